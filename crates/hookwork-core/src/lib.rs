//! Core domain models, work execution, and request persistence.
//!
//! Provides strongly-typed request identifiers, the compute and delivery
//! state machines, the deterministic work executor, the clock abstraction,
//! and the request store used by every other hookwork crate.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;
pub mod work;

pub use error::{CoreError, Result};
pub use models::{
    CallbackDelivery, DeliveryStatus, RequestFilter, RequestId, RequestMode, RequestPage,
    RequestPatch, RequestStatus, WorkInput, WorkRequest, WorkResult,
};
pub use storage::{RequestStore, SqliteRequestStore};
pub use time::{Clock, RealClock, TestClock};
pub use work::WorkExecutor;
