//! Durable request storage.
//!
//! `RequestStore` is the only way the lifecycle and the dispatcher touch
//! persisted state. Every `update` is a single atomic read-modify-write that
//! runs the patch through `WorkRequest::apply`, so no implementation can
//! regress a status or move a terminal delivery.

use std::{future::Future, pin::Pin};

use crate::{
    error::Result,
    models::{RequestFilter, RequestId, RequestPage, RequestPatch, WorkRequest},
};

mod sqlite;

pub use sqlite::SqliteRequestStore;

/// Boxed future returned by `RequestStore` methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Persistence operations for work requests and their callback state.
pub trait RequestStore: Send + Sync + 'static {
    /// Inserts a new request record.
    fn create(&self, request: WorkRequest) -> StoreFuture<'_, ()>;

    /// Atomically applies `patch` and returns the updated record.
    ///
    /// Fails with `CoreError::NotFound` for unknown IDs and
    /// `CoreError::InvalidTransition` when the patch breaks monotonicity; the
    /// stored record is unchanged in both cases.
    fn update(&self, id: RequestId, patch: RequestPatch) -> StoreFuture<'_, WorkRequest>;

    /// Fetches one record, or `CoreError::NotFound`.
    fn get(&self, id: RequestId) -> StoreFuture<'_, WorkRequest>;

    /// Lists records newest first.
    fn list(&self, filter: RequestFilter) -> StoreFuture<'_, RequestPage>;

    /// Completed async requests whose callback is still pending, oldest first.
    fn pending_deliveries(&self) -> StoreFuture<'_, Vec<WorkRequest>>;

    /// Verifies the backing store is reachable.
    fn health_check(&self) -> StoreFuture<'_, ()>;
}
