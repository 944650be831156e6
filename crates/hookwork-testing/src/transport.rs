//! Scripted callback transport.
//!
//! Answers each POST from a queue of canned responses and records every
//! request it sees. Hooks registered for an attempt number run right after
//! that attempt, which is how tests change DNS between two attempts.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use hookwork_delivery::{CallbackRequest, CallbackTransport, DeliveryError, DeliveryResponse};

/// One canned answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedResponse {
    /// Receiver answers with this status.
    Status(u16),
    /// Connection fails.
    NetworkError(String),
    /// Attempt times out.
    Timeout,
}

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct State {
    script: VecDeque<ScriptedResponse>,
    requests: Vec<CallbackRequest>,
    hooks: HashMap<u32, Hook>,
}

/// In-memory `CallbackTransport`.
///
/// Clones share the script and the recorded requests. Once the script runs
/// out every POST answers with the fallback (200 unless changed).
#[derive(Clone)]
pub struct ScriptedTransport {
    state: Arc<Mutex<State>>,
    fallback: ScriptedResponse,
}

impl fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("fallback", &self.fallback)
            .field("calls", &self.call_count())
            .finish_non_exhaustive()
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    /// Transport that always answers 200.
    pub fn new() -> Self {
        Self { state: Arc::default(), fallback: ScriptedResponse::Status(200) }
    }

    /// Transport that always answers `status`.
    pub fn always(status: u16) -> Self {
        Self { fallback: ScriptedResponse::Status(status), ..Self::new() }
    }

    /// Transport answering from `script`, then 200.
    pub fn scripted(script: impl IntoIterator<Item = ScriptedResponse>) -> Self {
        let transport = Self::new();
        if let Ok(mut state) = transport.state.lock() {
            state.script.extend(script);
        }
        transport
    }

    /// Runs `hook` after the POST for `attempt`.
    pub fn on_attempt(&self, attempt: u32, hook: impl FnOnce() + Send + 'static) {
        if let Ok(mut state) = self.state.lock() {
            state.hooks.insert(attempt, Box::new(hook));
        }
    }

    /// Requests seen so far, in order.
    pub fn requests(&self) -> Vec<CallbackRequest> {
        self.state.lock().map(|s| s.requests.clone()).unwrap_or_default()
    }

    /// Number of POSTs seen so far.
    pub fn call_count(&self) -> usize {
        self.state.lock().map(|s| s.requests.len()).unwrap_or_default()
    }
}

#[async_trait]
impl CallbackTransport for ScriptedTransport {
    async fn post(&self, request: &CallbackRequest) -> hookwork_delivery::Result<DeliveryResponse> {
        let (response, hook) = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| DeliveryError::network("scripted transport poisoned"))?;
            state.requests.push(request.clone());
            let response = state.script.pop_front().unwrap_or_else(|| self.fallback.clone());
            (response, state.hooks.remove(&request.attempt))
        };

        if let Some(hook) = hook {
            hook();
        }

        match response {
            ScriptedResponse::Status(status_code) => Ok(DeliveryResponse {
                status_code,
                body: String::new(),
                duration: Duration::from_millis(1),
            }),
            ScriptedResponse::NetworkError(message) => Err(DeliveryError::network(message)),
            ScriptedResponse::Timeout => Err(DeliveryError::timeout(10_000)),
        }
    }
}
