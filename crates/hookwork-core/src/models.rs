//! Core domain models and strongly-typed identifiers.
//!
//! Defines work requests, their compute lifecycle, callback delivery state,
//! and the patch type the request store applies atomically. All transition
//! rules live here so every store implementation enforces the same
//! monotonicity guarantees.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Maximum number of characters accepted in `WorkInput::text`.
pub const MAX_TEXT_CHARS: usize = 10_000;

/// Maximum accepted iteration count.
pub const MAX_ITERATIONS: u32 = 100;

/// Maximum number of callback delivery attempts per request.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 5;

/// Default page size for request listings.
pub const DEFAULT_PAGE_LIMIT: u32 = 50;

/// Largest page size accepted for request listings.
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Strongly-typed request identifier.
///
/// Wraps a UUID v4 generated at creation. A request keeps this ID for its
/// whole lifecycle and it is echoed back in every callback payload.
///
/// # Example
///
/// ```
/// use hookwork_core::models::RequestId;
/// let id = RequestId::new();
/// println!("Processing request: {}", id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    /// Creates a new random request ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for RequestId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| CoreError::validation(format!("invalid request id {s:?}: {e}")))
    }
}

/// Interaction style of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestMode {
    /// Result returned inline in the HTTP response.
    Sync,
    /// Acknowledged immediately, result delivered to a callback URL.
    Async,
}

impl RequestMode {
    /// Returns the wire and storage representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
        }
    }
}

impl fmt::Display for RequestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sync" => Ok(Self::Sync),
            "async" => Ok(Self::Async),
            _ => Err(CoreError::validation(format!("invalid request mode: {s}"))),
        }
    }
}

/// Compute lifecycle of a request.
///
/// Transitions only move forward:
///
/// ```text
/// Pending ──▶ Processing ──▶ Completed
///    │            │
///    └────────────┴────────▶ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Accepted and persisted, computation not started.
    Pending,
    /// Work executor is running.
    Processing,
    /// A result exists. Terminal.
    Completed,
    /// The result could not be produced. Terminal.
    Failed,
}

impl RequestStatus {
    /// Returns the wire and storage representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Returns true for `Completed` and `Failed`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Position of this status in the lifecycle; terminal states share the
    /// last stage.
    pub const fn stage(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Processing => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Returns true if moving from `self` to `next` is a legal transition.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Pending | Self::Processing, Self::Failed)
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(CoreError::validation(format!("invalid request status: {s}"))),
        }
    }
}

/// Callback delivery lifecycle, independent of the compute status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Delivery scheduled or being retried.
    Pending,
    /// Receiver answered with a 2xx status. Terminal.
    Sent,
    /// Attempts exhausted or target rejected as unsafe. Terminal.
    Failed,
}

impl DeliveryStatus {
    /// Returns the wire and storage representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    /// Returns true for `Sent` and `Failed`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            _ => Err(CoreError::validation(format!("invalid callback status: {s}"))),
        }
    }
}

/// Text and iteration count supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkInput {
    /// Text to process, 1..=10000 characters.
    pub text: String,
    /// Number of case-transform iterations, 1..=100.
    #[serde(default = "default_count")]
    pub count: u32,
}

fn default_count() -> u32 {
    1
}

impl WorkInput {
    /// Creates a new input without validating it.
    pub fn new(text: impl Into<String>, count: u32) -> Self {
        Self { text: text.into(), count }
    }

    /// Checks length and range constraints.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` describing the first violated rule.
    pub fn validate(&self) -> Result<()> {
        let chars = self.text.chars().count();
        if chars == 0 {
            return Err(CoreError::validation("text must not be empty"));
        }
        if chars > MAX_TEXT_CHARS {
            return Err(CoreError::validation(format!(
                "text exceeds {MAX_TEXT_CHARS} characters ({chars})"
            )));
        }
        if !(1..=MAX_ITERATIONS).contains(&self.count) {
            return Err(CoreError::validation(format!(
                "count must be between 1 and {MAX_ITERATIONS}, got {}",
                self.count
            )));
        }
        Ok(())
    }
}

/// Output of the work executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkResult {
    /// First 16 hex characters of SHA-256 over `"{text}:{count}"`.
    pub input_hash: String,
    /// Whitespace-separated word count.
    pub word_count: u64,
    /// Number of characters in the input text.
    pub character_count: u64,
    /// Case-transformed text.
    pub processed_text: String,
    /// Iteration count applied.
    pub iterations: u32,
    /// Wall time spent in the executor, the only non-deterministic field.
    pub processing_time_ms: f64,
}

impl WorkResult {
    /// Compares every deterministic field, ignoring `processing_time_ms`.
    pub fn same_output(&self, other: &Self) -> bool {
        self.input_hash == other.input_hash
            && self.word_count == other.word_count
            && self.character_count == other.character_count
            && self.processed_text == other.processed_text
            && self.iterations == other.iterations
    }
}

/// Callback notification state for an async request.
///
/// Owned exclusively by the callback dispatcher. Each mutating method
/// returns the error instead of changing state when the delivery is already
/// terminal or the attempt budget is spent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackDelivery {
    /// Current delivery status.
    pub status: DeliveryStatus,
    /// Delivery attempts made so far, at most `MAX_DELIVERY_ATTEMPTS`.
    pub attempts: u32,
    /// Most recent failure reason, cleared on success.
    pub last_error: Option<String>,
    /// When the next attempt is scheduled; absent once terminal.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// When the receiver acknowledged the callback.
    pub sent_at: Option<DateTime<Utc>>,
}

impl Default for CallbackDelivery {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackDelivery {
    /// Creates a pending delivery with no attempts.
    pub fn new() -> Self {
        Self {
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            sent_at: None,
        }
    }

    /// Returns true once the delivery is `Sent` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if another attempt may still be made.
    pub fn has_budget(&self) -> bool {
        !self.is_terminal() && self.attempts < MAX_DELIVERY_ATTEMPTS
    }

    /// Records a 2xx response for the next attempt.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` if terminal or out of budget.
    pub fn record_success(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.ensure_budget()?;
        self.attempts += 1;
        self.status = DeliveryStatus::Sent;
        self.last_error = None;
        self.next_attempt_at = None;
        self.sent_at = Some(at);
        Ok(())
    }

    /// Records a failed attempt that will be retried at `next_attempt_at`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` if terminal or out of budget.
    pub fn record_retry(
        &mut self,
        error: impl Into<String>,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_budget()?;
        self.attempts += 1;
        self.last_error = Some(error.into());
        self.next_attempt_at = Some(next_attempt_at);
        Ok(())
    }

    /// Records the final failed attempt and terminalizes the delivery.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` if terminal or out of budget.
    pub fn record_exhausted(&mut self, error: impl Into<String>) -> Result<()> {
        self.ensure_budget()?;
        self.attempts += 1;
        self.status = DeliveryStatus::Failed;
        self.last_error = Some(error.into());
        self.next_attempt_at = None;
        Ok(())
    }

    /// Terminalizes the delivery without counting an attempt.
    ///
    /// Used when the guard rejects the target before any network call.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` if already terminal.
    pub fn terminate(&mut self, reason: impl Into<String>) -> Result<()> {
        if self.is_terminal() {
            return Err(CoreError::invalid_transition(format!(
                "delivery already {}",
                self.status
            )));
        }
        self.status = DeliveryStatus::Failed;
        self.last_error = Some(reason.into());
        self.next_attempt_at = None;
        Ok(())
    }

    /// Checks that `next` is a legal successor of this delivery state.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` if `next` leaves a terminal
    /// state, decreases the attempt count, or exceeds the attempt budget.
    pub fn validate_successor(&self, next: &Self) -> Result<()> {
        if self.is_terminal() && next != self {
            return Err(CoreError::invalid_transition(format!(
                "delivery is terminal ({})",
                self.status
            )));
        }
        if next.attempts < self.attempts {
            return Err(CoreError::invalid_transition(format!(
                "attempts would decrease from {} to {}",
                self.attempts, next.attempts
            )));
        }
        if next.attempts > MAX_DELIVERY_ATTEMPTS {
            return Err(CoreError::invalid_transition(format!(
                "attempts {} exceed budget of {MAX_DELIVERY_ATTEMPTS}",
                next.attempts
            )));
        }
        Ok(())
    }

    fn ensure_budget(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(CoreError::invalid_transition(format!(
                "delivery already {}",
                self.status
            )));
        }
        if self.attempts >= MAX_DELIVERY_ATTEMPTS {
            return Err(CoreError::invalid_transition(format!(
                "attempt budget of {MAX_DELIVERY_ATTEMPTS} spent"
            )));
        }
        Ok(())
    }
}

/// Unit of work and audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRequest {
    /// Unique identifier.
    pub id: RequestId,
    /// Sync or async.
    pub mode: RequestMode,
    /// Caller input.
    pub input: WorkInput,
    /// Callback target, present iff `mode` is `Async`.
    pub callback_url: Option<String>,
    /// Compute status.
    pub status: RequestStatus,
    /// Present iff `status` is `Completed`.
    pub result: Option<WorkResult>,
    /// Compute failure text, present only when `status` is `Failed`.
    pub error: Option<String>,
    /// When the request was accepted.
    pub created_at: DateTime<Utc>,
    /// When the compute status became terminal.
    pub completed_at: Option<DateTime<Utc>>,
    /// Callback state, present only for completed async requests.
    #[serde(rename = "callback")]
    pub delivery: Option<CallbackDelivery>,
}

impl WorkRequest {
    /// Creates a pending synchronous request.
    pub fn new_sync(input: WorkInput, created_at: DateTime<Utc>) -> Self {
        Self::new(RequestMode::Sync, input, None, created_at)
    }

    /// Creates a pending asynchronous request with its callback target.
    pub fn new_async(
        input: WorkInput,
        callback_url: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self::new(RequestMode::Async, input, Some(callback_url.into()), created_at)
    }

    fn new(
        mode: RequestMode,
        input: WorkInput,
        callback_url: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RequestId::new(),
            mode,
            input,
            callback_url,
            status: RequestStatus::Pending,
            result: None,
            error: None,
            created_at,
            completed_at: None,
            delivery: None,
        }
    }

    /// Applies a patch, enforcing every transition rule.
    ///
    /// The record is left untouched when an error is returned.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` if the patch would regress the
    /// compute status, attach a result or delivery to the wrong status, or
    /// move a terminal delivery.
    pub fn apply(&mut self, patch: RequestPatch) -> Result<()> {
        let mut next = self.clone();

        if let Some(status) = patch.status {
            if !self.status.can_transition_to(status) {
                return Err(CoreError::invalid_transition(format!(
                    "request {} cannot move from {} to {}",
                    self.id, self.status, status
                )));
            }
            next.status = status;
            if status.is_terminal() {
                next.completed_at = patch.at.or(next.completed_at);
            }
        }

        if let Some(result) = patch.result {
            if next.status != RequestStatus::Completed {
                return Err(CoreError::invalid_transition(format!(
                    "result attached to {} request {}",
                    next.status, self.id
                )));
            }
            next.result = Some(result);
        }

        if let Some(error) = patch.error {
            if next.status != RequestStatus::Failed {
                return Err(CoreError::invalid_transition(format!(
                    "error attached to {} request {}",
                    next.status, self.id
                )));
            }
            next.error = Some(error);
        }

        if next.status == RequestStatus::Completed && next.result.is_none() {
            return Err(CoreError::invalid_transition(format!(
                "request {} completed without a result",
                self.id
            )));
        }

        if let Some(delivery) = patch.delivery {
            if self.mode != RequestMode::Async || next.status != RequestStatus::Completed {
                return Err(CoreError::invalid_transition(format!(
                    "callback delivery attached to {} {} request {}",
                    next.status, self.mode, self.id
                )));
            }
            if let Some(current) = &self.delivery {
                current.validate_successor(&delivery)?;
            }
            next.delivery = Some(delivery);
        }

        *self = next;
        Ok(())
    }
}

/// Partial update applied atomically by the request store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestPatch {
    /// New compute status.
    pub status: Option<RequestStatus>,
    /// Result, only with `Completed`.
    pub result: Option<WorkResult>,
    /// Failure text, only with `Failed`.
    pub error: Option<String>,
    /// Full replacement of the callback delivery state.
    pub delivery: Option<CallbackDelivery>,
    /// Timestamp recorded as `completed_at` when the status becomes terminal.
    pub at: Option<DateTime<Utc>>,
}

impl RequestPatch {
    /// Marks the request as processing.
    pub fn processing() -> Self {
        Self { status: Some(RequestStatus::Processing), ..Self::default() }
    }

    /// Marks the request as completed with its result.
    pub fn completed(result: WorkResult, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(RequestStatus::Completed),
            result: Some(result),
            at: Some(at),
            ..Self::default()
        }
    }

    /// Marks the request as failed with the compute error.
    pub fn failed(error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(RequestStatus::Failed),
            error: Some(error.into()),
            at: Some(at),
            ..Self::default()
        }
    }

    /// Replaces only the callback delivery state.
    pub fn delivery(delivery: CallbackDelivery) -> Self {
        Self { delivery: Some(delivery), ..Self::default() }
    }

    /// Adds a callback delivery state to this patch.
    #[must_use]
    pub fn with_delivery(mut self, delivery: CallbackDelivery) -> Self {
        self.delivery = Some(delivery);
        self
    }
}

/// Filters for listing requests, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFilter {
    /// Only requests of this mode.
    pub mode: Option<RequestMode>,
    /// Only requests with this compute status.
    pub status: Option<RequestStatus>,
    /// Only requests whose callback has this status.
    #[serde(rename = "callback_status")]
    pub delivery_status: Option<DeliveryStatus>,
    /// Page size, 1..=100.
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Number of records to skip.
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    DEFAULT_PAGE_LIMIT
}

impl Default for RequestFilter {
    fn default() -> Self {
        Self {
            mode: None,
            status: None,
            delivery_status: None,
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl RequestFilter {
    /// Checks the page size bounds.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Validation` if `limit` is outside 1..=100.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_PAGE_LIMIT).contains(&self.limit) {
            return Err(CoreError::validation(format!(
                "limit must be between 1 and {MAX_PAGE_LIMIT}, got {}",
                self.limit
            )));
        }
        Ok(())
    }
}

/// One page of a request listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPage {
    /// Matching requests, newest first.
    pub requests: Vec<WorkRequest>,
    /// Total matching requests ignoring pagination.
    pub total: u64,
    /// Page size used.
    pub limit: u32,
    /// Offset used.
    pub offset: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result() -> WorkResult {
        WorkResult {
            input_hash: "0123456789abcdef".to_string(),
            word_count: 2,
            character_count: 11,
            processed_text: "HELLO WORLD".to_string(),
            iterations: 3,
            processing_time_ms: 200.0,
        }
    }

    #[test]
    fn status_transitions_only_move_forward() {
        use RequestStatus::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Failed));

        assert!(!Processing.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn input_validation_rejects_out_of_range_values() {
        assert!(WorkInput::new("Hello world", 3).validate().is_ok());
        assert!(WorkInput::new("", 1).validate().is_err());
        assert!(WorkInput::new("x", 0).validate().is_err());
        assert!(WorkInput::new("x", MAX_ITERATIONS + 1).validate().is_err());
        assert!(WorkInput::new("x".repeat(MAX_TEXT_CHARS + 1), 1).validate().is_err());
        assert!(WorkInput::new("é".repeat(MAX_TEXT_CHARS), 1).validate().is_ok());
    }

    #[test]
    fn count_defaults_to_one_on_the_wire() {
        let input: WorkInput = serde_json::from_str(r#"{"text":"hi"}"#).unwrap();
        assert_eq!(input.count, 1);
    }

    #[test]
    fn negative_count_is_rejected_on_the_wire() {
        let parsed = serde_json::from_str::<WorkInput>(r#"{"text":"hi","count":-1}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn apply_walks_the_async_lifecycle() {
        let now = Utc::now();
        let mut request =
            WorkRequest::new_async(WorkInput::new("Hello world", 3), "https://example.com/h", now);

        request.apply(RequestPatch::processing()).unwrap();
        request
            .apply(
                RequestPatch::completed(sample_result(), now)
                    .with_delivery(CallbackDelivery::new()),
            )
            .unwrap();

        assert_eq!(request.status, RequestStatus::Completed);
        assert_eq!(request.completed_at, Some(now));
        assert_eq!(request.delivery.as_ref().map(|d| d.status), Some(DeliveryStatus::Pending));
    }

    #[test]
    fn apply_rejects_regression_and_leaves_record_untouched() {
        let now = Utc::now();
        let mut request = WorkRequest::new_sync(WorkInput::new("abc", 1), now);
        request.apply(RequestPatch::processing()).unwrap();
        request.apply(RequestPatch::completed(sample_result(), now)).unwrap();

        let before = request.clone();
        let err = request.apply(RequestPatch::processing()).unwrap_err();

        assert!(matches!(err, CoreError::InvalidTransition(_)));
        assert_eq!(request, before);
    }

    #[test]
    fn apply_rejects_delivery_on_sync_request() {
        let now = Utc::now();
        let mut request = WorkRequest::new_sync(WorkInput::new("abc", 1), now);
        request.apply(RequestPatch::processing()).unwrap();

        let patch =
            RequestPatch::completed(sample_result(), now).with_delivery(CallbackDelivery::new());
        assert!(request.apply(patch).is_err());
        assert_eq!(request.status, RequestStatus::Processing);
    }

    #[test]
    fn apply_rejects_completion_without_result() {
        let mut request = WorkRequest::new_sync(WorkInput::new("abc", 1), Utc::now());
        request.apply(RequestPatch::processing()).unwrap();

        let patch = RequestPatch { status: Some(RequestStatus::Completed), ..Default::default() };
        assert!(request.apply(patch).is_err());
    }

    #[test]
    fn delivery_budget_is_capped() {
        let now = Utc::now();
        let mut delivery = CallbackDelivery::new();

        for _ in 0..MAX_DELIVERY_ATTEMPTS - 1 {
            delivery.record_retry("HTTP 500", now).unwrap();
        }
        delivery.record_exhausted("HTTP 500").unwrap();

        assert_eq!(delivery.attempts, MAX_DELIVERY_ATTEMPTS);
        assert_eq!(delivery.status, DeliveryStatus::Failed);
        assert!(delivery.next_attempt_at.is_none());
        assert!(delivery.record_retry("HTTP 500", now).is_err());
        assert!(delivery.record_success(now).is_err());
    }

    #[test]
    fn unsafe_target_keeps_attempt_count() {
        let mut delivery = CallbackDelivery::new();
        delivery.record_retry("HTTP 503", Utc::now()).unwrap();
        delivery.terminate("target became unsafe: loopback").unwrap();

        assert_eq!(delivery.attempts, 1);
        assert_eq!(delivery.status, DeliveryStatus::Failed);
        assert!(delivery.terminate("again").is_err());
    }

    #[test]
    fn success_clears_last_error() {
        let now = Utc::now();
        let mut delivery = CallbackDelivery::new();
        delivery.record_retry("timeout", now).unwrap();
        delivery.record_success(now).unwrap();

        assert_eq!(delivery.status, DeliveryStatus::Sent);
        assert_eq!(delivery.attempts, 2);
        assert!(delivery.last_error.is_none());
        assert_eq!(delivery.sent_at, Some(now));
    }

    #[test]
    fn terminal_delivery_rejects_successors() {
        let mut sent = CallbackDelivery::new();
        sent.record_success(Utc::now()).unwrap();

        assert!(sent.validate_successor(&sent.clone()).is_ok());
        assert!(sent.validate_successor(&CallbackDelivery::new()).is_err());
    }

    #[test]
    fn request_id_parses_from_string() {
        let id = RequestId::new();
        let parsed: RequestId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<RequestId>().is_err());
    }

    #[test]
    fn filter_limits_are_validated() {
        assert!(RequestFilter::default().validate().is_ok());
        assert!(RequestFilter { limit: 0, ..Default::default() }.validate().is_err());
        assert!(RequestFilter { limit: 101, ..Default::default() }.validate().is_err());
    }
}
