//! Record and payload fixtures.

use anyhow::Result;
use chrono::{DateTime, Utc};
use hookwork_core::{
    CallbackDelivery, RequestPatch, RequestStore, WorkInput, WorkRequest, WorkResult,
};

/// Result for `"Hello world"` with `count = 1`.
pub fn sample_result() -> WorkResult {
    WorkResult {
        input_hash: hookwork_core::work::input_hash("Hello world", 1),
        word_count: 2,
        character_count: 11,
        processed_text: "HELLO WORLD".to_string(),
        iterations: 1,
        processing_time_ms: 200.0,
    }
}

/// Stores a completed async request whose callback has not been attempted.
pub async fn seed_completed_async(
    store: &dyn RequestStore,
    callback_url: &str,
    at: DateTime<Utc>,
) -> Result<WorkRequest> {
    let request = WorkRequest::new_async(WorkInput::new("Hello world", 1), callback_url, at);
    let id = request.id;
    store.create(request).await?;
    store.update(id, RequestPatch::processing()).await?;
    let patch =
        RequestPatch::completed(sample_result(), at).with_delivery(CallbackDelivery::new());
    Ok(store.update(id, patch).await?)
}

/// Decodes a recorded callback body.
pub fn decode_payload(body: &[u8]) -> Result<serde_json::Value> {
    Ok(serde_json::from_slice(body)?)
}
