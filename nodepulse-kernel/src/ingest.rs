use crate::state::LiveCache;
use crate::store::{run_blocking, MeasureStore, StoreError};
use nodepulse_contracts::Sample;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid token")]
    Unauthorized,
    #[error("malformed sample: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("sample has no node id")]
    MissingNodeId,
    #[error("failed to persist sample: {0}")]
    Persistence(#[source] StoreError),
}

/// Token comparison for an `Authorization` header value
pub fn bearer_matches(header: Option<&str>, expected: &str) -> bool {
    let expected = expected.trim();
    if expected.is_empty() {
        return false;
    }
    let Some(value) = header else {
        return false;
    };
    value.strip_prefix("Bearer ").unwrap_or(value).trim() == expected
}

pub struct Ingestor {
    token: String,
    cache: Arc<LiveCache>,
    store: Arc<MeasureStore>,
}

impl Ingestor {
    pub fn new(token: String, cache: Arc<LiveCache>, store: Arc<MeasureStore>) -> Self {
        Self { token, cache, store }
    }

    /// Authenticates, decodes, refreshes the cache, then persists.
    ///
    /// The cache is updated before the write, so a persistence failure
    /// still leaves the newest sample visible to the overview.
    pub async fn ingest(&self, authorization: Option<&str>, body: &[u8]) -> Result<(), IngestError> {
        if !bearer_matches(authorization, &self.token) {
            warn!("report rejected: bad token");
            return Err(IngestError::Unauthorized);
        }
        let sample: Sample = serde_json::from_slice(body)?;
        if sample.node_id.trim().is_empty() {
            return Err(IngestError::MissingNodeId);
        }
        debug!(node = %sample.node_id, ?sample, "report received");

        self.cache.set(sample.node_id.clone(), sample.clone());

        let node_id = sample.node_id.clone();
        run_blocking(&self.store, move |store| store.write_sample(&sample))
            .await
            .map_err(|e| {
                warn!(node = %node_id, error = %e, "report not persisted");
                IngestError::Persistence(e)
            })
    }
}
