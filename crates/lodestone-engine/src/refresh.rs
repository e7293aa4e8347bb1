//! Drift detector: re-reads remote state for subsequent diffing
//!
//! Refresh discovers divergence between the last-known and actual remote
//! state. A vanished identifier is surfaced as `ResourceNotFound` — a
//! distinct signal callers interpret as "deleted out-of-band, re-create on
//! next apply" — never as a stale cached snapshot.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use lodestone_common::{Error, Result};

use crate::remote::ControlPlaneClient;
use crate::state::ResourceState;

/// Re-reads remote state and maps it back into snapshot form
pub struct DriftDetector<C> {
    client: Arc<C>,
}

impl<C: ControlPlaneClient> DriftDetector<C> {
    /// Create a detector over an injected remote client
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    /// Re-read the remote resource and rebuild its state snapshot
    ///
    /// Fields the remote API does not round-trip (generated credential
    /// material) are preserved from `prior` rather than cleared.
    pub async fn refresh(
        &self,
        resource_id: &str,
        prior: Option<&ResourceState>,
    ) -> Result<ResourceState> {
        debug!(id = %resource_id, "reading remote state");

        let payload = self
            .client
            .get_cluster(resource_id)
            .await?
            .ok_or_else(|| Error::not_found(resource_id))?;

        let mut state = ResourceState::from_value(payload)?;
        state.preserve_write_only(prior);
        state.observed_at = Some(Utc::now());

        info!(
            id = %resource_id,
            provisioning_state = state.provisioning_state.as_deref().unwrap_or("unknown"),
            "remote state refreshed"
        );
        Ok(state)
    }
}
