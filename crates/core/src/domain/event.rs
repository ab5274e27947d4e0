use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::variation::{VariationId, VariationStatus};
use crate::lifecycle::TransitionOutcome;

/// One row of a variation's change feed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariationEvent {
    pub id: String,
    pub variation_id: VariationId,
    pub event_type: String,
    pub from_status: Option<VariationStatus>,
    pub to_status: Option<VariationStatus>,
    pub actor: String,
    pub detail: String,
    pub occurred_at: DateTime<Utc>,
}

impl VariationEvent {
    pub fn from_outcome(
        variation_id: VariationId,
        outcome: &TransitionOutcome,
        actor: impl Into<String>,
        detail: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("VEV-{}", Uuid::new_v4()),
            variation_id,
            event_type: outcome.action.event_type().to_owned(),
            from_status: outcome.from,
            to_status: outcome.to,
            actor: actor.into(),
            detail: detail.into(),
            occurred_at,
        }
    }
}
