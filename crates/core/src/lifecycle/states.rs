use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::variation::{ClientDecision, Disposition, SubmitRequest, Variation, VariationStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Create,
    Revise,
    Submit,
    SubmitDeferred,
    BeginReview,
    Approve,
    Decline,
    Discard,
    AttachFile,
    DetachFile,
}

impl LifecycleAction {
    pub fn for_submission(request: &SubmitRequest) -> Self {
        match request.disposition {
            Some(Disposition::Defer) => Self::SubmitDeferred,
            _ => Self::Submit,
        }
    }

    pub fn for_decision(decision: ClientDecision) -> Self {
        match decision {
            ClientDecision::Approve => Self::Approve,
            ClientDecision::Decline => Self::Decline,
        }
    }

    /// Name used for change feed rows and audit events.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Create => "variation.created",
            Self::Revise => "variation.revised",
            Self::Submit => "variation.submitted",
            Self::SubmitDeferred => "variation.deferred",
            Self::BeginReview => "variation.review_started",
            Self::Approve => "variation.approved",
            Self::Decline => "variation.declined",
            Self::Discard => "variation.discarded",
            Self::AttachFile => "variation.file_attached",
            Self::DetachFile => "variation.file_removed",
        }
    }
}

/// Guard inputs gathered by the caller before a transition is attempted.
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransitionContext {
    pub missing_required_fields: Vec<String>,
    pub cost_line_errors: Vec<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub comment: Option<String>,
    pub actor: Option<String>,
    pub client_of_record: Option<String>,
}

impl TransitionContext {
    pub fn for_variation(variation: &Variation) -> Self {
        Self {
            missing_required_fields: Vec::new(),
            cost_line_errors: variation.costs.validation_errors(),
            decided_at: variation.decided_at(),
            comment: None,
            actor: None,
            client_of_record: variation.client_id.clone(),
        }
    }

    pub fn with_decision(mut self, comment: &str, actor: Option<&str>) -> Self {
        self.comment = Some(comment.to_owned());
        self.actor = actor.map(str::to_owned);
        self
    }

    pub fn has_comment(&self) -> bool {
        self.comment.as_deref().map(str::trim).is_some_and(|comment| !comment.is_empty())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEffect {
    PersistDraft,
    FreezeContent,
    NotifyClient,
    RecordDecision,
    NotifyDownstream,
    InvalidateFilesCache,
    RemoveFromActiveSet,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    /// `None` before creation.
    pub from: Option<VariationStatus>,
    /// `None` once the variation leaves the active set.
    pub to: Option<VariationStatus>,
    pub action: LifecycleAction,
    pub effects: Vec<LifecycleEffect>,
}

impl TransitionOutcome {
    pub fn has_effect(&self, effect: LifecycleEffect) -> bool {
        self.effects.contains(&effect)
    }
}
