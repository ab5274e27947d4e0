use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::variation::VariationStatus;
use crate::errors::ErrorKind;
use crate::lifecycle::states::{
    LifecycleAction, LifecycleEffect, TransitionContext, TransitionOutcome,
};

pub trait LifecycleDefinition {
    fn name(&self) -> &'static str;
    fn initial_state(&self) -> VariationStatus;
    fn transition(
        &self,
        current: Option<VariationStatus>,
        action: LifecycleAction,
        context: &TransitionContext,
    ) -> Result<TransitionOutcome, TransitionError>;
}

#[derive(Clone, Debug, Default)]
pub struct VariationLifecycle;

impl LifecycleDefinition for VariationLifecycle {
    fn name(&self) -> &'static str {
        "variation"
    }

    fn initial_state(&self) -> VariationStatus {
        VariationStatus::Draft
    }

    fn transition(
        &self,
        current: Option<VariationStatus>,
        action: LifecycleAction,
        context: &TransitionContext,
    ) -> Result<TransitionOutcome, TransitionError> {
        transition_variation(current, action, context)
    }
}

#[derive(Clone, Debug)]
pub struct LifecycleEngine<L> {
    lifecycle: L,
}

impl<L> LifecycleEngine<L>
where
    L: LifecycleDefinition,
{
    pub fn new(lifecycle: L) -> Self {
        Self { lifecycle }
    }

    pub fn name(&self) -> &'static str {
        self.lifecycle.name()
    }

    pub fn initial_state(&self) -> VariationStatus {
        self.lifecycle.initial_state()
    }

    pub fn apply(
        &self,
        current: Option<VariationStatus>,
        action: LifecycleAction,
        context: &TransitionContext,
    ) -> Result<TransitionOutcome, TransitionError> {
        self.lifecycle.transition(current, action, context)
    }

    pub fn apply_with_audit<S>(
        &self,
        current: Option<VariationStatus>,
        action: LifecycleAction,
        context: &TransitionContext,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, TransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply(current, action, context);
        match &result {
            Ok(outcome) => {
                sink.emit(
                    AuditEvent::new(
                        audit.variation_id.clone(),
                        audit.correlation_id.clone(),
                        "lifecycle.transition_applied",
                        AuditCategory::Lifecycle,
                        audit.actor.clone(),
                        AuditOutcome::Success,
                    )
                    .with_metadata("from", status_label(outcome.from))
                    .with_metadata("to", status_label(outcome.to))
                    .with_metadata("action", action.event_type()),
                );
            }
            Err(error) => {
                sink.emit(
                    AuditEvent::new(
                        audit.variation_id.clone(),
                        audit.correlation_id.clone(),
                        "lifecycle.transition_rejected",
                        AuditCategory::Lifecycle,
                        audit.actor.clone(),
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("from", status_label(current))
                    .with_metadata("action", action.event_type())
                    .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }
}

impl Default for LifecycleEngine<VariationLifecycle> {
    fn default() -> Self {
        Self::new(VariationLifecycle)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("missing required fields before {action:?}: {missing_fields:?}")]
    MissingRequiredFields { action: LifecycleAction, missing_fields: Vec<String> },
    #[error("cost lines failed validation: {errors:?}")]
    InvalidCostLines { errors: Vec<String> },
    #[error("action {action:?} is not permitted from status {from:?}")]
    InvalidTransition { from: Option<VariationStatus>, action: LifecycleAction },
    #[error("a decline requires a non-empty comment")]
    CommentRequired,
    #[error("a decision was already recorded at {decided_at}")]
    DecisionAlreadyRecorded { decided_at: DateTime<Utc> },
    #[error("`{actor}` is not the client of record for this variation")]
    NotClientOfRecord { actor: String },
}

impl TransitionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingRequiredFields { .. }
            | Self::InvalidCostLines { .. }
            | Self::CommentRequired => ErrorKind::Validation,
            Self::InvalidTransition { .. } | Self::NotClientOfRecord { .. } => {
                ErrorKind::InvalidTransition
            }
            Self::DecisionAlreadyRecorded { .. } => ErrorKind::Conflict,
        }
    }
}

fn status_label(status: Option<VariationStatus>) -> &'static str {
    status.map(|status| status.as_str()).unwrap_or("none")
}

fn transition_variation(
    current: Option<VariationStatus>,
    action: LifecycleAction,
    context: &TransitionContext,
) -> Result<TransitionOutcome, TransitionError> {
    use LifecycleAction::{
        AttachFile, BeginReview, Create, Decline, DetachFile, Discard, Revise, Submit,
        SubmitDeferred,
    };
    use LifecycleEffect::{
        FreezeContent, InvalidateFilesCache, NotifyClient, NotifyDownstream, PersistDraft,
        RecordDecision, RemoveFromActiveSet,
    };
    use VariationStatus::{Declined, Deferred, Draft, Submitted, UnderReview};

    let invalid = || TransitionError::InvalidTransition { from: current, action };

    if matches!(action, LifecycleAction::Approve | Decline) {
        if let Some(decided_at) = context.decided_at {
            return Err(TransitionError::DecisionAlreadyRecorded { decided_at });
        }
    }

    let (to, effects) = match (current, action) {
        (None, Create) | (Some(Draft), Revise) => {
            if !context.missing_required_fields.is_empty() {
                return Err(TransitionError::MissingRequiredFields {
                    action,
                    missing_fields: context.missing_required_fields.clone(),
                });
            }
            if !context.cost_line_errors.is_empty() {
                return Err(TransitionError::InvalidCostLines {
                    errors: context.cost_line_errors.clone(),
                });
            }
            (Some(Draft), vec![PersistDraft])
        }
        (Some(Draft), Submit) | (Some(Draft), SubmitDeferred) => {
            if !context.cost_line_errors.is_empty() {
                return Err(TransitionError::InvalidCostLines {
                    errors: context.cost_line_errors.clone(),
                });
            }
            if action == Submit {
                (Some(Submitted), vec![FreezeContent, NotifyClient, InvalidateFilesCache])
            } else {
                (Some(Deferred), vec![FreezeContent, NotifyDownstream, InvalidateFilesCache])
            }
        }
        (Some(Submitted), BeginReview) => (Some(UnderReview), Vec::new()),
        (Some(Submitted | UnderReview), LifecycleAction::Approve | Decline) => {
            let client = context.client_of_record.as_deref().map(str::trim);
            if let Some(client) = client.filter(|client| !client.is_empty()) {
                let actor = context.actor.as_deref().map(str::trim).unwrap_or_default();
                if actor != client {
                    let actor = if actor.is_empty() { "anonymous" } else { actor };
                    return Err(TransitionError::NotClientOfRecord { actor: actor.to_owned() });
                }
            }
            if action == Decline && !context.has_comment() {
                return Err(TransitionError::CommentRequired);
            }
            let to = if action == Decline { Declined } else { VariationStatus::Approved };
            (Some(to), vec![RecordDecision, NotifyDownstream, InvalidateFilesCache])
        }
        (Some(Draft), Discard) => {
            if context.decided_at.is_some() {
                return Err(invalid());
            }
            (None, vec![RemoveFromActiveSet, InvalidateFilesCache])
        }
        (Some(status @ (Draft | Submitted | UnderReview)), AttachFile | DetachFile) => {
            (Some(status), vec![InvalidateFilesCache])
        }
        _ => return Err(invalid()),
    };

    Ok(TransitionOutcome { from: current, to, action, effects })
}
