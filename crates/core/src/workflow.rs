use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditContext, AuditSink, TracingAuditSink};
use crate::decision::{DecisionRecorder, DecisionRequest};
use crate::domain::attachment::{FileId, FileRef};
use crate::domain::event::VariationEvent;
use crate::domain::variation::{
    DraftVariation, SubmitRequest, Variation, VariationId, VariationNumber, VariationStatus,
};
use crate::errors::{DomainError, ErrorKind};
use crate::lifecycle::{
    LifecycleAction, LifecycleEngine, TransitionContext, TransitionError, TransitionOutcome,
    VariationLifecycle,
};

pub const DEFAULT_DECISION_ACTOR: &str = "client";

/// Lifecycle rules shared by every system-of-record implementation.
///
/// Each operation validates against the lifecycle engine before touching the variation, so a
/// rejected call leaves the value exactly as it was. Storage is the caller's job.
#[derive(Clone)]
pub struct VariationWorkflow {
    engine: LifecycleEngine<VariationLifecycle>,
    recorder: DecisionRecorder,
    sink: Arc<dyn AuditSink>,
    default_currency: String,
}

impl VariationWorkflow {
    pub fn new(default_currency: impl Into<String>, sink: Arc<dyn AuditSink>) -> Self {
        let engine = LifecycleEngine::default();
        Self {
            recorder: DecisionRecorder::new(engine.clone()),
            engine,
            sink,
            default_currency: default_currency.into(),
        }
    }

    pub fn default_currency(&self) -> &str {
        &self.default_currency
    }

    pub fn create(
        &self,
        draft: DraftVariation,
        id: VariationId,
        number: VariationNumber,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<(Variation, VariationEvent), DomainError> {
        let context = TransitionContext {
            missing_required_fields: draft.missing_required_fields(),
            cost_line_errors: draft.costs.validation_errors(),
            ..TransitionContext::default()
        };
        let outcome = self.apply(&id, None, LifecycleAction::Create, &context, actor)?;
        let variation = Variation::from_draft(draft, id, number, &self.default_currency, now)?;

        info!(
            event_name = "variation.created",
            variation_id = %variation.id,
            project_id = %variation.project_id,
            number = variation.number.0,
            price_impact = %variation.price_impact(),
            "variation created"
        );
        let event = VariationEvent::from_outcome(
            variation.id.clone(),
            &outcome,
            actor,
            format!("variation {} drafted", variation.number),
            now,
        );
        Ok((variation, event))
    }

    pub fn revise(
        &self,
        variation: &mut Variation,
        draft: DraftVariation,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<VariationEvent, DomainError> {
        let context = TransitionContext {
            missing_required_fields: draft.missing_required_fields(),
            cost_line_errors: draft.costs.validation_errors(),
            ..TransitionContext::for_variation(variation)
        };
        let outcome = self.apply(
            &variation.id,
            Some(variation.status),
            LifecycleAction::Revise,
            &context,
            actor,
        )?;
        variation.revise(draft, now)?;

        Ok(VariationEvent::from_outcome(
            variation.id.clone(),
            &outcome,
            actor,
            format!("price impact {}", variation.price_impact()),
            now,
        ))
    }

    pub fn submit(
        &self,
        variation: &mut Variation,
        request: &SubmitRequest,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<VariationEvent, DomainError> {
        let action = LifecycleAction::for_submission(request);
        let context = TransitionContext::for_variation(variation);
        let outcome =
            self.apply(&variation.id, Some(variation.status), action, &context, actor)?;
        let to = settled_status(&outcome)?;

        variation.status = to;
        variation.disposition = request.disposition;
        variation.disposition_reason = request
            .disposition_reason
            .as_deref()
            .map(str::trim)
            .filter(|reason| !reason.is_empty())
            .map(str::to_owned);
        variation.updated_at = now;

        info!(
            event_name = "variation.submitted",
            variation_id = %variation.id,
            status = to.as_str(),
            disposition = request.disposition.map(|d| d.as_str()).unwrap_or("none"),
            "variation submitted"
        );
        Ok(VariationEvent::from_outcome(
            variation.id.clone(),
            &outcome,
            actor,
            variation.disposition_reason.clone().unwrap_or_default(),
            now,
        ))
    }

    pub fn begin_review(
        &self,
        variation: &mut Variation,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<VariationEvent, DomainError> {
        let context = TransitionContext::for_variation(variation);
        let outcome = self.apply(
            &variation.id,
            Some(variation.status),
            LifecycleAction::BeginReview,
            &context,
            actor,
        )?;
        variation.status = settled_status(&outcome)?;
        variation.updated_at = now;

        Ok(VariationEvent::from_outcome(variation.id.clone(), &outcome, actor, "", now))
    }

    pub fn decide(
        &self,
        variation: &mut Variation,
        request: &DecisionRequest,
        now: DateTime<Utc>,
    ) -> Result<VariationEvent, DomainError> {
        let actor = request.decided_by.as_deref().unwrap_or(DEFAULT_DECISION_ACTOR);
        let audit = AuditContext::new(Some(variation.id.clone()), correlation_id(), actor);
        let result =
            self.recorder.record_with_audit(variation, request, now, self.sink.as_ref(), &audit);

        match result {
            Ok(receipt) => {
                info!(
                    event_name = "variation.decision.recorded",
                    variation_id = %variation.id,
                    decision = receipt.record.decision.as_str(),
                    status = receipt.to.as_str(),
                    correlation_id = %audit.correlation_id,
                    "client decision recorded"
                );
                let outcome = TransitionOutcome {
                    from: Some(receipt.from),
                    to: Some(receipt.to),
                    action: LifecycleAction::for_decision(receipt.record.decision),
                    effects: Vec::new(),
                };
                Ok(VariationEvent::from_outcome(
                    variation.id.clone(),
                    &outcome,
                    actor,
                    receipt.record.comment,
                    now,
                ))
            }
            Err(error) => {
                if error.kind() == ErrorKind::Conflict {
                    warn!(
                        event_name = "variation.decision.conflict",
                        variation_id = %variation.id,
                        correlation_id = %audit.correlation_id,
                        "decision already recorded"
                    );
                }
                Err(error)
            }
        }
    }

    /// Validates a discard; the caller removes the variation from its active set.
    pub fn discard(
        &self,
        variation: &Variation,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<VariationEvent, DomainError> {
        let context = TransitionContext::for_variation(variation);
        let outcome = self.apply(
            &variation.id,
            Some(variation.status),
            LifecycleAction::Discard,
            &context,
            actor,
        )?;
        Ok(VariationEvent::from_outcome(variation.id.clone(), &outcome, actor, "", now))
    }

    pub fn attach_file(
        &self,
        variation: &mut Variation,
        file: &FileRef,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<VariationEvent, DomainError> {
        let context = TransitionContext::for_variation(variation);
        let outcome = self.apply(
            &variation.id,
            Some(variation.status),
            LifecycleAction::AttachFile,
            &context,
            actor,
        )?;
        variation.file_ids.insert(file.id.clone());
        variation.updated_at = now;

        Ok(VariationEvent::from_outcome(
            variation.id.clone(),
            &outcome,
            actor,
            file.name.clone(),
            now,
        ))
    }

    /// The caller has already confirmed the file is attached.
    pub fn detach_file(
        &self,
        variation: &mut Variation,
        file_id: &FileId,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<VariationEvent, DomainError> {
        let context = TransitionContext::for_variation(variation);
        let outcome = self.apply(
            &variation.id,
            Some(variation.status),
            LifecycleAction::DetachFile,
            &context,
            actor,
        )?;
        variation.file_ids.remove(file_id);
        variation.updated_at = now;

        Ok(VariationEvent::from_outcome(
            variation.id.clone(),
            &outcome,
            actor,
            file_id.0.clone(),
            now,
        ))
    }

    fn apply(
        &self,
        id: &VariationId,
        current: Option<VariationStatus>,
        action: LifecycleAction,
        context: &TransitionContext,
        actor: &str,
    ) -> Result<TransitionOutcome, TransitionError> {
        let audit = AuditContext::new(Some(id.clone()), correlation_id(), actor);
        self.engine.apply_with_audit(current, action, context, self.sink.as_ref(), &audit)
    }
}

impl Default for VariationWorkflow {
    fn default() -> Self {
        Self::new("AED", Arc::new(TracingAuditSink))
    }
}

fn settled_status(outcome: &TransitionOutcome) -> Result<VariationStatus, TransitionError> {
    outcome
        .to
        .ok_or(TransitionError::InvalidTransition { from: outcome.from, action: outcome.action })
}

fn correlation_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::VariationWorkflow;
    use crate::audit::InMemoryAuditSink;
    use crate::decision::DecisionRequest;
    use crate::domain::attachment::{FileId, FileRef};
    use crate::domain::cost::MaterialCost;
    use crate::domain::variation::{
        Disposition, DraftVariation, ProjectId, SubmitRequest, Variation, VariationDetails,
        VariationId, VariationNumber, VariationStatus,
    };
    use crate::errors::ErrorKind;

    fn draft() -> DraftVariation {
        let mut draft = DraftVariation::new(
            ProjectId("P-100".to_owned()),
            VariationDetails {
                title: "Reception joinery".to_owned(),
                change_description: "Extend reception desk".to_owned(),
                reason_description: "Additional workstation".to_owned(),
                change_requestor: "Client".to_owned(),
                ..VariationDetails::default()
            },
        );
        draft.costs.material_costs.push(
            MaterialCost::new("Oak veneer", Decimal::from(4), Decimal::from(120))
                .expect("material"),
        );
        draft
    }

    fn created(workflow: &VariationWorkflow) -> Variation {
        workflow
            .create(draft(), VariationId("VAR-1".to_owned()), VariationNumber(1), "pm", Utc::now())
            .expect("create")
            .0
    }

    #[test]
    fn create_uses_default_currency_and_emits_created_event() {
        let workflow = VariationWorkflow::default();
        let (variation, event) = workflow
            .create(draft(), VariationId("VAR-1".to_owned()), VariationNumber(1), "pm", Utc::now())
            .expect("create");

        assert_eq!(variation.status, VariationStatus::Draft);
        assert_eq!(variation.currency, workflow.default_currency());
        assert_eq!(event.event_type, "variation.created");
        assert_eq!(event.from_status, None);
    }

    #[test]
    fn create_without_requestor_is_a_validation_error() {
        let mut incomplete = draft();
        incomplete.details.change_requestor = "   ".to_owned();

        let error = VariationWorkflow::default()
            .create(incomplete, VariationId("VAR-2".to_owned()), VariationNumber(2), "pm", Utc::now())
            .expect_err("missing requestor");
        assert_eq!(error.kind(), ErrorKind::Validation);
    }

    #[test]
    fn submission_freezes_edits() {
        let workflow = VariationWorkflow::default();
        let mut variation = created(&workflow);

        workflow
            .submit(&mut variation, &SubmitRequest::default(), "pm", Utc::now())
            .expect("submit");
        assert_eq!(variation.status, VariationStatus::Submitted);

        let error = workflow
            .revise(&mut variation, draft(), "pm", Utc::now())
            .expect_err("frozen after submission");
        assert_eq!(error.kind(), ErrorKind::InvalidTransition);

        let error = workflow
            .submit(&mut variation, &SubmitRequest::default(), "pm", Utc::now())
            .expect_err("double submit");
        assert_eq!(error.kind(), ErrorKind::InvalidTransition);
    }

    #[test]
    fn deferred_disposition_keeps_reason_and_blocks_decisions() {
        let workflow = VariationWorkflow::default();
        let mut variation = created(&workflow);

        let event = workflow
            .submit(&mut variation, &SubmitRequest::deferred(" waiting on landlord "), "pm", Utc::now())
            .expect("defer");

        assert_eq!(event.event_type, "variation.deferred");
        assert_eq!(variation.status, VariationStatus::Deferred);
        assert_eq!(variation.disposition, Some(Disposition::Defer));
        assert_eq!(variation.disposition_reason.as_deref(), Some("waiting on landlord"));

        let error = workflow
            .decide(&mut variation, &DecisionRequest::approve("ok"), Utc::now())
            .expect_err("deferred is terminal");
        assert_eq!(error.kind(), ErrorKind::InvalidTransition);
    }

    #[test]
    fn decision_audit_trail_is_captured() {
        let sink = InMemoryAuditSink::default();
        let workflow = VariationWorkflow::new("AED", Arc::new(sink.clone()));
        let mut variation = created(&workflow);
        workflow
            .submit(&mut variation, &SubmitRequest::default(), "pm", Utc::now())
            .expect("submit");

        let event = workflow
            .decide(&mut variation, &DecisionRequest::approve("Looks good").by("client-1"), Utc::now())
            .expect("approve");
        assert_eq!(event.event_type, "variation.approved");
        assert_eq!(event.actor, "client-1");

        let conflict = workflow
            .decide(&mut variation, &DecisionRequest::decline("no"), Utc::now())
            .expect_err("second decision");
        assert_eq!(conflict.kind(), ErrorKind::Conflict);

        assert!(sink.events().iter().any(|event| event.event_type == "variation.decision.conflict"));
    }

    #[test]
    fn attachments_follow_the_lifecycle() {
        let workflow = VariationWorkflow::default();
        let mut variation = created(&workflow);
        let file = FileRef {
            id: FileId("F-1".to_owned()),
            name: "desk.pdf".to_owned(),
            size: 1024,
            content_type: "application/pdf".to_owned(),
            preview_url: None,
        };

        workflow.attach_file(&mut variation, &file, "pm", Utc::now()).expect("attach");
        assert!(variation.file_ids.contains(&file.id));

        workflow
            .submit(&mut variation, &SubmitRequest::default(), "pm", Utc::now())
            .expect("submit");
        workflow
            .decide(&mut variation, &DecisionRequest::approve(""), Utc::now())
            .expect("approve");

        let error = workflow
            .detach_file(&mut variation, &file.id, "pm", Utc::now())
            .expect_err("frozen");
        assert_eq!(error.kind(), ErrorKind::InvalidTransition);
        assert!(variation.file_ids.contains(&file.id));
    }

    #[test]
    fn discard_is_limited_to_drafts() {
        let workflow = VariationWorkflow::default();
        let mut variation = created(&workflow);
        let event = workflow.discard(&variation, "pm", Utc::now()).expect("discard draft");
        assert_eq!(event.to_status, None);

        workflow
            .submit(&mut variation, &SubmitRequest::default(), "pm", Utc::now())
            .expect("submit");
        assert!(workflow.discard(&variation, "pm", Utc::now()).is_err());
    }
}
