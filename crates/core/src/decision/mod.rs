use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::variation::{ClientDecision, DecisionRecord, Variation, VariationStatus};
use crate::errors::{DomainError, ValidationError};
use crate::lifecycle::{
    LifecycleAction, LifecycleEngine, TransitionContext, TransitionError, TransitionOutcome,
    VariationLifecycle,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub decision: ClientDecision,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub decided_by: Option<String>,
}

impl DecisionRequest {
    pub fn approve(comment: impl Into<String>) -> Self {
        Self { decision: ClientDecision::Approve, comment: comment.into(), decided_by: None }
    }

    pub fn decline(comment: impl Into<String>) -> Self {
        Self { decision: ClientDecision::Decline, comment: comment.into(), decided_by: None }
    }

    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.decided_by = Some(actor.into());
        self
    }

    pub fn normalized_comment(&self) -> String {
        self.comment.trim().to_owned()
    }

    /// Checks that need no server state; a decline without comment never leaves the caller.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.decision == ClientDecision::Decline && self.comment.trim().is_empty() {
            return Err(ValidationError::CommentRequired);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionReceipt {
    pub from: VariationStatus,
    pub to: VariationStatus,
    pub record: DecisionRecord,
}

/// Applies a client decision to a variation awaiting one. At most one decision ever sticks.
#[derive(Clone, Debug, Default)]
pub struct DecisionRecorder {
    engine: LifecycleEngine<VariationLifecycle>,
}

impl DecisionRecorder {
    pub fn new(engine: LifecycleEngine<VariationLifecycle>) -> Self {
        Self { engine }
    }

    pub fn record(
        &self,
        variation: &mut Variation,
        request: &DecisionRequest,
        now: DateTime<Utc>,
    ) -> Result<DecisionReceipt, DomainError> {
        let context = decision_context(variation, request);
        let outcome = self.engine.apply(
            Some(variation.status),
            LifecycleAction::for_decision(request.decision),
            &context,
        )?;
        apply_outcome(variation, request, &outcome, now)
    }

    pub fn record_with_audit<S>(
        &self,
        variation: &mut Variation,
        request: &DecisionRequest,
        now: DateTime<Utc>,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<DecisionReceipt, DomainError>
    where
        S: AuditSink + ?Sized,
    {
        let context = decision_context(variation, request);
        let result = self
            .engine
            .apply_with_audit(
                Some(variation.status),
                LifecycleAction::for_decision(request.decision),
                &context,
                sink,
                audit,
            )
            .map_err(DomainError::from)
            .and_then(|outcome| apply_outcome(variation, request, &outcome, now));

        let (event_type, outcome) = match &result {
            Ok(_) => ("variation.decision.recorded", AuditOutcome::Success),
            Err(DomainError::Transition(TransitionError::DecisionAlreadyRecorded { .. })) => {
                ("variation.decision.conflict", AuditOutcome::Rejected)
            }
            Err(_) => ("variation.decision.rejected", AuditOutcome::Rejected),
        };
        sink.emit(
            AuditEvent::new(
                Some(variation.id.clone()),
                audit.correlation_id.clone(),
                event_type,
                AuditCategory::Decision,
                audit.actor.clone(),
                outcome,
            )
            .with_metadata("decision", request.decision.as_str())
            .with_metadata("status", variation.status.as_str()),
        );
        result
    }
}

fn decision_context(variation: &Variation, request: &DecisionRequest) -> TransitionContext {
    TransitionContext::for_variation(variation)
        .with_decision(&request.comment, request.decided_by.as_deref())
}

fn apply_outcome(
    variation: &mut Variation,
    request: &DecisionRequest,
    outcome: &TransitionOutcome,
    now: DateTime<Utc>,
) -> Result<DecisionReceipt, DomainError> {
    let to = outcome.to.ok_or(TransitionError::InvalidTransition {
        from: outcome.from,
        action: outcome.action,
    })?;
    let record = DecisionRecord {
        decision: request.decision,
        comment: request.normalized_comment(),
        decided_by: request.decided_by.clone(),
        decided_at: now,
    };

    let from = variation.status;
    variation.status = to;
    variation.decision = Some(record.clone());
    variation.updated_at = now;

    Ok(DecisionReceipt { from, to, record })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use super::{DecisionRecorder, DecisionRequest};
    use crate::audit::{AuditContext, InMemoryAuditSink};
    use crate::domain::cost::MaterialCost;
    use crate::domain::variation::{
        DraftVariation, ProjectId, Variation, VariationDetails, VariationId, VariationNumber,
        VariationStatus,
    };
    use crate::errors::{DomainError, ErrorKind, ValidationError};
    use crate::lifecycle::TransitionError;

    fn submitted_variation() -> Variation {
        let mut draft = DraftVariation::new(
            ProjectId("P-1".to_owned()),
            VariationDetails {
                change_description: "Marble lobby".to_owned(),
                reason_description: "Upgrade".to_owned(),
                change_requestor: "Site manager".to_owned(),
                ..VariationDetails::default()
            },
        );
        draft.costs.material_costs.push(
            MaterialCost::new("Marble tile", Decimal::from(10), Decimal::from(50))
                .expect("material"),
        );
        let mut variation = Variation::from_draft(
            draft,
            VariationId("VAR-1".to_owned()),
            VariationNumber(1),
            "AED",
            Utc::now(),
        )
        .expect("variation");
        variation.status = VariationStatus::Submitted;
        variation
    }

    #[test]
    fn approve_records_comment_and_timestamp() {
        let mut variation = submitted_variation();
        let now = Utc::now();

        let receipt = DecisionRecorder::default()
            .record(&mut variation, &DecisionRequest::approve("Looks good"), now)
            .expect("approve");

        assert_eq!(receipt.to, VariationStatus::Approved);
        assert_eq!(variation.status, VariationStatus::Approved);
        assert_eq!(variation.client_comment(), Some("Looks good"));
        assert_eq!(variation.decided_at(), Some(now));
        assert_eq!(variation.price_impact(), Decimal::from(500));
    }

    #[test]
    fn decline_with_empty_comment_leaves_status_unchanged() {
        let mut variation = submitted_variation();
        let request = DecisionRequest::decline("");

        assert_eq!(request.validate(), Err(ValidationError::CommentRequired));
        let error = DecisionRecorder::default()
            .record(&mut variation, &request, Utc::now())
            .expect_err("empty comment");

        assert_eq!(error.kind(), ErrorKind::Validation);
        assert_eq!(variation.status, VariationStatus::Submitted);
        assert!(variation.decision.is_none());
    }

    #[test]
    fn decline_with_comment_sets_declined() {
        let mut variation = submitted_variation();

        DecisionRecorder::default()
            .record(&mut variation, &DecisionRequest::decline("too expensive"), Utc::now())
            .expect("decline");

        assert_eq!(variation.status, VariationStatus::Declined);
        assert_eq!(variation.client_comment(), Some("too expensive"));
    }

    #[test]
    fn second_decision_conflicts_and_keeps_the_first() {
        let mut variation = submitted_variation();
        let recorder = DecisionRecorder::default();
        let first_at = Utc::now();
        recorder
            .record(&mut variation, &DecisionRequest::approve("Looks good"), first_at)
            .expect("first decision");

        let error = recorder
            .record(
                &mut variation,
                &DecisionRequest::decline("changed my mind"),
                first_at + Duration::minutes(5),
            )
            .expect_err("second decision");

        assert!(matches!(
            error,
            DomainError::Transition(TransitionError::DecisionAlreadyRecorded { decided_at })
                if decided_at == first_at
        ));
        assert_eq!(variation.status, VariationStatus::Approved);
        assert_eq!(variation.client_comment(), Some("Looks good"));
        assert_eq!(variation.decided_at(), Some(first_at));
    }

    #[test]
    fn recorded_client_must_be_the_deciding_actor() {
        let mut variation = submitted_variation();
        variation.client_id = Some("client-7".to_owned());
        let recorder = DecisionRecorder::default();

        let error = recorder
            .record(&mut variation, &DecisionRequest::approve("ok"), Utc::now())
            .expect_err("no decided_by");
        assert_eq!(error.kind(), ErrorKind::InvalidTransition);
        assert_eq!(variation.status, VariationStatus::Submitted);
        assert!(variation.decision.is_none());

        recorder
            .record(&mut variation, &DecisionRequest::approve("ok").by("client-7"), Utc::now())
            .expect("client of record");
        assert_eq!(variation.status, VariationStatus::Approved);
    }

    #[test]
    fn draft_cannot_be_decided() {
        let mut variation = submitted_variation();
        variation.status = VariationStatus::Draft;

        let error = DecisionRecorder::default()
            .record(&mut variation, &DecisionRequest::approve(""), Utc::now())
            .expect_err("draft");

        assert_eq!(error.kind(), ErrorKind::InvalidTransition);
    }

    #[test]
    fn audited_conflict_is_tagged() {
        let mut variation = submitted_variation();
        let recorder = DecisionRecorder::default();
        let sink = InMemoryAuditSink::default();
        let audit = AuditContext::new(Some(variation.id.clone()), "req-1", "client-7");

        recorder
            .record_with_audit(&mut variation, &DecisionRequest::approve(""), Utc::now(), &sink, &audit)
            .expect("approve");
        let _ = recorder.record_with_audit(
            &mut variation,
            &DecisionRequest::approve("again"),
            Utc::now(),
            &sink,
            &audit,
        );

        let event_types: Vec<_> =
            sink.events().into_iter().map(|event| event.event_type).collect();
        assert!(event_types.contains(&"variation.decision.recorded".to_owned()));
        assert!(event_types.contains(&"variation.decision.conflict".to_owned()));
    }
}
