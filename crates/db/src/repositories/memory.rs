use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use fitout_core::decision::DecisionRequest;
use fitout_core::domain::attachment::{FileId, FileRef};
use fitout_core::domain::event::VariationEvent;
use fitout_core::domain::variation::{
    ClientDecision, DraftVariation, ProjectId, SubmitRequest, Variation, VariationId,
    VariationNumber,
};
use fitout_core::errors::{ApplicationError, DomainError};
use fitout_core::repository::{AttachmentRepository, ChangeFeed, VariationRepository};
use fitout_core::workflow::VariationWorkflow;

use super::{next_variation_id, MANAGER_ACTOR};

#[derive(Default)]
struct MemoryState {
    variations: HashMap<String, Variation>,
    last_numbers: HashMap<String, u32>,
    files: HashMap<String, Vec<FileRef>>,
    events: HashMap<String, Vec<VariationEvent>>,
}

impl MemoryState {
    fn variation(&self, id: &VariationId) -> Result<&Variation, ApplicationError> {
        self.variations.get(&id.0).ok_or_else(|| ApplicationError::variation_not_found(&id.0))
    }

    fn record(&mut self, event: VariationEvent) {
        self.events.entry(event.variation_id.0.clone()).or_default().push(event);
    }
}

/// System of record held in process memory; every operation runs under one write lock.
pub struct InMemoryVariationRepository {
    workflow: VariationWorkflow,
    state: RwLock<MemoryState>,
}

impl Default for InMemoryVariationRepository {
    fn default() -> Self {
        Self::new(VariationWorkflow::default())
    }
}

impl InMemoryVariationRepository {
    pub fn new(workflow: VariationWorkflow) -> Self {
        Self { workflow, state: RwLock::new(MemoryState::default()) }
    }

    /// Applies `change` to a copy and stores it only when the workflow accepts the change.
    async fn mutate<F>(&self, id: &VariationId, change: F) -> Result<Variation, ApplicationError>
    where
        F: FnOnce(
            &VariationWorkflow,
            &mut Variation,
            DateTime<Utc>,
        ) -> Result<VariationEvent, DomainError>,
    {
        let mut state = self.state.write().await;
        let mut next = state.variation(id)?.clone();
        let event = change(&self.workflow, &mut next, Utc::now())?;

        state.variations.insert(id.0.clone(), next.clone());
        state.record(event);
        Ok(next)
    }

    async fn decide(
        &self,
        id: &VariationId,
        request: DecisionRequest,
    ) -> Result<Variation, ApplicationError> {
        self.mutate(id, |workflow, variation, now| workflow.decide(variation, &request, now))
            .await
    }
}

#[async_trait::async_trait]
impl VariationRepository for InMemoryVariationRepository {
    async fn create(&self, draft: DraftVariation) -> Result<Variation, ApplicationError> {
        let mut state = self.state.write().await;
        let project = draft.project_id.0.clone();
        let number = state.last_numbers.get(&project).copied().unwrap_or(0) + 1;

        let (variation, event) = self.workflow.create(
            draft,
            next_variation_id(),
            VariationNumber(number),
            MANAGER_ACTOR,
            Utc::now(),
        )?;

        state.last_numbers.insert(project, number);
        state.variations.insert(variation.id.0.clone(), variation.clone());
        state.record(event);
        Ok(variation)
    }

    async fn find_by_id(&self, id: &VariationId) -> Result<Variation, ApplicationError> {
        let state = self.state.read().await;
        state.variation(id).cloned()
    }

    async fn list_by_project(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<Variation>, ApplicationError> {
        let state = self.state.read().await;
        let mut variations: Vec<Variation> = state
            .variations
            .values()
            .filter(|variation| variation.project_id == *project_id)
            .cloned()
            .collect();
        variations.sort_by_key(|variation| variation.number);
        Ok(variations)
    }

    async fn update_draft(
        &self,
        id: &VariationId,
        draft: DraftVariation,
    ) -> Result<Variation, ApplicationError> {
        self.mutate(id, |workflow, variation, now| {
            workflow.revise(variation, draft, MANAGER_ACTOR, now)
        })
        .await
    }

    async fn submit_with(
        &self,
        id: &VariationId,
        request: SubmitRequest,
    ) -> Result<Variation, ApplicationError> {
        self.mutate(id, |workflow, variation, now| {
            workflow.submit(variation, &request, MANAGER_ACTOR, now)
        })
        .await
    }

    async fn begin_review(&self, id: &VariationId) -> Result<Variation, ApplicationError> {
        self.mutate(id, |workflow, variation, now| {
            workflow.begin_review(variation, MANAGER_ACTOR, now)
        })
        .await
    }

    async fn approve(
        &self,
        id: &VariationId,
        mut request: DecisionRequest,
    ) -> Result<Variation, ApplicationError> {
        request.decision = ClientDecision::Approve;
        self.decide(id, request).await
    }

    async fn decline(
        &self,
        id: &VariationId,
        mut request: DecisionRequest,
    ) -> Result<Variation, ApplicationError> {
        request.decision = ClientDecision::Decline;
        self.decide(id, request).await
    }

    async fn discard(&self, id: &VariationId) -> Result<(), ApplicationError> {
        let mut state = self.state.write().await;
        let event = self.workflow.discard(state.variation(id)?, MANAGER_ACTOR, Utc::now())?;

        state.variations.remove(&id.0);
        state.files.remove(&id.0);
        state.record(event);
        Ok(())
    }
}

#[async_trait::async_trait]
impl AttachmentRepository for InMemoryVariationRepository {
    async fn list_attached_files(
        &self,
        id: &VariationId,
    ) -> Result<Vec<FileRef>, ApplicationError> {
        let state = self.state.read().await;
        state.variation(id)?;
        Ok(state.files.get(&id.0).cloned().unwrap_or_default())
    }

    async fn attach_file(
        &self,
        id: &VariationId,
        file: FileRef,
    ) -> Result<Variation, ApplicationError> {
        let mut state = self.state.write().await;
        let mut next = state.variation(id)?.clone();
        let event = self.workflow.attach_file(&mut next, &file, MANAGER_ACTOR, Utc::now())?;

        let files = state.files.entry(id.0.clone()).or_default();
        files.retain(|existing| existing.id != file.id);
        files.push(file);
        state.variations.insert(id.0.clone(), next.clone());
        state.record(event);
        Ok(next)
    }

    async fn delete_attached_file(
        &self,
        id: &VariationId,
        file_id: &FileId,
    ) -> Result<(), ApplicationError> {
        let mut state = self.state.write().await;
        let mut next = state.variation(id)?.clone();
        if !next.file_ids.contains(file_id) {
            return Err(ApplicationError::file_not_found(&file_id.0));
        }
        let event = self.workflow.detach_file(&mut next, file_id, MANAGER_ACTOR, Utc::now())?;

        if let Some(files) = state.files.get_mut(&id.0) {
            files.retain(|existing| existing.id != *file_id);
        }
        state.variations.insert(id.0.clone(), next);
        state.record(event);
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChangeFeed for InMemoryVariationRepository {
    async fn list_events(&self, id: &VariationId) -> Result<Vec<VariationEvent>, ApplicationError> {
        let state = self.state.read().await;
        state.variation(id)?;
        Ok(state.events.get(&id.0).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rust_decimal::Decimal;

    use fitout_core::decision::DecisionRequest;
    use fitout_core::domain::attachment::{FileId, FileRef};
    use fitout_core::domain::cost::{LaborCost, MaterialCost};
    use fitout_core::domain::variation::{
        DraftVariation, ProjectId, SubmitRequest, VariationDetails, VariationNumber,
        VariationStatus,
    };
    use fitout_core::errors::ErrorKind;
    use fitout_core::repository::{AttachmentRepository, ChangeFeed, VariationRepository};

    use super::InMemoryVariationRepository;

    fn draft(project: &str) -> DraftVariation {
        let mut draft = DraftVariation::new(
            ProjectId(project.to_owned()),
            VariationDetails {
                title: "Partition relocation".to_owned(),
                change_description: "Move meeting room partition 600mm east".to_owned(),
                reason_description: "Client requested larger boardroom".to_owned(),
                change_requestor: "Client PM".to_owned(),
                ..VariationDetails::default()
            },
        );
        draft.costs.material_costs.push(
            MaterialCost::new("Gypsum board", Decimal::from(10), Decimal::from(50))
                .expect("material"),
        );
        draft.costs.labor_costs.push(
            LaborCost::new("Installer", Decimal::from(8), Decimal::from(40)).expect("labor"),
        );
        draft
    }

    fn file(id: &str) -> FileRef {
        FileRef {
            id: FileId(id.to_owned()),
            name: format!("{id}.pdf"),
            size: 1024,
            content_type: "application/pdf".to_owned(),
            preview_url: None,
        }
    }

    #[tokio::test]
    async fn numbers_are_allocated_per_project() {
        let repo = InMemoryVariationRepository::default();

        let first = repo.create(draft("P-1")).await.expect("first");
        let second = repo.create(draft("P-1")).await.expect("second");
        let other = repo.create(draft("P-2")).await.expect("other project");

        assert_eq!(first.number, VariationNumber(1));
        assert_eq!(second.number, VariationNumber(2));
        assert_eq!(other.number, VariationNumber(1));
        assert_eq!(first.price_impact(), Decimal::from(820));
    }

    #[tokio::test]
    async fn discarded_numbers_are_not_reused() {
        let repo = InMemoryVariationRepository::default();
        let first = repo.create(draft("P-1")).await.expect("first");

        repo.discard(&first.id).await.expect("discard draft");
        let next = repo.create(draft("P-1")).await.expect("next");

        assert_eq!(next.number, VariationNumber(2));
        let error = repo.find_by_id(&first.id).await.expect_err("discarded");
        assert_eq!(error.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn discard_keeps_the_change_feed_and_appends_to_it() {
        let repo = InMemoryVariationRepository::default();
        let created = repo.create(draft("P-1")).await.expect("create");

        repo.discard(&created.id).await.expect("discard draft");

        let state = repo.state.read().await;
        let types: Vec<&str> = state.events[&created.id.0]
            .iter()
            .map(|event| event.event_type.as_str())
            .collect();
        assert_eq!(types, vec!["variation.created", "variation.discarded"]);
    }

    #[tokio::test]
    async fn invalid_draft_is_rejected_without_allocating_a_number() {
        let repo = InMemoryVariationRepository::default();
        let mut invalid = draft("P-1");
        invalid.details.change_requestor = "  ".to_owned();

        let error = repo.create(invalid).await.expect_err("missing requestor");
        let valid = repo.create(draft("P-1")).await.expect("valid");

        assert_eq!(error.kind(), ErrorKind::Validation);
        assert_eq!(valid.number, VariationNumber(1));
    }

    #[tokio::test]
    async fn full_lifecycle_to_decline_records_the_comment() {
        let repo = InMemoryVariationRepository::default();
        let created = repo.create(draft("P-1")).await.expect("create");

        repo.submit(&created.id).await.expect("submit");
        repo.begin_review(&created.id).await.expect("review");
        let declined = repo
            .decline(&created.id, DecisionRequest::decline("  Over budget  "))
            .await
            .expect("decline");

        assert_eq!(declined.status, VariationStatus::Declined);
        assert_eq!(declined.client_comment(), Some("Over budget"));

        let events = repo.list_events(&created.id).await.expect("events");
        let types: Vec<&str> = events.iter().map(|event| event.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                "variation.created",
                "variation.submitted",
                "variation.review_started",
                "variation.declined"
            ]
        );
    }

    #[tokio::test]
    async fn second_decision_conflicts_and_keeps_the_first() {
        let repo = InMemoryVariationRepository::default();
        let created = repo.create(draft("P-1")).await.expect("create");
        repo.submit(&created.id).await.expect("submit");

        let approved =
            repo.approve(&created.id, DecisionRequest::approve("")).await.expect("approve");
        let error = repo
            .decline(&created.id, DecisionRequest::decline("changed my mind"))
            .await
            .expect_err("second decision");

        assert_eq!(error.kind(), ErrorKind::Conflict);
        let stored = repo.find_by_id(&created.id).await.expect("reload");
        assert_eq!(stored.status, VariationStatus::Approved);
        assert_eq!(stored.decided_at(), approved.decided_at());
    }

    #[tokio::test]
    async fn concurrent_decisions_settle_exactly_once() {
        let repo = Arc::new(InMemoryVariationRepository::default());
        let created = repo.create(draft("P-1")).await.expect("create");
        repo.submit(&created.id).await.expect("submit");

        let approve = {
            let repo = Arc::clone(&repo);
            let id = created.id.clone();
            tokio::spawn(async move { repo.approve(&id, DecisionRequest::approve("ok")).await })
        };
        let decline = {
            let repo = Arc::clone(&repo);
            let id = created.id.clone();
            tokio::spawn(async move { repo.decline(&id, DecisionRequest::decline("no")).await })
        };

        let results = [approve.await.expect("join"), decline.await.expect("join")];
        let successes = results.iter().filter(|result| result.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|result| matches!(result, Err(error) if error.kind() == ErrorKind::Conflict))
            .count();

        assert_eq!(successes, 1);
        assert_eq!(conflicts, 1);
    }

    #[tokio::test]
    async fn deferred_submission_is_terminal() {
        let repo = InMemoryVariationRepository::default();
        let created = repo.create(draft("P-1")).await.expect("create");

        let deferred = repo
            .submit_with(&created.id, SubmitRequest::deferred("Await landlord approval"))
            .await
            .expect("defer");
        let error = repo.begin_review(&created.id).await.expect_err("terminal");

        assert_eq!(deferred.status, VariationStatus::Deferred);
        assert_eq!(error.kind(), ErrorKind::InvalidTransition);
    }

    #[tokio::test]
    async fn revising_a_submitted_variation_is_rejected() {
        let repo = InMemoryVariationRepository::default();
        let created = repo.create(draft("P-1")).await.expect("create");
        repo.submit(&created.id).await.expect("submit");

        let mut revised = draft("P-1");
        revised.details.title = "Changed".to_owned();
        let error = repo.update_draft(&created.id, revised).await.expect_err("frozen");

        assert_eq!(error.kind(), ErrorKind::InvalidTransition);
        let stored = repo.find_by_id(&created.id).await.expect("reload");
        assert_eq!(stored.details.title, "Partition relocation");
    }

    #[tokio::test]
    async fn attachments_round_trip_and_missing_files_are_not_found() {
        let repo = InMemoryVariationRepository::default();
        let created = repo.create(draft("P-1")).await.expect("create");

        repo.attach_file(&created.id, file("F-1")).await.expect("attach");
        repo.attach_file(&created.id, file("F-2")).await.expect("attach");
        repo.delete_attached_file(&created.id, &FileId("F-1".to_owned()))
            .await
            .expect("detach");

        let files = repo.list_attached_files(&created.id).await.expect("files");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].id, FileId("F-2".to_owned()));

        let error = repo
            .delete_attached_file(&created.id, &FileId("F-9".to_owned()))
            .await
            .expect_err("unknown file");
        assert_eq!(error.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn list_by_project_orders_by_number() {
        let repo = InMemoryVariationRepository::default();
        for _ in 0..3 {
            repo.create(draft("P-1")).await.expect("create");
        }
        repo.create(draft("P-2")).await.expect("create");

        let listed = repo.list_by_project(&ProjectId("P-1".to_owned())).await.expect("list");
        let numbers: Vec<u32> = listed.iter().map(|variation| variation.number.0).collect();

        assert_eq!(numbers, vec![1, 2, 3]);
    }
}
