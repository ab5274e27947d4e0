use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use fitout_core::decision::DecisionRequest;
use fitout_core::domain::attachment::{FileId, FileRef};
use fitout_core::domain::variation::{
    DraftVariation, ProjectId, SubmitRequest, Variation, VariationId,
};
use fitout_core::errors::{ApplicationError, ErrorKind};
use fitout_core::repository::{AttachmentRepository, VariationRepository};

use crate::cache::VariationFilesCache;

/// Portal-side coordinator for one user's view of a project's variations.
///
/// The local view is replaced by every server response and never edited speculatively.
/// Input that can be checked locally is checked before any request is made.
pub struct VariationSession<R: ?Sized> {
    repository: Arc<R>,
    files: VariationFilesCache,
    actor: Option<String>,
    view: HashMap<VariationId, Variation>,
}

impl<R> VariationSession<R>
where
    R: VariationRepository + AttachmentRepository + ?Sized,
{
    pub fn new(repository: Arc<R>, files: VariationFilesCache) -> Self {
        Self { repository, files, actor: None, view: HashMap::new() }
    }

    /// Decisions made through this session are attributed to `actor`.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn variation(&self, id: &VariationId) -> Option<&Variation> {
        self.view.get(id)
    }

    /// Local view of one project, ordered by variation number.
    pub fn project_view(&self, project_id: &ProjectId) -> Vec<&Variation> {
        let mut variations: Vec<&Variation> =
            self.view.values().filter(|variation| variation.project_id == *project_id).collect();
        variations.sort_by_key(|variation| variation.number);
        variations
    }

    pub async fn load_project(
        &mut self,
        project_id: &ProjectId,
    ) -> Result<Vec<&Variation>, ApplicationError> {
        let variations = self.repository.list_by_project(project_id).await?;
        self.view.retain(|_, variation| variation.project_id != *project_id);
        for variation in variations {
            self.store(variation);
        }
        Ok(self.project_view(project_id))
    }

    pub async fn refresh(&mut self, id: &VariationId) -> Result<&Variation, ApplicationError> {
        match self.repository.find_by_id(id).await {
            Ok(variation) => Ok(self.store(variation)),
            Err(error) => {
                if error.kind() == ErrorKind::NotFound {
                    self.view.remove(id);
                }
                Err(error)
            }
        }
    }

    pub async fn create(&mut self, draft: DraftVariation) -> Result<&Variation, ApplicationError> {
        draft.validate()?;
        let variation = self.repository.create(draft).await?;
        info!(
            event_name = "variation.session.created",
            variation_id = %variation.id,
            number = variation.number.0,
            "variation drafted"
        );
        Ok(self.store(variation))
    }

    pub async fn update_draft(
        &mut self,
        id: &VariationId,
        draft: DraftVariation,
    ) -> Result<&Variation, ApplicationError> {
        draft.validate()?;
        let result = self.repository.update_draft(id, draft).await;
        self.settle(id, result, false).await
    }

    pub async fn submit(
        &mut self,
        id: &VariationId,
        request: SubmitRequest,
    ) -> Result<&Variation, ApplicationError> {
        let result = self.repository.submit_with(id, request).await;
        self.settle(id, result, true).await
    }

    pub async fn approve(
        &mut self,
        id: &VariationId,
        comment: impl Into<String>,
    ) -> Result<&Variation, ApplicationError> {
        let request = self.attributed(DecisionRequest::approve(comment));
        self.decide(id, request).await
    }

    /// A blank comment is rejected here and never reaches the system of record.
    pub async fn decline(
        &mut self,
        id: &VariationId,
        comment: impl Into<String>,
    ) -> Result<&Variation, ApplicationError> {
        let request = self.attributed(DecisionRequest::decline(comment));
        self.decide(id, request).await
    }

    pub async fn discard(&mut self, id: &VariationId) -> Result<(), ApplicationError> {
        self.repository.discard(id).await?;
        self.view.remove(id);
        self.files.invalidate(id).await;
        Ok(())
    }

    pub async fn files(&self, id: &VariationId) -> Result<Vec<FileRef>, ApplicationError> {
        let repository = Arc::clone(&self.repository);
        self.files.get_or_load(id, || async move { repository.list_attached_files(id).await }).await
    }

    pub async fn attach_file(
        &mut self,
        id: &VariationId,
        file: FileRef,
    ) -> Result<&Variation, ApplicationError> {
        let result = self.repository.attach_file(id, file).await;
        self.settle(id, result, true).await
    }

    pub async fn delete_file(
        &mut self,
        id: &VariationId,
        file_id: &FileId,
    ) -> Result<(), ApplicationError> {
        self.repository.delete_attached_file(id, file_id).await?;
        self.files.invalidate(id).await;
        if let Err(error) = self.refresh(id).await {
            warn!(
                event_name = "variation.session.refresh_failed",
                variation_id = %id,
                error = %error,
                "view kept after file removal"
            );
        }
        Ok(())
    }

    fn attributed(&self, request: DecisionRequest) -> DecisionRequest {
        match &self.actor {
            Some(actor) => request.by(actor.clone()),
            None => request,
        }
    }

    async fn decide(
        &mut self,
        id: &VariationId,
        request: DecisionRequest,
    ) -> Result<&Variation, ApplicationError> {
        request.validate()?;
        let result = self.repository.record_decision(id, request).await;
        self.settle(id, result, true).await
    }

    /// Stores a successful response; after a refresh-worthy failure the view is re-fetched so
    /// it shows the state that beat this call. Either way the files cache is dropped when the
    /// call could have changed attachments.
    async fn settle(
        &mut self,
        id: &VariationId,
        result: Result<Variation, ApplicationError>,
        touches_files: bool,
    ) -> Result<&Variation, ApplicationError> {
        match result {
            Ok(variation) => {
                if touches_files {
                    self.files.invalidate(id).await;
                }
                Ok(self.store(variation))
            }
            Err(error) => {
                if error.kind().requires_refresh() {
                    if error.kind() == ErrorKind::Conflict {
                        warn!(
                            event_name = "variation.decision.conflict",
                            variation_id = %id,
                            "server state moved on; refreshing view"
                        );
                    }
                    if touches_files {
                        self.files.invalidate(id).await;
                    }
                    if let Err(refresh_error) = self.refresh(id).await {
                        warn!(
                            event_name = "variation.session.refresh_failed",
                            variation_id = %id,
                            error = %refresh_error,
                            "view kept after a rejected change"
                        );
                    }
                }
                Err(error)
            }
        }
    }

    fn store(&mut self, variation: Variation) -> &Variation {
        let id = variation.id.clone();
        self.view.insert(id.clone(), variation);
        &self.view[&id]
    }
}
