use async_trait::async_trait;

use crate::decision::DecisionRequest;
use crate::domain::attachment::{FileId, FileRef};
use crate::domain::event::VariationEvent;
use crate::domain::variation::{
    ClientDecision, DraftVariation, ProjectId, SubmitRequest, Variation, VariationId,
};
use crate::errors::ApplicationError;

/// Boundary to the system of record, which is the only authority on `status`.
#[async_trait]
pub trait VariationRepository: Send + Sync {
    async fn create(&self, draft: DraftVariation) -> Result<Variation, ApplicationError>;
    async fn find_by_id(&self, id: &VariationId) -> Result<Variation, ApplicationError>;
    /// Order is unspecified; callers sort for presentation.
    async fn list_by_project(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<Variation>, ApplicationError>;
    async fn update_draft(
        &self,
        id: &VariationId,
        draft: DraftVariation,
    ) -> Result<Variation, ApplicationError>;
    async fn submit_with(
        &self,
        id: &VariationId,
        request: SubmitRequest,
    ) -> Result<Variation, ApplicationError>;
    async fn begin_review(&self, id: &VariationId) -> Result<Variation, ApplicationError>;
    async fn approve(
        &self,
        id: &VariationId,
        request: DecisionRequest,
    ) -> Result<Variation, ApplicationError>;
    async fn decline(
        &self,
        id: &VariationId,
        request: DecisionRequest,
    ) -> Result<Variation, ApplicationError>;
    async fn discard(&self, id: &VariationId) -> Result<(), ApplicationError>;

    async fn submit(&self, id: &VariationId) -> Result<Variation, ApplicationError> {
        self.submit_with(id, SubmitRequest::default()).await
    }

    async fn record_decision(
        &self,
        id: &VariationId,
        request: DecisionRequest,
    ) -> Result<Variation, ApplicationError> {
        match request.decision {
            ClientDecision::Approve => self.approve(id, request).await,
            ClientDecision::Decline => self.decline(id, request).await,
        }
    }
}

#[async_trait]
pub trait AttachmentRepository: Send + Sync {
    async fn list_attached_files(
        &self,
        id: &VariationId,
    ) -> Result<Vec<FileRef>, ApplicationError>;
    async fn attach_file(
        &self,
        id: &VariationId,
        file: FileRef,
    ) -> Result<Variation, ApplicationError>;
    async fn delete_attached_file(
        &self,
        id: &VariationId,
        file_id: &FileId,
    ) -> Result<(), ApplicationError>;
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn list_events(
        &self,
        id: &VariationId,
    ) -> Result<Vec<VariationEvent>, ApplicationError>;
}

#[async_trait]
pub trait DocumentGenerator: Send + Sync {
    /// Rendered document bytes; `application/pdf` when a converter is available.
    async fn generate_document(&self, id: &VariationId) -> Result<Vec<u8>, ApplicationError>;
}
