use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{debug, warn};

use fitout_core::config::ApiConfig;
use fitout_core::decision::DecisionRequest;
use fitout_core::domain::attachment::{FileId, FileRef};
use fitout_core::domain::event::VariationEvent;
use fitout_core::domain::variation::{
    ClientDecision, DraftVariation, ProjectId, SubmitRequest, Variation, VariationId,
};
use fitout_core::errors::ApplicationError;
use fitout_core::repository::{
    AttachmentRepository, ChangeFeed, DocumentGenerator, VariationRepository,
};

use crate::ingress;

const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Serialize)]
struct DecisionBody<'a> {
    comment: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    decided_by: Option<&'a str>,
}

/// Repository backed by the remote system of record.
///
/// Reads are retried on transport failure with a linear backoff; writes are sent exactly once.
#[derive(Clone)]
pub struct HttpVariationRepository {
    client: Client,
    base_url: Url,
    token: Option<SecretString>,
    max_read_retries: u32,
    retry_backoff: Duration,
}

impl HttpVariationRepository {
    pub fn new(config: &ApiConfig) -> Result<Self, ApplicationError> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            ApplicationError::Configuration(format!("api.base_url `{}`: {e}", config.base_url))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ApplicationError::Configuration(format!(
                "api.base_url `{}` cannot carry a path",
                config.base_url
            )));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| ApplicationError::Configuration(format!("http client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            token: config.token.clone(),
            max_read_retries: config.max_read_retries,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        })
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApplicationError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApplicationError::Configuration("api.base_url has no path".to_owned()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<Vec<u8>, ApplicationError> {
        let response = builder
            .send()
            .await
            .map_err(|e| ApplicationError::Unavailable(format!("request failed: {e}")))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ApplicationError::Unavailable(format!("read body failed: {e}")))?;

        if status.is_success() {
            Ok(body.to_vec())
        } else {
            Err(ingress::decode_error(status.as_u16(), &body))
        }
    }

    async fn read(
        &self,
        segments: &[&str],
        query: &[(&str, &str)],
    ) -> Result<Vec<u8>, ApplicationError> {
        let url = self.endpoint(segments)?;
        let mut attempt: u32 = 0;
        loop {
            let builder = self.request(Method::GET, url.clone()).query(query);
            match self.execute(builder).await {
                Err(error) if error.kind().is_retryable_read() && attempt < self.max_read_retries => {
                    attempt += 1;
                    warn!(
                        event_name = "variation.read.retry",
                        url = %url,
                        attempt,
                        error = %error,
                        "retrying read after transport failure"
                    );
                    tokio::time::sleep(self.retry_backoff.saturating_mul(attempt)).await;
                }
                result => return result,
            }
        }
    }

    async fn write<B: Serialize + ?Sized>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&B>,
    ) -> Result<Vec<u8>, ApplicationError> {
        let url = self.endpoint(segments)?;
        debug!(event_name = "variation.write.sent", method = %method, url = %url, "sending write");
        let mut builder = self.request(method, url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        self.execute(builder).await
    }

    async fn decide(
        &self,
        id: &VariationId,
        request: &DecisionRequest,
    ) -> Result<Variation, ApplicationError> {
        request.validate()?;
        let action = match request.decision {
            ClientDecision::Approve => "approve",
            ClientDecision::Decline => "decline",
        };
        let body = DecisionBody {
            comment: request.comment.as_str(),
            decided_by: request.decided_by.as_deref(),
        };
        let response =
            self.write(Method::POST, &["variation", id.0.as_str(), action], Some(&body)).await?;
        ingress::decode_variation(&response)
    }
}

#[async_trait]
impl VariationRepository for HttpVariationRepository {
    async fn create(&self, draft: DraftVariation) -> Result<Variation, ApplicationError> {
        draft.validate()?;
        let response = self.write(Method::POST, &["variation"], Some(&draft)).await?;
        ingress::decode_variation(&response)
    }

    async fn find_by_id(&self, id: &VariationId) -> Result<Variation, ApplicationError> {
        let response = self.read(&["variation", id.0.as_str()], &[]).await?;
        ingress::decode_variation(&response)
    }

    async fn list_by_project(
        &self,
        project_id: &ProjectId,
    ) -> Result<Vec<Variation>, ApplicationError> {
        let response = self.read(&["variations"], &[("project", project_id.0.as_str())]).await?;
        ingress::decode_variations(&response)
    }

    async fn update_draft(
        &self,
        id: &VariationId,
        draft: DraftVariation,
    ) -> Result<Variation, ApplicationError> {
        draft.validate()?;
        let response =
            self.write(Method::PUT, &["variation", id.0.as_str()], Some(&draft)).await?;
        ingress::decode_variation(&response)
    }

    async fn submit_with(
        &self,
        id: &VariationId,
        request: SubmitRequest,
    ) -> Result<Variation, ApplicationError> {
        let response = self
            .write(Method::POST, &["variation", id.0.as_str(), "submit"], Some(&request))
            .await?;
        ingress::decode_variation(&response)
    }

    async fn begin_review(&self, id: &VariationId) -> Result<Variation, ApplicationError> {
        let response = self
            .write::<()>(Method::POST, &["variation", id.0.as_str(), "review"], None)
            .await?;
        ingress::decode_variation(&response)
    }

    async fn approve(
        &self,
        id: &VariationId,
        mut request: DecisionRequest,
    ) -> Result<Variation, ApplicationError> {
        request.decision = ClientDecision::Approve;
        self.decide(id, &request).await
    }

    async fn decline(
        &self,
        id: &VariationId,
        mut request: DecisionRequest,
    ) -> Result<Variation, ApplicationError> {
        request.decision = ClientDecision::Decline;
        self.decide(id, &request).await
    }

    async fn discard(&self, id: &VariationId) -> Result<(), ApplicationError> {
        self.write::<()>(Method::DELETE, &["variation", id.0.as_str()], None).await?;
        Ok(())
    }
}

#[async_trait]
impl AttachmentRepository for HttpVariationRepository {
    async fn list_attached_files(
        &self,
        id: &VariationId,
    ) -> Result<Vec<FileRef>, ApplicationError> {
        let response = self.read(&["variation", id.0.as_str(), "files"], &[]).await?;
        ingress::decode_files(&response)
    }

    async fn attach_file(
        &self,
        id: &VariationId,
        file: FileRef,
    ) -> Result<Variation, ApplicationError> {
        let response = self
            .write(Method::POST, &["variation", id.0.as_str(), "files"], Some(&file))
            .await?;
        ingress::decode_variation(&response)
    }

    async fn delete_attached_file(
        &self,
        id: &VariationId,
        file_id: &FileId,
    ) -> Result<(), ApplicationError> {
        self.write::<()>(
            Method::DELETE,
            &["variation", id.0.as_str(), "files", file_id.0.as_str()],
            None,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for HttpVariationRepository {
    async fn list_events(&self, id: &VariationId) -> Result<Vec<VariationEvent>, ApplicationError> {
        let response = self.read(&["variation", id.0.as_str(), "events"], &[]).await?;
        ingress::decode_events(&response)
    }
}

#[async_trait]
impl DocumentGenerator for HttpVariationRepository {
    async fn generate_document(&self, id: &VariationId) -> Result<Vec<u8>, ApplicationError> {
        self.read(&["document", "variation", id.0.as_str()], &[]).await
    }
}
