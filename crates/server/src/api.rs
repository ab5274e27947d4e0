//! HTTP surface of the variation system of record.
//!
//! JSON endpoints:
//! - `POST   /variation`: create a draft
//! - `GET    /variations?project={id}`: list a project's variations
//! - `GET    /variation/{id}`: fetch one variation
//! - `PUT    /variation/{id}`: revise a draft
//! - `DELETE /variation/{id}`: discard a draft
//! - `POST   /variation/{id}/submit`: submit (optionally deferred)
//! - `POST   /variation/{id}/review`: begin client review
//! - `POST   /variation/{id}/approve`: record client approval
//! - `POST   /variation/{id}/decline`: record client decline (comment required)
//! - `GET    /variation/{id}/files`: list attached files
//! - `POST   /variation/{id}/files`: attach a file
//! - `DELETE /variation/{id}/files/{file_id}`: detach a file
//! - `GET    /variation/{id}/events`: lifecycle change feed
//!
//! Document endpoint:
//! - `GET    /document/variation/{id}`: PDF (HTML when no converter is installed)

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use fitout_core::costing::{CostBreakdown, CostingEngine, DeterministicCostingEngine};
use fitout_core::decision::DecisionRequest;
use fitout_core::domain::attachment::{FileId, FileRef};
use fitout_core::domain::event::VariationEvent;
use fitout_core::domain::variation::{
    DraftVariation, ProjectId, SubmitRequest, Variation, VariationId,
};
use fitout_core::errors::{ApplicationError, ErrorKind, ValidationError};
use fitout_core::repository::{AttachmentRepository, ChangeFeed, VariationRepository};

use crate::pdf::VariationDocuments;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct ApiState {
    variations: Arc<dyn VariationRepository>,
    attachments: Arc<dyn AttachmentRepository>,
    feed: Arc<dyn ChangeFeed>,
    documents: VariationDocuments,
}

impl ApiState {
    /// All repository seams served by one system-of-record implementation.
    pub fn new<R>(repository: Arc<R>, documents: VariationDocuments) -> Self
    where
        R: VariationRepository + AttachmentRepository + ChangeFeed + 'static,
    {
        Self {
            variations: repository.clone(),
            attachments: repository.clone(),
            feed: repository,
            documents,
        }
    }
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

/// Every variation response carries the derived totals next to the record itself.
#[derive(Debug, Serialize)]
pub struct VariationResponse {
    pub variation: Variation,
    pub price_impact: Decimal,
    pub breakdown: CostBreakdown,
}

impl From<Variation> for VariationResponse {
    fn from(variation: Variation) -> Self {
        let breakdown = DeterministicCostingEngine.breakdown(&variation.costs, &variation.currency);
        Self { price_impact: breakdown.price_impact, breakdown, variation }
    }
}

#[derive(Debug, Deserialize)]
pub struct ProjectQuery {
    pub project: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DecisionBody {
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub decided_by: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: ErrorKind,
    pub correlation_id: String,
}

#[derive(Debug)]
pub struct ApiError {
    error: ApplicationError,
    correlation_id: String,
}

impl ApiError {
    fn new(error: ApplicationError, correlation_id: &str) -> Self {
        Self { error, correlation_id: correlation_id.to_owned() }
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::InvalidTransition => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.error.kind();
        let interface = self.error.into_interface(self.correlation_id.clone());
        // Storage and configuration detail stays in the log.
        let message = match kind {
            ErrorKind::Unavailable | ErrorKind::Internal => {
                warn!(
                    event_name = "system.server.request_failed",
                    correlation_id = %self.correlation_id,
                    kind = kind.as_str(),
                    error = %interface,
                    "request failed"
                );
                interface.user_message().to_owned()
            }
            _ => interface.message().to_owned(),
        };

        let body = ErrorBody { error: message, kind, correlation_id: self.correlation_id };
        (status_for(kind), Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/variation", post(create_variation))
        .route("/variations", get(list_variations))
        .route(
            "/variation/{id}",
            get(get_variation).put(update_variation).delete(discard_variation),
        )
        .route("/variation/{id}/submit", post(submit_variation))
        .route("/variation/{id}/review", post(begin_review))
        .route("/variation/{id}/approve", post(approve_variation))
        .route("/variation/{id}/decline", post(decline_variation))
        .route("/variation/{id}/files", get(list_files).post(attach_file))
        .route("/variation/{id}/files/{file_id}", delete(delete_file))
        .route("/variation/{id}/events", get(list_events))
        .route("/document/variation/{id}", get(download_document))
        .with_state(state)
}

/// Echoes the caller's correlation id, or assigns one.
pub fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| format!("req-{}", Uuid::new_v4().simple()))
}

/// Empty bodies decode to `T::default()`; malformed JSON is a validation failure.
fn parse_body<T>(body: &Bytes, correlation_id: &str) -> ApiResult<T>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_required_body(body, correlation_id)
}

fn parse_required_body<T: DeserializeOwned>(body: &Bytes, correlation_id: &str) -> ApiResult<T> {
    serde_json::from_slice(body).map_err(|e| {
        ApiError::new(
            ApplicationError::from(ValidationError::MissingRequiredFields(vec![format!(
                "request body: {e}"
            )])),
            correlation_id,
        )
    })
}

fn with_correlation(correlation_id: &str, response: impl IntoResponse) -> Response {
    let mut response = response.into_response();
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

fn variation_reply(correlation_id: &str, variation: Variation) -> Response {
    with_correlation(correlation_id, Json(VariationResponse::from(variation)))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn create_variation(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let correlation_id = correlation_id(&headers);
    let draft: DraftVariation = parse_required_body(&body, &correlation_id)?;

    let variation =
        state.variations.create(draft).await.map_err(|e| ApiError::new(e, &correlation_id))?;
    info!(
        event_name = "system.server.variation_created",
        correlation_id = %correlation_id,
        variation_id = %variation.id,
        "variation created over http"
    );

    Ok(with_correlation(
        &correlation_id,
        (StatusCode::CREATED, Json(VariationResponse::from(variation))),
    ))
}

pub async fn list_variations(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<ProjectQuery>,
) -> ApiResult<Response> {
    let correlation_id = correlation_id(&headers);
    let project = query
        .project
        .map(|project| project.trim().to_owned())
        .filter(|project| !project.is_empty())
        .ok_or_else(|| {
            ApiError::new(
                ValidationError::MissingRequiredFields(vec!["project".to_owned()]).into(),
                &correlation_id,
            )
        })?;

    let mut variations = state
        .variations
        .list_by_project(&ProjectId(project))
        .await
        .map_err(|e| ApiError::new(e, &correlation_id))?;
    variations.sort_by_key(|variation| variation.number);

    let payload: Vec<VariationResponse> =
        variations.into_iter().map(VariationResponse::from).collect();
    Ok(with_correlation(&correlation_id, Json(payload)))
}

pub async fn get_variation(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let correlation_id = correlation_id(&headers);
    let variation = state
        .variations
        .find_by_id(&VariationId(id))
        .await
        .map_err(|e| ApiError::new(e, &correlation_id))?;
    Ok(variation_reply(&correlation_id, variation))
}

pub async fn update_variation(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let correlation_id = correlation_id(&headers);
    let draft: DraftVariation = parse_required_body(&body, &correlation_id)?;
    let variation = state
        .variations
        .update_draft(&VariationId(id), draft)
        .await
        .map_err(|e| ApiError::new(e, &correlation_id))?;
    Ok(variation_reply(&correlation_id, variation))
}

pub async fn discard_variation(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let correlation_id = correlation_id(&headers);
    state
        .variations
        .discard(&VariationId(id))
        .await
        .map_err(|e| ApiError::new(e, &correlation_id))?;
    Ok(with_correlation(&correlation_id, StatusCode::NO_CONTENT))
}

pub async fn submit_variation(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let correlation_id = correlation_id(&headers);
    let request: SubmitRequest = parse_body(&body, &correlation_id)?;
    let variation = state
        .variations
        .submit_with(&VariationId(id), request)
        .await
        .map_err(|e| ApiError::new(e, &correlation_id))?;
    Ok(variation_reply(&correlation_id, variation))
}

pub async fn begin_review(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let correlation_id = correlation_id(&headers);
    let variation = state
        .variations
        .begin_review(&VariationId(id))
        .await
        .map_err(|e| ApiError::new(e, &correlation_id))?;
    Ok(variation_reply(&correlation_id, variation))
}

pub async fn approve_variation(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let correlation_id = correlation_id(&headers);
    let body: DecisionBody = parse_body(&body, &correlation_id)?;
    let request = decision_request(DecisionRequest::approve(body.comment), body.decided_by);
    let variation = state
        .variations
        .approve(&VariationId(id), request)
        .await
        .map_err(|e| ApiError::new(e, &correlation_id))?;
    Ok(variation_reply(&correlation_id, variation))
}

pub async fn decline_variation(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let correlation_id = correlation_id(&headers);
    let body: DecisionBody = parse_body(&body, &correlation_id)?;
    let request = decision_request(DecisionRequest::decline(body.comment), body.decided_by);
    let variation = state
        .variations
        .decline(&VariationId(id), request)
        .await
        .map_err(|e| ApiError::new(e, &correlation_id))?;
    Ok(variation_reply(&correlation_id, variation))
}

fn decision_request(request: DecisionRequest, decided_by: Option<String>) -> DecisionRequest {
    match decided_by.filter(|actor| !actor.trim().is_empty()) {
        Some(actor) => request.by(actor),
        None => request,
    }
}

pub async fn list_files(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let correlation_id = correlation_id(&headers);
    let files: Vec<FileRef> = state
        .attachments
        .list_attached_files(&VariationId(id))
        .await
        .map_err(|e| ApiError::new(e, &correlation_id))?;
    Ok(with_correlation(&correlation_id, Json(files)))
}

pub async fn attach_file(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let correlation_id = correlation_id(&headers);
    let file: FileRef = parse_required_body(&body, &correlation_id)?;
    let variation = state
        .attachments
        .attach_file(&VariationId(id), file)
        .await
        .map_err(|e| ApiError::new(e, &correlation_id))?;
    Ok(variation_reply(&correlation_id, variation))
}

pub async fn delete_file(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((id, file_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let correlation_id = correlation_id(&headers);
    state
        .attachments
        .delete_attached_file(&VariationId(id), &FileId(file_id))
        .await
        .map_err(|e| ApiError::new(e, &correlation_id))?;
    Ok(with_correlation(&correlation_id, StatusCode::NO_CONTENT))
}

pub async fn list_events(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let correlation_id = correlation_id(&headers);
    let events: Vec<VariationEvent> = state
        .feed
        .list_events(&VariationId(id))
        .await
        .map_err(|e| ApiError::new(e, &correlation_id))?;
    Ok(with_correlation(&correlation_id, Json(events)))
}

pub async fn download_document(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let correlation_id = correlation_id(&headers);
    let id = VariationId(id);
    info!(
        event_name = "variation.document.requested",
        correlation_id = %correlation_id,
        variation_id = %id,
        "variation document requested"
    );

    let rendered =
        state.documents.render(&id).await.map_err(|e| ApiError::new(e, &correlation_id))?;
    info!(
        event_name = "variation.document.generated",
        correlation_id = %correlation_id,
        variation_id = %id,
        filename = %rendered.filename,
        "variation document generated"
    );
    Ok(with_correlation(&correlation_id, rendered.output.into_response(&rendered.filename)))
}
