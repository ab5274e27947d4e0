use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lifecycle::TransitionError;

/// Error taxonomy shared by every layer that talks about variations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    InvalidTransition,
    Conflict,
    NotFound,
    Unavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::InvalidTransition => "invalid_transition",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "validation" => Some(Self::Validation),
            "invalid_transition" => Some(Self::InvalidTransition),
            "conflict" => Some(Self::Conflict),
            "not_found" => Some(Self::NotFound),
            "unavailable" => Some(Self::Unavailable),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }

    /// Only reads may be retried, and only after a transport failure.
    pub fn is_retryable_read(&self) -> bool {
        matches!(self, Self::Unavailable)
    }

    /// Callers should re-fetch current state instead of offering a retry.
    pub fn requires_refresh(&self) -> bool {
        matches!(self, Self::Conflict | Self::NotFound)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required fields: {0:?}")]
    MissingRequiredFields(Vec<String>),
    #[error("`{field}` must not be negative (got {value})")]
    NegativeAmount { field: String, value: Decimal },
    #[error("`{field}` exceeds the supported maximum (got {value})")]
    AmountTooLarge { field: String, value: Decimal },
    #[error("a comment is required to decline a variation")]
    CommentRequired,
    #[error("invalid currency code `{0}` (expected three ASCII letters)")]
    InvalidCurrency(String),
    #[error("unknown work type `{0}`")]
    UnknownWorkType(String),
    #[error("unknown change category `{0}`")]
    UnknownCategory(String),
    #[error("malformed cost lines: {0}")]
    MalformedCostLines(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl DomainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Transition(error) => error.kind(),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("{entity} `{id}` was not found")]
    NotFound { entity: &'static str, id: String },
    #[error("remote {kind:?} error: {message}")]
    Remote { kind: ErrorKind, message: String },
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

impl ApplicationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Domain(error) => error.kind(),
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Remote { kind, .. } => *kind,
            Self::Persistence(_) | Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Configuration(_) => ErrorKind::Internal,
        }
    }

    pub fn variation_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { entity: "variation", id: id.into() }
    }

    pub fn file_not_found(id: impl Into<String>) -> Self {
        Self::NotFound { entity: "file", id: id.into() }
    }

    pub fn decision_conflict(decided_at: DateTime<Utc>) -> Self {
        Self::Domain(DomainError::Transition(TransitionError::DecisionAlreadyRecorded {
            decided_at,
        }))
    }

    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::TransitionRejected { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ValidationError> for ApplicationError {
    fn from(value: ValidationError) -> Self {
        Self::Domain(DomainError::Validation(value))
    }
}

impl From<TransitionError> for ApplicationError {
    fn from(value: TransitionError) -> Self {
        Self::Domain(DomainError::Transition(value))
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("transition rejected: {message}")]
    TransitionRejected { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest { .. } => ErrorKind::Validation,
            Self::TransitionRejected { .. } => ErrorKind::InvalidTransition,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::ServiceUnavailable { .. } => ErrorKind::Unavailable,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest { message, .. }
            | Self::TransitionRejected { message, .. }
            | Self::Conflict { message, .. }
            | Self::NotFound { message, .. }
            | Self::ServiceUnavailable { message, .. }
            | Self::Internal { message, .. } => message,
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::TransitionRejected { .. } => {
                "This action is not available for the variation in its current state."
            }
            Self::Conflict { .. } => {
                "A decision has already been recorded for this variation. Refresh to see it."
            }
            Self::NotFound { .. } => {
                "This variation no longer exists. Refresh the list to continue."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let kind = value.kind();
        let message = value.to_string();
        let correlation_id = "unassigned".to_owned();
        match kind {
            ErrorKind::Validation => Self::BadRequest { message, correlation_id },
            ErrorKind::InvalidTransition => Self::TransitionRejected { message, correlation_id },
            ErrorKind::Conflict => Self::Conflict { message, correlation_id },
            ErrorKind::NotFound => Self::NotFound { message, correlation_id },
            ErrorKind::Unavailable => Self::ServiceUnavailable { message, correlation_id },
            ErrorKind::Internal => Self::Internal { message, correlation_id },
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::domain::variation::VariationStatus;
    use crate::errors::{
        ApplicationError, DomainError, ErrorKind, InterfaceError, ValidationError,
    };
    use crate::lifecycle::{LifecycleAction, TransitionError};

    #[test]
    fn validation_error_maps_to_bad_request_interface_error() {
        let interface = ApplicationError::from(ValidationError::CommentRequired)
            .into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::BadRequest {
                ref correlation_id,
                ..
            } if correlation_id == "req-1"
        ));
        assert_eq!(
            interface.user_message(),
            "The request could not be processed. Check inputs and try again."
        );
    }

    #[test]
    fn invalid_transition_keeps_its_own_kind() {
        let error = ApplicationError::from(TransitionError::InvalidTransition {
            from: Some(VariationStatus::Draft),
            action: LifecycleAction::Approve,
        });

        assert_eq!(error.kind(), ErrorKind::InvalidTransition);
        assert!(matches!(error.into_interface("req-2"), InterfaceError::TransitionRejected { .. }));
    }

    #[test]
    fn decision_conflict_asks_for_refresh() {
        let error = ApplicationError::decision_conflict(Utc::now());

        assert_eq!(error.kind(), ErrorKind::Conflict);
        assert!(error.kind().requires_refresh());
        assert!(!error.kind().is_retryable_read());

        let interface = error.into_interface("req-3");
        assert!(interface.user_message().contains("Refresh"));
    }

    #[test]
    fn not_found_is_distinct_from_transport_failure() {
        let missing = ApplicationError::variation_not_found("VAR-404");
        let offline = ApplicationError::Unavailable("connection refused".to_owned());

        assert_eq!(missing.kind(), ErrorKind::NotFound);
        assert_eq!(offline.kind(), ErrorKind::Unavailable);
        assert!(offline.kind().is_retryable_read());
        assert!(!missing.kind().is_retryable_read());
    }

    #[test]
    fn persistence_error_maps_to_service_unavailable() {
        let interface = ApplicationError::Persistence("database lock timeout".to_owned())
            .into_interface("req-4");

        assert!(matches!(interface, InterfaceError::ServiceUnavailable { .. }));
        assert_eq!(
            interface.user_message(),
            "The service is temporarily unavailable. Please retry shortly."
        );
    }

    #[test]
    fn remote_errors_keep_the_reported_kind() {
        let error = ApplicationError::Remote {
            kind: ErrorKind::Conflict,
            message: "decision already recorded".to_owned(),
        };

        assert_eq!(error.kind(), ErrorKind::Conflict);
        assert_eq!(
            DomainError::from(ValidationError::CommentRequired).kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn error_kind_round_trips_through_wire_name() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::InvalidTransition,
            ErrorKind::Conflict,
            ErrorKind::NotFound,
            ErrorKind::Unavailable,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::parse("teapot"), None);
    }
}
