use thiserror::Error;
use uuid::Uuid;

use fitout_core::domain::variation::VariationId;
use fitout_core::errors::{ApplicationError, DomainError};

pub mod memory;
pub mod variation;

pub use memory::InMemoryVariationRepository;
pub use variation::SqlVariationRepository;

/// Actor recorded on manager-side events; decisions carry their own actor.
pub const MANAGER_ACTOR: &str = "manager";

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error(transparent)]
    Application(#[from] ApplicationError),
}

impl From<DomainError> for RepositoryError {
    fn from(error: DomainError) -> Self {
        Self::Application(error.into())
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(error: RepositoryError) -> Self {
        match error {
            RepositoryError::Database(error) => Self::Persistence(error.to_string()),
            RepositoryError::Decode(message) => Self::Persistence(format!("decode: {message}")),
            RepositoryError::Encode(message) => Self::Persistence(format!("encode: {message}")),
            RepositoryError::Application(error) => error,
        }
    }
}

pub(crate) fn next_variation_id() -> VariationId {
    VariationId(format!("VAR-{}", Uuid::new_v4()))
}
