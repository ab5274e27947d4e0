pub mod audit;
pub mod config;
pub mod costing;
pub mod decision;
pub mod domain;
pub mod errors;
pub mod lifecycle;
pub mod repository;
pub mod workflow;

pub use costing::{CostBreakdown, CostingEngine, DeterministicCostingEngine};
pub use decision::{DecisionRecorder, DecisionRequest};
pub use domain::attachment::{FileId, FileRef};
pub use domain::cost::{AdditionalCost, CostSheet, LaborCost, MaterialCost};
pub use domain::event::VariationEvent;
pub use domain::variation::{
    ChangeCategory, ClientDecision, Disposition, DraftVariation, ProjectId, SubmitRequest,
    Variation, VariationDetails, VariationId, VariationNumber, VariationStatus, WorkType,
};
pub use errors::{ApplicationError, DomainError, ErrorKind, InterfaceError, ValidationError};
pub use lifecycle::{LifecycleAction, LifecycleEngine, TransitionError};
pub use repository::{AttachmentRepository, ChangeFeed, DocumentGenerator, VariationRepository};
pub use workflow::VariationWorkflow;
