pub mod engine;
pub mod states;

pub use engine::{LifecycleDefinition, LifecycleEngine, TransitionError, VariationLifecycle};
pub use states::{LifecycleAction, LifecycleEffect, TransitionContext, TransitionOutcome};
