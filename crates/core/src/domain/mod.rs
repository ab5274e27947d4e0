pub mod attachment;
pub mod cost;
pub mod event;
pub mod variation;
