//! The supervision layer: provider registry, model router, tiered dispatcher,
//! and the graph orchestrator with checkpoint/resume.

pub mod checkpoint;
pub mod dispatcher;
pub mod orchestrator;
pub mod providers;
pub mod router;
pub mod store;
pub mod telemetry;
