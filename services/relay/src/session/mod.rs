//! Session lifecycle: registry, turn reassembly, and orchestration.

pub mod orchestrator;
pub mod registry;
pub mod turn;
