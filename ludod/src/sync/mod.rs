pub mod conflict;
pub mod orchestrator;
pub mod progress;
pub mod resolver;
pub mod scheduler;
