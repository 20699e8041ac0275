pub mod error;
pub mod evaluator;
pub mod gate;
pub mod grader;
pub mod orchestrator;
pub mod plagiarism;
pub mod registry;
pub mod sandbox;

#[cfg(test)]
mod orchestrator_tests;

pub use error::{InputError, RegistryError, SandboxError};
pub use gate::AdmissionGate;
pub use orchestrator::Orchestrator;
pub use registry::{LanguageConfig, LanguageRegistry};
pub use sandbox::{RunJob, RunOutcome, Sandbox};
