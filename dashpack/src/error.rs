use thiserror::Error;

use crate::pipeline::BuildStage;

/// The message every dependency verification failure carries, whether it was
/// caught before the build, inside it, or when querying the finished image.
pub const DEPENDENCY_NOT_INSTALLED: &str = "Dependency not installed";

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Dependency not installed: {}", .packages.join(", "))]
    DependencyNotInstalled { packages: Vec<String> },

    #[error("build failed at stage {stage:?} (exit status {status})")]
    StepFailed { stage: BuildStage, status: i32 },
}

impl BuildError {
    /// Verification failures always exit with 1, other step failures
    /// forward whatever the container runtime exited with.
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::DependencyNotInstalled { .. } => 1,
            BuildError::StepFailed { status, .. } if *status != 0 => *status,
            BuildError::StepFailed { .. } => 1,
        }
    }
}
