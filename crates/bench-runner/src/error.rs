use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("environment error: {0}")]
    Environment(String),
    #[error("deployment error: {0}")]
    Deployment(String),
    #[error("transient remote error: {0}")]
    TransientRemote(String),
    #[error("measurement error: {0}")]
    Measurement(String),
}

impl OrchestratorError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Configuration(_)
                | OrchestratorError::Environment(_)
                | OrchestratorError::Deployment(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Configuration(_) => "configuration",
            OrchestratorError::Environment(_) => "environment",
            OrchestratorError::Deployment(_) => "deployment",
            OrchestratorError::TransientRemote(_) => "transient_remote",
            OrchestratorError::Measurement(_) => "measurement",
        }
    }
}

pub type OpResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification_matches_taxonomy() {
        assert!(OrchestratorError::Configuration("x".into()).is_fatal());
        assert!(OrchestratorError::Environment("x".into()).is_fatal());
        assert!(OrchestratorError::Deployment("x".into()).is_fatal());
        assert!(!OrchestratorError::TransientRemote("x".into()).is_fatal());
        assert!(!OrchestratorError::Measurement("x".into()).is_fatal());
    }
}
