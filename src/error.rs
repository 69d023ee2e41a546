use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum LcmError {
    #[error("Admission rejected: {0}")]
    AdmissionRejected(String),

    #[error("Cluster {cluster_id} is busy with execution {holder}")]
    ClusterBusy { cluster_id: String, holder: Uuid },

    #[error("Step {index} failed: {message}")]
    StepFailure { index: u32, message: String },

    #[error("Execution {0} exceeded its timeout")]
    Timeout(Uuid),

    #[error("Fact inconsistency for {cluster_id}/{host}/{key}: {detail}")]
    FactInconsistency {
        cluster_id: String,
        host: String,
        key: String,
        detail: String,
    },

    #[error("Execution {0} interrupted by shutdown")]
    ShutdownInterrupted(Uuid),

    #[error("Configuration not found: {0}")]
    ConfigurationNotFound(String),

    #[error("Configuration {0} is deleted")]
    ConfigurationDeleted(Uuid),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("Execution {0} already reached a terminal state")]
    AlreadyTerminal(Uuid),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Cluster lock {cluster_id} is not held by execution {execution_id}")]
    LockNotHeld {
        cluster_id: String,
        execution_id: Uuid,
    },

    #[error("Playbook resolution failed: {0}")]
    Resolution(String),

    #[error("Controller already started")]
    AlreadyStarted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LcmError {
    pub fn fact_missing(cluster_id: &str, host: &str, key: &str) -> Self {
        LcmError::FactInconsistency {
            cluster_id: cluster_id.to_string(),
            host: host.to_string(),
            key: key.to_string(),
            detail: "fact is missing".to_string(),
        }
    }

    /// True for conditions a caller may retry later without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LcmError::AdmissionRejected(_) | LcmError::ClusterBusy { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LcmError>;
