use thiserror::Error;

/// Numeric pilot error codes reported to harvester as `pilotErrorCode`.
pub mod codes {
    pub const GENERAL_ERROR: u32 = 1008;
    pub const BAD_JOB_DESCRIPTION: u32 = 1110;
    pub const FILE_HANDLING_FAILURE: u32 = 1116;
    pub const LOG_FILE_CREATION_FAILURE: u32 = 1117;
    pub const PAYLOAD_LAUNCH_FAILURE: u32 = 1118;
    pub const KILL_SIGNAL: u32 = 1200;
}

/// Pilot-level errors. Every variant aborts the current job and is caught
/// once by the engine's failure boundary.
#[derive(Debug, Error)]
pub enum PilotError {
    #[error("Bad job description: {0}")]
    JobDescription(String),

    #[error("Rank {rank} has no entry in a job list of {len} ids")]
    RankOutOfRange { rank: usize, len: usize },

    #[error("File handling failure: {0}")]
    FileHandling(String),

    #[error("Log file creation failure: {0}")]
    LogFileCreation(String),

    #[error("Payload launch failed: {0}")]
    PayloadLaunch(String),

    #[error("Interrupted by {0}")]
    Interrupted(String),

    #[error("Phase order violation: {from} -> {to}")]
    PhaseOrder { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PilotError {
    /// Code published as `pilotErrorCode` in the work report.
    pub fn code(&self) -> u32 {
        match self {
            PilotError::JobDescription(_) | PilotError::RankOutOfRange { .. } => {
                codes::BAD_JOB_DESCRIPTION
            }
            PilotError::FileHandling(_) => codes::FILE_HANDLING_FAILURE,
            PilotError::LogFileCreation(_) => codes::LOG_FILE_CREATION_FAILURE,
            PilotError::PayloadLaunch(_) => codes::PAYLOAD_LAUNCH_FAILURE,
            PilotError::Interrupted(_) => codes::KILL_SIGNAL,
            PilotError::PhaseOrder { .. } | PilotError::Io(_) | PilotError::Json(_) => {
                codes::GENERAL_ERROR
            }
        }
    }

    /// Wraps an I/O fault as a file-handling failure with context.
    pub fn file_handling(context: &str, err: impl std::fmt::Display) -> Self {
        PilotError::FileHandling(format!("{context}: {err}"))
    }
}
