mod job;
mod state;

pub use job::{FileType, Job, JobDescription, JobState, PilotTrace};
pub use state::{Outcome, Phase, StateMachine, Transition};

#[cfg(test)]
pub use job::JobFile;
