use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PilotError;

/// The phases of a pilot run.
///
/// Each run flows strictly forward:
/// ACQUIRE_JOB → SETUP_WORKDIR → SETUP_SCRATCH → BUILD_COMMAND → RUN_PAYLOAD →
/// PARSE_REPORT → CLEANUP → PACKAGE_LOGS → STAGE_OUT → DECLARE_OUTPUT → DONE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    AcquireJob,
    SetupWorkdir,
    SetupScratch,
    BuildCommand,
    RunPayload,
    ParseReport,
    Cleanup,
    PackageLogs,
    StageOut,
    DeclareOutput,
    Done,
}

impl Phase {
    /// The phase that must follow this one, `None` after `Done`.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::AcquireJob => Some(Phase::SetupWorkdir),
            Phase::SetupWorkdir => Some(Phase::SetupScratch),
            Phase::SetupScratch => Some(Phase::BuildCommand),
            Phase::BuildCommand => Some(Phase::RunPayload),
            Phase::RunPayload => Some(Phase::ParseReport),
            Phase::ParseReport => Some(Phase::Cleanup),
            Phase::Cleanup => Some(Phase::PackageLogs),
            Phase::PackageLogs => Some(Phase::StageOut),
            Phase::StageOut => Some(Phase::DeclareOutput),
            Phase::DeclareOutput => Some(Phase::Done),
            Phase::Done => None,
        }
    }

    pub fn pre_checkpoint(self) -> String {
        format!("PILOT_PRE_{self}")
    }

    pub fn post_checkpoint(self) -> String {
        format!("PILOT_POST_{self}")
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::AcquireJob => "ACQUIRE_JOB",
            Phase::SetupWorkdir => "SETUP_WORKDIR",
            Phase::SetupScratch => "SETUP_SCRATCH",
            Phase::BuildCommand => "BUILD_COMMAND",
            Phase::RunPayload => "RUN_PAYLOAD",
            Phase::ParseReport => "PARSE_REPORT",
            Phase::Cleanup => "CLEANUP",
            Phase::PackageLogs => "PACKAGE_LOGS",
            Phase::StageOut => "STAGE_OUT",
            Phase::DeclareOutput => "DECLARE_OUTPUT",
            Phase::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Terminal outcome of a pilot run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    Failure,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "SUCCESS"),
            Outcome::Failure => write!(f, "FAILURE"),
        }
    }
}

/// The result of evaluating a phase transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Entered the given phase.
    Next(Phase),
    /// The run has ended.
    Complete(Outcome),
}

/// Enforces the linear phase order and keeps the visited history.
#[derive(Debug, Default)]
pub struct StateMachine {
    current: Option<Phase>,
    history: Vec<Phase>,
    outcome: Option<Outcome>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Phase> {
        self.current
    }

    /// Phases entered so far, in order.
    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    /// Enter `to`, which must be the direct successor of the current phase
    /// (or `AcquireJob` when nothing has run yet). Entering `Done` completes
    /// the run successfully.
    pub fn advance(&mut self, to: Phase) -> Result<Transition, PilotError> {
        let expected = match (self.outcome, self.current) {
            (Some(_), _) => None,
            (None, None) => Some(Phase::AcquireJob),
            (None, Some(phase)) => phase.next(),
        };
        if expected != Some(to) {
            return Err(PilotError::PhaseOrder {
                from: self
                    .current
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "START".to_string()),
                to: to.to_string(),
            });
        }

        self.current = Some(to);
        self.history.push(to);
        if to == Phase::Done {
            self.outcome = Some(Outcome::Success);
            return Ok(Transition::Complete(Outcome::Success));
        }
        Ok(Transition::Next(to))
    }

    /// Abort the run from whatever phase it is in.
    pub fn fail(&mut self) -> Transition {
        self.outcome = Some(Outcome::Failure);
        Transition::Complete(Outcome::Failure)
    }

    /// End a run that had nothing to do.
    pub fn finish_early(&mut self) -> Transition {
        self.outcome = Some(Outcome::Success);
        Transition::Complete(Outcome::Success)
    }
}
