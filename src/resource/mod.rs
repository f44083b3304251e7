//! Site resource adapters.
//!
//! All site-specific knowledge lives behind [`ResourceAdapter`]. Adding a site
//! means adding an implementation and a [`ResourceKind`] variant; the engine's
//! phase sequencing never changes.

mod command;
mod titan;

#[cfg(test)]
mod fake;

pub use titan::TitanAdapter;

#[cfg(test)]
pub use fake::{AdapterCall, FakeAdapter};

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::PilotConfig;
use crate::error::PilotError;
use crate::state_machine::Job;
use crate::timing::TimingRecorder;

/// Capability set a site provides to the engine.
#[async_trait]
pub trait ResourceAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Locate the job assigned to this rank. A missing job list means there
    /// is nothing to do and yields `(None, rank)`.
    async fn get_job(&self, handoff_dir: &Path) -> Result<(Option<Job>, usize), PilotError>;

    /// Site environment statements run ahead of the payload.
    fn get_setup(&self) -> Vec<String>;

    /// Enter `base/jobid` and return it with the search paths the payload
    /// should run with.
    async fn set_job_workdir(&self, job: &Job, base: &Path) -> Result<Workdir, PilotError>;

    /// Stage inputs onto the fast scratch tier, returning the directory the
    /// payload runs in (`workdir` itself when no scratch tier exists).
    async fn set_scratch_workdir(
        &self,
        job: &mut Job,
        workdir: &Path,
        timing: &mut TimingRecorder,
    ) -> Result<PathBuf, PilotError>;

    async fn get_payload_command(&self, job: &Job, scratch_dir: &Path)
    -> Result<String, PilotError>;

    /// Relay the payload's self-report from `scratch_dir` into `handoff_dir`.
    async fn process_jobreport(
        &self,
        report_file: &str,
        scratch_dir: &Path,
        handoff_dir: &Path,
    ) -> Result<(), PilotError>;

    /// Undo staging side effects in `workdir`.
    async fn postprocess_workdir(&self, workdir: &Path) -> Result<(), PilotError>;
}

/// Registry of the sites this pilot knows how to run on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// ORNL Titan: RAM-disk scratch, optional Singularity container.
    #[default]
    Titan,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Titan => write!(f, "titan"),
        }
    }
}

/// Construct the adapter for `config.resource`.
pub fn build(
    config: &PilotConfig,
    rank: usize,
    search_paths: SearchPaths,
) -> Box<dyn ResourceAdapter> {
    match config.resource {
        ResourceKind::Titan => Box::new(TitanAdapter::new(config.clone(), rank, search_paths)),
    }
}

/// A job working directory and the environment the payload runs with there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workdir {
    pub path: PathBuf,
    pub search_paths: SearchPaths,
}

/// Library and executable search paths handed to the payload.
///
/// `None` marks a variable that was not set at all and is left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPaths {
    pub path: Option<Vec<String>>,
    pub pythonpath: Option<Vec<String>>,
    pub ld_library_path: Option<Vec<String>>,
}

impl SearchPaths {
    /// Capture the search paths of the current process.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let split = |key: &str| -> Option<Vec<String>> {
            lookup(key).map(|v| {
                v.split(':')
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect()
            })
        };
        Self {
            path: split("PATH"),
            pythonpath: split("PYTHONPATH"),
            ld_library_path: split("LD_LIBRARY_PATH"),
        }
    }

    /// Drop every entry under `prefix`.
    pub fn without_prefix(&self, prefix: &str) -> Self {
        let keep = |entries: &Option<Vec<String>>| -> Option<Vec<String>> {
            entries.as_ref().map(|entries| {
                entries
                    .iter()
                    .filter(|p| prefix.is_empty() || !p.starts_with(prefix))
                    .cloned()
                    .collect()
            })
        };
        Self {
            path: keep(&self.path),
            pythonpath: keep(&self.pythonpath),
            ld_library_path: keep(&self.ld_library_path),
        }
    }

    /// Environment variables to set on the payload process.
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        [
            ("PATH", &self.path),
            ("PYTHONPATH", &self.pythonpath),
            ("LD_LIBRARY_PATH", &self.ld_library_path),
        ]
        .into_iter()
        .filter_map(|(key, entries)| entries.as_ref().map(|e| (key, e.join(":"))))
        .collect()
    }
}

const RANK_VARIABLES: [&str; 4] = ["PMI_RANK", "OMPI_COMM_WORLD_RANK", "ALPS_APP_PE", "SLURM_PROCID"];

/// Rank of this process among its peers, from the MPI launcher environment.
/// Defaults to 0 outside a multi-rank launch.
pub fn rank_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> usize {
    RANK_VARIABLES
        .iter()
        .find_map(|key| lookup(key).and_then(|v| v.trim().parse().ok()))
        .unwrap_or(0)
}

pub fn rank_from_env() -> usize {
    rank_from_lookup(|key| std::env::var(key).ok())
}
