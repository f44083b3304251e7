//! Fake resource adapter for engine tests.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{ResourceAdapter, SearchPaths, Workdir};
use crate::error::PilotError;
use crate::state_machine::Job;
use crate::timing::TimingRecorder;

/// Recorded adapter call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterCall {
    GetJob,
    SetJobWorkdir,
    SetScratchWorkdir,
    GetPayloadCommand,
    ProcessJobreport,
    PostprocessWorkdir,
}

/// Adapter serving a fixed job and running a fixed shell command, with an
/// optional injected failure.
#[derive(Clone)]
pub struct FakeAdapter {
    job: Option<Job>,
    command: String,
    fail_on: Option<AdapterCall>,
    calls: Arc<Mutex<Vec<AdapterCall>>>,
}

impl FakeAdapter {
    pub fn new(job: Option<Job>, command: impl Into<String>) -> Self {
        Self {
            job,
            command: command.into(),
            fail_on: None,
            calls: Arc::default(),
        }
    }

    /// Raise a file-handling error from `call`.
    pub fn failing_on(mut self, call: AdapterCall) -> Self {
        self.fail_on = Some(call);
        self
    }

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, call: AdapterCall) -> Result<(), PilotError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call.clone());
        if self.fail_on.as_ref() == Some(&call) {
            return Err(PilotError::FileHandling(format!("injected failure in {call:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceAdapter for FakeAdapter {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn get_job(&self, _handoff_dir: &Path) -> Result<(Option<Job>, usize), PilotError> {
        self.record(AdapterCall::GetJob)?;
        Ok((self.job.clone(), 0))
    }

    fn get_setup(&self) -> Vec<String> {
        Vec::new()
    }

    async fn set_job_workdir(&self, job: &Job, base: &Path) -> Result<Workdir, PilotError> {
        self.record(AdapterCall::SetJobWorkdir)?;
        let path = base.join(job.jobid());
        std::fs::create_dir_all(&path)?;
        Ok(Workdir {
            path,
            search_paths: SearchPaths::from_env(),
        })
    }

    async fn set_scratch_workdir(
        &self,
        _job: &mut Job,
        workdir: &Path,
        _timing: &mut TimingRecorder,
    ) -> Result<PathBuf, PilotError> {
        self.record(AdapterCall::SetScratchWorkdir)?;
        Ok(workdir.to_path_buf())
    }

    async fn get_payload_command(&self, _job: &Job, _scratch_dir: &Path) -> Result<String, PilotError> {
        self.record(AdapterCall::GetPayloadCommand)?;
        Ok(self.command.clone())
    }

    async fn process_jobreport(
        &self,
        report_file: &str,
        scratch_dir: &Path,
        handoff_dir: &Path,
    ) -> Result<(), PilotError> {
        self.record(AdapterCall::ProcessJobreport)?;
        let src = scratch_dir.join(report_file);
        let dst = handoff_dir.join(report_file);
        if src != dst {
            std::fs::copy(src, dst)?;
        }
        Ok(())
    }

    async fn postprocess_workdir(&self, _workdir: &Path) -> Result<(), PilotError> {
        self.record(AdapterCall::PostprocessWorkdir)
    }
}
