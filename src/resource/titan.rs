//! ORNL Titan: jobs arrive through a harvester access point on Lustre, inputs
//! are staged to a RAM disk and the payload optionally runs in Singularity.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use super::command::PayloadCommand;
use super::{ResourceAdapter, SearchPaths, Workdir};
use crate::config::PilotConfig;
use crate::error::PilotError;
use crate::state_machine::{Job, JobDescription};
use crate::timing::{POST_STAGEIN, PRE_STAGEIN, TimingRecorder};

const CONTAINER_SCRIPT: &str = "run_payload.sh";

pub struct TitanAdapter {
    config: PilotConfig,
    rank: usize,
    search_paths: SearchPaths,
}

impl TitanAdapter {
    pub fn new(config: PilotConfig, rank: usize, search_paths: SearchPaths) -> Self {
        Self {
            config,
            rank,
            search_paths,
        }
    }

    fn enter(&self, dir: &Path) -> Result<(), PilotError> {
        if self.config.hpc.change_directory {
            std::env::set_current_dir(dir).map_err(|e| {
                PilotError::file_handling(&format!("cannot enter {}", dir.display()), e)
            })?;
            tracing::debug!(dir = %dir.display(), "changed working directory");
        }
        Ok(())
    }

    async fn load_job(&self, job_workdir: &Path, jobid: &str) -> Result<Job, PilotError> {
        let path = job_workdir.join(&self.config.harvester.job_description_file);
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            PilotError::JobDescription(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut jobs: serde_json::Map<String, Value> = serde_json::from_str(&raw)
            .map_err(|e| PilotError::JobDescription(format!("{}: {e}", path.display())))?;
        let entry = jobs.remove(jobid).ok_or_else(|| {
            PilotError::JobDescription(format!("job {jobid} not found in {}", path.display()))
        })?;
        let desc: JobDescription = serde_json::from_value(entry)
            .map_err(|e| PilotError::JobDescription(format!("job {jobid}: {e}")))?;
        Job::from_description(desc)
    }

    async fn stage_in(&self, job: &Job, workdir: &Path, job_scratch: &Path) -> Result<(), PilotError> {
        let root = &self.config.hpc.scratch;
        let fail = |e: std::io::Error| PilotError::file_handling("Copy to RAM disk failed", e);

        tokio::fs::create_dir_all(root.join("tmp")).await.map_err(fail)?;

        let started = std::time::Instant::now();
        for data in &self.config.hpc.reference_data {
            let dst = root.join(&data.destination);
            if tokio::fs::try_exists(&dst).await.map_err(fail)? {
                tracing::debug!(dst = %dst.display(), "reference data already staged");
                continue;
            }
            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(fail)?;
            }
            tokio::fs::copy(&data.source, &dst).await.map_err(fail)?;
        }
        tracing::debug!(elapsed = ?started.elapsed(), "reference data copied");

        let started = std::time::Instant::now();
        tokio::fs::create_dir_all(job_scratch).await.map_err(fail)?;
        for file in &job.indata {
            let src = workdir.join(&file.lfn);
            let dst = job_scratch.join(&file.lfn);
            tracing::debug!(src = %src.display(), dst = %dst.display(), "copy input");
            tokio::fs::copy(&src, &dst).await.map_err(fail)?;
        }
        tracing::debug!(elapsed = ?started.elapsed(), files = job.indata.len(), "input files copied");
        Ok(())
    }

    async fn create_links(&self, job_scratch: &Path) -> Result<(), PilotError> {
        for link in &self.config.hpc.links {
            let path = job_scratch.join(&link.link);
            if tokio::fs::symlink_metadata(&path).await.is_ok() {
                continue;
            }
            tokio::fs::symlink(&link.target, &path).await.map_err(|e| {
                PilotError::file_handling(&format!("cannot link {}", path.display()), e)
            })?;
        }
        Ok(())
    }

    async fn container_command(
        &self,
        image: &str,
        command: &str,
        scratch_dir: &Path,
    ) -> Result<String, PilotError> {
        let script = scratch_dir.join(CONTAINER_SCRIPT);
        let mut body = String::from("#!/bin/bash\n");
        for line in &self.config.hpc.container_setup {
            body.push_str(line);
            body.push('\n');
        }
        body.push_str(command);
        body.push('\n');
        tracing::debug!(script = %script.display(), "container script:\n{body}");

        let fail = |e: std::io::Error| PilotError::file_handling("Container script creation failed", e);
        tokio::fs::write(&script, body).await.map_err(fail)?;
        tokio::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(fail)?;

        Ok(format!(
            "{} --verbose exec {image} /bin/bash -c {}",
            self.config.hpc.container_runtime,
            script.display()
        ))
    }
}

#[async_trait]
impl ResourceAdapter for TitanAdapter {
    fn name(&self) -> &'static str {
        "titan"
    }

    async fn get_job(&self, handoff_dir: &Path) -> Result<(Option<Job>, usize), PilotError> {
        let rank = self.rank;
        let list_path = handoff_dir.join(&self.config.harvester.jobs_list_file);
        if !tokio::fs::try_exists(&list_path).await? {
            tracing::info!(path = %list_path.display(), "no job id list, nothing to execute");
            return Ok((None, rank));
        }

        let raw = tokio::fs::read_to_string(&list_path).await?;
        let ids: Vec<Value> = serde_json::from_str(&raw)
            .map_err(|e| PilotError::JobDescription(format!("{}: {e}", list_path.display())))?;
        tracing::info!(count = ids.len(), "got job ids");

        let jobid = match ids.get(rank) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(other) => {
                return Err(PilotError::JobDescription(format!(
                    "job id at rank {rank} is not a string or number: {other}"
                )));
            }
            None => return Err(PilotError::RankOutOfRange { rank, len: ids.len() }),
        };

        let job_workdir = std::path::absolute(handoff_dir)?.join(&jobid);
        tracing::info!(rank, jobid = %jobid, workdir = %job_workdir.display(), "selected job");
        let job = self.load_job(&job_workdir, &jobid).await?;
        Ok((Some(job), rank))
    }

    fn get_setup(&self) -> Vec<String> {
        self.config
            .hpc
            .setup
            .iter()
            .filter(|s| !s.trim().is_empty())
            .cloned()
            .collect()
    }

    async fn set_job_workdir(&self, job: &Job, base: &Path) -> Result<Workdir, PilotError> {
        let path = base.join(job.jobid());
        self.enter(&path)?;
        Ok(Workdir {
            path,
            search_paths: self
                .search_paths
                .without_prefix(&self.config.hpc.shared_fs_prefix),
        })
    }

    async fn set_scratch_workdir(
        &self,
        job: &mut Job,
        workdir: &Path,
        timing: &mut TimingRecorder,
    ) -> Result<PathBuf, PilotError> {
        let root = &self.config.hpc.scratch;
        if !tokio::fs::try_exists(root).await.unwrap_or(false) {
            tracing::info!(scratch = %root.display(), "scratch directory does not exist, running in workdir");
            return Ok(workdir.to_path_buf());
        }
        log_disk_usage(root, "before staging");

        let job_scratch = root.join(job.jobid());
        for file in &mut job.indata {
            file.scratch_path = Some(job_scratch.clone());
        }
        tracing::debug!(path = %job_scratch.display(), "job scratch path");

        timing.record(job.jobid(), PRE_STAGEIN);
        let staged = self.stage_in(job, workdir, &job_scratch).await;
        timing.record(job.jobid(), POST_STAGEIN);
        if let Err(e) = staged {
            tracing::error!(error = %e, "copy to scratch failed, execution terminated");
            return Err(e);
        }

        self.enter(&job_scratch)?;
        self.create_links(&job_scratch).await?;
        log_disk_usage(root, "after staging");
        Ok(job_scratch)
    }

    async fn get_payload_command(&self, job: &Job, scratch_dir: &Path) -> Result<String, PilotError> {
        let command = PayloadCommand::parse(&job.transformation, &job.jobparams)
            .relocate_inputs(&self.config.hpc.input_file_flags, scratch_dir)
            .strip(&self.config.hpc.strip_tokens)
            .to_string();

        let full = match self.config.container_image() {
            Some(image) => self.container_command(image, &command, scratch_dir).await?,
            None => {
                let setup = self.get_setup();
                if setup.is_empty() {
                    command
                } else {
                    format!("{}; {command}", setup.join("; "))
                }
            }
        };
        tracing::debug!(command = %full, "payload command");
        Ok(full)
    }

    async fn process_jobreport(
        &self,
        report_file: &str,
        scratch_dir: &Path,
        handoff_dir: &Path,
    ) -> Result<(), PilotError> {
        let src = scratch_dir.join(report_file);
        let dst = handoff_dir.join(report_file);
        if src == dst {
            tracing::debug!(report = %src.display(), "payload report already at access point, kept as written");
            return Ok(());
        }
        tracing::info!(report = report_file, dst = %dst.display(), "copy payload report to access point");

        let fail = |e: &dyn std::fmt::Display| PilotError::file_handling("Job report copy from RAM failed", e);
        let raw = tokio::fs::read(&src).await.map_err(|e| fail(&e))?;
        let mut report: Value = serde_json::from_slice(&raw).map_err(|e| fail(&e))?;
        shrink_jobreport(&mut report);
        let body = serde_json::to_vec_pretty(&report).map_err(|e| fail(&e))?;
        tokio::fs::write(&dst, body).await.map_err(|e| fail(&e))?;
        Ok(())
    }

    async fn postprocess_workdir(&self, workdir: &Path) -> Result<(), PilotError> {
        for link in &self.config.hpc.links {
            let path = workdir.join(&link.link);
            if tokio::fs::symlink_metadata(&path).await.is_err() {
                continue;
            }
            tokio::fs::remove_file(&path).await.map_err(|e| {
                PilotError::file_handling("Post processing of working directory failed", e)
            })?;
            tracing::debug!(link = %path.display(), "removed compatibility link");
        }
        Ok(())
    }
}

/// Empty every `executor[*].logfileReport`; everything else is kept.
fn shrink_jobreport(report: &mut Value) {
    let Some(executors) = report.get_mut("executor").and_then(Value::as_array_mut) else {
        return;
    };
    for executor in executors.iter_mut().filter_map(Value::as_object_mut) {
        if let Some(log_report) = executor.get_mut("logfileReport") {
            *log_report = Value::Object(serde_json::Map::new());
        }
    }
}

fn log_disk_usage(path: &Path, when: &str) {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => {
            let fragment = stat.fragment_size() as u64;
            let free = stat.blocks_available() as u64 * fragment;
            let used = (stat.blocks() as u64).saturating_sub(stat.blocks_free() as u64) * fragment;
            tracing::info!(scratch = %path.display(), free, used, "scratch space {when}");
        }
        Err(e) => tracing::warn!(scratch = %path.display(), error = %e, "cannot stat scratch"),
    }
}
