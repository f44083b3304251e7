//! Stage-out: bring produced files back to shared storage and declare the
//! ones harvester should transfer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::PilotError;
use crate::report::WorkReport;
use crate::state_machine::{FileType, Job};

/// One file eligible for stage-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    #[serde(rename = "type")]
    pub filetype: FileType,
    pub path: PathBuf,
    pub fsize: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
}

/// `{jobid: [descriptor, ...]}` as written for harvester.
pub type StageOutDeclaration = BTreeMap<String, Vec<FileDescriptor>>;

/// Copy outputs and logs present in `scratch_dir` back to `workdir`.
pub async fn copy_output(job: &Job, scratch_dir: &Path, workdir: &Path) -> Result<(), PilotError> {
    let started = Instant::now();
    let result = copy_files(job, scratch_dir, workdir).await;
    tracing::info!(elapsed = ?started.elapsed(), "copy of outputs finished");
    result
}

async fn copy_files(job: &Job, scratch_dir: &Path, workdir: &Path) -> Result<(), PilotError> {
    for file in job.outdata.iter().chain(&job.logdata) {
        let src = scratch_dir.join(&file.lfn);
        if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
            continue;
        }
        tokio::fs::copy(&src, workdir.join(&file.lfn))
            .await
            .map_err(|e| {
                PilotError::file_handling("Copy from scratch dir to access point failed", e)
            })?;
    }
    Ok(())
}

/// Check every output and log file of `job` in its workdir and write the
/// stage-out declaration to `declaration_path`.
///
/// A missing file fails the job but does not stop the check. Guids come from
/// the file record first, then from the payload report merged into `report`.
/// Nothing is written when no file qualifies.
pub fn declare_output(
    job: &mut Job,
    report: &WorkReport,
    declaration_path: &Path,
) -> Result<Vec<FileDescriptor>, PilotError> {
    let workdir = job
        .workdir
        .clone()
        .ok_or_else(|| PilotError::FileHandling("job has no working directory".into()))?;
    let workdir = std::path::absolute(&workdir)?;
    let jobid = job.jobid().to_string();

    let mut descriptors = Vec::new();
    let mut missing = Vec::new();
    for file in job.outdata.iter_mut().chain(job.logdata.iter_mut()) {
        tracing::debug!(lfn = %file.lfn, "checking file for stage-out");
        let path = workdir.join(&file.lfn);
        let Ok(meta) = std::fs::metadata(&path) else {
            tracing::info!(lfn = %file.lfn, jobid = %jobid, "expected output file missing, job will be failed");
            missing.push(file.lfn.clone());
            continue;
        };

        if file.guid.is_none() {
            file.guid = report.output_guid(&file.lfn).map(String::from);
        }
        descriptors.push(FileDescriptor {
            filetype: file.filetype,
            path,
            fsize: meta.len(),
            guid: file.guid.clone(),
        });
    }
    if !missing.is_empty() {
        job.mark_failed();
    }

    if !descriptors.is_empty() {
        let declaration = StageOutDeclaration::from([(jobid, descriptors.clone())]);
        let body = serde_json::to_vec_pretty(&declaration)?;
        std::fs::write(declaration_path, body)
            .map_err(|e| PilotError::file_handling("Stage-out declaration failed", e))?;
        tracing::debug!(path = %declaration_path.display(), files = descriptors.len(), "stage-out declared");
    }
    Ok(descriptors)
}
