use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

use super::state::{Outcome, Phase};
use crate::error::PilotError;

/// Lifecycle tag of a job as reported to harvester.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    Starting,
    Running,
    Finished,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Starting => write!(f, "starting"),
            JobState::Running => write!(f, "running"),
            JobState::Finished => write!(f, "finished"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Input,
    Output,
    Log,
}

/// A file the job consumes or produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFile {
    pub lfn: String,
    pub filetype: FileType,
    pub guid: Option<String>,
    /// Directory the file was staged into, when scratch staging ran.
    pub scratch_path: Option<PathBuf>,
}

impl JobFile {
    pub fn new(lfn: impl Into<String>, filetype: FileType) -> Self {
        Self {
            lfn: lfn.into(),
            filetype,
            guid: None,
            scratch_path: None,
        }
    }

    pub fn with_guid(mut self, guid: impl Into<String>) -> Self {
        self.guid = Some(guid.into());
        self
    }
}

/// The pre-validated job record handed over by harvester.
///
/// Keys follow the harvester job definition; list fields are comma separated.
#[derive(Debug, Clone, Deserialize)]
pub struct JobDescription {
    #[serde(rename = "PandaID", deserialize_with = "string_or_number")]
    pub jobid: String,
    #[serde(default)]
    pub transformation: String,
    #[serde(rename = "jobPars", default)]
    pub jobparams: String,
    #[serde(rename = "inFiles", default)]
    pub in_files: String,
    #[serde(rename = "GUID", default)]
    pub in_guids: String,
    #[serde(rename = "outFiles", default)]
    pub out_files: String,
    #[serde(rename = "logFile", default)]
    pub log_file: String,
    #[serde(rename = "logGUID", default)]
    pub log_guid: String,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected job id as string or number, got {other}"
        ))),
    }
}

fn split_list(raw: &str) -> Vec<&str> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "NULL")
        .collect()
}

/// A single job executed by this pilot.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    jobid: String,
    pub state: JobState,
    pub workdir: Option<PathBuf>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub transformation: String,
    pub jobparams: String,
    pub indata: Vec<JobFile>,
    pub outdata: Vec<JobFile>,
    pub logdata: Vec<JobFile>,
    pub transexitcode: i64,
    pub exeerrorcode: i64,
}

impl Job {
    pub fn new(jobid: impl Into<String>) -> Self {
        Self {
            jobid: jobid.into(),
            state: JobState::default(),
            workdir: None,
            start_time: None,
            end_time: None,
            transformation: String::new(),
            jobparams: String::new(),
            indata: Vec::new(),
            outdata: Vec::new(),
            logdata: Vec::new(),
            transexitcode: 0,
            exeerrorcode: 0,
        }
    }

    /// Build a job from its harvester description.
    pub fn from_description(desc: JobDescription) -> Result<Self, PilotError> {
        if desc.jobid.trim().is_empty() {
            return Err(PilotError::JobDescription("empty PandaID".into()));
        }
        if desc.transformation.trim().is_empty() {
            return Err(PilotError::JobDescription(format!(
                "job {} has no transformation",
                desc.jobid
            )));
        }

        let guids = split_list(&desc.in_guids);
        let indata = split_list(&desc.in_files)
            .into_iter()
            .enumerate()
            .map(|(i, lfn)| {
                let file = JobFile::new(lfn, FileType::Input);
                match guids.get(i) {
                    Some(guid) => file.with_guid(*guid),
                    None => file,
                }
            })
            .collect();
        let outdata = split_list(&desc.out_files)
            .into_iter()
            .map(|lfn| JobFile::new(lfn, FileType::Output))
            .collect();
        let logdata = split_list(&desc.log_file)
            .into_iter()
            .map(|lfn| {
                let file = JobFile::new(lfn, FileType::Log);
                if desc.log_guid.trim().is_empty() {
                    file
                } else {
                    file.with_guid(desc.log_guid.trim())
                }
            })
            .collect();

        Ok(Self {
            transformation: desc.transformation,
            jobparams: desc.jobparams,
            indata,
            outdata,
            logdata,
            ..Self::new(desc.jobid)
        })
    }

    pub fn jobid(&self) -> &str {
        &self.jobid
    }

    /// Move the job to `state`. A failed job stays failed.
    pub fn set_state(&mut self, state: JobState) {
        if self.state != JobState::Failed {
            self.state = state;
        }
    }

    pub fn mark_failed(&mut self) {
        self.state = JobState::Failed;
    }
}

/// Outcome summary returned by the engine at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PilotTrace {
    pub state: Outcome,
    pub nr_jobs: u32,
    pub error_code: u32,
    pub jobid: Option<String>,
    pub job_state: Option<JobState>,
    pub phases: Vec<Phase>,
    pub message: Option<String>,
}
