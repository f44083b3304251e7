//! The work report harvester polls for job status.

use std::path::Path;

use serde_json::{Map, Value, json};

use crate::error::PilotError;
use crate::state_machine::JobState;

/// Status snapshot published for harvester.
///
/// Keys are kept sorted, so publishing an unchanged report rewrites the file
/// with identical bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkReport {
    fields: Map<String, Value>,
}

impl WorkReport {
    /// Report with every field harvester expects set to its default.
    pub fn initial(node: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("jobStatus".into(), json!(JobState::Starting));
        fields.insert("startTime".into(), json!(""));
        fields.insert("endTime".into(), json!(""));
        fields.insert("cpuConsumptionTime".into(), json!(0));
        fields.insert("transExitCode".into(), json!(0));
        fields.insert("pilotErrorCode".into(), json!(0));
        fields.insert("exitMsg".into(), json!(""));
        fields.insert("workdir".into(), json!(""));
        fields.insert("node".into(), json!(node));
        Self { fields }
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn set_status(&mut self, state: JobState) {
        self.set("jobStatus", state.to_string());
    }

    /// Merge fields taken from the payload's own report, overriding ours.
    pub fn merge(&mut self, other: Map<String, Value>) {
        self.fields.extend(other);
    }

    /// Guid the payload reported for `lfn`, if any.
    pub fn output_guid(&self, lfn: &str) -> Option<&str> {
        self.fields
            .get("outputfiles")?
            .get(lfn)?
            .get("guid")?
            .as_str()
    }

    /// Overwrite `path` with the current snapshot.
    pub fn publish(&self, path: &Path) -> Result<(), PilotError> {
        let mut body = serde_json::to_vec_pretty(&self.fields)?;
        body.push(b'\n');
        std::fs::write(path, body)
            .map_err(|e| PilotError::file_handling("Work report publish failed", e))?;
        tracing::debug!(path = %path.display(), status = ?self.get("jobStatus"), "work report published");
        Ok(())
    }
}

/// Extract the fields harvester cares about from a payload self-report.
///
/// Produces `exeExitCode`, `exeErrorDiag` and `outputfiles` (`{lfn: {guid}}`)
/// when the report carries them.
pub fn summarize_payload_report(report: &Value) -> Map<String, Value> {
    let mut summary = Map::new();

    if let Some(code) = report.get("exitCode").and_then(Value::as_i64) {
        summary.insert("exeExitCode".into(), json!(code));
    }
    if let Some(msg) = report.get("exitMsg").and_then(Value::as_str) {
        summary.insert("exeErrorDiag".into(), json!(msg));
    }

    let subfiles = report
        .pointer("/files/output")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.get("subFiles").and_then(Value::as_array))
        .flatten();
    let mut outputs = Map::new();
    for sub in subfiles {
        if let (Some(name), Some(guid)) = (
            sub.get("name").and_then(Value::as_str),
            sub.get("file_guid").and_then(Value::as_str),
        ) {
            outputs.insert(name.to_string(), json!({ "guid": guid }));
        }
    }
    if !outputs.is_empty() {
        summary.insert("outputfiles".into(), Value::Object(outputs));
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_report_defaults() {
        let report = WorkReport::initial("nid00042");
        assert_eq!(report.get("jobStatus"), Some(&json!("starting")));
        assert_eq!(report.get("transExitCode"), Some(&json!(0)));
        assert_eq!(report.get("node"), Some(&json!("nid00042")));
        assert_eq!(report.get("workdir"), Some(&json!("")));
    }

    #[test]
    fn published_status_matches_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker_attributes.json");
        let mut report = WorkReport::initial("node");
        report.set_status(JobState::Failed);
        assert_eq!(report.get("jobStatus"), Some(&json!("failed")));

        report.publish(&path).unwrap();
        let parsed: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(Some(&parsed["jobStatus"]), report.get("jobStatus"));
    }

    #[test]
    fn publishing_twice_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker_attributes.json");
        let mut report = WorkReport::initial("node");
        report.set_status(JobState::Running);

        report.publish(&path).unwrap();
        let first = std::fs::read(&path).unwrap();
        report.publish(&path).unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn publish_overwrites_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker_attributes.json");
        std::fs::write(&path, "x".repeat(4096)).unwrap();

        let report = WorkReport::initial("node");
        report.publish(&path).unwrap();
        let parsed: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed["jobStatus"], json!("starting"));
    }

    #[test]
    fn publish_into_missing_dir_is_file_handling_error() {
        let dir = tempfile::tempdir().unwrap();
        let report = WorkReport::initial("node");
        let err = report
            .publish(&dir.path().join("nope").join("report.json"))
            .unwrap_err();
        assert!(matches!(err, PilotError::FileHandling(_)));
    }

    #[test]
    fn summary_extracts_exit_and_output_guids() {
        let payload = json!({
            "exitCode": 65,
            "exitMsg": "TRF_EXEC_FAIL",
            "files": {
                "output": [
                    {"subFiles": [{"name": "HITS.pool.root", "file_guid": "G-1"}]},
                    {"subFiles": [{"name": "AOD.pool.root", "file_guid": "G-2"}, {"name": "noguid"}]}
                ]
            },
            "executor": []
        });
        let summary = summarize_payload_report(&payload);
        assert_eq!(summary["exeExitCode"], json!(65));
        assert_eq!(summary["exeErrorDiag"], json!("TRF_EXEC_FAIL"));

        let mut report = WorkReport::initial("node");
        report.merge(summary);
        assert_eq!(report.output_guid("HITS.pool.root"), Some("G-1"));
        assert_eq!(report.output_guid("AOD.pool.root"), Some("G-2"));
        assert_eq!(report.output_guid("noguid"), None);
    }

    #[test]
    fn summary_of_empty_report_is_empty() {
        assert!(summarize_payload_report(&json!({})).is_empty());
    }
}
