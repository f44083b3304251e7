use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use chrono::Utc;
use nix::sys::resource::{UsageWho, getrusage};
use tokio::process::Command;

use crate::archive::{pack_logs, remove_redundant_files};
use crate::config::PilotConfig;
use crate::error::PilotError;
use crate::output::{copy_output, declare_output};
use crate::report::{WorkReport, summarize_payload_report};
use crate::resource::{ResourceAdapter, Workdir};
use crate::signals::Cancellation;
use crate::state_machine::{Job, JobState, Outcome, Phase, PilotTrace, StateMachine, Transition};
use crate::timing::{NO_JOB, TimingRecorder};

/// Receives phase progress, e.g. to drive a terminal spinner.
pub trait PhaseObserver: Send + Sync {
    fn phase_started(&self, _phase: Phase, _jobid: &str) {}
    fn finished(&self, _trace: &PilotTrace) {}
}

/// Observer that ignores everything.
pub struct NoProgress;

impl PhaseObserver for NoProgress {}

/// Drives one job through every phase, from acquisition to the final report.
pub struct JobOrchestrator {
    adapter: Box<dyn ResourceAdapter>,
    config: PilotConfig,
    observer: Box<dyn PhaseObserver>,
}

/// Mutable state of a single run.
struct Run {
    machine: StateMachine,
    timing: TimingRecorder,
    report: WorkReport,
    report_path: PathBuf,
    /// Where the report goes before the workdir is known, and the last resort
    /// when publishing into the workdir fails.
    handoff_report_path: PathBuf,
    /// Set once the job workdir exists; from then on every phase publishes.
    publishing: bool,
    jobid: Option<String>,
}

impl Run {
    fn jobid(&self) -> &str {
        self.jobid.as_deref().unwrap_or(NO_JOB)
    }
}

/// Result of the payload subprocess.
struct PayloadResult {
    exit_code: i32,
    cpu_seconds: f64,
    elapsed_seconds: f64,
}

impl JobOrchestrator {
    pub fn new(adapter: Box<dyn ResourceAdapter>, config: PilotConfig) -> Self {
        Self {
            adapter,
            config,
            observer: Box::new(NoProgress),
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn PhaseObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Run the job harvester assigned to this rank under `handoff_dir`.
    ///
    /// Never fails: pilot errors end the run with a `FAILURE` trace after the
    /// work report has been published.
    pub async fn run(&self, handoff_dir: &Path, cancel: &Cancellation) -> PilotTrace {
        let harvester = &self.config.harvester;
        let timing = if harvester.timing_file.is_empty() {
            TimingRecorder::in_memory()
        } else {
            TimingRecorder::new(handoff_dir.join(&harvester.timing_file))
        };
        let mut run = Run {
            machine: StateMachine::new(),
            timing,
            report: WorkReport::initial(&hostname()),
            report_path: handoff_dir.join(&harvester.worker_attributes_file),
            handoff_report_path: handoff_dir.join(&harvester.worker_attributes_file),
            publishing: false,
            jobid: None,
        };
        tracing::info!(resource = self.adapter.name(), handoff = %handoff_dir.display(), "starting pilot");

        let trace = match self.run_phases(&mut run, handoff_dir, cancel).await {
            Ok(job_state) => PilotTrace {
                state: run.machine.outcome().unwrap_or(Outcome::Success),
                nr_jobs: u32::from(job_state.is_some()),
                error_code: 0,
                jobid: run.jobid.clone(),
                job_state,
                phases: run.machine.history().to_vec(),
                message: None,
            },
            Err(e) => self.fail(&mut run, e),
        };

        tracing::debug!(checkpoints = run.timing.entries().len(), ?trace, "pilot finished");
        self.observer.finished(&trace);
        trace
    }

    /// Failure boundary: mark the job failed and publish what we know.
    fn fail(&self, run: &mut Run, error: PilotError) -> PilotTrace {
        run.machine.fail();
        run.report.set_status(JobState::Failed);
        run.report.set("exitMsg", error.to_string());
        run.report.set("pilotErrorCode", error.code());
        if let Err(e) = run.report.publish(&run.report_path) {
            tracing::error!(error = %e, path = %run.report_path.display(), "cannot publish final work report");
            if run.report_path != run.handoff_report_path {
                match run.report.publish(&run.handoff_report_path) {
                    Ok(()) => tracing::warn!(
                        path = %run.handoff_report_path.display(),
                        "final work report published to handoff directory instead"
                    ),
                    Err(e) => tracing::error!(error = %e, "cannot publish final work report anywhere"),
                }
            }
        }
        tracing::error!(error = %error, code = error.code(), phase = ?run.machine.current(), "job aborted");

        PilotTrace {
            state: Outcome::Failure,
            nr_jobs: u32::from(run.jobid.is_some()),
            error_code: error.code(),
            jobid: run.jobid.clone(),
            job_state: run.jobid.as_ref().map(|_| JobState::Failed),
            phases: run.machine.history().to_vec(),
            message: Some(error.to_string()),
        }
    }

    fn enter(&self, run: &mut Run, phase: Phase, cancel: &Cancellation) -> Result<(), PilotError> {
        if cancel.is_cancelled() {
            let reason = cancel.reason().unwrap_or("cancellation request");
            return Err(PilotError::Interrupted(reason.to_string()));
        }
        if let Transition::Complete(outcome) = run.machine.advance(phase)? {
            tracing::debug!(?outcome, "phase sequence complete");
        }
        run.timing.record(run.jobid.as_deref().unwrap_or(NO_JOB), &phase.pre_checkpoint());
        self.observer.phase_started(phase, run.jobid());
        tracing::debug!(%phase, jobid = run.jobid(), "entering phase");
        Ok(())
    }

    fn leave(&self, run: &mut Run, phase: Phase) -> Result<(), PilotError> {
        run.timing.record(run.jobid.as_deref().unwrap_or(NO_JOB), &phase.post_checkpoint());
        if run.publishing {
            run.report.publish(&run.report_path)?;
        }
        Ok(())
    }

    /// The phase sequence. Returns the final job state, `None` when there was
    /// no job to run.
    async fn run_phases(
        &self,
        run: &mut Run,
        handoff_dir: &Path,
        cancel: &Cancellation,
    ) -> Result<Option<JobState>, PilotError> {
        // ACQUIRE_JOB
        self.enter(run, Phase::AcquireJob, cancel)?;
        let (job, rank) = self.adapter.get_job(handoff_dir).await?;
        let Some(mut job) = job else {
            tracing::info!(rank, "no job assigned, nothing to do");
            self.leave(run, Phase::AcquireJob)?;
            run.machine.finish_early();
            return Ok(None);
        };
        run.jobid = Some(job.jobid().to_string());
        tracing::info!(rank, jobid = job.jobid(), "job acquired");
        self.leave(run, Phase::AcquireJob)?;

        // SETUP_WORKDIR
        self.enter(run, Phase::SetupWorkdir, cancel)?;
        let Workdir { path: workdir, search_paths } =
            self.adapter.set_job_workdir(&job, handoff_dir).await?;
        job.workdir = Some(workdir.clone());
        run.report.set("workdir", workdir.display().to_string());
        run.report_path = workdir.join(&self.config.harvester.worker_attributes_file);
        run.publishing = true;
        job.set_state(JobState::Starting);
        run.report.set_status(job.state);
        tracing::debug!(path = %run.report_path.display(), "worker attributes location");
        self.leave(run, Phase::SetupWorkdir)?;

        // SETUP_SCRATCH
        self.enter(run, Phase::SetupScratch, cancel)?;
        tracing::info!(setup = ?self.adapter.get_setup(), "site setup");
        let scratch = self
            .adapter
            .set_scratch_workdir(&mut job, &workdir, &mut run.timing)
            .await?;
        self.leave(run, Phase::SetupScratch)?;

        // BUILD_COMMAND
        self.enter(run, Phase::BuildCommand, cancel)?;
        let command = self.adapter.get_payload_command(&job, &scratch).await?;
        self.leave(run, Phase::BuildCommand)?;

        // RUN_PAYLOAD
        self.enter(run, Phase::RunPayload, cancel)?;
        let payload = &self.config.payload;
        let stdout = create_capture(&workdir.join(&payload.stdout))?;
        let stderr = create_capture(&workdir.join(&payload.stderr))?;

        job.set_state(JobState::Running);
        job.start_time = Some(utc_timestamp());
        run.report.set_status(job.state);
        run.report.set("startTime", job.start_time.clone());
        run.report.publish(&run.report_path)?;

        tracing::info!(command = %command, cwd = %scratch.display(), "launching payload");
        let mut process = Command::new(&payload.shell);
        process
            .arg("-c")
            .arg(&command)
            .current_dir(&scratch)
            .envs(search_paths.to_env())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        let result = run_payload(&mut process).await?;

        job.end_time = Some(utc_timestamp());
        job.set_state(if result.exit_code == 0 {
            JobState::Finished
        } else {
            JobState::Failed
        });
        job.transexitcode = i64::from(result.exit_code).rem_euclid(255);
        run.report.set("startTime", job.start_time.clone());
        run.report.set("endTime", job.end_time.clone());
        run.report.set_status(job.state);
        run.report.set("cpuConsumptionTime", result.cpu_seconds);
        run.report.set("transExitCode", job.transexitcode);
        tracing::info!(
            jobid = job.jobid(),
            exit_code = result.exit_code,
            cpu_seconds = result.cpu_seconds,
            execution_seconds = result.elapsed_seconds,
            start = ?job.start_time,
            end = ?job.end_time,
            "payload finished"
        );
        self.leave(run, Phase::RunPayload)?;

        // PARSE_REPORT
        self.enter(run, Phase::ParseReport, cancel)?;
        let jobreport = &payload.jobreport;
        let report_src = scratch.join(jobreport);
        if tokio::fs::try_exists(&report_src).await.unwrap_or(false) {
            self.adapter
                .process_jobreport(jobreport, &scratch, &workdir)
                .await?;
            let summary = read_payload_summary(&report_src).await?;
            if let Some(code) = summary.get("exeExitCode").and_then(serde_json::Value::as_i64) {
                job.exeerrorcode = code;
            }
            run.report.merge(summary);
        } else {
            tracing::info!(report = %report_src.display(), "payload produced no job report");
        }
        tracing::info!(exe_error_code = job.exeerrorcode, "exit code (job report)");
        self.leave(run, Phase::ParseReport)?;

        // CLEANUP
        self.enter(run, Phase::Cleanup, cancel)?;
        self.adapter.postprocess_workdir(&scratch).await?;
        let protected = self.protected_files(&job);
        let removed = remove_redundant_files(
            &scratch,
            self.config.hpc.redundant_files.clone(),
            protected.clone(),
        )
        .await?;
        tracing::info!(removed, dir = %scratch.display(), "cleanup of working directory");
        self.leave(run, Phase::Cleanup)?;

        // PACKAGE_LOGS
        self.enter(run, Phase::PackageLogs, cancel)?;
        match job.logdata.first_mut() {
            Some(log) => {
                pack_logs(&scratch, protected, &log.lfn).await?;
                if log.guid.is_none() {
                    log.guid = Some(uuid::Uuid::new_v4().to_string().to_uppercase());
                }
            }
            None => tracing::warn!(jobid = job.jobid(), "job declares no log file, skipping log packaging"),
        }
        self.leave(run, Phase::PackageLogs)?;

        // STAGE_OUT
        self.enter(run, Phase::StageOut, cancel)?;
        if scratch != workdir {
            copy_output(&job, &scratch, &workdir).await?;
        }
        self.leave(run, Phase::StageOut)?;

        // DECLARE_OUTPUT
        self.enter(run, Phase::DeclareOutput, cancel)?;
        let declaration = workdir.join(&self.config.harvester.stageout_file);
        let declared = declare_output(&mut job, &run.report, &declaration)?;
        run.report.set_status(job.state);
        tracing::info!(files = declared.len(), state = %job.state, "stage-out declared");
        self.leave(run, Phase::DeclareOutput)?;

        // DONE
        self.enter(run, Phase::Done, cancel)?;
        tracing::info!(jobid = job.jobid(), state = %job.state, "all done");
        self.leave(run, Phase::Done)?;

        Ok(Some(job.state))
    }

    /// Files that must not end up in the log archive.
    fn protected_files(&self, job: &Job) -> Vec<String> {
        let mut protected: Vec<String> = job
            .outdata
            .iter()
            .filter(|f| !job.logdata.iter().any(|l| l.lfn == f.lfn))
            .map(|f| f.lfn.clone())
            .collect();
        protected.push(self.config.harvester.worker_attributes_file.clone());
        protected.push(self.config.harvester.stageout_file.clone());
        protected
    }
}

fn create_capture(path: &Path) -> Result<std::fs::File, PilotError> {
    std::fs::File::create(path)
        .map_err(|e| PilotError::file_handling(&format!("cannot create {}", path.display()), e))
}

/// Run the payload to completion. There is no timeout; a stuck payload blocks
/// until something outside kills it.
async fn run_payload(process: &mut Command) -> Result<PayloadResult, PilotError> {
    let cpu_before = children_user_seconds();
    let started = Instant::now();
    let status = process
        .status()
        .await
        .map_err(|e| PilotError::PayloadLaunch(e.to_string()))?;

    // A payload killed by a signal reports 128 + signo, as a shell would.
    let exit_code = status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1);

    Ok(PayloadResult {
        exit_code,
        cpu_seconds: (children_user_seconds() - cpu_before).max(0.0),
        elapsed_seconds: started.elapsed().as_secs_f64(),
    })
}

async fn read_payload_summary(
    path: &Path,
) -> Result<serde_json::Map<String, serde_json::Value>, PilotError> {
    let fail = |e: &dyn std::fmt::Display| PilotError::file_handling("Job report parsing failed", e);
    let raw = tokio::fs::read(path).await.map_err(|e| fail(&e))?;
    let report: serde_json::Value = serde_json::from_slice(&raw).map_err(|e| fail(&e))?;
    Ok(summarize_payload_report(&report))
}

fn children_user_seconds() -> f64 {
    match getrusage(UsageWho::RUSAGE_CHILDREN) {
        Ok(usage) => {
            let tv = usage.user_time();
            tv.tv_sec() as f64 + tv.tv_usec() as f64 / 1_000_000.0
        }
        Err(e) => {
            tracing::warn!(error = %e, "getrusage failed");
            0.0
        }
    }
}

fn utc_timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use crate::resource::{AdapterCall, FakeAdapter, SearchPaths, TitanAdapter};
    use crate::state_machine::{FileType, JobFile};
    use serde_json::{Value, json};

    fn read_json(path: &Path) -> Value {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    fn fake_job(outputs: &[&str]) -> Job {
        let mut job = Job::new("7");
        job.transformation = "unused".into();
        job.outdata = outputs
            .iter()
            .map(|lfn| JobFile::new(*lfn, FileType::Output))
            .collect();
        job
    }

    fn fake_config() -> PilotConfig {
        let mut config = PilotConfig::default();
        config.harvester.timing_file = String::new();
        config
    }

    #[tokio::test]
    async fn end_to_end_single_job() {
        let handoff = tempfile::tempdir().unwrap();
        let base = handoff.path();
        std::fs::write(base.join("worker_pandaids.json"), r#"["107"]"#).unwrap();
        std::fs::create_dir(base.join("107")).unwrap();
        let job_report = r#"'{"exitCode":0,"files":{"output":[{"subFiles":[{"name":"HITS.pool.root","file_guid":"GUID-107"}]}]}}'"#;
        let desc = json!({
            "107": {
                "PandaID": 107,
                "transformation": "printf",
                "jobPars": format!("payload-data > HITS.pool.root && printf {job_report} > jobReport.json"),
                "outFiles": "HITS.pool.root"
            }
        });
        std::fs::write(base.join("107").join("HPCJobs.json"), desc.to_string()).unwrap();

        let mut config = PilotConfig::default();
        config.hpc.scratch = base.join("no-ramdisk");
        config.hpc.change_directory = false;
        config.hpc.setup = Vec::new();
        let adapter = TitanAdapter::new(config.clone(), 0, SearchPaths::from_env());
        let pilot = JobOrchestrator::new(Box::new(adapter), config);

        let trace = pilot.run(base, &Cancellation::new()).await;

        assert_eq!(trace.state, Outcome::Success, "{trace:?}");
        assert_eq!(trace.nr_jobs, 1);
        assert_eq!(trace.jobid.as_deref(), Some("107"));
        assert_eq!(trace.job_state, Some(JobState::Finished));
        assert_eq!(trace.phases.len(), 11);
        assert_eq!(trace.phases.last(), Some(&Phase::Done));

        let workdir = base.join("107");
        let report = read_json(&workdir.join("worker_attributes.json"));
        assert_eq!(report["jobStatus"], json!("finished"));
        assert_eq!(report["transExitCode"], json!(0));
        assert_eq!(report["exeExitCode"], json!(0));
        assert_eq!(report["workdir"], json!(workdir.display().to_string()));
        assert!(workdir.join("payload.stdout").exists());

        let declared = read_json(&workdir.join("event_status.dump.json"));
        let entries = declared["107"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["type"], json!("output"));
        assert_eq!(entries[0]["fsize"], json!("payload-data".len()));
        assert_eq!(entries[0]["guid"], json!("GUID-107"));

        let timing = std::fs::read_to_string(base.join("pilot_timing.jsonl")).unwrap();
        assert!(timing.lines().next().unwrap().contains(r#""jobid":"0""#));
        assert!(timing.contains("PILOT_POST_DONE"));
    }

    #[tokio::test]
    async fn exit_code_is_reduced_modulo_255() {
        for (command, expected) in [("exit 3", 3), ("exit 255", 0)] {
            let handoff = tempfile::tempdir().unwrap();
            let adapter = FakeAdapter::new(Some(fake_job(&[])), command);
            let pilot = JobOrchestrator::new(Box::new(adapter), fake_config());

            let trace = pilot.run(handoff.path(), &Cancellation::new()).await;
            assert_eq!(trace.state, Outcome::Success);
            assert_eq!(trace.job_state, Some(JobState::Failed));

            let report = read_json(&handoff.path().join("7").join("worker_attributes.json"));
            assert_eq!(report["transExitCode"], json!(expected), "{command}");
            assert_eq!(report["jobStatus"], json!("failed"));
        }
    }

    #[tokio::test]
    async fn missing_output_fails_job_but_run_completes() {
        let handoff = tempfile::tempdir().unwrap();
        let adapter = FakeAdapter::new(Some(fake_job(&["never-written.root"])), "true");
        let calls = adapter.clone();
        let pilot = JobOrchestrator::new(Box::new(adapter), fake_config());

        let trace = pilot.run(handoff.path(), &Cancellation::new()).await;

        assert_eq!(trace.state, Outcome::Success);
        assert_eq!(trace.job_state, Some(JobState::Failed));
        assert_eq!(trace.phases.last(), Some(&Phase::Done));
        assert!(calls.calls().contains(&AdapterCall::PostprocessWorkdir));

        let workdir = handoff.path().join("7");
        let report = read_json(&workdir.join("worker_attributes.json"));
        assert_eq!(report["jobStatus"], json!("failed"));
        assert_eq!(report["transExitCode"], json!(0));
        assert!(!workdir.join("event_status.dump.json").exists());
    }

    #[tokio::test]
    async fn adapter_failure_publishes_failed_report() {
        let handoff = tempfile::tempdir().unwrap();
        let adapter = FakeAdapter::new(Some(fake_job(&[])), "true")
            .failing_on(AdapterCall::SetScratchWorkdir);
        let calls = adapter.clone();
        let pilot = JobOrchestrator::new(Box::new(adapter), fake_config());

        let trace = pilot.run(handoff.path(), &Cancellation::new()).await;

        assert_eq!(trace.state, Outcome::Failure);
        assert_eq!(trace.error_code, codes::FILE_HANDLING_FAILURE);
        assert_eq!(trace.phases.last(), Some(&Phase::SetupScratch));
        assert!(!calls.calls().contains(&AdapterCall::GetPayloadCommand));

        let report = read_json(&handoff.path().join("7").join("worker_attributes.json"));
        assert_eq!(report["jobStatus"], json!("failed"));
        assert_eq!(report["pilotErrorCode"], json!(codes::FILE_HANDLING_FAILURE));
        assert!(report["exitMsg"].as_str().unwrap().contains("injected failure"));
    }

    #[tokio::test]
    async fn cancellation_is_honoured_at_phase_boundary() {
        let handoff = tempfile::tempdir().unwrap();
        let adapter = FakeAdapter::new(Some(fake_job(&[])), "true");
        let calls = adapter.clone();
        let pilot = JobOrchestrator::new(Box::new(adapter), fake_config());
        let cancel = Cancellation::new();
        cancel.cancel("SIGTERM");

        let trace = pilot.run(handoff.path(), &cancel).await;

        assert_eq!(trace.state, Outcome::Failure);
        assert_eq!(trace.error_code, codes::KILL_SIGNAL);
        assert!(trace.phases.is_empty());
        assert!(calls.calls().is_empty());

        let report = read_json(&handoff.path().join("worker_attributes.json"));
        assert_eq!(report["jobStatus"], json!("failed"));
        assert_eq!(report["exitMsg"], json!("Interrupted by SIGTERM"));
    }

    #[tokio::test]
    async fn scratch_run_stages_out_output_and_log() {
        let handoff = tempfile::tempdir().unwrap();
        let ramdisk = tempfile::tempdir().unwrap();
        let base = handoff.path();
        std::fs::write(base.join("worker_pandaids.json"), r#"["108"]"#).unwrap();
        let workdir = base.join("108");
        std::fs::create_dir(&workdir).unwrap();
        std::fs::write(workdir.join("EVNT.pool.root"), "events").unwrap();
        let desc = json!({
            "108": {
                "PandaID": "108",
                "transformation": "true",
                "jobPars": "--inputEVNTFile=EVNT.pool.root; cp EVNT.pool.root HITS.root; touch core.99",
                "inFiles": "EVNT.pool.root",
                "outFiles": "HITS.root",
                "logFile": "log.108.tgz"
            }
        });
        std::fs::write(workdir.join("HPCJobs.json"), desc.to_string()).unwrap();

        let mut config = PilotConfig::default();
        config.hpc.scratch = ramdisk.path().to_path_buf();
        config.hpc.change_directory = false;
        config.hpc.setup = Vec::new();
        config.hpc.reference_data = Vec::new();
        config.hpc.links = Vec::new();
        let adapter = TitanAdapter::new(config.clone(), 0, SearchPaths::from_env());
        let pilot = JobOrchestrator::new(Box::new(adapter), config);

        let trace = pilot.run(base, &Cancellation::new()).await;

        assert_eq!(trace.state, Outcome::Success, "{trace:?}");
        assert_eq!(trace.job_state, Some(JobState::Finished));

        let scratch = ramdisk.path().join("108");
        assert!(scratch.join("HITS.root").exists());
        assert!(!scratch.join("core.99").exists());
        assert!(workdir.join("HITS.root").exists());
        assert!(workdir.join("log.108.tgz").exists());

        let archive = std::fs::File::open(scratch.join("log.108.tgz")).unwrap();
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(archive));
        let packed: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(packed.contains(&"EVNT.pool.root".to_string()));
        assert!(!packed.contains(&"HITS.root".to_string()));
        assert!(!packed.contains(&"core.99".to_string()));

        let declared = read_json(&workdir.join("event_status.dump.json"));
        let entries = declared["108"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["type"], json!("output"));
        assert_eq!(entries[0]["fsize"], json!("events".len()));
        assert_eq!(entries[1]["type"], json!("log"));
        let log_guid = entries[1]["guid"].as_str().unwrap();
        assert_eq!(log_guid.len(), 36);
        assert_eq!(log_guid, log_guid.to_uppercase());

        let timing = std::fs::read_to_string(base.join("pilot_timing.jsonl")).unwrap();
        assert!(timing.contains("PILOT_PRE_STAGEIN"));
        assert!(timing.contains("PILOT_POST_STAGEIN"));
    }

    #[tokio::test]
    async fn payload_killed_by_signal_reports_128_plus_signo() {
        let handoff = tempfile::tempdir().unwrap();
        let adapter = FakeAdapter::new(Some(fake_job(&[])), "kill -9 $$");
        let pilot = JobOrchestrator::new(Box::new(adapter), fake_config());

        let trace = pilot.run(handoff.path(), &Cancellation::new()).await;

        assert_eq!(trace.state, Outcome::Success);
        assert_eq!(trace.job_state, Some(JobState::Failed));
        let report = read_json(&handoff.path().join("7").join("worker_attributes.json"));
        assert_eq!(report["transExitCode"], json!(137));
    }

    #[tokio::test]
    async fn report_falls_back_to_handoff_when_workdir_is_gone() {
        let handoff = tempfile::tempdir().unwrap();
        let adapter = FakeAdapter::new(Some(fake_job(&[])), r#"rm -rf "$PWD""#);
        let pilot = JobOrchestrator::new(Box::new(adapter), fake_config());

        let trace = pilot.run(handoff.path(), &Cancellation::new()).await;

        assert_eq!(trace.state, Outcome::Failure);
        assert_eq!(trace.error_code, codes::FILE_HANDLING_FAILURE);
        assert!(!handoff.path().join("7").exists());

        let report = read_json(&handoff.path().join("worker_attributes.json"));
        assert_eq!(report["jobStatus"], json!("failed"));
        assert_eq!(report["pilotErrorCode"], json!(codes::FILE_HANDLING_FAILURE));
        assert_eq!(
            report["workdir"],
            json!(handoff.path().join("7").display().to_string())
        );
    }

    #[tokio::test]
    async fn no_job_is_nothing_to_do() {
        let handoff = tempfile::tempdir().unwrap();
        let pilot = JobOrchestrator::new(Box::new(FakeAdapter::new(None, "true")), fake_config());

        let trace = pilot.run(handoff.path(), &Cancellation::new()).await;

        assert_eq!(trace.state, Outcome::Success);
        assert_eq!(trace.nr_jobs, 0);
        assert_eq!(trace.phases, vec![Phase::AcquireJob]);
        assert!(!handoff.path().join("worker_attributes.json").exists());
    }

    #[test]
    fn log_and_bookkeeping_files_are_protected() {
        let mut job = fake_job(&["HITS.pool.root", "log.tgz"]);
        job.logdata = vec![JobFile::new("log.tgz", FileType::Log)];
        let pilot = JobOrchestrator::new(Box::new(FakeAdapter::new(None, "true")), fake_config());
        assert_eq!(
            pilot.protected_files(&job),
            ["HITS.pool.root", "worker_attributes.json", "event_status.dump.json"]
        );
    }
}
