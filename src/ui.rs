//! Interface de terminal do piloto: spinner de fases e saída colorida.
//!
//! Usa `indicatif` para o spinner e `console` para as cores. O
//! [`PhaseProgress`] acompanha visualmente as fases de um job.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::orchestrator::PhaseObserver;
use crate::state_machine::{Outcome, Phase, PilotTrace};

/// Indicador visual de progresso das fases do piloto.
///
/// Exibe um spinner durante a execução e uma linha final verde (sucesso)
/// ou vermelha (falha).
pub struct PhaseProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl PhaseProgress {
    /// Inicia o spinner.
    pub fn start() -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} [{elapsed}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message("starting pilot");
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }
}

impl PhaseObserver for PhaseProgress {
    fn phase_started(&self, phase: Phase, jobid: &str) {
        self.pb.set_message(format!("{phase} (job {jobid})"));
    }

    fn finished(&self, trace: &PilotTrace) {
        self.pb.finish_and_clear();
        let job = trace.jobid.as_deref().unwrap_or("-");
        match trace.state {
            Outcome::Success if trace.nr_jobs == 0 => {
                println!("  {} No job assigned", self.yellow.apply_to("-"));
            }
            Outcome::Success => {
                let state = trace
                    .job_state
                    .map(|s| s.to_string())
                    .unwrap_or_default();
                println!("  {} Job {job} done ({state})", self.green.apply_to("✓"));
            }
            Outcome::Failure => {
                let msg = trace.message.as_deref().unwrap_or("unknown error");
                println!(
                    "  {} Job {job} failed [{}]: {msg}",
                    self.red.apply_to("✗"),
                    trace.error_code
                );
            }
        }
    }
}
