use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

/// Signals that request a cooperative stop instead of killing the pilot.
pub const HANDLED_SIGNALS: [Signal; 7] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGQUIT,
    Signal::SIGSEGV,
    Signal::SIGXCPU,
    Signal::SIGUSR1,
    Signal::SIGBUS,
];

/// Last signal caught by [`record_raw_signal`]; 0 while none arrived.
static RAW_SIGNAL: AtomicI32 = AtomicI32::new(0);

const RAW_SIGNAL_POLL: Duration = Duration::from_millis(20);

/// Cooperative cancellation shared between the signal handlers and the engine.
///
/// Tripping it never interrupts running work; the engine checks it between
/// phases.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    token: CancellationToken,
    reason: Arc<OnceLock<String>>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop. The first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        let _ = self.reason.set(reason.into());
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }
}

/// Install handlers for [`HANDLED_SIGNALS`] that trip the returned
/// cancellation.
///
/// tokio refuses to hook SIGSEGV, so signals it rejects get a raw one-shot
/// `sigaction` handler instead, bridged into the cancellation by a polling
/// task.
pub fn install_signal_handlers() -> Cancellation {
    let cancellation = Cancellation::new();
    let mut raw_installed = false;

    for sig in HANDLED_SIGNALS {
        let mut stream = match signal(SignalKind::from_raw(sig as i32)) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(signal = %sig, error = %e, "runtime refused signal, installing raw handler");
                match install_raw_handler(sig) {
                    Ok(()) => raw_installed = true,
                    Err(e) => tracing::warn!(signal = %sig, error = %e, "cannot install signal handler"),
                }
                continue;
            }
        };
        let cancellation = cancellation.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                tracing::info!(signal = %sig, "caught signal, requesting graceful stop");
                cancellation.cancel(sig.as_str());
            }
        });
    }

    if raw_installed {
        let cancellation = cancellation.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RAW_SIGNAL_POLL);
            loop {
                tick.tick().await;
                let signo = RAW_SIGNAL.load(Ordering::SeqCst);
                if signo == 0 {
                    continue;
                }
                let name = Signal::try_from(signo).map(Signal::as_str).unwrap_or("signal");
                tracing::info!(signal = name, "caught signal, requesting graceful stop");
                cancellation.cancel(name);
                break;
            }
        });
    }

    cancellation
}

// Only async-signal-safe work is allowed here.
extern "C" fn record_raw_signal(signo: nix::libc::c_int) {
    RAW_SIGNAL.store(signo, Ordering::SeqCst);
}

/// One-shot: the disposition resets to default after the first delivery, so
/// a genuine fault that re-triggers the signal still terminates the process.
fn install_raw_handler(sig: Signal) -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(record_raw_signal),
        SaFlags::SA_RESETHAND | SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only stores into an atomic.
    unsafe { sigaction(sig, &action) }.map(|_| ())
}
