use anyhow::Result;
use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Set from the signal handler; read by every token that observes signals
static SIGNALLED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_signal(_signum: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// Shared cancellation flag checked between stages and while waiting on a child
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    observe_signals: bool,
}

impl CancelToken {
    /// A token that is only cancelled through [`CancelToken::cancel`]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || (self.observe_signals && SIGNALLED.load(Ordering::SeqCst))
    }
}

/// Install SIGINT/SIGTERM handlers and return a token that trips when either arrives
pub fn install_signal_handlers() -> Result<CancelToken> {
    #[cfg(unix)]
    {
        for signal in [libc::SIGINT, libc::SIGTERM] {
            // SAFETY: the handler only stores to an atomic, which is async-signal-safe
            let previous = unsafe { libc::signal(signal, on_signal as libc::sighandler_t) };
            if previous == libc::SIG_ERR {
                anyhow::bail!(
                    "Failed to install handler for signal {signal}: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
        debug!("Installed SIGINT/SIGTERM handlers");
    }

    #[cfg(not(unix))]
    debug!("Signal handling is not supported on this platform, cancellation is manual only");

    Ok(CancelToken {
        flag: Arc::new(AtomicBool::new(false)),
        observe_signals: true,
    })
}
