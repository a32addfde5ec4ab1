//! Process termination
//!
//! The lifecycle thread parks in [`wait_for_termination`] until the process
//! is told to exit, then runs the ordered stop.

use std::fmt;
use std::io;

use tokio::runtime::Handle;

/// Signals that end the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Interrupt => f.write_str("SIGINT"),
            Signal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Installed signal listeners.
///
/// Install before the roles start so a signal raised during startup is
/// queued instead of hitting the default handler.
#[derive(Debug)]
pub struct Termination {
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
}

impl Termination {
    /// Register SIGINT and SIGTERM listeners on the runtime behind `handle`.
    #[cfg(unix)]
    pub fn install(handle: &Handle) -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let _guard = handle.enter();
        let sigint = signal(SignalKind::interrupt())?;
        let sigterm = signal(SignalKind::terminate())?;
        tracing::debug!("[lifecycle] [signals_installed]");
        Ok(Self { sigint, sigterm })
    }

    #[cfg(not(unix))]
    pub fn install(_handle: &Handle) -> io::Result<Self> {
        Ok(Self {})
    }

    /// Wait for the first termination signal.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> io::Result<Signal> {
        let received = tokio::select! {
            _ = self.sigint.recv() => Signal::Interrupt,
            _ = self.sigterm.recv() => Signal::Terminate,
        };
        Ok(received)
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> io::Result<Signal> {
        tokio::signal::ctrl_c().await?;
        Ok(Signal::Interrupt)
    }
}

/// Block the calling thread until a termination signal arrives.
///
/// `handle` must be the runtime the listeners were installed on. The caller
/// must not be inside an async context.
pub fn wait_for_termination(handle: &Handle, termination: &mut Termination) -> io::Result<Signal> {
    let signal = handle.block_on(termination.recv())?;
    tracing::info!("[lifecycle] [signal] received={}", signal);
    Ok(signal)
}
