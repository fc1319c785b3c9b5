//! Server phase machine.

use std::fmt;

use crate::error::{NetError, Result};

/// Phase of a server.
///
/// `Unstarted → Starting → Started → ShuttingDown → Shutdown`. A failed
/// bind returns `Starting` to `Unstarted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unstarted,
    Starting,
    Started,
    ShuttingDown,
    Shutdown,
}

/// What a shutdown request should do in the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShutdownStep {
    /// Release resources.
    Proceed,
    /// Nothing bound, already stopping, or already stopped.
    Noop,
}

impl Phase {
    /// Transition taken by `start`.
    pub(crate) fn begin_start(self) -> Result<Phase> {
        match self {
            Phase::Unstarted => Ok(Phase::Starting),
            Phase::Shutdown | Phase::ShuttingDown => Err(NetError::NotRunning("server was shut down")),
            Phase::Starting | Phase::Started => Err(NetError::AlreadyStarted),
        }
    }

    pub(crate) fn shutdown_step(self) -> ShutdownStep {
        match self {
            Phase::Started => ShutdownStep::Proceed,
            _ => ShutdownStep::Noop,
        }
    }

    pub fn is_running(self) -> bool {
        self == Phase::Started
    }

    pub fn is_terminated(self) -> bool {
        self == Phase::Shutdown
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Unstarted => "unstarted",
            Phase::Starting => "starting",
            Phase::Started => "started",
            Phase::ShuttingDown => "shutting-down",
            Phase::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unstarted_can_start() {
        assert_eq!(Phase::Unstarted.begin_start().unwrap(), Phase::Starting);
        assert!(matches!(Phase::Started.begin_start(), Err(NetError::AlreadyStarted)));
        assert!(matches!(Phase::Starting.begin_start(), Err(NetError::AlreadyStarted)));
        assert!(matches!(Phase::Shutdown.begin_start(), Err(NetError::NotRunning(_))));
    }

    #[test]
    fn shutdown_only_acts_on_started() {
        assert_eq!(Phase::Started.shutdown_step(), ShutdownStep::Proceed);
        for phase in [Phase::Unstarted, Phase::Starting, Phase::ShuttingDown, Phase::Shutdown] {
            assert_eq!(phase.shutdown_step(), ShutdownStep::Noop);
        }
    }
}
