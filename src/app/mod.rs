//! Process lifecycle: bootstrap, the run loop and shutdown.
pub mod bootstrap;
pub mod run_loop;
pub mod shutdown;
pub mod signals;

pub use bootstrap::{Bootstrap, Outcome};
pub use run_loop::LoopExit;
use tokio::sync::mpsc;

/// How the process ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
}

impl ExitStatus {
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failure => 1,
        }
    }
}

/// Something that woke the run loop up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    Reload,
    Shutdown,
    /// A wake-up the event source couldn't classify.
    Spurious(String),
}

pub type EventSender = mpsc::UnboundedSender<AppEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<AppEvent>;

#[must_use]
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
