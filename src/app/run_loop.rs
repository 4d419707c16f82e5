//! The application run loop.
//!
//! The loop blocks on the event channel and sorts every wake-up into one of three outcomes:
//! reload (ask the server to reload and keep waiting), shutdown (leave the loop) and anything
//! else (report it as unexpected and leave the loop as if shutdown had been requested).
use super::{AppEvent, EventReceiver};
use crate::report::Reporter;
use crate::server::ServerContext;
use crate::{require, unexpected_error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Starting,
    Running,
    ReloadRequested,
    Terminating,
}

/// Why [`RunLoop::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Shutdown,
    Unexpected,
}

#[derive(Debug)]
pub struct RunLoop {
    state: RunState,
    reloads: u64,
}

impl Default for RunLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl RunLoop {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RunState::Starting,
            reloads: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> RunState {
        self.state
    }

    #[must_use]
    pub fn reloads(&self) -> u64 {
        self.reloads
    }

    /// Mark bootstrap as complete.
    pub fn started(&mut self) {
        require!(self.state == RunState::Starting);
        self.state = RunState::Running;
    }

    /// Wait for events until shutdown. Must not be called from inside the task scheduler.
    pub fn run(
        &mut self,
        events: &mut EventReceiver,
        server: &dyn ServerContext,
        reporter: &Reporter,
    ) -> LoopExit {
        require!(self.state == RunState::Running);
        loop {
            match events.blocking_recv() {
                Some(AppEvent::Reload) => {
                    self.state = RunState::ReloadRequested;
                    tracing::info!("reload requested");
                    server.request_reload();
                    self.reloads += 1;
                    self.state = RunState::Running;
                }
                Some(AppEvent::Shutdown) => {
                    tracing::info!("shutdown requested");
                    self.state = RunState::Terminating;
                    return LoopExit::Shutdown;
                }
                Some(AppEvent::Spurious(reason)) => {
                    unexpected_error!(reporter, "run loop woke up unexpectedly: {reason}");
                    self.state = RunState::Terminating;
                    return LoopExit::Unexpected;
                }
                None => {
                    unexpected_error!(reporter, "event channel closed");
                    self.state = RunState::Terminating;
                    return LoopExit::Unexpected;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::event_channel;
    use crate::error::Error;
    use crate::log::MemoryWriter;
    use crate::report::{Stream, Termination};
    use crate::server::ServerOption;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    impl ServerContext for Recorder {
        fn set_option(&mut self, _option: ServerOption, _value: bool) {}
        fn set_delay(&mut self, _delay: Duration) {}
        fn start(&mut self) -> Result<(), Error> {
            Ok(())
        }
        fn request_reload(&self) {
            self.0.lock().unwrap().push("reload");
        }
        fn destroy(self: Box<Self>) -> Result<(), Error> {
            Ok(())
        }
    }

    fn reporter() -> (Reporter, MemoryWriter) {
        let out = MemoryWriter::default();
        let stream: Stream = Arc::new(Mutex::new(out.clone()));
        (
            Reporter::with_stream("namecrab", stream, Termination::Exit),
            out,
        )
    }

    #[test]
    fn reload_then_shutdown() {
        let (reporter, out) = reporter();
        let server = Recorder::default();
        let (tx, mut rx) = event_channel();
        tx.send(AppEvent::Reload).unwrap();
        tx.send(AppEvent::Shutdown).unwrap();
        tx.send(AppEvent::Reload).unwrap();

        let mut run_loop = RunLoop::new();
        run_loop.started();
        assert_eq!(run_loop.run(&mut rx, &server, &reporter), LoopExit::Shutdown);
        assert_eq!(run_loop.state(), RunState::Terminating);
        assert_eq!(run_loop.reloads(), 1);
        assert_eq!(*server.0.lock().unwrap(), ["reload"]);
        assert!(out.contents().is_empty());
    }

    #[test]
    fn spurious_wakeup_terminates() {
        let (reporter, out) = reporter();
        let server = Recorder::default();
        let (tx, mut rx) = event_channel();
        tx.send(AppEvent::Spurious("mystery".into())).unwrap();

        let mut run_loop = RunLoop::new();
        run_loop.started();
        assert_eq!(run_loop.run(&mut rx, &server, &reporter), LoopExit::Unexpected);
        assert!(out.contents().contains("mystery"));
    }

    #[test]
    fn closed_channel_terminates() {
        let (reporter, out) = reporter();
        let (tx, mut rx) = event_channel();
        drop(tx);
        let mut run_loop = RunLoop::new();
        run_loop.started();
        assert_eq!(
            run_loop.run(&mut rx, &Recorder::default(), &reporter),
            LoopExit::Unexpected
        );
        assert!(out.contents().contains("event channel closed"));
    }

    #[test]
    fn events_from_another_thread() {
        let (reporter, _) = reporter();
        let server = Recorder::default();
        let (tx, mut rx) = event_channel();
        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            tx.send(AppEvent::Reload).unwrap();
            tx.send(AppEvent::Shutdown).unwrap();
        });
        let mut run_loop = RunLoop::new();
        run_loop.started();
        assert_eq!(run_loop.run(&mut rx, &server, &reporter), LoopExit::Shutdown);
        sender.join().unwrap();
        assert_eq!(run_loop.reloads(), 1);
    }

    #[test]
    #[should_panic]
    fn run_before_start_panics() {
        let (reporter, _) = reporter();
        let (_tx, mut rx) = event_channel();
        RunLoop::new().run(&mut rx, &Recorder::default(), &reporter);
    }
}
