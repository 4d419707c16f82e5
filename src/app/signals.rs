//! Turns process signals into [`AppEvent`]s: `SIGHUP` asks for a reload, `SIGTERM` and
//! `SIGINT` for shutdown.
use super::{event_channel, AppEvent, EventReceiver};
use crate::error::Error;
use crate::managers::Spawner;
use tokio::signal::unix::{signal, SignalKind};

/// Install the signal handlers and start forwarding signals on the task scheduler.
///
/// # Errors
///
/// [`Error::IO`] when a handler can't be registered.
pub fn install(spawner: &Spawner) -> Result<EventReceiver, Error> {
    let (tx, rx) = event_channel();
    let _guard = spawner.handle().enter();
    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let shutdown = spawner.shutdown_token();

    spawner.spawn(async move {
        loop {
            let received = tokio::select! {
                () = shutdown.cancelled() => break,
                s = hangup.recv() => s.map(|()| AppEvent::Reload),
                s = terminate.recv() => s.map(|()| AppEvent::Shutdown),
                s = interrupt.recv() => s.map(|()| AppEvent::Shutdown),
            };
            // A closed stream won't deliver again; hand the loop one last wake-up and stop.
            let (event, last) = match received {
                Some(event) => (event, false),
                None => (AppEvent::Spurious("signal stream closed".to_string()), true),
            };
            tracing::debug!(?event, "signal received");
            if tx.send(event).is_err() || last {
                break;
            }
        }
    });
    Ok(rx)
}
