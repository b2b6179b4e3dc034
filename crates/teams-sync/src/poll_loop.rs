//! Recurring timer used by the message refresh and the reminder check.
//!
//! A `PollLoop` owns a background task that invokes its callback every
//! `period`. The handle can postpone the next tick (`reset`), schedule an
//! extra one-shot tick (`trigger_after`) or stop the loop. Dropping the
//! handle stops the loop as well.
//!
//! At most one callback runs per loop: a tick that comes due while the
//! previous callback is still running is dropped, not queued. A callback
//! that panics counts as finished.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

const MIN_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum Command {
    Reset,
    TriggerAfter(Duration),
    Stop,
}

/// Handle to a running poll loop
pub struct PollLoop {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl PollLoop {
    /// Start ticking. The first tick fires one `period` from now. A zero
    /// period is raised to one second.
    pub fn start<F, Fut>(name: impl Into<String>, period: Duration, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (commands, receiver) = mpsc::unbounded_channel();

        let period = if period.is_zero() {
            tracing::warn!("{} loop given a zero interval, using {:?}", name, MIN_PERIOD);
            MIN_PERIOD
        } else {
            period
        };

        tracing::info!("{} loop started (interval: {:?})", name, period);

        let task = tokio::spawn(run_loop(name.clone(), period, Arc::new(callback), receiver));

        Self {
            name,
            commands,
            task,
        }
    }

    /// Cancel the pending tick and schedule the next one a full period from now
    pub fn reset(&self) {
        self.send(Command::Reset);
    }

    /// Schedule one extra tick after `delay`, subject to the same overlap rule
    pub fn trigger_after(&self, delay: Duration) {
        self.send(Command::TriggerAfter(delay));
    }

    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("{} loop already stopped", self.name);
        }
    }
}

async fn run_loop<F, Fut>(
    name: String,
    period: Duration,
    callback: Arc<F>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let in_flight = Arc::new(AtomicBool::new(false));
    let mut next_tick = Instant::now() + period;
    let mut one_shot: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = sleep_until(next_tick) => {
                next_tick = Instant::now() + period;
                fire(&name, &callback, &in_flight);
            }
            _ = sleep_until(one_shot.unwrap_or(next_tick)), if one_shot.is_some() => {
                one_shot = None;
                fire(&name, &callback, &in_flight);
            }
            command = commands.recv() => match command {
                Some(Command::Reset) => {
                    tracing::debug!("{} loop reset", name);
                    next_tick = Instant::now() + period;
                    one_shot = None;
                }
                Some(Command::TriggerAfter(delay)) => {
                    one_shot = Some(Instant::now() + delay);
                }
                Some(Command::Stop) | None => break,
            },
        }
    }

    tracing::info!("{} loop stopped", name);
}

/// Clears the in-flight flag when the callback task ends, including by panic
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn fire<F, Fut>(name: &str, callback: &Arc<F>, in_flight: &Arc<AtomicBool>)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if in_flight.swap(true, Ordering::AcqRel) {
        tracing::debug!("{} tick dropped, previous run still in flight", name);
        return;
    }

    tracing::trace!("{} tick", name);
    let callback = Arc::clone(callback);
    let guard = InFlight(Arc::clone(in_flight));
    tokio::spawn(async move {
        let _guard = guard;
        callback().await;
    });
}
