//! Background reachability polling, one thread per instrument.
//!
//! Each [`LivenessMonitor`] probes its session at a fixed interval and sends
//! [`LivenessEvent`]s to a single subscriber channel. Monitors never share a
//! thread, so a probe stuck on one host does not hold up the others.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};

use crate::oscilloscope::Oscilloscope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessState {
    pub alive: bool,
    pub observed_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessEvent {
    pub name: String,
    pub host: String,
    pub state: LivenessState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmitPolicy {
    /// Send the observation of every tick.
    #[default]
    EveryTick,
    /// Send only the first observation and transitions after it.
    OnChange,
}

pub struct LivenessMonitor {
    name: String,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl LivenessMonitor {
    /// Start polling with the interval from the session settings.
    pub fn start(scope: Arc<Oscilloscope>, events: Sender<LivenessEvent>) -> std::io::Result<Self> {
        let interval = scope.settings().monitor_interval;
        Self::spawn(scope, interval, EmitPolicy::default(), events)
    }

    pub fn spawn(
        scope: Arc<Oscilloscope>,
        interval: Duration,
        policy: EmitPolicy,
        events: Sender<LivenessEvent>,
    ) -> std::io::Result<Self> {
        let name = scope.to_string();
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let thread = thread::Builder::new()
            .name(format!("liveness-{}", scope.name()))
            .spawn(move || {
                let mut last: Option<bool> = None;
                loop {
                    let alive = scope.is_alive();
                    if last == Some(false) && alive {
                        // back from the dead, possibly as a different instrument
                        scope.invalidate_identity();
                    }

                    if policy == EmitPolicy::EveryTick || last != Some(alive) {
                        let event = LivenessEvent {
                            name: scope.name().to_string(),
                            host: scope.host().to_string(),
                            state: LivenessState {
                                alive,
                                observed_at: SystemTime::now(),
                            },
                        };
                        if events.send(event).is_err() {
                            log::debug!("{}: subscriber gone, stopping monitor", scope);
                            break;
                        }
                    }
                    last = Some(alive);

                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::debug!("{}: monitor stopped", scope);
            })?;

        log::info!("{}: monitoring every {:?}", name, interval);
        Ok(Self {
            name,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Signal the polling thread and wait for it to exit.
    ///
    /// Returns once any probe in flight has finished; no probe starts afterwards.
    pub fn stop(&mut self) {
        // dropping the sender disconnects the channel, which also wakes the thread
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("{}: monitor thread panicked", self.name);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for LivenessMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
