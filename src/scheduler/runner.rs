//! Tick loop that fires due schedules.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::storage::Storage;

use super::engine::SchedulerEngine;
use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::types::{SchedulerCommand, SchedulerState};

/// Periodically calls [`SchedulerEngine::fire_due_schedules`].
pub struct ScheduleRunner<S: Storage> {
    engine: Arc<SchedulerEngine<S>>,
    tick_interval: Duration,
}

impl<S: Storage + 'static> ScheduleRunner<S> {
    pub fn new(engine: Arc<SchedulerEngine<S>>) -> Self {
        Self {
            engine,
            tick_interval: Duration::from_secs(1),
        }
    }

    /// Set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Spawn the runner and return a handle for controlling it.
    pub fn start(self) -> (SchedulerHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(SchedulerState::Running));

        let handle = SchedulerHandle {
            command_tx,
            state: Arc::clone(&state),
        };

        let task = tokio::spawn(async move {
            self.run(command_rx, state).await;
        });

        (handle, task)
    }

    async fn run(
        self,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        state: Arc<RwLock<SchedulerState>>,
    ) {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(tick_interval_ms = self.tick_interval.as_millis() as u64, "Schedule runner started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let current_state = *state.read().await;
                    if current_state == SchedulerState::Running {
                        self.tick().await;
                    }
                }

                Some(command) = command_rx.recv() => {
                    match command {
                        SchedulerCommand::Tick { response } => {
                            let result = self.engine.fire_due_schedules(Utc::now()).await;
                            let _ = response.send(result);
                        }
                        SchedulerCommand::Pause { response } => {
                            *state.write().await = SchedulerState::Paused;
                            tracing::info!("Schedule runner paused");
                            let _ = response.send(());
                        }
                        SchedulerCommand::Resume { response } => {
                            // Occurrences missed while paused collapse into a
                            // single fire on the next tick.
                            *state.write().await = SchedulerState::Running;
                            tracing::info!("Schedule runner resumed");
                            let _ = response.send(());
                        }
                        SchedulerCommand::Shutdown { response } => {
                            *state.write().await = SchedulerState::Stopped;
                            tracing::info!("Schedule runner stopped");
                            let _ = response.send(());
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn tick(&self) {
        match self.engine.fire_due_schedules(Utc::now()).await {
            Ok(0) => {}
            Ok(fired) => tracing::debug!(fired, "Fired due schedules"),
            Err(e) => tracing::warn!(error = %e, "Failed to check schedules"),
        }
    }
}
