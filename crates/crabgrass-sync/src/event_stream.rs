use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::Level;

use crabgrass_observability::{emit_event, SyncEvent};
use crabgrass_types::{EntityRef, EventKind, InboundEvent};

use crate::config::SyncConfig;
use crate::listeners::{dispatch, ClientEvent, Listener, ListenerRegistry, StreamFault};
use crate::sse::{EventTransport, SseFrame};
use crate::OBS_PROCESS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamHealth {
    /// Never connected, or explicitly disconnected.
    Idle,
    Connecting,
    Live,
    /// Between a drop and the next attempt.
    Recovering,
    /// Reconnect budget exhausted; only an explicit `connect` restarts.
    Unavailable,
}

/// Exponential reconnect schedule: `base * 2^(attempt - 1)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base_delay: config.reconnect_base_delay(),
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Delay before attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

struct Shared {
    entity: EntityRef,
    entity_label: String,
    listeners: StdMutex<ListenerRegistry>,
    attempts: AtomicU32,
    health: watch::Sender<StreamHealth>,
}

impl Shared {
    fn set_health(&self, status: StreamHealth) {
        self.health.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn dispatch(&self, event: &ClientEvent) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot(event.kind());
        dispatch(&listeners, event);
    }

    fn deliver_frame(&self, frame: SseFrame) {
        match InboundEvent::decode(&frame.event, &frame.data) {
            Ok(event) => {
                tracing::trace!(
                    entity = %self.entity,
                    kind = %event.kind(),
                    edit_id = event.edit_id(),
                    "push event"
                );
                self.dispatch(&ClientEvent::Inbound(event));
            }
            Err(err) => {
                let message = err.to_string();
                emit_event(
                    Level::WARN,
                    OBS_PROCESS,
                    SyncEvent {
                        entity: Some(&self.entity_label),
                        status: Some(&frame.event),
                        detail: Some(&message),
                        ..SyncEvent::new("stream.decode_failed", "event_stream")
                    },
                );
                self.dispatch(&ClientEvent::Error(StreamFault::Decode {
                    event_name: frame.event,
                    message,
                }));
            }
        }
    }
}

struct ConnectionState {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

/// One push connection per entity, with listener fan-out and bounded
/// exponential reconnect.
///
/// At most one connection task exists at a time. Dropping the client stops
/// the task because its stop channel closes.
pub struct EventStreamClient {
    shared: Arc<Shared>,
    transport: Arc<dyn EventTransport>,
    policy: ReconnectPolicy,
    state: Mutex<ConnectionState>,
}

impl EventStreamClient {
    pub fn new(
        entity: EntityRef,
        transport: Arc<dyn EventTransport>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (health, _) = watch::channel(StreamHealth::Idle);
        Self {
            shared: Arc::new(Shared {
                entity_label: entity.to_string(),
                entity,
                listeners: StdMutex::new(ListenerRegistry::new()),
                attempts: AtomicU32::new(0),
                health,
            }),
            transport,
            policy,
            state: Mutex::new(ConnectionState {
                stop_tx: None,
                task: None,
            }),
        }
    }

    pub fn entity(&self) -> &EntityRef {
        &self.shared.entity
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn on(&self, kind: EventKind, listener: Listener) {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(kind, listener);
    }

    pub fn off(&self, kind: EventKind, listener: &Listener) -> bool {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(kind, listener)
    }

    pub fn listener_count(&self) -> usize {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total()
    }

    pub fn health(&self) -> StreamHealth {
        *self.shared.health.borrow()
    }

    pub fn watch_health(&self) -> watch::Receiver<StreamHealth> {
        self.shared.health.subscribe()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub async fn is_connected(&self) -> bool {
        let state = self.state.lock().await;
        state.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Tears down any existing connection or pending retry, resets the
    /// attempt counter, and starts a fresh connection task.
    ///
    /// Must not be awaited from inside a listener; listeners run on the
    /// connection task this waits for.
    pub async fn connect(&self) {
        let mut state = self.state.lock().await;
        stop_task(&mut state).await;

        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.set_health(StreamHealth::Connecting);

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(run_connection(
            self.shared.clone(),
            self.transport.clone(),
            self.policy.clone(),
            stop_rx,
        ));

        state.stop_tx = Some(stop_tx);
        state.task = Some(task);
    }

    /// Closes the connection and cancels any pending retry. Safe to call
    /// when not connected.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        let was_running = stop_task(&mut state).await;
        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.set_health(StreamHealth::Idle);
        if was_running {
            emit_event(
                Level::INFO,
                OBS_PROCESS,
                SyncEvent {
                    entity: Some(&self.shared.entity_label),
                    ..SyncEvent::new("stream.disconnected", "event_stream")
                },
            );
        }
    }
}

async fn stop_task(state: &mut ConnectionState) -> bool {
    let mut was_running = false;
    if let Some(stop_tx) = state.stop_tx.take() {
        let _ = stop_tx.send(());
    }
    if let Some(task) = state.task.take() {
        was_running = !task.is_finished();
        let _ = task.await;
    }
    was_running
}

async fn run_connection(
    shared: Arc<Shared>,
    transport: Arc<dyn EventTransport>,
    policy: ReconnectPolicy,
    mut stop_rx: oneshot::Receiver<()>,
) {
    'outer: loop {
        let opened = tokio::select! {
            res = transport.open(&shared.entity) => res,
            _ = &mut stop_rx => break 'outer,
        };

        let reason = match opened {
            Ok(mut stream) => {
                shared.attempts.store(0, Ordering::SeqCst);
                shared.set_health(StreamHealth::Live);
                emit_event(
                    Level::INFO,
                    OBS_PROCESS,
                    SyncEvent {
                        entity: Some(&shared.entity_label),
                        status: Some("live"),
                        ..SyncEvent::new("stream.opened", "event_stream")
                    },
                );

                loop {
                    tokio::select! {
                        _ = &mut stop_rx => break 'outer,
                        maybe = stream.next() => match maybe {
                            Some(Ok(frame)) => shared.deliver_frame(frame),
                            Some(Err(e)) => {
                                tracing::warn!("Event stream for {} failed: {}", shared.entity, e);
                                break e.to_string();
                            }
                            None => {
                                tracing::info!("Event stream for {} ended", shared.entity);
                                break "stream ended".to_string();
                            }
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Failed to open event stream for {}: {}", shared.entity, e);
                e.to_string()
            }
        };

        let attempt = shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > policy.max_attempts {
            shared.attempts.store(policy.max_attempts, Ordering::SeqCst);
            shared.set_health(StreamHealth::Unavailable);
            emit_event(
                Level::ERROR,
                OBS_PROCESS,
                SyncEvent {
                    entity: Some(&shared.entity_label),
                    attempt: Some(policy.max_attempts),
                    status: Some("unavailable"),
                    detail: Some(&reason),
                    ..SyncEvent::new("stream.reconnect_exhausted", "event_stream")
                },
            );
            shared.dispatch(&ClientEvent::Error(StreamFault::ConnectionLost {
                attempts: policy.max_attempts,
                message: reason,
            }));
            break;
        }

        let delay = policy.delay_for(attempt);
        shared.set_health(StreamHealth::Recovering);
        emit_event(
            Level::INFO,
            OBS_PROCESS,
            SyncEvent {
                entity: Some(&shared.entity_label),
                attempt: Some(attempt),
                status: Some("recovering"),
                detail: Some(&reason),
                ..SyncEvent::new("stream.reconnect_scheduled", "event_stream")
            },
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {},
            _ = &mut stop_rx => break 'outer,
        }
    }

    tracing::debug!("Event stream task for {} stopped", shared.entity);
}
