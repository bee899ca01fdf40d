//! Session Hub
//!
//! Owns every live client connection. Each client gets a bounded outbound
//! queue that a transport task drains onto the socket; the hub itself never
//! touches the socket, so a slow or dead client can only ever fill its own
//! queue. A client whose queue is full or closed is dropped on the spot.
//!
//! Liveness: every registered client has a probe task that sends a `ping`
//! envelope on a fixed interval and drops the client once nothing has been
//! heard from it for longer than the read deadline.

pub mod envelope;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use envelope::{Envelope, EnvelopeType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub ping_interval_secs: u64,
    pub read_deadline_secs: u64,
    pub write_deadline_secs: u64,
    /// Frames queued per client before it counts as too slow and is dropped.
    pub outbound_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            read_deadline_secs: 60,
            write_deadline_secs: 10,
            outbound_capacity: 256,
        }
    }
}

impl HubConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.read_deadline_secs)
    }

    pub fn write_deadline(&self) -> Duration {
        Duration::from_secs(self.write_deadline_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    fn fresh() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Item handed to the transport task of one client.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Pre-serialized envelope, shared between all recipients of a broadcast.
    Frame(Arc<str>),
    Close,
}

#[derive(Debug)]
struct Liveness {
    last_seen: Mutex<Instant>,
    closing: AtomicBool,
}

impl Liveness {
    fn new() -> Self {
        Self {
            last_seen: Mutex::new(Instant::now()),
            closing: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn silent_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn mark_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

struct ClientSlot {
    outbound: mpsc::Sender<Outbound>,
    liveness: Arc<Liveness>,
}

/// The transport-facing half of a registration: the outbound queue to drain
/// and the id to report inbound traffic under.
#[derive(Debug)]
pub struct ClientConnection {
    id: SessionId,
    outbound: mpsc::Receiver<Outbound>,
    liveness: Arc<Liveness>,
}

impl ClientConnection {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Next queued item; `None` once the hub has dropped the client and the
    /// queue is drained.
    pub async fn next_outbound(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    pub fn try_next_outbound(&mut self) -> Option<Outbound> {
        self.outbound.try_recv().ok()
    }

    /// True once the hub has unregistered this client.
    pub fn is_closing(&self) -> bool {
        self.liveness.is_closing()
    }
}

pub struct SessionHub {
    clients: Mutex<HashMap<SessionId, ClientSlot>>,
    config: HubConfig,
    shutdown: CancellationToken,
}

impl SessionHub {
    pub fn new(config: HubConfig, shutdown: CancellationToken) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            config,
            shutdown,
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, ClientSlot>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new client, queue `initial` (the full-state replace) as
    /// its first frame and start its liveness probe.
    pub fn register(self: &Arc<Self>, initial: &Envelope) -> ClientConnection {
        let id = SessionId::fresh();
        let (tx, rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        let liveness = Arc::new(Liveness::new());
        let connection = ClientConnection {
            id: id.clone(),
            outbound: rx,
            liveness: liveness.clone(),
        };

        if self.shutdown.is_cancelled() {
            liveness.mark_closing();
            let _ = tx.try_send(Outbound::Close);
            return connection;
        }

        match initial.to_json() {
            Ok(frame) => {
                let _ = tx.try_send(Outbound::Frame(Arc::from(frame)));
            }
            Err(e) => warn!("[Hub] Failed to encode initial state for {}: {}", id, e),
        }

        let connected = {
            let mut clients = self.lock();
            clients.insert(
                id.clone(),
                ClientSlot {
                    outbound: tx,
                    liveness: liveness.clone(),
                },
            );
            clients.len()
        };
        info!("[Hub] Client {} registered ({} connected)", id, connected);

        self.spawn_liveness(id, liveness);
        connection
    }

    /// Remove a client and close its queue. Safe to call more than once;
    /// returns whether the client was still registered.
    pub fn unregister(&self, id: &SessionId) -> bool {
        let removed = self.lock().remove(id);
        match removed {
            Some(slot) => {
                close_slot(slot);
                info!("[Hub] Client {} unregistered", id);
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, id: &SessionId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn client_count(&self) -> usize {
        self.lock().len()
    }

    /// Record inbound traffic from a client.
    pub fn touch(&self, id: &SessionId) {
        if let Some(slot) = self.lock().get(id) {
            slot.liveness.touch();
        }
    }

    /// Serialize once and queue for every client. Clients whose queue is
    /// full or gone are dropped; the rest still get the frame. Returns the
    /// number of clients the frame was queued for.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        let frame: Arc<str> = match envelope.to_json() {
            Ok(frame) => Arc::from(frame),
            Err(e) => {
                warn!("[Hub] Dropping unencodable {:?} envelope: {}", envelope.kind(), e);
                return 0;
            }
        };

        let mut clients = self.lock();
        let mut failed = Vec::new();
        let mut delivered = 0;
        for (id, slot) in clients.iter() {
            match slot.outbound.try_send(Outbound::Frame(frame.clone())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("[Hub] Client {} is not keeping up; dropping it", id);
                    failed.push(id.clone());
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("[Hub] Client {} queue already closed", id);
                    failed.push(id.clone());
                }
            }
        }
        for id in failed {
            if let Some(slot) = clients.remove(&id) {
                close_slot(slot);
            }
        }
        delivered
    }

    /// Queue an envelope for one client only, outside the broadcast path.
    pub fn send_to(&self, id: &SessionId, envelope: &Envelope) -> bool {
        let frame = match envelope.to_json() {
            Ok(frame) => Arc::from(frame),
            Err(e) => {
                warn!("[Hub] Failed to encode envelope for {}: {}", id, e);
                return false;
            }
        };

        let mut clients = self.lock();
        let Some(slot) = clients.get(id) else {
            return false;
        };
        if slot.outbound.try_send(Outbound::Frame(frame)).is_ok() {
            return true;
        }
        warn!("[Hub] Direct send to {} failed; dropping it", id);
        if let Some(slot) = clients.remove(id) {
            close_slot(slot);
        }
        false
    }

    /// Unregister and close every client.
    pub fn close_all(&self) {
        let drained: Vec<(SessionId, ClientSlot)> = self.lock().drain().collect();
        if !drained.is_empty() {
            info!("[Hub] Closing {} client(s)", drained.len());
        }
        for (_, slot) in drained {
            close_slot(slot);
        }
    }

    fn spawn_liveness(self: &Arc<Self>, id: SessionId, liveness: Arc<Liveness>) {
        let hub: Weak<SessionHub> = Arc::downgrade(self);
        let interval = self.config.ping_interval();
        let deadline = self.config.read_deadline();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if liveness.is_closing() {
                    break;
                }
                let Some(hub) = hub.upgrade() else {
                    break;
                };

                let silent_for = liveness.silent_for();
                if silent_for > deadline {
                    warn!(
                        "[Hub] Client {} silent for {:?}, past the {:?} deadline; dropping it",
                        id, silent_for, deadline
                    );
                    hub.unregister(&id);
                    break;
                }
                if !hub.send_to(&id, &Envelope::ping()) {
                    break;
                }
            }
            debug!("[Hub] Liveness probe for {} stopped", id);
        });
    }
}

fn close_slot(slot: ClientSlot) {
    slot.liveness.mark_closing();
    // Best effort: a full queue still closes once the sender is dropped.
    let _ = slot.outbound.try_send(Outbound::Close);
}

impl fmt::Debug for SessionHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHub")
            .field("clients", &self.client_count())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ViewState;

    fn hub_with(config: HubConfig) -> Arc<SessionHub> {
        Arc::new(SessionHub::new(config, CancellationToken::new()))
    }

    fn drain_frames(connection: &mut ClientConnection) -> Vec<Envelope> {
        let mut frames = Vec::new();
        while let Some(item) = connection.try_next_outbound() {
            if let Outbound::Frame(frame) = item {
                frames.push(Envelope::from_json(&frame).expect("valid frame"));
            }
        }
        frames
    }

    #[tokio::test]
    async fn register_queues_full_state_first() {
        let hub = hub_with(HubConfig::default());
        let mut connection = hub.register(&Envelope::state_replace(&ViewState::default()));
        let frames = drain_frames(&mut connection);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind(), EnvelopeType::StateReplace);
        assert_eq!(hub.client_count(), 1);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let hub = hub_with(HubConfig::default());
        let connection = hub.register(&Envelope::ping());
        let id = connection.id().clone();

        assert!(hub.unregister(&id));
        assert!(!hub.unregister(&id));
        assert_eq!(hub.client_count(), 0);
        assert!(connection.is_closing());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_client() {
        let hub = hub_with(HubConfig::default());
        let mut first = hub.register(&Envelope::ping());
        let mut second = hub.register(&Envelope::ping());
        drain_frames(&mut first);
        drain_frames(&mut second);

        let delivered = hub.broadcast(&Envelope::live_update("update_layout", serde_json::json!({})));
        assert_eq!(delivered, 2);
        assert_eq!(drain_frames(&mut first).len(), 1);
        assert_eq!(drain_frames(&mut second).len(), 1);
    }

    #[tokio::test]
    async fn slow_client_is_dropped_without_blocking_others() {
        let hub = hub_with(HubConfig {
            outbound_capacity: 2,
            ..HubConfig::default()
        });
        let _stalled = hub.register(&Envelope::ping());
        let mut healthy = hub.register(&Envelope::ping());

        for round in 0..4 {
            hub.broadcast(&Envelope::live_update("round", serde_json::json!(round)));
            drain_frames(&mut healthy);
        }

        assert_eq!(hub.client_count(), 1);
        assert!(hub.is_registered(healthy.id()));
        assert_eq!(hub.broadcast(&Envelope::ping()), 1);
    }

    #[tokio::test]
    async fn dropped_receiver_is_unregistered_on_next_broadcast() {
        let hub = hub_with(HubConfig::default());
        let gone = hub.register(&Envelope::ping());
        let gone_id = gone.id().clone();
        drop(gone);

        assert_eq!(hub.broadcast(&Envelope::ping()), 0);
        assert!(!hub.is_registered(&gone_id));
    }

    #[tokio::test]
    async fn send_to_targets_one_client() {
        let hub = hub_with(HubConfig::default());
        let mut first = hub.register(&Envelope::ping());
        let mut second = hub.register(&Envelope::ping());
        drain_frames(&mut first);
        drain_frames(&mut second);

        assert!(hub.send_to(first.id(), &Envelope::pong()));
        assert_eq!(drain_frames(&mut first)[0].kind(), EnvelopeType::Pong);
        assert!(drain_frames(&mut second).is_empty());
    }

    #[tokio::test]
    async fn close_all_empties_registry_and_closes_queues() {
        let hub = hub_with(HubConfig::default());
        let mut connection = hub.register(&Envelope::ping());
        drain_frames(&mut connection);
        hub.close_all();

        assert_eq!(hub.client_count(), 0);
        assert_eq!(connection.next_outbound().await, Some(Outbound::Close));
        assert_eq!(connection.next_outbound().await, None);
    }

    #[tokio::test]
    async fn register_after_shutdown_is_closed_immediately() {
        let shutdown = CancellationToken::new();
        let hub = Arc::new(SessionHub::new(HubConfig::default(), shutdown.clone()));
        shutdown.cancel();
        let mut connection = hub.register(&Envelope::ping());
        assert!(connection.is_closing());
        assert_eq!(hub.client_count(), 0);
        assert_eq!(connection.next_outbound().await, Some(Outbound::Close));
    }
}
