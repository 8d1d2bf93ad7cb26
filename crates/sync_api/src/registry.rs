use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use shared::{domain::DeviceId, protocol::LinkMessage, sequence::SequenceWindow};
use tokio::{
    sync::{mpsc, Mutex, OwnedMutexGuard},
    time::{Duration, Instant},
};
use uuid::Uuid;

/// One live device connection.
struct Session {
    connection_id: Uuid,
    outbound: mpsc::UnboundedSender<LinkMessage>,
    last_heartbeat: Instant,
    last_seen: DateTime<Utc>,
    stale: bool,
}

/// What the heartbeat sweep needs to know about a session it expired.
#[derive(Debug, Clone)]
pub struct ExpiredSession {
    pub device_id: DeviceId,
    pub connection_id: Uuid,
    pub last_seen: DateTime<Utc>,
}

/// Sharded map of live sessions plus the per-device state that must outlive
/// any single connection: the inbound envelope window and the mirror lock.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<DeviceId, Session>,
    inbound: DashMap<DeviceId, SequenceWindow>,
    locks: DashMap<DeviceId, Arc<Mutex<()>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection, replacing any previous one for the device.
    pub fn register(
        &self,
        device_id: &DeviceId,
        outbound: mpsc::UnboundedSender<LinkMessage>,
        now: Instant,
    ) -> Uuid {
        let connection_id = Uuid::new_v4();
        self.sessions.insert(
            device_id.clone(),
            Session {
                connection_id,
                outbound,
                last_heartbeat: now,
                last_seen: Utc::now(),
                stale: false,
            },
        );
        connection_id
    }

    /// Removes the session only if it still belongs to `connection_id`.
    pub fn deregister(&self, device_id: &DeviceId, connection_id: Uuid) -> bool {
        self.sessions
            .remove_if(device_id, |_, session| session.connection_id == connection_id)
            .is_some()
    }

    /// Refreshes liveness. Returns true when the session was stale and has
    /// just been revived.
    pub fn touch(&self, device_id: &DeviceId, now: Instant) -> bool {
        let Some(mut session) = self.sessions.get_mut(device_id) else {
            return false;
        };
        session.last_heartbeat = now;
        session.last_seen = Utc::now();
        std::mem::replace(&mut session.stale, false)
    }

    pub fn is_live(&self, device_id: &DeviceId) -> bool {
        self.sessions
            .get(device_id)
            .is_some_and(|session| !session.stale)
    }

    /// Queues a message on the device's live session.
    pub fn send(&self, device_id: &DeviceId, message: LinkMessage) -> bool {
        match self.sessions.get(device_id) {
            Some(session) if !session.stale => session.outbound.send(message).is_ok(),
            _ => false,
        }
    }

    /// Flags every session silent for longer than `timeout` and returns them.
    pub fn expire_silent(&self, now: Instant, timeout: Duration) -> Vec<ExpiredSession> {
        let mut expired = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            let (device_id, session) = entry.pair_mut();
            if session.stale || now.saturating_duration_since(session.last_heartbeat) <= timeout {
                continue;
            }
            session.stale = true;
            expired.push(ExpiredSession {
                device_id: device_id.clone(),
                connection_id: session.connection_id,
                last_seen: session.last_seen,
            });
        }
        expired
    }

    /// Runs an inbound envelope sequence through the device's window.
    pub fn accept_inbound(&self, device_id: &DeviceId, sequence: u64, is_hello: bool) -> Accepted {
        let mut window = self.inbound.entry(device_id.clone()).or_default();
        if is_hello {
            if window.accept_hello(sequence) {
                Accepted::Restarted
            } else {
                Accepted::Fresh
            }
        } else if window.accept(sequence) {
            Accepted::Fresh
        } else {
            Accepted::Duplicate
        }
    }

    pub fn received_through(&self, device_id: &DeviceId) -> Option<u64> {
        self.inbound
            .get(device_id)
            .and_then(|window| window.highest())
    }

    /// Serializes mirror mutations for one device.
    pub async fn lock_device(&self, device_id: &DeviceId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(device_id.clone())
            .or_default()
            .value()
            .clone();
        lock.lock_owned().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    Fresh,
    /// A hello that rewound the window: the device restarted its counter.
    Restarted,
    Duplicate,
}
