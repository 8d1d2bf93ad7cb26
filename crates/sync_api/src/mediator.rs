use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use shared::{
    domain::{DeviceId, MirroredSwitch},
    protocol::{
        Envelope, HeartbeatPayload, HelloPayload, LinkMessage, StateEventPayload,
        SubscriberEvent, SwitchUpdate,
    },
};
use storage::Storage;
use tokio::{
    sync::{broadcast, mpsc},
    time::Instant,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::{Accepted, SessionRegistry};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct MediatorSettings {
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
}

impl Default for MediatorSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            max_missed_heartbeats: 3,
        }
    }
}

impl MediatorSettings {
    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval
            .saturating_mul(self.max_missed_heartbeats.max(1))
    }
}

/// Backend side of every device link: tracks sessions, keeps the mirror in
/// step with what agents report and fans changes out to subscribers.
pub struct SyncMediator {
    storage: Storage,
    registry: SessionRegistry,
    events: broadcast::Sender<SubscriberEvent>,
    settings: MediatorSettings,
}

impl SyncMediator {
    pub fn new(storage: Storage, settings: MediatorSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            storage,
            registry: SessionRegistry::new(),
            events,
            settings,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn settings(&self) -> &MediatorSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SubscriberEvent> {
        self.events.subscribe()
    }

    pub fn publish(&self, event: SubscriberEvent) {
        let _ = self.events.send(event);
    }

    pub fn is_live(&self, device_id: &DeviceId) -> bool {
        self.registry.is_live(device_id)
    }

    /// Queues a message for the device. False when no live session exists.
    pub fn deliver(&self, device_id: &DeviceId, message: LinkMessage) -> bool {
        self.registry.send(device_id, message)
    }

    pub fn on_connect(
        &self,
        device_id: &DeviceId,
        outbound: mpsc::UnboundedSender<LinkMessage>,
        now: Instant,
    ) -> Uuid {
        let connection_id = self.registry.register(device_id, outbound, now);
        info!(device_id = %device_id, connection_id = %connection_id, "mediator: session opened");
        connection_id
    }

    /// Filters retransmitted envelopes. Any accepted envelope counts as a
    /// sign of life.
    pub async fn accept(&self, envelope: &Envelope, now: Instant) -> Result<bool> {
        let is_hello = matches!(envelope.message, LinkMessage::Hello(_));
        match self
            .registry
            .accept_inbound(&envelope.device_id, envelope.sequence_number, is_hello)
        {
            Accepted::Duplicate => {
                debug!(
                    device_id = %envelope.device_id,
                    sequence_number = envelope.sequence_number,
                    kind = envelope.kind(),
                    "mediator: dropping duplicate envelope"
                );
                return Ok(false);
            }
            Accepted::Restarted => info!(
                device_id = %envelope.device_id,
                sequence_number = envelope.sequence_number,
                "mediator: device restarted its link counter"
            ),
            Accepted::Fresh => {}
        }

        if self.registry.touch(&envelope.device_id, now) {
            self.revive(&envelope.device_id).await?;
        }
        Ok(true)
    }

    /// Replaces the device's mirror with the agent's full state.
    pub async fn on_hello(&self, device_id: &DeviceId, hello: &HelloPayload) -> Result<Vec<MirroredSwitch>> {
        let _guard = self.registry.lock_device(device_id).await;
        let now = Utc::now();
        if let Some(alert) = &hello.startup_alert {
            warn!(device_id = %device_id, alert = %alert, "mediator: device reported startup alert");
        }
        let switches = self.storage.record_hello(device_id, hello, now).await?;
        info!(device_id = %device_id, switches = switches.len(), "mediator: mirror refreshed from hello");
        self.fan_out(&switches, now);
        Ok(switches)
    }

    pub async fn on_state_event(
        &self,
        device_id: &DeviceId,
        event: &StateEventPayload,
    ) -> Result<MirroredSwitch> {
        let _guard = self.registry.lock_device(device_id).await;
        let now = Utc::now();
        let switch = self.storage.record_state_event(device_id, event, now).await?;
        debug!(
            device_id = %device_id,
            switch_id = %switch.switch_id,
            physical_state = switch.physical_state,
            manual_override = switch.manual_override,
            unpersisted = switch.unpersisted,
            "mediator: state event mirrored"
        );
        if switch.unpersisted {
            warn!(device_id = %device_id, switch_id = %switch.switch_id, "mediator: device reports unpersisted switch state");
        }
        self.fan_out(std::slice::from_ref(&switch), now);
        Ok(switch)
    }

    /// Records the heartbeat and builds the echo, which confirms everything
    /// received from the device so far.
    pub async fn on_heartbeat(&self, device_id: &DeviceId) -> Result<HeartbeatPayload> {
        self.storage.touch_device(device_id, Utc::now()).await?;
        Ok(HeartbeatPayload {
            received_through: self.registry.received_through(device_id),
        })
    }

    /// Marks devices whose heartbeats stopped as stale. Mirror values are kept.
    pub async fn sweep_heartbeats(&self, now: Instant) -> Result<Vec<DeviceId>> {
        let expired = self.registry.expire_silent(now, self.settings.stale_after());
        let mut stale = Vec::with_capacity(expired.len());
        for session in expired {
            let _guard = self.registry.lock_device(&session.device_id).await;
            warn!(
                device_id = %session.device_id,
                connection_id = %session.connection_id,
                last_seen = %session.last_seen,
                "mediator: heartbeats missed, marking device stale"
            );
            let switches = self.storage.set_device_stale(&session.device_id, true).await?;
            self.fan_out(&switches, session.last_seen);
            stale.push(session.device_id);
        }
        Ok(stale)
    }

    /// Drops the session if `connection_id` still owns it. The mirror is kept
    /// and flagged stale until the device says hello again.
    pub async fn on_disconnect(&self, device_id: &DeviceId, connection_id: Uuid) -> Result<bool> {
        if !self.registry.deregister(device_id, connection_id) {
            debug!(device_id = %device_id, connection_id = %connection_id, "mediator: superseded session closed");
            return Ok(false);
        }
        let _guard = self.registry.lock_device(device_id).await;
        let switches = self.storage.set_device_stale(device_id, true).await?;
        info!(device_id = %device_id, connection_id = %connection_id, "mediator: session closed");
        self.fan_out(&switches, Utc::now());
        Ok(true)
    }

    #[cfg(test)]
    pub(crate) async fn lock_device(&self, device_id: &DeviceId) -> tokio::sync::OwnedMutexGuard<()> {
        self.registry.lock_device(device_id).await
    }

    async fn revive(&self, device_id: &DeviceId) -> Result<()> {
        let _guard = self.registry.lock_device(device_id).await;
        let switches = self.storage.set_device_stale(device_id, false).await?;
        info!(device_id = %device_id, "mediator: device back from stale");
        self.fan_out(&switches, Utc::now());
        Ok(())
    }

    fn fan_out(&self, switches: &[MirroredSwitch], timestamp: DateTime<Utc>) {
        for switch in switches {
            self.publish(SubscriberEvent::SwitchUpdated(SwitchUpdate::from_mirror(
                switch, timestamp,
            )));
        }
    }
}
