//! Backend half of the switch synchronization engine: the session registry,
//! the [`SyncMediator`] that keeps the mirror current and the
//! [`CommandRouter`] that carries commands to devices.

pub mod mediator;
pub mod registry;
pub mod router;

use std::sync::Arc;

use anyhow::Result;
use shared::{
    domain::DeviceId,
    protocol::{Envelope, LinkMessage},
};
use storage::Storage;
use tokio::time::Instant;
use tracing::warn;

pub use mediator::{MediatorSettings, SyncMediator};
pub use router::{CommandRouter, RouterSettings, SweepReport};

#[derive(Clone)]
pub struct SyncContext {
    pub mediator: Arc<SyncMediator>,
    pub router: Arc<CommandRouter>,
}

impl SyncContext {
    pub fn new(storage: Storage, mediator: MediatorSettings, router: RouterSettings) -> Self {
        let mediator = Arc::new(SyncMediator::new(storage, mediator));
        let router = Arc::new(CommandRouter::new(Arc::clone(&mediator), router));
        Self { mediator, router }
    }

    pub fn storage(&self) -> &Storage {
        self.mediator.storage()
    }
}

/// Dispatches one envelope received on `device_id`'s link. Returns the
/// immediate reply, if any, for the same link.
pub async fn handle_inbound(
    ctx: &SyncContext,
    device_id: &DeviceId,
    envelope: Envelope,
    now: Instant,
) -> Result<Option<LinkMessage>> {
    if &envelope.device_id != device_id {
        warn!(
            device_id = %device_id,
            claimed = %envelope.device_id,
            kind = envelope.kind(),
            "mediator: envelope for another device ignored"
        );
        return Ok(None);
    }
    if !ctx.mediator.accept(&envelope, now).await? {
        return Ok(None);
    }

    match envelope.message {
        LinkMessage::Hello(hello) => {
            ctx.mediator.on_hello(device_id, &hello).await?;
            ctx.router.replay(device_id, &hello, now).await?;
            Ok(None)
        }
        LinkMessage::Heartbeat(_) => {
            let echo = ctx.mediator.on_heartbeat(device_id).await?;
            Ok(Some(LinkMessage::Heartbeat(echo)))
        }
        LinkMessage::StateEvent(event) => {
            ctx.mediator.on_state_event(device_id, &event).await?;
            Ok(None)
        }
        LinkMessage::Ack(ack) => {
            ctx.router.on_ack(device_id, &ack).await?;
            Ok(None)
        }
        LinkMessage::Command(command) => {
            warn!(
                device_id = %device_id,
                command_id = %command.command_id,
                "mediator: device sent a command, ignoring"
            );
            Ok(None)
        }
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
