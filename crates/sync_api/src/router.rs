use std::{sync::Arc, time::Duration};

use chrono::Utc;
use dashmap::DashMap;
use shared::{
    backoff::Backoff,
    domain::{CommandId, CommandRecord, CommandStatus, DeviceId, RejectReason, SwitchId},
    error::SyncError,
    protocol::{
        AckPayload, CommandPayload, CommandResolution, HelloPayload, LinkMessage,
        SubmitCommandRequest, SubmitCommandResponse, SubmitStatus, SubscriberEvent,
    },
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::mediator::SyncMediator;

#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// How long an undelivered command may wait for its device.
    pub command_ttl: Duration,
    pub max_attempts: u32,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    /// Terminal commands older than this are garbage-collected.
    pub retention: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            command_ttl: Duration::from_secs(30),
            max_attempts: 3,
            retry_initial: Duration::from_secs(2),
            retry_max: Duration::from_secs(30),
            retention: Duration::from_secs(60 * 60),
        }
    }
}

struct PendingCommand {
    record: CommandRecord,
    expires_at: Instant,
    next_attempt_at: Instant,
}

impl PendingCommand {
    fn payload(&self) -> CommandPayload {
        CommandPayload {
            command_id: self.record.command_id,
            switch_id: self.record.switch_id.clone(),
            switch_sequence: self.record.sequence_number,
            desired_state: self.record.desired_state,
            clear_override: self.record.clear_override,
        }
    }
}

/// Outcome counts of one [`CommandRouter::sweep`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub redelivered: usize,
    pub expired: usize,
}

/// Entry point for commands from outside: sequencing, delivery, redelivery
/// and resolution tracking.
pub struct CommandRouter {
    mediator: Arc<SyncMediator>,
    settings: RouterSettings,
    pending: DashMap<CommandId, PendingCommand>,
}

fn persistence(err: anyhow::Error) -> SyncError {
    SyncError::Persistence(format!("{err:#}"))
}

impl CommandRouter {
    pub fn new(mediator: Arc<SyncMediator>, settings: RouterSettings) -> Self {
        Self {
            mediator,
            settings,
            pending: DashMap::new(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Picks up commands still pending in the ledger, e.g. after a restart.
    pub async fn reload(&self, now: Instant) -> Result<usize, SyncError> {
        let records = self
            .mediator
            .storage()
            .pending_commands()
            .await
            .map_err(persistence)?;
        let count = records.len();
        for record in records {
            self.pending.insert(
                record.command_id,
                PendingCommand {
                    record,
                    expires_at: now + self.settings.command_ttl,
                    next_attempt_at: now,
                },
            );
        }
        if count > 0 {
            info!(count, "router: reloaded pending commands");
        }
        Ok(count)
    }

    pub async fn submit(
        &self,
        request: SubmitCommandRequest,
        now: Instant,
    ) -> Result<SubmitCommandResponse, SyncError> {
        let storage = self.mediator.storage();
        let Some(sequence_number) = storage
            .next_sequence(&request.device_id, &request.switch_id)
            .await
            .map_err(persistence)?
        else {
            warn!(
                device_id = %request.device_id,
                switch_id = %request.switch_id,
                "router: command for unknown switch"
            );
            return Err(SyncError::rejected(
                &request.device_id,
                &request.switch_id,
                RejectReason::UnknownSwitch,
            ));
        };

        let record = CommandRecord {
            command_id: CommandId::generate(),
            device_id: request.device_id,
            switch_id: request.switch_id,
            sequence_number,
            desired_state: request.desired_state,
            clear_override: request.clear_override,
            status: CommandStatus::Pending,
            reason: None,
            attempts: 0,
            issued_at: Utc::now(),
            resolved_at: None,
        };
        storage.insert_command(&record).await.map_err(persistence)?;

        let command_id = record.command_id;
        info!(
            command_id = %command_id,
            device_id = %record.device_id,
            switch_id = %record.switch_id,
            switch_sequence = record.sequence_number,
            desired_state = record.desired_state,
            "router: command queued"
        );
        // Tracked before the first send so an immediate ack finds it.
        self.pending.insert(
            command_id,
            PendingCommand {
                record,
                expires_at: now + self.settings.command_ttl,
                next_attempt_at: now,
            },
        );
        self.attempt(command_id, now).await?;

        Ok(SubmitCommandResponse {
            command_id,
            status: SubmitStatus::Queued,
        })
    }

    pub async fn status(&self, command_id: CommandId) -> Result<Option<CommandRecord>, SyncError> {
        self.mediator
            .storage()
            .load_command(command_id)
            .await
            .map_err(persistence)
    }

    pub async fn on_ack(&self, device_id: &DeviceId, ack: &AckPayload) -> Result<(), SyncError> {
        let (status, reason) = ack.status.resolution();
        if reason != Some(RejectReason::UnknownSwitch) {
            self.mediator
                .storage()
                .record_applied_sequence(device_id, &ack.switch_id, ack.switch_sequence)
                .await
                .map_err(persistence)?;
        }
        self.resolve(ack.command_id, status, reason).await?;
        Ok(())
    }

    /// Redelivers the device's pending commands after a hello, oldest first.
    /// Commands below the sequence the agent already processed were
    /// superseded and are rejected as stale.
    pub async fn replay(
        &self,
        device_id: &DeviceId,
        hello: &HelloPayload,
        now: Instant,
    ) -> Result<usize, SyncError> {
        let mut queued: Vec<(SwitchId, u64, CommandId)> = self
            .pending
            .iter()
            .filter(|entry| &entry.record.device_id == device_id)
            .map(|entry| {
                (
                    entry.record.switch_id.clone(),
                    entry.record.sequence_number,
                    *entry.key(),
                )
            })
            .collect();
        queued.sort();

        let mut replayed = 0;
        for (switch_id, sequence_number, command_id) in queued {
            let processed = hello
                .switches
                .iter()
                .find(|report| report.switch_id == switch_id)
                .map_or(0, |report| report.last_sequence);
            if sequence_number < processed {
                self.resolve(
                    command_id,
                    CommandStatus::Rejected,
                    Some(RejectReason::StaleSequence),
                )
                .await?;
                continue;
            }

            if self.attempt(command_id, now).await? {
                replayed += 1;
            }
        }
        if replayed > 0 {
            info!(device_id = %device_id, replayed, "router: replayed pending commands");
        }
        Ok(replayed)
    }

    /// Redelivers commands whose retry time has come and expires the ones
    /// that ran out of attempts or waited past their TTL undelivered.
    pub async fn sweep(&self, now: Instant) -> Result<SweepReport, SyncError> {
        let due: Vec<CommandId> = self
            .pending
            .iter()
            .filter(|entry| now >= entry.next_attempt_at)
            .map(|entry| *entry.key())
            .collect();

        let mut report = SweepReport::default();
        for command_id in due {
            let Some((device_id, attempts, expires_at)) = self.pending.get(&command_id).map(|entry| {
                (
                    entry.record.device_id.clone(),
                    entry.record.attempts,
                    entry.expires_at,
                )
            }) else {
                continue;
            };
            let device_live = self.mediator.is_live(&device_id);
            let exhausted = attempts >= self.settings.max_attempts;
            let timed_out = now >= expires_at;

            if exhausted || (!device_live && timed_out) {
                if self.resolve(command_id, CommandStatus::Expired, None).await? {
                    report.expired += 1;
                }
                continue;
            }
            if device_live && self.attempt(command_id, now).await? {
                report.redelivered += 1;
            }
        }
        if report != SweepReport::default() {
            debug!(
                redelivered = report.redelivered,
                expired = report.expired,
                "router: sweep finished"
            );
        }
        Ok(report)
    }

    /// Deletes terminal commands and switch activity past the retention
    /// window. Returns the number of commands purged.
    pub async fn collect_garbage(&self) -> Result<u64, SyncError> {
        let retention = chrono::Duration::from_std(self.settings.retention)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let purged = self
            .mediator
            .storage()
            .purge_resolved_commands(cutoff)
            .await
            .map_err(persistence)?;
        let trimmed = self
            .mediator
            .storage()
            .purge_activity(cutoff)
            .await
            .map_err(persistence)?;
        if purged > 0 || trimmed > 0 {
            info!(purged, trimmed, "router: purged resolved commands and old activity");
        }
        Ok(purged)
    }

    /// Sends the command if it is still pending and its device has a live
    /// session, then schedules the next attempt. Returns whether it went out.
    /// The entry is updated in place so a concurrent resolve always wins.
    async fn attempt(&self, command_id: CommandId, now: Instant) -> Result<bool, SyncError> {
        let attempts = {
            let Some(mut pending) = self.pending.get_mut(&command_id) else {
                return Ok(false);
            };
            let message = LinkMessage::Command(pending.payload());
            if !self.mediator.deliver(&pending.record.device_id, message) {
                return Ok(false);
            }
            pending.record.attempts += 1;
            pending.next_attempt_at = now
                + Backoff::delay_for_attempt(
                    self.settings.retry_initial,
                    self.settings.retry_max,
                    pending.record.attempts,
                );
            pending.record.attempts
        };
        self.mediator
            .storage()
            .record_attempt(command_id, attempts)
            .await
            .map_err(persistence)?;
        debug!(command_id = %command_id, attempts, "router: command sent");
        Ok(true)
    }

    /// Records a terminal status once and publishes it. Returns false when the
    /// command was already resolved.
    async fn resolve(
        &self,
        command_id: CommandId,
        status: CommandStatus,
        reason: Option<RejectReason>,
    ) -> Result<bool, SyncError> {
        let recorded = self
            .mediator
            .storage()
            .resolve_command(command_id, status, reason, Utc::now())
            .await
            .map_err(persistence)?;
        let pending = self.pending.remove(&command_id).map(|(_, pending)| pending);
        if !recorded {
            debug!(command_id = %command_id, status = status.as_str(), "router: command already resolved");
            return Ok(false);
        }

        let record = match pending {
            Some(pending) => pending.record,
            None => match self.status(command_id).await? {
                Some(record) => record,
                None => return Ok(true),
            },
        };
        info!(
            command_id = %command_id,
            device_id = %record.device_id,
            switch_id = %record.switch_id,
            status = status.as_str(),
            reason = reason.map(RejectReason::as_str),
            "router: command resolved"
        );
        self.mediator
            .publish(SubscriberEvent::CommandResolved(CommandResolution {
                command_id,
                device_id: record.device_id,
                switch_id: record.switch_id,
                status,
                reason,
            }));
        Ok(true)
    }
}
