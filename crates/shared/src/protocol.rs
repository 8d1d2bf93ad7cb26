use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    ChangeSource, CommandId, CommandStatus, DeviceId, MirroredSwitch, RejectReason, SwitchId,
};

/// One framed message on the device link. Serialized as a single JSON object:
/// `{ type, deviceId, sequenceNumber, payload, timestamp }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub device_id: DeviceId,
    /// Per-direction counter used by the receiver to drop retransmitted duplicates.
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub message: LinkMessage,
}

impl Envelope {
    pub fn new(device_id: DeviceId, sequence_number: u64, message: LinkMessage) -> Self {
        Self {
            device_id,
            sequence_number,
            timestamp: Utc::now(),
            message,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.message.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum LinkMessage {
    Hello(HelloPayload),
    Heartbeat(HeartbeatPayload),
    StateEvent(StateEventPayload),
    Command(CommandPayload),
    Ack(AckPayload),
}

impl LinkMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            LinkMessage::Hello(_) => "hello",
            LinkMessage::Heartbeat(_) => "heartbeat",
            LinkMessage::StateEvent(_) => "stateEvent",
            LinkMessage::Command(_) => "command",
            LinkMessage::Ack(_) => "ack",
        }
    }

    /// State events are superseded by any later value for the same switch, so a
    /// full outbox may shed them. Everything else must be delivered.
    pub fn is_droppable(&self) -> bool {
        matches!(self, LinkMessage::StateEvent(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub switches: Vec<SwitchReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_alert: Option<String>,
}

/// Full state of one switch as reported in `hello`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchReport {
    pub switch_id: SwitchId,
    pub physical_state: bool,
    pub desired_state: bool,
    pub manual_override: bool,
    #[serde(default)]
    pub unpersisted: bool,
    /// Highest command sequence the agent has processed for this switch.
    #[serde(default)]
    pub last_sequence: u64,
    pub last_change_source: ChangeSource,
    pub last_changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    /// Set on the backend's echo: highest device envelope sequence accepted so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_through: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateEventPayload {
    pub switch_id: SwitchId,
    pub physical_state: bool,
    pub desired_state: bool,
    pub manual_override: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unpersisted: bool,
    pub source: ChangeSource,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    pub command_id: CommandId,
    pub switch_id: SwitchId,
    pub switch_sequence: u64,
    pub desired_state: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub clear_override: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AckStatus {
    Applied,
    Overridden,
    Stale,
    UnknownSwitch,
}

impl AckStatus {
    /// How the router records this outcome for the issuer.
    pub fn resolution(self) -> (CommandStatus, Option<RejectReason>) {
        match self {
            AckStatus::Applied => (CommandStatus::Acked, None),
            AckStatus::Overridden => (CommandStatus::Rejected, Some(RejectReason::Overridden)),
            AckStatus::Stale => (CommandStatus::Rejected, Some(RejectReason::StaleSequence)),
            AckStatus::UnknownSwitch => {
                (CommandStatus::Rejected, Some(RejectReason::UnknownSwitch))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub command_id: CommandId,
    pub switch_id: SwitchId,
    pub switch_sequence: u64,
    pub status: AckStatus,
}

/// Fan-out event delivered to subscribers whenever the mirror changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchUpdate {
    pub device_id: DeviceId,
    pub switch_id: SwitchId,
    pub physical_state: bool,
    pub desired_state: bool,
    pub manual_override: bool,
    pub stale: bool,
    pub unpersisted: bool,
    pub timestamp: DateTime<Utc>,
}

impl SwitchUpdate {
    pub fn from_mirror(switch: &MirroredSwitch, timestamp: DateTime<Utc>) -> Self {
        Self {
            device_id: switch.device_id.clone(),
            switch_id: switch.switch_id.clone(),
            physical_state: switch.physical_state,
            desired_state: switch.desired_state,
            manual_override: switch.manual_override,
            stale: switch.stale,
            unpersisted: switch.unpersisted,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResolution {
    pub command_id: CommandId,
    pub device_id: DeviceId,
    pub switch_id: SwitchId,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum SubscriberEvent {
    SwitchUpdated(SwitchUpdate),
    CommandResolved(CommandResolution),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitCommandRequest {
    pub device_id: DeviceId,
    pub switch_id: SwitchId,
    pub desired_state: bool,
    #[serde(default)]
    pub clear_override: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubmitStatus {
    Queued,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitCommandResponse {
    pub command_id: CommandId,
    pub status: SubmitStatus,
}
