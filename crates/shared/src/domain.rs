use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(DeviceId);
id_newtype!(SwitchId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub Uuid);

impl CommandId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeSource {
    #[default]
    Remote,
    Manual,
    Automation,
}

impl ChangeSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeSource::Remote => "remote",
            ChangeSource::Manual => "manual",
            ChangeSource::Automation => "automation",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "remote" => Some(ChangeSource::Remote),
            "manual" => Some(ChangeSource::Manual),
            "automation" => Some(ChangeSource::Automation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandStatus {
    Pending,
    Acked,
    Rejected,
    Expired,
}

impl CommandStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Acked => "acked",
            CommandStatus::Rejected => "rejected",
            CommandStatus::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(CommandStatus::Pending),
            "acked" => Some(CommandStatus::Acked),
            "rejected" => Some(CommandStatus::Rejected),
            "expired" => Some(CommandStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, CommandStatus::Pending)
    }
}

/// Why a command did not take effect. Always reported to the issuer as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
    Overridden,
    UnknownSwitch,
    StaleSequence,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::Overridden => "overridden",
            RejectReason::UnknownSwitch => "unknownSwitch",
            RejectReason::StaleSequence => "staleSequence",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "overridden" => Some(RejectReason::Overridden),
            "unknownSwitch" => Some(RejectReason::UnknownSwitch),
            "staleSequence" => Some(RejectReason::StaleSequence),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub device_id: DeviceId,
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    pub switch_ids: Vec<SwitchId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_alert: Option<String>,
}

/// Mirror view of one switch as the backend last heard it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirroredSwitch {
    pub device_id: DeviceId,
    pub switch_id: SwitchId,
    pub desired_state: bool,
    pub physical_state: bool,
    pub manual_override: bool,
    pub unpersisted: bool,
    pub stale: bool,
    pub last_change_source: ChangeSource,
    pub last_changed_at: DateTime<Utc>,
    pub issued_sequence: u64,
    pub applied_sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActivityKind {
    /// Full state reported on (re)connect.
    Hello,
    StateChange,
    /// A command reached a terminal status.
    Command,
}

impl ActivityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityKind::Hello => "hello",
            ActivityKind::StateChange => "state_change",
            ActivityKind::Command => "command",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "hello" => Some(ActivityKind::Hello),
            "state_change" => Some(ActivityKind::StateChange),
            "command" => Some(ActivityKind::Command),
            _ => None,
        }
    }
}

/// One entry in a switch's activity trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchActivity {
    pub device_id: DeviceId,
    pub switch_id: SwitchId,
    pub kind: ActivityKind,
    pub source: ChangeSource,
    pub physical_state: bool,
    pub desired_state: bool,
    pub manual_override: bool,
    /// Command outcome, e.g. `acked` or `rejected: overridden`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub command_id: CommandId,
    pub device_id: DeviceId,
    pub switch_id: SwitchId,
    pub sequence_number: u64,
    pub desired_state: bool,
    pub clear_override: bool,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    pub attempts: u32,
    pub issued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}
