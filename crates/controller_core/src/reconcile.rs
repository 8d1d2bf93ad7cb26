//! Per-switch reconciliation rules.
//!
//! Every function here is pure: it takes the current [`SwitchState`] and one
//! input and returns the next state plus the side effects the agent must carry
//! out, in order. Hardware and persistence never appear in this module.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ChangeSource, SwitchId},
    protocol::{AckPayload, AckStatus, CommandPayload},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SwitchMode {
    /// Physical, desired and persisted values agree.
    Synced,
    /// A human changed the switch away from the last remote request. Remote
    /// commands are refused until one explicitly clears the override.
    ManualOverride,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchState {
    pub switch_id: SwitchId,
    pub mode: SwitchMode,
    pub desired: bool,
    pub physical: bool,
    pub persisted: bool,
    /// Highest command sequence processed, whatever its outcome.
    pub last_sequence: u64,
    #[serde(default)]
    pub last_ack: Option<AckPayload>,
    pub last_change_source: ChangeSource,
    pub last_changed_at: DateTime<Utc>,
}

impl SwitchState {
    /// Safe default used on first boot and when stored state is unreadable.
    pub fn off(switch_id: SwitchId, at: DateTime<Utc>) -> Self {
        Self {
            switch_id,
            mode: SwitchMode::Synced,
            desired: false,
            physical: false,
            persisted: false,
            last_sequence: 0,
            last_ack: None,
            last_change_source: ChangeSource::Remote,
            last_changed_at: at,
        }
    }

    pub fn manual_override(&self) -> bool {
        self.mode == SwitchMode::ManualOverride
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    DriveRelay(bool),
    Persist,
    EmitState,
    Ack(AckPayload),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: SwitchState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn unchanged(state: &SwitchState) -> Self {
        Self {
            next: state.clone(),
            effects: Vec::new(),
        }
    }
}

/// A hardware reading that disagrees with the persisted value is a manual
/// change and is adopted unconditionally.
pub fn on_reading(state: &SwitchState, physical: bool, at: DateTime<Utc>) -> Transition {
    if physical == state.persisted {
        return Transition::unchanged(state);
    }

    let mode = if physical == state.desired {
        SwitchMode::Synced
    } else {
        SwitchMode::ManualOverride
    };
    let next = SwitchState {
        mode,
        physical,
        persisted: physical,
        last_change_source: ChangeSource::Manual,
        last_changed_at: at,
        ..state.clone()
    };
    Transition {
        next,
        effects: vec![Effect::Persist, Effect::EmitState],
    }
}

pub fn on_command(state: &SwitchState, command: &CommandPayload, at: DateTime<Utc>) -> Transition {
    let sequence = command.switch_sequence;

    if sequence == state.last_sequence {
        if let Some(cached) = &state.last_ack {
            return Transition {
                next: state.clone(),
                effects: vec![Effect::Ack(cached.clone())],
            };
        }
    }
    if sequence <= state.last_sequence {
        return Transition {
            next: state.clone(),
            effects: vec![Effect::Ack(ack(command, AckStatus::Stale))],
        };
    }

    if state.manual_override() && !command.clear_override {
        let rejection = ack(command, AckStatus::Overridden);
        let next = SwitchState {
            last_sequence: sequence,
            last_ack: Some(rejection.clone()),
            ..state.clone()
        };
        return Transition {
            next,
            effects: vec![Effect::Persist, Effect::Ack(rejection)],
        };
    }

    let applied = ack(command, AckStatus::Applied);
    let target = command.desired_state;
    // The durable write lands before the relay moves.
    let mut effects = vec![Effect::Persist];
    if target != state.physical {
        effects.push(Effect::DriveRelay(target));
    }
    effects.extend([Effect::EmitState, Effect::Ack(applied.clone())]);

    let next = SwitchState {
        mode: SwitchMode::Synced,
        desired: target,
        physical: target,
        persisted: target,
        last_sequence: sequence,
        last_ack: Some(applied),
        last_change_source: ChangeSource::Remote,
        last_changed_at: at,
        switch_id: state.switch_id.clone(),
    };
    Transition { next, effects }
}

fn ack(command: &CommandPayload, status: AckStatus) -> AckPayload {
    AckPayload {
        command_id: command.command_id,
        switch_id: command.switch_id.clone(),
        switch_sequence: command.switch_sequence,
        status,
    }
}

#[cfg(test)]
#[path = "tests/reconcile_tests.rs"]
mod tests;
