//! On-device half of the switch synchronization engine.
//!
//! [`ControllerAgent`] owns one device's switches: it polls the hardware,
//! runs every input through the pure rules in [`reconcile`], persists through
//! a [`StateStore`] and talks to the backend over [`transport`].

pub mod hardware;
pub mod outbox;
pub mod reconcile;
pub mod transport;

use std::{str::FromStr, time::Duration};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use shared::{
    backoff::Backoff,
    domain::{DeviceId, SwitchId},
    protocol::{
        AckPayload, AckStatus, CommandPayload, HelloPayload, LinkMessage, StateEventPayload,
        SwitchReport,
    },
};
use storage::StateStore;
use tokio::{
    sync::watch,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

pub use hardware::{SimulatedHardware, SwitchHardware};
use reconcile::{Effect, SwitchState, Transition};
pub use transport::{LinkConfig, LinkEvent, LinkHandle};

/// How the wall control next to each relay behaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ManualMode {
    /// A latching switch; the relay follows its position.
    #[default]
    Maintained,
    /// A push button; each press toggles the relay.
    Momentary,
}

impl FromStr for ManualMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "maintained" => Ok(Self::Maintained),
            "momentary" => Ok(Self::Momentary),
            other => Err(format!("unknown manual mode `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub device_id: DeviceId,
    /// Switches in the order they are reported to the backend.
    pub switch_ids: Vec<SwitchId>,
    pub poll_interval: Duration,
    pub manual_mode: ManualMode,
    /// Attempts per write before a switch is flagged unpersisted.
    pub persist_attempts: u32,
    pub persist_retry_delay: Duration,
}

impl AgentConfig {
    pub fn new(device_id: DeviceId, switch_ids: Vec<SwitchId>) -> Self {
        Self {
            device_id,
            switch_ids,
            poll_interval: Duration::from_millis(100),
            manual_mode: ManualMode::Maintained,
            persist_attempts: 3,
            persist_retry_delay: Duration::from_millis(50),
        }
    }
}

struct TrackedSwitch {
    state: SwitchState,
    /// The last write failed; memory is ahead of the store.
    unpersisted: bool,
    /// Push button level at the last poll.
    pressed: bool,
}

pub struct ControllerAgent<H, S> {
    config: AgentConfig,
    hardware: H,
    store: S,
    switches: Vec<TrackedSwitch>,
    startup_alert: Option<String>,
    /// Changes adopted during boot, sent with the first tick.
    boot_events: Vec<LinkMessage>,
}

fn storage_key(switch_id: &SwitchId) -> String {
    format!("switch/{switch_id}")
}

async fn load_switch<S: StateStore>(store: &S, switch_id: &SwitchId) -> Result<Option<SwitchState>> {
    let Some(bytes) = store.get(&storage_key(switch_id)).await? else {
        return Ok(None);
    };
    let state: SwitchState = serde_json::from_slice(&bytes)
        .with_context(|| format!("stored state for {switch_id} is corrupt"))?;
    if &state.switch_id != switch_id {
        return Err(anyhow!(
            "stored state for {switch_id} belongs to {}",
            state.switch_id
        ));
    }
    Ok(Some(state))
}

impl<H: SwitchHardware, S: StateStore> ControllerAgent<H, S> {
    /// Loads persisted switch state and reconciles it with the relays. A
    /// position changed by hand while the device was down is adopted like any
    /// other manual change and reported on the first tick. If any record
    /// cannot be read, every switch is driven off and a startup alert is
    /// raised; a missing record is a first boot and starts off silently.
    pub async fn boot(config: AgentConfig, mut hardware: H, store: S) -> Self {
        let now = Utc::now();
        let mut loaded = Vec::with_capacity(config.switch_ids.len());
        let mut failures = Vec::new();
        for switch_id in &config.switch_ids {
            match load_switch(&store, switch_id).await {
                Ok(Some(state)) => loaded.push(state),
                Ok(None) => loaded.push(SwitchState::off(switch_id.clone(), now)),
                Err(err) => failures.push(format!("{switch_id}: {err:#}")),
            }
        }

        let (switches, startup_alert) = if failures.is_empty() {
            let switches = loaded
                .into_iter()
                .map(|state| TrackedSwitch {
                    state,
                    unpersisted: false,
                    pressed: false,
                })
                .collect::<Vec<_>>();
            (switches, None)
        } else {
            let alert = format!(
                "persisted switch state unreadable, all switches reset to off: {}",
                failures.join("; ")
            );
            error!(device_id = %config.device_id, alert = %alert, "agent: boot fell back to safe defaults");
            // Flagged so the defaults get written on the next tick.
            let switches = config
                .switch_ids
                .iter()
                .map(|switch_id| TrackedSwitch {
                    state: SwitchState::off(switch_id.clone(), now),
                    unpersisted: true,
                    pressed: false,
                })
                .collect::<Vec<_>>();
            (switches, Some(alert))
        };

        // A relay behind a push button only moves when driven, so it never
        // drifts from the store while powered off.
        if startup_alert.is_some() || config.manual_mode == ManualMode::Momentary {
            for tracked in &switches {
                hardware.drive(&tracked.state.switch_id, tracked.state.persisted);
            }
        }

        let mut agent = Self {
            config,
            hardware,
            store,
            switches,
            startup_alert,
            boot_events: Vec::new(),
        };
        if agent.startup_alert.is_none() {
            let mut boot_events = Vec::new();
            for index in 0..agent.switches.len() {
                agent.observe(index, &mut boot_events).await;
            }
            agent.boot_events = boot_events;
        }
        info!(
            device_id = %agent.config.device_id,
            switches = agent.switches.len(),
            adopted = agent.boot_events.len(),
            alert = agent.startup_alert.is_some(),
            "agent: booted"
        );
        agent
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.config.device_id
    }

    pub fn startup_alert(&self) -> Option<&str> {
        self.startup_alert.as_deref()
    }

    pub fn switch(&self, switch_id: &SwitchId) -> Option<&SwitchState> {
        self.index_of(switch_id).map(|index| &self.switches[index].state)
    }

    pub fn is_unpersisted(&self, switch_id: &SwitchId) -> bool {
        self.index_of(switch_id)
            .is_some_and(|index| self.switches[index].unpersisted)
    }

    /// Polls every switch once. Manual changes are adopted and reported, and
    /// switches whose last write failed get another attempt.
    pub async fn tick(&mut self) -> Vec<LinkMessage> {
        let mut outbound = std::mem::take(&mut self.boot_events);
        for index in 0..self.switches.len() {
            let changed = self.observe(index, &mut outbound).await;
            if !changed && self.switches[index].unpersisted {
                self.retry_deferred_write(index, &mut outbound).await;
            }
        }
        outbound
    }

    /// Runs one remote command. The switch is read first so a manual change
    /// made since the last poll is adopted before the command is judged.
    pub async fn apply_command(&mut self, command: CommandPayload) -> Vec<LinkMessage> {
        let Some(index) = self.index_of(&command.switch_id) else {
            warn!(
                device_id = %self.config.device_id,
                switch_id = %command.switch_id,
                command_id = %command.command_id,
                "agent: command for unknown switch"
            );
            return vec![LinkMessage::Ack(AckPayload {
                command_id: command.command_id,
                switch_id: command.switch_id,
                switch_sequence: command.switch_sequence,
                status: AckStatus::UnknownSwitch,
            })];
        };

        let mut outbound = Vec::new();
        self.observe(index, &mut outbound).await;
        let transition = reconcile::on_command(&self.switches[index].state, &command, Utc::now());
        if let Some(status) = transition.effects.iter().find_map(|effect| match effect {
            Effect::Ack(ack) => Some(ack.status),
            _ => None,
        }) {
            info!(
                device_id = %self.config.device_id,
                switch_id = %command.switch_id,
                command_id = %command.command_id,
                switch_sequence = command.switch_sequence,
                desired_state = command.desired_state,
                clear_override = command.clear_override,
                status = ?status,
                "agent: command processed"
            );
        }
        self.execute(index, transition, &mut outbound).await;
        outbound
    }

    /// Full current state, sent on every (re)connect.
    pub fn hello(&self) -> HelloPayload {
        HelloPayload {
            switches: self
                .switches
                .iter()
                .map(|tracked| SwitchReport {
                    switch_id: tracked.state.switch_id.clone(),
                    physical_state: tracked.state.physical,
                    desired_state: tracked.state.desired,
                    manual_override: tracked.state.manual_override(),
                    unpersisted: tracked.unpersisted,
                    last_sequence: tracked.state.last_sequence,
                    last_change_source: tracked.state.last_change_source,
                    last_changed_at: tracked.state.last_changed_at,
                })
                .collect(),
            startup_alert: self.startup_alert.clone(),
        }
    }

    /// Drives the agent until `shutdown` flips: polls on the configured
    /// interval, applies commands from the link and reports everything back.
    pub async fn run(mut self, link_config: LinkConfig, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let (hello_tx, hello_rx) = watch::channel(self.hello());
        let mut link = transport::spawn(link_config, hello_rx)?;
        let mut poll = time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = shutdown.changed() => break Ok(()),
                _ = poll.tick() => {
                    let outbound = self.tick().await;
                    if let Err(err) = send_all(&link, outbound) {
                        break Err(err);
                    }
                    hello_tx.send_replace(self.hello());
                }
                event = link.next_event() => match event {
                    Some(LinkEvent::Message(LinkMessage::Command(command))) => {
                        let outbound = self.apply_command(command).await;
                        if let Err(err) = send_all(&link, outbound) {
                            break Err(err);
                        }
                        hello_tx.send_replace(self.hello());
                    }
                    Some(LinkEvent::Message(other)) => {
                        debug!(device_id = %self.config.device_id, kind = other.kind(), "agent: ignoring link message");
                    }
                    Some(LinkEvent::Connected) => {
                        info!(device_id = %self.config.device_id, "agent: link up");
                    }
                    Some(LinkEvent::Disconnected { stale }) => {
                        warn!(device_id = %self.config.device_id, stale, "agent: link down, buffering");
                    }
                    None => break Err(anyhow!("link task ended unexpectedly")),
                },
            }
        };

        link.shutdown().await;
        info!(device_id = %self.config.device_id, "agent: stopped");
        result
    }

    fn index_of(&self, switch_id: &SwitchId) -> Option<usize> {
        self.switches
            .iter()
            .position(|tracked| &tracked.state.switch_id == switch_id)
    }

    /// Reads one switch and adopts any manual change. Returns whether the
    /// reading changed anything.
    async fn observe(&mut self, index: usize, outbound: &mut Vec<LinkMessage>) -> bool {
        let switch_id = self.switches[index].state.switch_id.clone();
        let reading = match self.config.manual_mode {
            ManualMode::Maintained => self.hardware.read(&switch_id),
            ManualMode::Momentary => {
                let pressed = self.hardware.pressed(&switch_id);
                let tracked = &mut self.switches[index];
                let rising = pressed && !tracked.pressed;
                tracked.pressed = pressed;
                tracked.state.physical ^ rising
            }
        };
        let mut transition = reconcile::on_reading(&self.switches[index].state, reading, Utc::now());
        if transition.effects.is_empty() {
            return false;
        }
        if self.config.manual_mode == ManualMode::Momentary {
            // Persist stays first.
            transition.effects.insert(1, Effect::DriveRelay(reading));
        }
        info!(
            device_id = %self.config.device_id,
            switch_id = %switch_id,
            physical_state = reading,
            manual_override = transition.next.manual_override(),
            "agent: manual change adopted"
        );
        self.execute(index, transition, outbound).await;
        true
    }

    async fn execute(&mut self, index: usize, transition: Transition, outbound: &mut Vec<LinkMessage>) {
        let switch_id = transition.next.switch_id.clone();
        self.switches[index].state = transition.next;
        for effect in transition.effects {
            match effect {
                Effect::DriveRelay(on) => self.hardware.drive(&switch_id, on),
                Effect::Persist => {
                    let attempts = self.config.persist_attempts;
                    if let Err(err) = self.write_state(index, attempts).await {
                        error!(
                            device_id = %self.config.device_id,
                            switch_id = %switch_id,
                            error = %err,
                            "agent: persistence failed, continuing from memory"
                        );
                    }
                }
                Effect::EmitState => outbound.push(LinkMessage::StateEvent(self.state_event(index))),
                Effect::Ack(ack) => outbound.push(LinkMessage::Ack(ack)),
            }
        }
    }

    async fn retry_deferred_write(&mut self, index: usize, outbound: &mut Vec<LinkMessage>) {
        match self.write_state(index, 1).await {
            Ok(()) => {
                info!(
                    device_id = %self.config.device_id,
                    switch_id = %self.switches[index].state.switch_id,
                    "agent: deferred write committed"
                );
                outbound.push(LinkMessage::StateEvent(self.state_event(index)));
            }
            Err(err) => debug!(
                device_id = %self.config.device_id,
                switch_id = %self.switches[index].state.switch_id,
                error = %err,
                "agent: deferred write still failing"
            ),
        }
    }

    /// Writes the switch's state with up to `attempts` tries, updating its
    /// unpersisted flag with the outcome.
    async fn write_state(&mut self, index: usize, attempts: u32) -> Result<()> {
        let state = &self.switches[index].state;
        let key = storage_key(&state.switch_id);
        let bytes = serde_json::to_vec(state).context("failed to encode switch state")?;
        let retry_cap = self.config.persist_retry_delay.saturating_mul(8);

        let mut last_error = None;
        for attempt in 1..=attempts.max(1) {
            match self.store.put(&key, &bytes).await {
                Ok(()) => {
                    self.switches[index].unpersisted = false;
                    return Ok(());
                }
                Err(err) => {
                    if attempt < attempts {
                        warn!(
                            device_id = %self.config.device_id,
                            key = %key,
                            attempt,
                            error = %err,
                            "agent: write failed, retrying"
                        );
                        time::sleep(Backoff::delay_for_attempt(
                            self.config.persist_retry_delay,
                            retry_cap,
                            attempt,
                        ))
                        .await;
                    }
                    last_error = Some(err);
                }
            }
        }

        self.switches[index].unpersisted = true;
        Err(last_error.unwrap_or_else(|| anyhow!("no write attempted")))
    }

    fn state_event(&self, index: usize) -> StateEventPayload {
        let tracked = &self.switches[index];
        StateEventPayload {
            switch_id: tracked.state.switch_id.clone(),
            physical_state: tracked.state.physical,
            desired_state: tracked.state.desired,
            manual_override: tracked.state.manual_override(),
            unpersisted: tracked.unpersisted,
            source: tracked.state.last_change_source,
            changed_at: tracked.state.last_changed_at,
        }
    }
}

fn send_all(link: &LinkHandle, messages: Vec<LinkMessage>) -> Result<()> {
    for message in messages {
        link.send(message)?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/agent_tests.rs"]
mod tests;
