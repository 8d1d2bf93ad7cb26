use super::*;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use shared::domain::{ChangeSource, CommandId};
use storage::MemoryStore;

/// Memory store whose reads or writes can be made to fail on demand.
#[derive(Clone, Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("flash read error"));
        }
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("flash write error"));
        }
        self.inner.put(key, value).await
    }
}

fn relay(id: &str) -> SwitchId {
    SwitchId::new(id)
}

fn config() -> AgentConfig {
    AgentConfig {
        persist_retry_delay: Duration::from_millis(1),
        ..AgentConfig::new(
            DeviceId::new("aa:bb:cc:dd:ee:01"),
            vec![relay("relay-1"), relay("relay-2")],
        )
    }
}

fn command(switch: &str, sequence: u64, desired_state: bool, clear_override: bool) -> CommandPayload {
    CommandPayload {
        command_id: CommandId::generate(),
        switch_id: relay(switch),
        switch_sequence: sequence,
        desired_state,
        clear_override,
    }
}

fn acks(messages: &[LinkMessage]) -> Vec<AckStatus> {
    messages
        .iter()
        .filter_map(|message| match message {
            LinkMessage::Ack(ack) => Some(ack.status),
            _ => None,
        })
        .collect()
}

fn state_events(messages: &[LinkMessage]) -> Vec<&StateEventPayload> {
    messages
        .iter()
        .filter_map(|message| match message {
            LinkMessage::StateEvent(event) => Some(event),
            _ => None,
        })
        .collect()
}

async fn stored<S: StateStore>(store: &S, switch: &str) -> SwitchState {
    load_switch(store, &relay(switch))
        .await
        .expect("readable")
        .expect("present")
}

#[tokio::test]
async fn first_boot_starts_off_without_alert() {
    let hardware = SimulatedHardware::new();
    let agent = ControllerAgent::boot(config(), hardware.clone(), MemoryStore::new()).await;

    assert!(agent.startup_alert().is_none());
    let hello = agent.hello();
    assert_eq!(hello.switches.len(), 2);
    assert!(hello.switches.iter().all(|s| !s.physical_state && !s.manual_override));
    assert!(!hardware.position(&relay("relay-1")));
}

#[tokio::test]
async fn unreadable_store_falls_back_to_off_and_raises_alert() {
    let store = FlakyStore::default();
    let mut seeded = ControllerAgent::boot(config(), SimulatedHardware::new(), store.clone()).await;
    seeded.apply_command(command("relay-1", 1, true, false)).await;

    store.fail_reads.store(true, Ordering::SeqCst);
    let hardware = SimulatedHardware::new();
    hardware.set(&relay("relay-1"), true);
    let mut agent = ControllerAgent::boot(config(), hardware.clone(), store.clone()).await;

    let hello = agent.hello();
    assert!(hello.startup_alert.is_some());
    assert!(hello.switches.iter().all(|s| !s.physical_state && s.unpersisted));
    assert!(!hardware.position(&relay("relay-1")));

    store.fail_reads.store(false, Ordering::SeqCst);
    let outbound = agent.tick().await;
    assert_eq!(state_events(&outbound).len(), 2);
    assert!(!agent.is_unpersisted(&relay("relay-1")));
    assert!(!stored(&store, "relay-1").await.persisted);
}

#[tokio::test]
async fn reboot_with_unchanged_relays_is_quiet() {
    let store = MemoryStore::new();
    let hardware = SimulatedHardware::new();
    let mut first = ControllerAgent::boot(config(), hardware.clone(), store.clone()).await;
    first.apply_command(command("relay-2", 1, true, false)).await;
    drop(first);

    let mut rebooted = ControllerAgent::boot(config(), hardware.clone(), store).await;
    assert!(hardware.position(&relay("relay-2")));
    let state = rebooted.switch(&relay("relay-2")).cloned().expect("tracked");
    assert_eq!(state.last_sequence, 1);
    assert!(state.physical && !state.manual_override());
    assert!(rebooted.tick().await.is_empty());
}

#[tokio::test]
async fn relay_flipped_while_powered_off_is_adopted_at_boot() {
    let store = MemoryStore::new();
    let mut first = ControllerAgent::boot(config(), SimulatedHardware::new(), store.clone()).await;
    first.apply_command(command("relay-1", 1, false, false)).await;
    drop(first);

    let hardware = SimulatedHardware::new();
    hardware.set(&relay("relay-1"), true);
    let mut agent = ControllerAgent::boot(config(), hardware.clone(), store.clone()).await;

    assert!(hardware.position(&relay("relay-1")), "boot must not undo the change");
    let state = agent.switch(&relay("relay-1")).cloned().expect("tracked");
    assert!(state.physical);
    assert!(state.manual_override());
    assert_eq!(state.last_change_source, ChangeSource::Manual);
    assert!(stored(&store, "relay-1").await.persisted);

    let outbound = agent.tick().await;
    let events = state_events(&outbound);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].switch_id, relay("relay-1"));
    assert!(events[0].physical_state && events[0].manual_override);
    assert!(agent.tick().await.is_empty());
}

/// Records the relay position every time the watched switch is written.
#[derive(Clone)]
struct WitnessStore {
    inner: MemoryStore,
    hardware: SimulatedHardware,
    watched: SwitchId,
    positions_at_write: Arc<std::sync::Mutex<Vec<bool>>>,
}

#[async_trait]
impl StateStore for WitnessStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        if key == storage_key(&self.watched) {
            self.positions_at_write
                .lock()
                .expect("witness lock")
                .push(self.hardware.position(&self.watched));
        }
        self.inner.put(key, value).await
    }
}

#[tokio::test]
async fn command_is_durable_before_the_relay_moves() {
    let hardware = SimulatedHardware::new();
    let store = WitnessStore {
        inner: MemoryStore::new(),
        hardware: hardware.clone(),
        watched: relay("relay-1"),
        positions_at_write: Arc::default(),
    };
    let mut agent = ControllerAgent::boot(config(), hardware.clone(), store.clone()).await;
    agent.apply_command(command("relay-1", 1, false, false)).await;
    store.positions_at_write.lock().expect("witness lock").clear();

    let outbound = agent.apply_command(command("relay-1", 2, true, false)).await;

    assert_eq!(acks(&outbound), vec![AckStatus::Applied]);
    assert_eq!(*store.positions_at_write.lock().expect("witness lock"), vec![false]);
    assert!(hardware.position(&relay("relay-1")));
    assert!(stored(&store.inner, "relay-1").await.persisted);
}

#[tokio::test]
async fn manual_toggle_is_persisted_and_reported_as_override() {
    let store = MemoryStore::new();
    let hardware = SimulatedHardware::new();
    let mut agent = ControllerAgent::boot(config(), hardware.clone(), store.clone()).await;

    hardware.flip(&relay("relay-1"));
    let outbound = agent.tick().await;

    let events = state_events(&outbound);
    assert_eq!(events.len(), 1);
    assert!(events[0].physical_state);
    assert!(events[0].manual_override);
    assert_eq!(events[0].source, ChangeSource::Manual);
    assert!(stored(&store, "relay-1").await.persisted);
    assert!(agent.tick().await.is_empty());
}

#[tokio::test]
async fn override_rejects_remote_command_until_cleared() {
    let hardware = SimulatedHardware::new();
    let mut agent = ControllerAgent::boot(config(), hardware.clone(), MemoryStore::new()).await;

    hardware.flip(&relay("relay-1"));
    agent.tick().await;

    let rejected = agent.apply_command(command("relay-1", 1, false, false)).await;
    assert_eq!(acks(&rejected), vec![AckStatus::Overridden]);
    assert!(state_events(&rejected).is_empty());
    assert!(hardware.position(&relay("relay-1")));

    let cleared = agent.apply_command(command("relay-1", 2, false, true)).await;
    assert_eq!(acks(&cleared), vec![AckStatus::Applied]);
    assert!(!hardware.position(&relay("relay-1")));
    let state = agent.switch(&relay("relay-1")).expect("switch");
    assert!(!state.manual_override());
    assert_eq!(state.last_change_source, ChangeSource::Remote);
}

#[tokio::test]
async fn manual_change_since_last_poll_is_seen_before_command() {
    let hardware = SimulatedHardware::new();
    let mut agent = ControllerAgent::boot(config(), hardware.clone(), MemoryStore::new()).await;

    hardware.flip(&relay("relay-2"));
    let outbound = agent.apply_command(command("relay-2", 1, false, false)).await;

    assert!(matches!(outbound[0], LinkMessage::StateEvent(_)));
    assert_eq!(acks(&outbound), vec![AckStatus::Overridden]);
    assert!(hardware.position(&relay("relay-2")));
}

#[tokio::test]
async fn unknown_switch_is_acked_without_side_effects() {
    let store = MemoryStore::new();
    let mut agent = ControllerAgent::boot(config(), SimulatedHardware::new(), store.clone()).await;

    let outbound = agent.apply_command(command("relay-9", 1, true, false)).await;
    assert_eq!(acks(&outbound), vec![AckStatus::UnknownSwitch]);
    assert_eq!(outbound.len(), 1);
    assert!(store.get("switch/relay-9").await.expect("get").is_none());
}

#[tokio::test]
async fn redelivered_command_gets_same_ack_and_no_new_event() {
    let mut agent = ControllerAgent::boot(config(), SimulatedHardware::new(), MemoryStore::new()).await;
    let first = command("relay-1", 4, true, false);

    let applied = agent.apply_command(first.clone()).await;
    let again = agent.apply_command(first).await;

    assert_eq!(state_events(&applied).len(), 1);
    assert_eq!(again.len(), 1);
    assert_eq!(acks(&again), vec![AckStatus::Applied]);
}

#[tokio::test]
async fn failed_writes_flag_unpersisted_and_recover_in_background() {
    let store = FlakyStore::default();
    let hardware = SimulatedHardware::new();
    let mut agent = ControllerAgent::boot(config(), hardware.clone(), store.clone()).await;

    store.fail_writes.store(true, Ordering::SeqCst);
    let outbound = agent.apply_command(command("relay-1", 1, true, false)).await;
    assert_eq!(acks(&outbound), vec![AckStatus::Applied]);
    assert!(state_events(&outbound)[0].unpersisted);
    assert!(hardware.position(&relay("relay-1")));
    assert!(agent.is_unpersisted(&relay("relay-1")));
    assert!(agent.hello().switches[0].unpersisted);

    assert!(agent.tick().await.is_empty());

    store.fail_writes.store(false, Ordering::SeqCst);
    let recovered = agent.tick().await;
    let events = state_events(&recovered);
    assert_eq!(events.len(), 1);
    assert!(!events[0].unpersisted);
    assert!(stored(&store, "relay-1").await.persisted);
}

#[tokio::test]
async fn momentary_press_toggles_the_relay_once_per_press() {
    let hardware = SimulatedHardware::new();
    let store = MemoryStore::new();
    let momentary = AgentConfig {
        manual_mode: ManualMode::Momentary,
        ..config()
    };
    let mut agent = ControllerAgent::boot(momentary, hardware.clone(), store.clone()).await;

    hardware.press(&relay("relay-1"));
    let outbound = agent.tick().await;
    let events = state_events(&outbound);
    assert_eq!(events.len(), 1);
    assert!(events[0].physical_state && events[0].manual_override);
    assert!(hardware.position(&relay("relay-1")));
    assert!(stored(&store, "relay-1").await.persisted);

    // Held down: no repeat.
    assert!(agent.tick().await.is_empty());
    hardware.release(&relay("relay-1"));
    assert!(agent.tick().await.is_empty());
    assert!(hardware.position(&relay("relay-1")));

    hardware.press(&relay("relay-1"));
    let outbound = agent.tick().await;
    let events = state_events(&outbound);
    assert_eq!(events.len(), 1);
    assert!(!events[0].physical_state && !events[0].manual_override);
    assert!(!hardware.position(&relay("relay-1")));
}

#[test]
fn manual_mode_parses_from_config_text() {
    assert_eq!("maintained".parse::<ManualMode>(), Ok(ManualMode::Maintained));
    assert_eq!(" Momentary ".parse::<ManualMode>(), Ok(ManualMode::Momentary));
    assert!("toggle".parse::<ManualMode>().is_err());
}
