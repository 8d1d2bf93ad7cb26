use super::*;
use std::future::Future;

use controller_core::{AgentConfig, ControllerAgent, LinkConfig, SimulatedHardware};
use shared::{
    domain::{CommandStatus, RejectReason, SwitchId},
    protocol::SubscriberEvent,
};
use storage::MemoryStore;
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};

const DEVICE: &str = "aa:bb:cc:dd:ee:42";

struct Harness {
    sync: SyncContext,
    hardware: SimulatedHardware,
    shutdown: watch::Sender<bool>,
    agent: JoinHandle<anyhow::Result<()>>,
}

fn relay() -> SwitchId {
    SwitchId::new("relay-1")
}

/// Polls `check` until it yields a value or five seconds pass.
async fn eventually<T, F, Fut>(what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = check().await {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn start() -> Harness {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let settings = Settings::default();
    let sync = SyncContext::new(
        storage,
        settings.mediator_settings(),
        settings.router_settings(),
    );
    let app = build_router(Arc::new(AppState { sync: sync.clone() }));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let device_id = DeviceId::new(DEVICE);
    let switch_ids = vec![relay()];
    let hardware = SimulatedHardware::with_switches(&switch_ids);
    let mut agent_config = AgentConfig::new(device_id.clone(), switch_ids);
    agent_config.poll_interval = Duration::from_millis(20);
    let agent = ControllerAgent::boot(agent_config, hardware.clone(), MemoryStore::new()).await;

    let mut link_config = LinkConfig::new(format!("http://{addr}"), device_id);
    link_config.heartbeat_interval = Duration::from_millis(200);
    link_config.reconnect_initial = Duration::from_millis(50);
    link_config.reconnect_max = Duration::from_millis(200);

    let (shutdown, shutdown_rx) = watch::channel(false);
    let agent = tokio::spawn(agent.run(link_config, shutdown_rx));

    let storage = sync.storage().clone();
    eventually("device hello", || {
        let storage = storage.clone();
        async move {
            let switches = storage.list_switches(&DeviceId::new(DEVICE)).await.ok()?;
            (!switches.is_empty()).then_some(())
        }
    })
    .await;

    Harness {
        sync,
        hardware,
        shutdown,
        agent,
    }
}

async fn submit(harness: &Harness, desired_state: bool, clear_override: bool) -> CommandId {
    harness
        .sync
        .router
        .submit(
            SubmitCommandRequest {
                device_id: DeviceId::new(DEVICE),
                switch_id: relay(),
                desired_state,
                clear_override,
            },
            Instant::now(),
        )
        .await
        .expect("submit")
        .command_id
}

async fn resolved(harness: &Harness, command_id: CommandId) -> CommandRecord {
    let router = Arc::clone(&harness.sync.router);
    eventually("command resolution", || {
        let router = Arc::clone(&router);
        async move {
            let record = router.status(command_id).await.ok()??;
            (record.status != CommandStatus::Pending).then_some(record)
        }
    })
    .await
}

async fn mirrored(harness: &Harness) -> MirroredSwitch {
    let storage = harness.sync.storage().clone();
    let switches = storage
        .list_switches(&DeviceId::new(DEVICE))
        .await
        .expect("switches");
    switches.into_iter().next().expect("relay mirrored")
}

#[tokio::test]
async fn remote_command_reaches_the_relay_and_is_acked() {
    let harness = start().await;
    let mut events = harness.sync.mediator.subscribe();

    let command_id = submit(&harness, true, false).await;
    let record = resolved(&harness, command_id).await;

    assert_eq!(record.status, CommandStatus::Acked);
    assert!(harness.hardware.position(&relay()));

    let resolution = loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event")
            .expect("open")
        {
            SubscriberEvent::CommandResolved(resolution) => break resolution,
            SubscriberEvent::SwitchUpdated(_) => continue,
        }
    };
    assert_eq!(resolution.command_id, command_id);
    assert_eq!(resolution.status, CommandStatus::Acked);

    let _ = harness.shutdown.send(true);
    harness.agent.await.expect("join").expect("agent");
}

#[tokio::test]
async fn manual_override_rejects_commands_until_cleared() {
    let harness = start().await;

    assert!(harness.hardware.flip(&relay()));
    let storage = harness.sync.storage().clone();
    eventually("manual override mirrored", || {
        let storage = storage.clone();
        async move {
            let switches = storage.list_switches(&DeviceId::new(DEVICE)).await.ok()?;
            switches
                .iter()
                .any(|s| s.manual_override && s.physical_state)
                .then_some(())
        }
    })
    .await;

    let rejected = resolved(&harness, submit(&harness, false, false).await).await;
    assert_eq!(rejected.status, CommandStatus::Rejected);
    assert_eq!(rejected.reason, Some(RejectReason::Overridden));
    assert!(harness.hardware.position(&relay()), "manual position kept");

    let cleared = resolved(&harness, submit(&harness, false, true).await).await;
    assert_eq!(cleared.status, CommandStatus::Acked);
    assert!(!harness.hardware.position(&relay()));

    let switch = eventually("override cleared in mirror", || {
        let storage = storage.clone();
        async move {
            let switches = storage.list_switches(&DeviceId::new(DEVICE)).await.ok()?;
            switches.into_iter().find(|s| !s.manual_override)
        }
    })
    .await;
    assert!(!switch.physical_state);
    assert!(!switch.desired_state);

    let _ = harness.shutdown.send(true);
    harness.agent.await.expect("join").expect("agent");
}

#[tokio::test]
async fn closed_link_leaves_a_stale_mirror() {
    let harness = start().await;
    assert!(!mirrored(&harness).await.stale);

    let _ = harness.shutdown.send(true);
    harness.agent.await.expect("join").expect("agent");

    let storage = harness.sync.storage().clone();
    eventually("stale mirror", || {
        let storage = storage.clone();
        async move {
            let switches = storage.list_switches(&DeviceId::new(DEVICE)).await.ok()?;
            switches.iter().all(|s| s.stale).then_some(())
        }
    })
    .await;
    assert!(!harness.sync.mediator.is_live(&DeviceId::new(DEVICE)));
}
