use super::*;
use std::time::Duration;

use chrono::Utc;
use shared::{
    domain::{ChangeSource, CommandId, CommandStatus, RejectReason, SwitchId},
    error::SyncError,
    protocol::{
        AckPayload, AckStatus, CommandPayload, HeartbeatPayload, HelloPayload,
        StateEventPayload, SubmitCommandRequest, SubscriberEvent, SwitchReport,
    },
};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

const DEVICE: &str = "aa:bb:cc:dd:ee:10";

async fn context() -> SyncContext {
    let storage = Storage::new("sqlite::memory:").await.expect("storage");
    SyncContext::new(
        storage,
        MediatorSettings {
            heartbeat_interval: Duration::from_secs(1),
            max_missed_heartbeats: 2,
        },
        RouterSettings {
            command_ttl: Duration::from_secs(10),
            max_attempts: 2,
            retry_initial: Duration::from_secs(1),
            retry_max: Duration::from_secs(4),
            retention: Duration::ZERO,
        },
    )
}

fn device() -> DeviceId {
    DeviceId::new(DEVICE)
}

fn relay(id: &str) -> SwitchId {
    SwitchId::new(id)
}

fn report(switch: &str, physical: bool, last_sequence: u64) -> SwitchReport {
    SwitchReport {
        switch_id: relay(switch),
        physical_state: physical,
        desired_state: physical,
        manual_override: false,
        unpersisted: false,
        last_sequence,
        last_change_source: ChangeSource::Remote,
        last_changed_at: Utc::now(),
    }
}

fn hello(last_sequence: u64) -> LinkMessage {
    LinkMessage::Hello(HelloPayload {
        switches: vec![report("relay-1", false, last_sequence), report("relay-2", false, 0)],
        startup_alert: None,
    })
}

fn manual_event(switch: &str, physical: bool, desired: bool) -> LinkMessage {
    LinkMessage::StateEvent(StateEventPayload {
        switch_id: relay(switch),
        physical_state: physical,
        desired_state: desired,
        manual_override: physical != desired,
        unpersisted: false,
        source: ChangeSource::Manual,
        changed_at: Utc::now(),
    })
}

fn request(switch: &str, desired_state: bool) -> SubmitCommandRequest {
    SubmitCommandRequest {
        device_id: device(),
        switch_id: relay(switch),
        desired_state,
        clear_override: false,
    }
}

struct Link {
    connection_id: Uuid,
    outbound: mpsc::UnboundedReceiver<LinkMessage>,
    next_sequence: u64,
}

impl Link {
    fn open(ctx: &SyncContext, now: Instant) -> Self {
        Self::open_at(ctx, now, 1)
    }

    fn open_at(ctx: &SyncContext, now: Instant, first_sequence: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = ctx.mediator.on_connect(&device(), tx, now);
        Self {
            connection_id,
            outbound: rx,
            next_sequence: first_sequence,
        }
    }

    async fn send(&mut self, ctx: &SyncContext, message: LinkMessage, now: Instant) -> Option<LinkMessage> {
        let envelope = Envelope::new(device(), self.next_sequence, message);
        self.next_sequence += 1;
        handle_inbound(ctx, &device(), envelope, now)
            .await
            .expect("inbound handled")
    }

    fn commands(&mut self) -> Vec<CommandPayload> {
        let mut commands = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            if let LinkMessage::Command(command) = message {
                commands.push(command);
            }
        }
        commands
    }
}

fn drain(events: &mut broadcast::Receiver<SubscriberEvent>) -> Vec<SubscriberEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

fn ack(command: &CommandPayload, status: AckStatus) -> LinkMessage {
    LinkMessage::Ack(AckPayload {
        command_id: command.command_id,
        switch_id: command.switch_id.clone(),
        switch_sequence: command.switch_sequence,
        status,
    })
}

async fn command_status(ctx: &SyncContext, command_id: CommandId) -> (CommandStatus, Option<RejectReason>) {
    let record = ctx
        .router
        .status(command_id)
        .await
        .expect("status")
        .expect("record");
    (record.status, record.reason)
}

#[tokio::test]
async fn hello_builds_mirror_and_fans_out_every_switch() {
    let ctx = context().await;
    let mut events = ctx.mediator.subscribe();
    let now = Instant::now();
    let mut link = Link::open(&ctx, now);

    assert!(link.send(&ctx, hello(0), now).await.is_none());

    let switches = ctx.storage().list_switches(&device()).await.expect("switches");
    let ids: Vec<&str> = switches.iter().map(|s| s.switch_id.as_str()).collect();
    assert_eq!(ids, vec!["relay-1", "relay-2"]);
    let updates = drain(&mut events);
    assert_eq!(updates.len(), 2);
    assert!(updates
        .iter()
        .all(|event| matches!(event, SubscriberEvent::SwitchUpdated(update) if !update.stale)));
}

#[tokio::test]
async fn heartbeat_echo_reports_highest_received_envelope() {
    let ctx = context().await;
    let now = Instant::now();
    let mut link = Link::open(&ctx, now);
    link.send(&ctx, hello(0), now).await;
    link.send(&ctx, manual_event("relay-1", true, false), now).await;

    let echo = link
        .send(&ctx, LinkMessage::Heartbeat(HeartbeatPayload::default()), now)
        .await;
    assert_eq!(
        echo,
        Some(LinkMessage::Heartbeat(HeartbeatPayload {
            received_through: Some(3)
        }))
    );
}

#[tokio::test]
async fn retransmitted_envelope_is_dropped() {
    let ctx = context().await;
    let now = Instant::now();
    let mut link = Link::open(&ctx, now);
    link.send(&ctx, hello(0), now).await;

    let first = Envelope::new(device(), 2, manual_event("relay-1", true, false));
    let replayed = Envelope::new(device(), 2, manual_event("relay-1", false, false));
    handle_inbound(&ctx, &device(), first, now).await.expect("first");
    handle_inbound(&ctx, &device(), replayed, now).await.expect("replayed");

    let switch = ctx
        .storage()
        .load_switch(&device(), &relay("relay-1"))
        .await
        .expect("load")
        .expect("switch");
    assert!(switch.physical_state);
    assert!(switch.manual_override);
}

#[tokio::test]
async fn restarted_device_counter_is_accepted_after_hello() {
    let ctx = context().await;
    let now = Instant::now();
    let mut before = Link::open_at(&ctx, now, 40);
    before.send(&ctx, hello(0), now).await;
    before.send(&ctx, manual_event("relay-1", true, false), now).await;

    let mut after = Link::open(&ctx, now);
    after.send(&ctx, hello(0), now).await;
    after.send(&ctx, manual_event("relay-2", true, false), now).await;

    let switch = ctx
        .storage()
        .load_switch(&device(), &relay("relay-2"))
        .await
        .expect("load")
        .expect("switch");
    assert!(switch.physical_state);
}

#[tokio::test]
async fn override_rejection_reaches_the_issuer_and_mirror_keeps_manual_state() {
    let ctx = context().await;
    let now = Instant::now();
    let mut link = Link::open(&ctx, now);
    link.send(&ctx, hello(0), now).await;
    link.send(&ctx, manual_event("relay-1", true, false), now).await;
    let mut events = ctx.mediator.subscribe();

    let submitted = ctx
        .router
        .submit(request("relay-1", false), now)
        .await
        .expect("submit");
    let delivered = link.commands();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].command_id, submitted.command_id);
    assert_eq!(delivered[0].switch_sequence, 1);

    link.send(&ctx, ack(&delivered[0], AckStatus::Overridden), now).await;

    assert_eq!(
        command_status(&ctx, submitted.command_id).await,
        (CommandStatus::Rejected, Some(RejectReason::Overridden))
    );
    let resolved = drain(&mut events);
    assert!(resolved.iter().any(|event| matches!(
        event,
        SubscriberEvent::CommandResolved(resolution)
            if resolution.command_id == submitted.command_id
                && resolution.reason == Some(RejectReason::Overridden)
    )));
    let switch = ctx
        .storage()
        .load_switch(&device(), &relay("relay-1"))
        .await
        .expect("load")
        .expect("switch");
    assert!(switch.physical_state);
    assert!(switch.manual_override);
    assert_eq!(switch.applied_sequence, 1);
}

#[tokio::test]
async fn submit_for_unknown_switch_fails_synchronously() {
    let ctx = context().await;
    let now = Instant::now();
    let mut link = Link::open(&ctx, now);
    link.send(&ctx, hello(0), now).await;

    let err = ctx
        .router
        .submit(request("relay-9", true), now)
        .await
        .expect_err("unknown switch");
    assert!(matches!(
        err,
        SyncError::CommandRejected {
            reason: RejectReason::UnknownSwitch,
            ..
        }
    ));
    assert_eq!(ctx.router.pending_count(), 0);
}

#[tokio::test]
async fn undelivered_command_expires_after_ttl() {
    let ctx = context().await;
    let now = Instant::now();
    let mut link = Link::open(&ctx, now);
    link.send(&ctx, hello(0), now).await;
    ctx.mediator
        .on_disconnect(&device(), link.connection_id)
        .await
        .expect("disconnect");

    let submitted = ctx
        .router
        .submit(request("relay-1", true), now)
        .await
        .expect("submit");

    let early = ctx.router.sweep(now + Duration::from_secs(5)).await.expect("sweep");
    assert_eq!(early.expired, 0);
    let late = ctx.router.sweep(now + Duration::from_secs(11)).await.expect("sweep");
    assert_eq!(late.expired, 1);
    assert_eq!(
        command_status(&ctx, submitted.command_id).await,
        (CommandStatus::Expired, None)
    );
}

#[tokio::test]
async fn unacked_command_is_redelivered_then_expired() {
    let ctx = context().await;
    let now = Instant::now();
    let mut link = Link::open(&ctx, now);
    link.send(&ctx, hello(0), now).await;

    let submitted = ctx
        .router
        .submit(request("relay-2", true), now)
        .await
        .expect("submit");
    assert_eq!(link.commands().len(), 1);

    // Keep the session alive while the command goes unanswered.
    let second = now + Duration::from_secs(1);
    link.send(&ctx, LinkMessage::Heartbeat(HeartbeatPayload::default()), second).await;
    let retry = ctx.router.sweep(second).await.expect("sweep");
    assert_eq!(retry.redelivered, 1);
    let redelivered = link.commands();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].command_id, submitted.command_id);

    let third = now + Duration::from_secs(3);
    link.send(&ctx, LinkMessage::Heartbeat(HeartbeatPayload::default()), third).await;
    let exhausted = ctx.router.sweep(third).await.expect("sweep");
    assert_eq!(exhausted.expired, 1);

    let record = ctx
        .router
        .status(submitted.command_id)
        .await
        .expect("status")
        .expect("record");
    assert_eq!(record.status, CommandStatus::Expired);
    assert_eq!(record.attempts, 2);
}

#[tokio::test]
async fn reconnect_replays_pending_commands_and_rejects_superseded_ones() {
    let ctx = context().await;
    let now = Instant::now();
    let mut first = Link::open(&ctx, now);
    first.send(&ctx, hello(0), now).await;

    let one = ctx.router.submit(request("relay-1", true), now).await.expect("one");
    let two = ctx.router.submit(request("relay-1", false), now).await.expect("two");
    assert_eq!(first.commands().len(), 2);
    ctx.mediator
        .on_disconnect(&device(), first.connection_id)
        .await
        .expect("disconnect");
    let three = ctx.router.submit(request("relay-1", true), now).await.expect("three");

    let mut second = Link::open_at(&ctx, now, 10);
    second.send(&ctx, hello(2), now).await;

    assert_eq!(
        command_status(&ctx, one.command_id).await,
        (CommandStatus::Rejected, Some(RejectReason::StaleSequence))
    );
    let replayed: Vec<CommandId> = second.commands().iter().map(|c| c.command_id).collect();
    assert_eq!(replayed, vec![two.command_id, three.command_id]);
    assert_eq!(
        command_status(&ctx, three.command_id).await,
        (CommandStatus::Pending, None)
    );
}

#[tokio::test]
async fn silent_device_goes_stale_without_losing_state_and_revives_on_traffic() {
    let ctx = context().await;
    let now = Instant::now();
    let mut link = Link::open(&ctx, now);
    link.send(&ctx, hello(0), now).await;
    link.send(&ctx, manual_event("relay-1", true, false), now).await;
    let mut events = ctx.mediator.subscribe();

    let quiet = ctx
        .mediator
        .sweep_heartbeats(now + Duration::from_secs(1))
        .await
        .expect("sweep");
    assert!(quiet.is_empty());

    let stale = ctx
        .mediator
        .sweep_heartbeats(now + Duration::from_secs(3))
        .await
        .expect("sweep");
    assert_eq!(stale, vec![device()]);
    assert!(!ctx.mediator.is_live(&device()));

    let switches = ctx.storage().list_switches(&device()).await.expect("switches");
    assert!(switches.iter().all(|s| s.stale));
    assert!(switches[0].physical_state);
    let summary = ctx
        .storage()
        .load_device(&device())
        .await
        .expect("device")
        .expect("present");
    assert!(!summary.online);
    assert!(drain(&mut events).iter().all(|event| matches!(
        event,
        SubscriberEvent::SwitchUpdated(update) if update.stale
    )));

    link.send(
        &ctx,
        LinkMessage::Heartbeat(HeartbeatPayload::default()),
        now + Duration::from_secs(4),
    )
    .await;
    assert!(ctx.mediator.is_live(&device()));
    let switches = ctx.storage().list_switches(&device()).await.expect("switches");
    assert!(switches.iter().all(|s| !s.stale));
}

#[tokio::test]
async fn closing_a_superseded_connection_keeps_the_new_session() {
    let ctx = context().await;
    let now = Instant::now();
    let old = Link::open(&ctx, now);
    let _new = Link::open(&ctx, now);

    let removed = ctx
        .mediator
        .on_disconnect(&device(), old.connection_id)
        .await
        .expect("disconnect");
    assert!(!removed);
    assert!(ctx.mediator.is_live(&device()));
}

#[tokio::test]
async fn device_lock_does_not_block_other_devices() {
    let ctx = context().await;
    let other = DeviceId::new("aa:bb:cc:dd:ee:99");
    let event = StateEventPayload {
        switch_id: relay("relay-1"),
        physical_state: true,
        desired_state: true,
        manual_override: false,
        unpersisted: false,
        source: ChangeSource::Remote,
        changed_at: Utc::now(),
    };

    let _held = ctx.mediator.lock_device(&device()).await;
    let mirrored = tokio::time::timeout(
        Duration::from_secs(2),
        ctx.mediator.on_state_event(&other, &event),
    )
    .await
    .expect("not blocked by another device")
    .expect("mirrored");
    assert_eq!(mirrored.device_id, other);
}

#[tokio::test]
async fn late_ack_after_expiry_does_not_resolve_twice() {
    let ctx = context().await;
    let now = Instant::now();
    let mut link = Link::open(&ctx, now);
    link.send(&ctx, hello(0), now).await;
    let mut events = ctx.mediator.subscribe();

    ctx.router.submit(request("relay-1", true), now).await.expect("submit");
    let command = link.commands().remove(0);
    link.send(&ctx, LinkMessage::Heartbeat(HeartbeatPayload::default()), now + Duration::from_secs(1)).await;
    ctx.router.sweep(now + Duration::from_secs(1)).await.expect("retry");
    link.send(&ctx, LinkMessage::Heartbeat(HeartbeatPayload::default()), now + Duration::from_secs(3)).await;
    ctx.router.sweep(now + Duration::from_secs(3)).await.expect("expire");

    link.send(&ctx, ack(&command, AckStatus::Applied), now + Duration::from_secs(4)).await;

    assert_eq!(
        command_status(&ctx, command.command_id).await,
        (CommandStatus::Expired, None)
    );
    let resolutions = drain(&mut events)
        .into_iter()
        .filter(|event| matches!(event, SubscriberEvent::CommandResolved(_)))
        .count();
    assert_eq!(resolutions, 1);
}

#[tokio::test]
async fn resolved_commands_are_collected_and_pending_ones_reload() {
    let ctx = context().await;
    let now = Instant::now();
    let mut link = Link::open(&ctx, now);
    link.send(&ctx, hello(0), now).await;

    ctx.router.submit(request("relay-1", true), now).await.expect("one");
    let delivered = link.commands().remove(0);
    link.send(&ctx, ack(&delivered, AckStatus::Applied), now).await;
    let pending = ctx.router.submit(request("relay-2", true), now).await.expect("two");

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(ctx.router.collect_garbage().await.expect("gc"), 1);
    assert!(ctx.router.status(delivered.command_id).await.expect("status").is_none());

    let restarted = CommandRouter::new(Arc::clone(&ctx.mediator), RouterSettings::default());
    assert_eq!(restarted.reload(now).await.expect("reload"), 1);
    assert_eq!(
        command_status(&ctx, pending.command_id).await,
        (CommandStatus::Pending, None)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ack_racing_the_first_delivery_leaves_nothing_to_redeliver() {
    let ctx = context().await;
    let now = Instant::now();
    let mut link = Link::open(&ctx, now);
    link.send(&ctx, hello(0), now).await;

    // Answers every command the moment it is handed to the session.
    let responder_ctx = ctx.clone();
    let Link {
        mut outbound,
        next_sequence,
        ..
    } = link;
    let responder = tokio::spawn(async move {
        let mut sequence = next_sequence;
        let mut answered = Vec::new();
        while answered.len() < 5 {
            let Some(message) = outbound.recv().await else {
                break;
            };
            if let LinkMessage::Command(command) = message {
                let envelope = Envelope::new(device(), sequence, ack(&command, AckStatus::Applied));
                sequence += 1;
                handle_inbound(&responder_ctx, &device(), envelope, now)
                    .await
                    .expect("ack handled");
                answered.push(command.command_id);
            }
        }
        (outbound, answered)
    });

    let mut submitted = Vec::new();
    for _ in 0..5 {
        let response = ctx
            .router
            .submit(request("relay-1", true), now)
            .await
            .expect("submit");
        submitted.push(response.command_id);
    }
    let (mut outbound, answered) = responder.await.expect("responder");
    assert_eq!(answered, submitted);

    for command_id in &submitted {
        assert_eq!(
            command_status(&ctx, *command_id).await,
            (CommandStatus::Acked, None)
        );
    }
    assert_eq!(ctx.router.pending_count(), 0);
    let later = ctx
        .router
        .sweep(now + Duration::from_secs(5))
        .await
        .expect("sweep");
    assert_eq!(later, SweepReport::default());
    assert!(outbound.try_recv().is_err(), "resolved commands are never resent");
}
