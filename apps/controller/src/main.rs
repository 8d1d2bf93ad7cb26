use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use controller_core::{AgentConfig, ControllerAgent, LinkConfig, ManualMode, SimulatedHardware};
use shared::domain::{DeviceId, SwitchId};
use storage::{LocalStore, MemoryStore, StateStore};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Runs one switch controller against a sync backend, with simulated relays.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    /// Hardware identifier, usually the MAC address.
    #[arg(long)]
    device_id: String,
    #[arg(long = "switch", default_values_t = vec!["relay-1".to_string()])]
    switches: Vec<String>,
    /// Local state database, or `memory` for a volatile store.
    #[arg(long, default_value = "sqlite://./data/agent.db")]
    state_db: String,
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,
    #[arg(long, default_value_t = 3)]
    max_missed_heartbeats: u32,
    #[arg(long, default_value_t = 100)]
    poll_ms: u64,
    /// `maintained` for latching wall switches, `momentary` for push buttons.
    #[arg(long, default_value = "maintained")]
    manual_mode: ManualMode,
    /// Flip the first switch by hand every N seconds.
    #[arg(long)]
    simulate_flip_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    if args.state_db == "memory" {
        warn!("controller: using a volatile state store");
        run(args, MemoryStore::new()).await
    } else {
        let store = LocalStore::open(&args.state_db).await?;
        run(args, store).await
    }
}

async fn run<S: StateStore + 'static>(args: Args, store: S) -> Result<()> {
    let device_id = DeviceId::new(args.device_id.trim());
    let switch_ids: Vec<SwitchId> = args.switches.iter().map(SwitchId::new).collect();
    let hardware = SimulatedHardware::with_switches(&switch_ids);

    let mut agent_config = AgentConfig::new(device_id.clone(), switch_ids.clone());
    agent_config.poll_interval = Duration::from_millis(args.poll_ms.max(1));
    agent_config.manual_mode = args.manual_mode;

    let mut link_config = LinkConfig::new(args.server_url, device_id.clone());
    link_config.heartbeat_interval = Duration::from_secs(args.heartbeat_secs.max(1));
    link_config.max_missed_heartbeats = args.max_missed_heartbeats.max(1);

    let agent = ControllerAgent::boot(agent_config, hardware.clone(), store).await;
    if let Some(alert) = agent.startup_alert() {
        warn!(device_id = %device_id, alert, "controller: started with safe defaults");
    }

    if let (Some(secs), Some(first)) = (args.simulate_flip_secs, switch_ids.first().cloned()) {
        let hardware = hardware.clone();
        let (mode, hold) = (args.manual_mode, Duration::from_millis(args.poll_ms.max(1) * 3));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs.max(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match mode {
                    ManualMode::Maintained => {
                        let on = hardware.flip(&first);
                        info!(switch_id = %first, on, "controller: simulated manual flip");
                    }
                    ManualMode::Momentary => {
                        hardware.press(&first);
                        tokio::time::sleep(hold).await;
                        hardware.release(&first);
                        info!(switch_id = %first, "controller: simulated button press");
                    }
                }
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("controller: shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    info!(device_id = %device_id, switches = switch_ids.len(), "controller: running");
    agent.run(link_config, shutdown_rx).await
}
