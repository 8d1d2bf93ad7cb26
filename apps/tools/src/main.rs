use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use shared::{
    domain::{DeviceId, SwitchId},
    error::ApiError,
    protocol::{SubmitCommandRequest, SubmitCommandResponse},
};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/server.db")]
    database_url: String,
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Devices known to the mirror.
    Devices,
    /// Mirrored switches of one device.
    Switches { device_id: String },
    Commands {
        #[arg(long)]
        device: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Activity trail of one switch, newest first.
    Events {
        device_id: String,
        switch_id: String,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Send a command through the running server.
    Submit {
        device_id: String,
        switch_id: String,
        #[arg(value_parser = parse_on_off)]
        state: bool,
        #[arg(long)]
        clear_override: bool,
    },
    /// Purge resolved commands and activity older than the given age.
    Gc {
        #[arg(long, default_value_t = 3600)]
        older_than_secs: u64,
    },
}

fn parse_on_off(raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        other => Err(format!("expected on or off, got '{other}'")),
    }
}

fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Submit {
            device_id,
            switch_id,
            state,
            clear_override,
        } => {
            let request = SubmitCommandRequest {
                device_id: DeviceId::new(device_id),
                switch_id: SwitchId::new(switch_id),
                desired_state: state,
                clear_override,
            };
            submit(&cli.server_url, &request).await?;
        }
        command => inspect(&cli.database_url, command).await?,
    }

    Ok(())
}

/// Read and maintenance commands that work on the mirror database directly.
async fn inspect(database_url: &str, command: Command) -> Result<()> {
    let storage = Storage::new(database_url).await?;
    match command {
        Command::Devices => {
            for device in storage.list_devices().await? {
                let last_seen = device
                    .last_seen
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "never".into());
                println!(
                    "{} online={} switches={} last_seen={}",
                    device.device_id,
                    device.online,
                    device.switch_ids.len(),
                    last_seen
                );
                if let Some(alert) = device.startup_alert {
                    println!("  alert: {alert}");
                }
            }
        }
        Command::Switches { device_id } => {
            for switch in storage.list_switches(&DeviceId::new(device_id)).await? {
                println!(
                    "{} physical={} desired={} override={} stale={} unpersisted={} applied_seq={}",
                    switch.switch_id,
                    on_off(switch.physical_state),
                    on_off(switch.desired_state),
                    switch.manual_override,
                    switch.stale,
                    switch.unpersisted,
                    switch.applied_sequence
                );
            }
        }
        Command::Commands { device, limit } => {
            let device = device.map(DeviceId::new);
            for command in storage.list_commands(device.as_ref(), limit).await? {
                let reason = command.reason.map(|r| r.as_str()).unwrap_or("-");
                println!(
                    "{} {}/{} seq={} {} status={} reason={} attempts={}",
                    command.command_id,
                    command.device_id,
                    command.switch_id,
                    command.sequence_number,
                    on_off(command.desired_state),
                    command.status.as_str(),
                    reason,
                    command.attempts
                );
            }
        }
        Command::Events {
            device_id,
            switch_id,
            limit,
        } => {
            let (device_id, switch_id) = (DeviceId::new(device_id), SwitchId::new(switch_id));
            for entry in storage
                .list_switch_activity(&device_id, &switch_id, limit)
                .await?
            {
                println!(
                    "{} {} source={} physical={} desired={} override={} {}",
                    entry.recorded_at.to_rfc3339(),
                    entry.kind.as_str(),
                    entry.source.as_str(),
                    on_off(entry.physical_state),
                    on_off(entry.desired_state),
                    entry.manual_override,
                    entry.detail.as_deref().unwrap_or("")
                );
            }
        }
        Command::Gc { older_than_secs } => {
            let cutoff = Utc::now() - chrono::Duration::seconds(older_than_secs as i64);
            let purged = storage.purge_resolved_commands(cutoff).await?;
            let trimmed = storage.purge_activity(cutoff).await?;
            println!("purged {purged} resolved commands and {trimmed} activity entries");
        }
        Command::Submit { .. } => bail!("submit goes through the server"),
    }

    Ok(())
}

async fn submit(server_url: &str, request: &SubmitCommandRequest) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let url = format!("{}/commands", server_url.trim_end_matches('/'));
    let response = client.post(url).json(request).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiError>(&body)
            .map(|e| e.message)
            .unwrap_or(body);
        bail!("server refused command ({status}): {message}");
    }
    let accepted: SubmitCommandResponse = response.json().await?;
    println!("queued command_id={}", accepted.command_id);
    Ok(())
}
