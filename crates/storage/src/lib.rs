use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite, Transaction,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use uuid::Uuid;

use shared::{
    domain::{
        ActivityKind, ChangeSource, CommandId, CommandRecord, CommandStatus, DeviceId,
        DeviceSummary, MirroredSwitch, RejectReason, SwitchActivity, SwitchId,
    },
    protocol::{HelloPayload, StateEventPayload},
};

mod local;

pub use local::{LocalStore, MemoryStore, StateStore};

/// Backend mirror store: devices, their switches as last reported, the
/// command ledger and each switch's activity trail.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        // Shared-cache memory databases report lock conflicts instead of
        // waiting on them, so they get a single connection.
        let max_connections = if database_url.starts_with("sqlite::memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Creates the device on first contact and replaces every reported switch
    /// with the agent's full state. The issued sequence never falls below what
    /// the agent has already processed.
    pub async fn record_hello(
        &self,
        device_id: &DeviceId,
        hello: &HelloPayload,
        seen_at: DateTime<Utc>,
    ) -> Result<Vec<MirroredSwitch>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO devices (device_id, online, last_seen, startup_alert)
             VALUES (?1, 1, ?2, ?3)
             ON CONFLICT(device_id) DO UPDATE SET
                online = 1,
                last_seen = excluded.last_seen,
                startup_alert = excluded.startup_alert",
        )
        .bind(device_id.as_str())
        .bind(seen_at)
        .bind(hello.startup_alert.as_deref())
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to upsert device {device_id}"))?;

        for (position, report) in hello.switches.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO switches (
                    device_id, switch_id, position, desired_state, physical_state,
                    manual_override, unpersisted, stale, last_change_source,
                    last_changed_at, issued_sequence, applied_sequence
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?10, ?10)
                ON CONFLICT(device_id, switch_id) DO UPDATE SET
                    position = excluded.position,
                    desired_state = excluded.desired_state,
                    physical_state = excluded.physical_state,
                    manual_override = excluded.manual_override,
                    unpersisted = excluded.unpersisted,
                    stale = 0,
                    last_change_source = excluded.last_change_source,
                    last_changed_at = excluded.last_changed_at,
                    issued_sequence = MAX(switches.issued_sequence, excluded.issued_sequence),
                    applied_sequence = excluded.applied_sequence
                "#,
            )
            .bind(device_id.as_str())
            .bind(report.switch_id.as_str())
            .bind(position as i64)
            .bind(report.desired_state)
            .bind(report.physical_state)
            .bind(report.manual_override)
            .bind(report.unpersisted)
            .bind(report.last_change_source.as_str())
            .bind(report.last_changed_at)
            .bind(report.last_sequence as i64)
            .execute(&mut *tx)
            .await
            .with_context(|| {
                format!(
                    "failed to upsert switch {}/{}",
                    device_id, report.switch_id
                )
            })?;

            insert_activity(
                &mut tx,
                &SwitchActivity {
                    device_id: device_id.clone(),
                    switch_id: report.switch_id.clone(),
                    kind: ActivityKind::Hello,
                    source: report.last_change_source,
                    physical_state: report.physical_state,
                    desired_state: report.desired_state,
                    manual_override: report.manual_override,
                    detail: None,
                    recorded_at: seen_at,
                },
            )
            .await?;
        }
        tx.commit().await?;

        self.list_switches(device_id).await
    }

    /// Applies one state event to the mirror. Switches first seen through an
    /// event (no prior hello) are appended after the known ones.
    pub async fn record_state_event(
        &self,
        device_id: &DeviceId,
        event: &StateEventPayload,
        seen_at: DateTime<Utc>,
    ) -> Result<MirroredSwitch> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO devices (device_id, online, last_seen) VALUES (?1, 1, ?2)
             ON CONFLICT(device_id) DO UPDATE SET online = 1, last_seen = excluded.last_seen",
        )
        .bind(device_id.as_str())
        .bind(seen_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO switches (
                device_id, switch_id, position, desired_state, physical_state,
                manual_override, unpersisted, stale, last_change_source, last_changed_at
            )
            VALUES (
                ?1, ?2,
                (SELECT COUNT(*) FROM switches WHERE device_id = ?1),
                ?3, ?4, ?5, ?6, 0, ?7, ?8
            )
            ON CONFLICT(device_id, switch_id) DO UPDATE SET
                desired_state = excluded.desired_state,
                physical_state = excluded.physical_state,
                manual_override = excluded.manual_override,
                unpersisted = excluded.unpersisted,
                stale = 0,
                last_change_source = excluded.last_change_source,
                last_changed_at = excluded.last_changed_at
            "#,
        )
        .bind(device_id.as_str())
        .bind(event.switch_id.as_str())
        .bind(event.desired_state)
        .bind(event.physical_state)
        .bind(event.manual_override)
        .bind(event.unpersisted)
        .bind(event.source.as_str())
        .bind(event.changed_at)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to apply state event for {device_id}/{}", event.switch_id))?;

        insert_activity(
            &mut tx,
            &SwitchActivity {
                device_id: device_id.clone(),
                switch_id: event.switch_id.clone(),
                kind: ActivityKind::StateChange,
                source: event.source,
                physical_state: event.physical_state,
                desired_state: event.desired_state,
                manual_override: event.manual_override,
                detail: None,
                recorded_at: event.changed_at,
            },
        )
        .await?;
        tx.commit().await?;

        self.load_switch(device_id, &event.switch_id)
            .await?
            .with_context(|| format!("switch {device_id}/{} vanished", event.switch_id))
    }

    pub async fn touch_device(&self, device_id: &DeviceId, seen_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE devices SET last_seen = ?2 WHERE device_id = ?1")
            .bind(device_id.as_str())
            .bind(seen_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Flags (or clears) staleness on every switch of the device and returns
    /// them. Switch values are left untouched.
    pub async fn set_device_stale(
        &self,
        device_id: &DeviceId,
        stale: bool,
    ) -> Result<Vec<MirroredSwitch>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE devices SET online = ?2 WHERE device_id = ?1")
            .bind(device_id.as_str())
            .bind(!stale)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE switches SET stale = ?2 WHERE device_id = ?1")
            .bind(device_id.as_str())
            .bind(stale)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.list_switches(device_id).await
    }

    pub async fn record_applied_sequence(
        &self,
        device_id: &DeviceId,
        switch_id: &SwitchId,
        sequence: u64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE switches SET applied_sequence = MAX(applied_sequence, ?3)
             WHERE device_id = ?1 AND switch_id = ?2",
        )
        .bind(device_id.as_str())
        .bind(switch_id.as_str())
        .bind(sequence as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically reserves the next command sequence for a switch. `None` when
    /// the switch is not in the mirror.
    pub async fn next_sequence(
        &self,
        device_id: &DeviceId,
        switch_id: &SwitchId,
    ) -> Result<Option<u64>> {
        let row = sqlx::query(
            "UPDATE switches SET issued_sequence = issued_sequence + 1
             WHERE device_id = ?1 AND switch_id = ?2
             RETURNING issued_sequence",
        )
        .bind(device_id.as_str())
        .bind(switch_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<i64, _>(0) as u64))
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceSummary>> {
        let rows = sqlx::query(
            "SELECT device_id, online, last_seen, startup_alert FROM devices ORDER BY device_id",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut devices = Vec::with_capacity(rows.len());
        for row in rows {
            devices.push(self.device_from_row(&row).await?);
        }
        Ok(devices)
    }

    pub async fn load_device(&self, device_id: &DeviceId) -> Result<Option<DeviceSummary>> {
        let row = sqlx::query(
            "SELECT device_id, online, last_seen, startup_alert FROM devices WHERE device_id = ?1",
        )
        .bind(device_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.device_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    async fn device_from_row(&self, row: &SqliteRow) -> Result<DeviceSummary> {
        let device_id = DeviceId::new(row.try_get::<String, _>("device_id")?);
        let switch_ids = sqlx::query(
            "SELECT switch_id FROM switches WHERE device_id = ?1 ORDER BY position, switch_id",
        )
        .bind(device_id.as_str())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|r| SwitchId::new(r.get::<String, _>(0)))
        .collect();
        Ok(DeviceSummary {
            online: row.try_get::<bool, _>("online")?,
            last_seen: row.try_get::<Option<DateTime<Utc>>, _>("last_seen")?,
            startup_alert: row.try_get::<Option<String>, _>("startup_alert")?,
            switch_ids,
            device_id,
        })
    }

    pub async fn list_switches(&self, device_id: &DeviceId) -> Result<Vec<MirroredSwitch>> {
        let rows = sqlx::query(
            "SELECT * FROM switches WHERE device_id = ?1 ORDER BY position, switch_id",
        )
        .bind(device_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(switch_from_row).collect()
    }

    pub async fn load_switch(
        &self,
        device_id: &DeviceId,
        switch_id: &SwitchId,
    ) -> Result<Option<MirroredSwitch>> {
        let row = sqlx::query("SELECT * FROM switches WHERE device_id = ?1 AND switch_id = ?2")
            .bind(device_id.as_str())
            .bind(switch_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(switch_from_row).transpose()
    }

    pub async fn insert_command(&self, command: &CommandRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO commands (
                command_id, device_id, switch_id, sequence_number, desired_state,
                clear_override, status, reason, attempts, issued_at, resolved_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(command.command_id.0.to_string())
        .bind(command.device_id.as_str())
        .bind(command.switch_id.as_str())
        .bind(command.sequence_number as i64)
        .bind(command.desired_state)
        .bind(command.clear_override)
        .bind(command.status.as_str())
        .bind(command.reason.map(RejectReason::as_str))
        .bind(command.attempts as i64)
        .bind(command.issued_at)
        .bind(command.resolved_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to insert command {}", command.command_id))?;
        Ok(())
    }

    /// Moves a pending command to a terminal status and adds the outcome to
    /// the switch's trail. Returns false when the command was already resolved
    /// (or unknown), so a resolution is recorded once.
    pub async fn resolve_command(
        &self,
        command_id: CommandId,
        status: CommandStatus,
        reason: Option<RejectReason>,
        resolved_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE commands SET status = ?2, reason = ?3, resolved_at = ?4
             WHERE command_id = ?1 AND status = 'pending'",
        )
        .bind(command_id.0.to_string())
        .bind(status.as_str())
        .bind(reason.map(RejectReason::as_str))
        .bind(resolved_at)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        let detail = match reason {
            Some(reason) => format!("{}: {}", status.as_str(), reason.as_str()),
            None => status.as_str().to_string(),
        };
        sqlx::query(
            r#"
            INSERT INTO switch_events (
                device_id, switch_id, kind, source, physical_state,
                desired_state, manual_override, detail, recorded_at
            )
            SELECT c.device_id, c.switch_id, ?2, ?3,
                   COALESCE(s.physical_state, 0), c.desired_state,
                   COALESCE(s.manual_override, 0), ?4, ?5
            FROM commands c
            LEFT JOIN switches s
                ON s.device_id = c.device_id AND s.switch_id = c.switch_id
            WHERE c.command_id = ?1
            "#,
        )
        .bind(command_id.0.to_string())
        .bind(ActivityKind::Command.as_str())
        .bind(ChangeSource::Remote.as_str())
        .bind(detail)
        .bind(resolved_at)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to record outcome of command {command_id}"))?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn record_attempt(&self, command_id: CommandId, attempts: u32) -> Result<()> {
        sqlx::query("UPDATE commands SET attempts = ?2 WHERE command_id = ?1")
            .bind(command_id.0.to_string())
            .bind(attempts as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_command(&self, command_id: CommandId) -> Result<Option<CommandRecord>> {
        let row = sqlx::query("SELECT * FROM commands WHERE command_id = ?1")
            .bind(command_id.0.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(command_from_row).transpose()
    }

    /// Pending commands, oldest sequence first within each switch.
    pub async fn pending_commands(&self) -> Result<Vec<CommandRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM commands WHERE status = 'pending'
             ORDER BY device_id, switch_id, sequence_number",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(command_from_row).collect()
    }

    pub async fn list_commands(
        &self,
        device_id: Option<&DeviceId>,
        limit: u32,
    ) -> Result<Vec<CommandRecord>> {
        let rows = match device_id {
            Some(device_id) => {
                sqlx::query(
                    "SELECT * FROM commands WHERE device_id = ?1
                     ORDER BY issued_at DESC LIMIT ?2",
                )
                .bind(device_id.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM commands ORDER BY issued_at DESC LIMIT ?1")
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(command_from_row).collect()
    }

    /// Most recent activity for one switch, newest first.
    pub async fn list_switch_activity(
        &self,
        device_id: &DeviceId,
        switch_id: &SwitchId,
        limit: u32,
    ) -> Result<Vec<SwitchActivity>> {
        let rows = sqlx::query(
            "SELECT * FROM switch_events WHERE device_id = ?1 AND switch_id = ?2
             ORDER BY event_id DESC LIMIT ?3",
        )
        .bind(device_id.as_str())
        .bind(switch_id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(activity_from_row).collect()
    }

    pub async fn purge_activity(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM switch_events WHERE recorded_at < ?1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Deletes terminal commands resolved before `before`. Pending ones are kept.
    pub async fn purge_resolved_commands(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM commands WHERE status != 'pending' AND resolved_at < ?1",
        )
        .bind(before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

async fn insert_activity(
    tx: &mut Transaction<'_, Sqlite>,
    activity: &SwitchActivity,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO switch_events (
            device_id, switch_id, kind, source, physical_state,
            desired_state, manual_override, detail, recorded_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(activity.device_id.as_str())
    .bind(activity.switch_id.as_str())
    .bind(activity.kind.as_str())
    .bind(activity.source.as_str())
    .bind(activity.physical_state)
    .bind(activity.desired_state)
    .bind(activity.manual_override)
    .bind(activity.detail.as_deref())
    .bind(activity.recorded_at)
    .execute(&mut **tx)
    .await
    .with_context(|| {
        format!(
            "failed to record activity for {}/{}",
            activity.device_id, activity.switch_id
        )
    })?;
    Ok(())
}

fn activity_from_row(row: &SqliteRow) -> Result<SwitchActivity> {
    let kind: String = row.try_get("kind")?;
    let source: String = row.try_get("source")?;
    Ok(SwitchActivity {
        device_id: DeviceId::new(row.try_get::<String, _>("device_id")?),
        switch_id: SwitchId::new(row.try_get::<String, _>("switch_id")?),
        kind: ActivityKind::parse(&kind).with_context(|| format!("unknown activity kind '{kind}'"))?,
        source: ChangeSource::parse(&source)
            .with_context(|| format!("unknown change source '{source}'"))?,
        physical_state: row.try_get("physical_state")?,
        desired_state: row.try_get("desired_state")?,
        manual_override: row.try_get("manual_override")?,
        detail: row.try_get("detail")?,
        recorded_at: row.try_get("recorded_at")?,
    })
}

fn switch_from_row(row: &SqliteRow) -> Result<MirroredSwitch> {
    let source: String = row.try_get("last_change_source")?;
    Ok(MirroredSwitch {
        device_id: DeviceId::new(row.try_get::<String, _>("device_id")?),
        switch_id: SwitchId::new(row.try_get::<String, _>("switch_id")?),
        desired_state: row.try_get("desired_state")?,
        physical_state: row.try_get("physical_state")?,
        manual_override: row.try_get("manual_override")?,
        unpersisted: row.try_get("unpersisted")?,
        stale: row.try_get("stale")?,
        last_change_source: ChangeSource::parse(&source)
            .with_context(|| format!("unknown change source '{source}'"))?,
        last_changed_at: row.try_get("last_changed_at")?,
        issued_sequence: row.try_get::<i64, _>("issued_sequence")? as u64,
        applied_sequence: row.try_get::<i64, _>("applied_sequence")? as u64,
    })
}

fn command_from_row(row: &SqliteRow) -> Result<CommandRecord> {
    let command_id: String = row.try_get("command_id")?;
    let status: String = row.try_get("status")?;
    let reason: Option<String> = row.try_get("reason")?;
    Ok(CommandRecord {
        command_id: CommandId(
            Uuid::parse_str(&command_id)
                .with_context(|| format!("invalid command id '{command_id}'"))?,
        ),
        device_id: DeviceId::new(row.try_get::<String, _>("device_id")?),
        switch_id: SwitchId::new(row.try_get::<String, _>("switch_id")?),
        sequence_number: row.try_get::<i64, _>("sequence_number")? as u64,
        desired_state: row.try_get("desired_state")?,
        clear_override: row.try_get("clear_override")?,
        status: CommandStatus::parse(&status)
            .with_context(|| format!("unknown command status '{status}'"))?,
        reason: reason.as_deref().and_then(RejectReason::parse),
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        issued_at: row.try_get("issued_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;
    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
