//! Core types for pgtestpool: registry rows, slot state and statistics.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::fmt;

/// Registered identity of a pool. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PoolInfo {
    /// Pool name (primary key)
    pub name: String,
    /// Template database every slot is cloned from
    pub template_database: String,
    /// Maximum number of slots
    pub max_size: i32,
    /// Registration timestamp
    pub created_at: DateTime<Utc>,
    /// Last registration check
    pub updated_at: DateTime<Utc>,
}

impl fmt::Display for PoolInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PoolInfo {{ name: {}, template_database: {}, max_size: {} }}",
            self.name, self.template_database, self.max_size
        )
    }
}

/// Setup state of a pool's template database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TemplateInfo {
    pub pool_name: String,
    pub template_database: String,
    /// Set once, after the setup hook returned successfully
    pub setup_complete: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Slot status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    /// Database is clean and can be handed out
    Free,
    /// Held by exactly one process
    InUse,
    /// Database state is unknown; re-cloned from the template before reuse
    Failed,
}

impl SlotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Free => "free",
            SlotStatus::InUse => "in_use",
            SlotStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SlotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(SlotStatus::Free),
            "in_use" => Ok(SlotStatus::InUse),
            "failed" => Ok(SlotStatus::Failed),
            _ => Err(format!("Invalid slot status: {}", s)),
        }
    }
}

/// One numbered slot of a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub pool_name: String,
    /// Stable index in `0..max_size`
    pub slot_index: i32,
    /// Derived from the pool name and index
    pub database_name: String,
    pub status: SlotStatus,
    /// Set when a dead holder's slot was returned without a reset
    pub needs_reset: bool,
    /// OS process id of the holder while in use
    pub process_id: Option<i32>,
    /// Host of the holder while in use
    pub hostname: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl SlotInfo {
    /// True when `holder` is the recorded owner of this slot.
    pub fn is_held_by(&self, holder: &Holder) -> bool {
        self.process_id == Some(holder.process_id)
            && self.hostname.as_deref() == Some(holder.hostname.as_str())
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for SlotInfo {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<SlotStatus>()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "status".to_string(),
                source: e.into(),
            })?;

        Ok(Self {
            pool_name: row.try_get("pool_name")?,
            slot_index: row.try_get("slot_index")?,
            database_name: row.try_get("database_name")?,
            status,
            needs_reset: row.try_get("needs_reset")?,
            process_id: row.try_get("process_id")?,
            hostname: row.try_get("hostname")?,
            created_at: row.try_get("created_at")?,
            last_used_at: row.try_get("last_used_at")?,
        })
    }
}

impl fmt::Display for SlotInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.process_id, &self.hostname) {
            (Some(pid), Some(host)) => write!(
                f,
                "SlotInfo {{ pool: {}, index: {}, database: {}, status: {}, holder: {}@{} }}",
                self.pool_name, self.slot_index, self.database_name, self.status, pid, host
            ),
            _ => write!(
                f,
                "SlotInfo {{ pool: {}, index: {}, database: {}, status: {} }}",
                self.pool_name, self.slot_index, self.database_name, self.status
            ),
        }
    }
}

/// Identity recorded on a slot while a process holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder {
    pub process_id: i32,
    pub hostname: String,
}

impl Holder {
    /// The calling process.
    pub fn current() -> Self {
        Self {
            process_id: std::process::id() as i32,
            hostname: crate::liveness::local_hostname(),
        }
    }
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.process_id, self.hostname)
    }
}

/// Point-in-time view of a pool's slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub name: String,
    pub max_size: i32,
    /// Slots with a row, in any state
    pub total_slots: i64,
    pub in_use: i64,
    pub free: i64,
    pub failed: i64,
    /// Reset or drop failures seen by this process since the pool was built
    pub local_reset_failures: u64,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PoolStats {{ name: {}, max_size: {}, total: {}, in_use: {}, free: {}, failed: {} }}",
            self.name, self.max_size, self.total_slots, self.in_use, self.free, self.failed
        )
    }
}
