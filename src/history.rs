use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::sync::watch;
use uuid::Uuid;

use crate::db;
use crate::now_timestamp_ms;
use crate::payload::Payload;
use crate::prefs::{LogPreference, PreferenceResolver};

pub const DEFAULT_MAX_ENTRIES: usize = 100;
pub const DEFAULT_MAX_TIMESTAMPS: usize = 50;
pub const DEFAULT_MAX_TRIGGERS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(RunStatus::Success),
            "error" => Some(RunStatus::Error),
            _ => None,
        }
    }
}

/// What caused a tool execution: an explicit click, a URL-driven reload, an
/// auto-run on blur, or a file upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Click,
    Query,
    Auto,
    Upload,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Click => "click",
            Trigger::Query => "query",
            Trigger::Auto => "auto",
            Trigger::Upload => "upload",
        }
    }
}

/// One record per unique (tool, input) pair. Re-running the same input
/// updates the record in place instead of duplicating it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub tool_name: String,
    pub tool_route: String,
    pub input: Payload,
    pub output: Payload,
    pub status: RunStatus,
    /// Execution instants, newest first, capped.
    pub timestamps: Vec<i64>,
    /// Distinct causes, most recent first, capped.
    pub triggers: Vec<Trigger>,
    pub last_used: i64,
}

impl HistoryEntry {
    pub fn last_used_rfc3339(&self) -> Option<String> {
        let instant =
            OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.last_used) * 1_000_000)
                .ok()?;
        instant.format(&Rfc3339).ok()
    }
}

/// Input to `HistoryStore::append`.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub tool_name: String,
    pub tool_route: String,
    pub input: Payload,
    pub output: Payload,
    pub status: RunStatus,
    pub trigger: Trigger,
}

#[derive(Debug, Clone, Copy)]
pub struct HistoryLimits {
    pub max_entries: usize,
    pub max_timestamps: usize,
    pub max_triggers: usize,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_timestamps: DEFAULT_MAX_TIMESTAMPS,
            max_triggers: DEFAULT_MAX_TRIGGERS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Logging was disabled for this call; nothing was written.
    Skipped,
    /// A new entry was created.
    Inserted,
    /// An existing entry for the same (route, input) pair was updated.
    Merged,
}

#[derive(Debug, Clone)]
pub struct HistoryError {
    pub message: String,
}

impl HistoryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for HistoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HistoryError {}

/// Usage-history store with bounded retention and input-level dedup. The
/// in-memory list is authoritative and mirrors the SQLite table after every
/// operation.
pub struct HistoryStore {
    connection: Arc<Mutex<Connection>>,
    prefs: Arc<PreferenceResolver>,
    limits: HistoryLimits,
    entries: Mutex<Vec<HistoryEntry>>,
    /// Serializes every find-or-upsert so rapid appends for the same input
    /// cannot race between the lookup and the write.
    write_lock: tokio::sync::Mutex<()>,
    /// Last instant handed out; keeps execution timestamps strictly
    /// increasing even within one millisecond.
    clock: Mutex<i64>,
    last_error: Mutex<Option<String>>,
    watch_tx: watch::Sender<Vec<HistoryEntry>>,
    watch_rx: watch::Receiver<Vec<HistoryEntry>>,
}

impl HistoryStore {
    /// Loads persisted entries. A failing load degrades to an empty list with
    /// the cause retrievable through `last_error`.
    pub fn new(
        connection: Arc<Mutex<Connection>>,
        prefs: Arc<PreferenceResolver>,
        limits: HistoryLimits,
    ) -> Self {
        let mut load_error = None;
        let entries = match connection.lock() {
            Ok(conn) => match db::load_entries(&conn) {
                Ok(entries) => entries,
                Err(err) => {
                    load_error = Some(format!("unable to load history: {err}"));
                    Vec::new()
                }
            },
            Err(_) => {
                load_error = Some("database lock poisoned".to_string());
                Vec::new()
            }
        };

        let (watch_tx, watch_rx) = watch::channel(entries.clone());
        Self {
            connection,
            prefs,
            limits,
            entries: Mutex::new(entries),
            write_lock: tokio::sync::Mutex::new(()),
            clock: Mutex::new(0),
            last_error: Mutex::new(load_error),
            watch_tx,
            watch_rx,
        }
    }

    /// Records an execution. Consults the effective logging preference first:
    /// `off` (or the global kill switch) skips the write entirely, and
    /// `restrictive` stores the redaction placeholder instead of the output.
    pub async fn append(&self, execution: NewExecution) -> Result<AppendOutcome, HistoryError> {
        if !self.prefs.is_history_enabled() {
            return Ok(AppendOutcome::Skipped);
        }
        let preference = self.prefs.effective_preference(&execution.tool_route);
        if preference == LogPreference::Off {
            return Ok(AppendOutcome::Skipped);
        }

        let output = if preference == LogPreference::Restrictive {
            Payload::redacted()
        } else {
            execution.output.clone()
        };

        let _guard = self.write_lock.lock().await;
        let now = self.next_timestamp()?;
        let fingerprint = execution.input.fingerprint();

        let existing = {
            let entries = self.lock_entries()?;
            entries
                .iter()
                .find(|entry| {
                    entry.tool_route == execution.tool_route
                        && entry.input.fingerprint() == fingerprint
                })
                .cloned()
        };

        match existing {
            Some(mut entry) => {
                merge_timestamp(&mut entry.timestamps, now, self.limits.max_timestamps);
                merge_trigger(&mut entry.triggers, execution.trigger, self.limits.max_triggers);
                entry.output = output;
                entry.status = execution.status;
                entry.last_used = now;

                self.persist_entry(&entry, &fingerprint)?;
                {
                    let mut entries = self.lock_entries()?;
                    entries.retain(|candidate| candidate.id != entry.id);
                    entries.insert(0, entry);
                }
                self.publish();
                Ok(AppendOutcome::Merged)
            }
            None => {
                let entry = HistoryEntry {
                    id: Uuid::new_v4().to_string(),
                    tool_name: execution.tool_name,
                    tool_route: execution.tool_route,
                    input: execution.input,
                    output,
                    status: execution.status,
                    timestamps: vec![now],
                    triggers: vec![execution.trigger],
                    last_used: now,
                };

                self.persist_entry(&entry, &fingerprint)?;
                let evicted: Vec<String> = {
                    let mut entries = self.lock_entries()?;
                    entries.insert(0, entry);
                    if entries.len() > self.limits.max_entries {
                        entries
                            .split_off(self.limits.max_entries)
                            .into_iter()
                            .map(|old| old.id)
                            .collect()
                    } else {
                        Vec::new()
                    }
                };
                if !evicted.is_empty() {
                    self.with_connection("evict history entries", |conn| {
                        db::delete_entries(conn, &evicted)
                    })?;
                }
                self.publish();
                Ok(AppendOutcome::Inserted)
            }
        }
    }

    pub async fn delete_entry(&self, id: &str) -> Result<bool, HistoryError> {
        let _guard = self.write_lock.lock().await;
        let removed = {
            let mut entries = self.lock_entries()?;
            let before = entries.len();
            entries.retain(|entry| entry.id != id);
            before != entries.len()
        };
        if removed {
            self.with_connection("delete history entry", |conn| db::delete_entry(conn, id))?;
            self.publish();
        }
        Ok(removed)
    }

    pub async fn clear_tool(&self, tool_route: &str) -> Result<usize, HistoryError> {
        let _guard = self.write_lock.lock().await;
        let removed = {
            let mut entries = self.lock_entries()?;
            let before = entries.len();
            entries.retain(|entry| entry.tool_route != tool_route);
            before - entries.len()
        };
        if removed > 0 {
            self.with_connection("clear tool history", |conn| {
                db::delete_for_tool(conn, tool_route)
            })?;
            self.publish();
        }
        Ok(removed)
    }

    pub async fn clear_all(&self) -> Result<usize, HistoryError> {
        let _guard = self.write_lock.lock().await;
        let removed = {
            let mut entries = self.lock_entries()?;
            let count = entries.len();
            entries.clear();
            count
        };
        if removed > 0 {
            self.with_connection("clear history", db::delete_all)?;
            self.publish();
        }
        Ok(removed)
    }

    /// Snapshot ordered by `last_used`, newest first.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn entries_for_tool(&self, tool_route: &str) -> Vec<HistoryEntry> {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.tool_route == tool_route)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn entry(&self, id: &str) -> Option<HistoryEntry> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.iter().find(|entry| entry.id == id).cloned())
    }

    /// Receiver that observes the full list after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<Vec<HistoryEntry>> {
        self.watch_rx.clone()
    }

    /// Most recent storage failure, if any. Cleared by the next successful
    /// mutation.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn persist_entry(&self, entry: &HistoryEntry, fingerprint: &str) -> Result<(), HistoryError> {
        self.with_connection("save history entry", |conn| {
            db::upsert_entry(conn, entry, fingerprint)
        })
    }

    fn with_connection<T>(
        &self,
        context: &str,
        operation: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, HistoryError> {
        let outcome = match self.connection.lock() {
            Ok(conn) => operation(&conn).map_err(|err| format!("unable to {context}: {err}")),
            Err(_) => Err(format!("unable to {context}: database lock poisoned")),
        };
        match outcome {
            Ok(value) => {
                if let Ok(mut last_error) = self.last_error.lock() {
                    *last_error = None;
                }
                Ok(value)
            }
            Err(message) => {
                if let Ok(mut last_error) = self.last_error.lock() {
                    *last_error = Some(message.clone());
                }
                Err(HistoryError::new(message))
            }
        }
    }

    fn lock_entries(&self) -> Result<std::sync::MutexGuard<'_, Vec<HistoryEntry>>, HistoryError> {
        self.entries
            .lock()
            .map_err(|_| HistoryError::new("history state lock poisoned"))
    }

    fn next_timestamp(&self) -> Result<i64, HistoryError> {
        let mut clock = self
            .clock
            .lock()
            .map_err(|_| HistoryError::new("history clock lock poisoned"))?;
        let now = now_timestamp_ms().max(*clock + 1);
        *clock = now;
        Ok(now)
    }

    fn publish(&self) {
        let snapshot = self.entries();
        self.watch_tx.send_replace(snapshot);
    }
}

fn merge_timestamp(timestamps: &mut Vec<i64>, now: i64, cap: usize) {
    timestamps.retain(|instant| *instant != now);
    timestamps.insert(0, now);
    timestamps.sort_unstable_by(|a, b| b.cmp(a));
    timestamps.truncate(cap);
}

fn merge_trigger(triggers: &mut Vec<Trigger>, trigger: Trigger, cap: usize) {
    triggers.retain(|existing| *existing != trigger);
    triggers.insert(0, trigger);
    triggers.truncate(cap);
}
