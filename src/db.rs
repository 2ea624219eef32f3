use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::history::{HistoryEntry, RunStatus, Trigger};
use crate::payload::Payload;
use crate::prefs::PreferenceSettings;

const SETTING_HISTORY_PREFERENCES: &str = "history_preferences";

pub fn create_tables(connection: &Connection) -> Result<(), rusqlite::Error> {
    connection.execute_batch(
        "
    CREATE TABLE IF NOT EXISTS history_entries (
      id TEXT PRIMARY KEY,
      tool_name TEXT NOT NULL,
      tool_route TEXT NOT NULL,
      input_json TEXT NOT NULL,
      input_fingerprint TEXT NOT NULL,
      output_json TEXT NOT NULL,
      status TEXT NOT NULL,
      timestamps_json TEXT NOT NULL,
      triggers_json TEXT NOT NULL,
      last_used INTEGER NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_history_route_fingerprint
      ON history_entries(tool_route, input_fingerprint);
    CREATE INDEX IF NOT EXISTS idx_history_last_used ON history_entries(last_used);
    CREATE INDEX IF NOT EXISTS idx_history_tool_route ON history_entries(tool_route);

    CREATE TABLE IF NOT EXISTS settings (
      key TEXT PRIMARY KEY,
      value TEXT NOT NULL
    );
    ",
    )?;

    Ok(())
}

struct RawHistoryRow {
    id: String,
    tool_name: String,
    tool_route: String,
    input_json: String,
    output_json: String,
    status: String,
    timestamps_json: String,
    triggers_json: String,
    last_used: i64,
}

fn map_raw_history_row(row: &Row<'_>) -> rusqlite::Result<RawHistoryRow> {
    Ok(RawHistoryRow {
        id: row.get("id")?,
        tool_name: row.get("tool_name")?,
        tool_route: row.get("tool_route")?,
        input_json: row.get("input_json")?,
        output_json: row.get("output_json")?,
        status: row.get("status")?,
        timestamps_json: row.get("timestamps_json")?,
        triggers_json: row.get("triggers_json")?,
        last_used: row.get("last_used")?,
    })
}

/// Decodes the JSON columns of one row. A row that no longer parses is
/// dropped with a warning rather than poisoning the whole load.
fn decode_history_row(raw: RawHistoryRow) -> Option<HistoryEntry> {
    let input = serde_json::from_str::<Payload>(&raw.input_json).ok();
    let output = serde_json::from_str::<Payload>(&raw.output_json).ok();
    let timestamps = serde_json::from_str::<Vec<i64>>(&raw.timestamps_json).ok();
    let triggers = serde_json::from_str::<Vec<Trigger>>(&raw.triggers_json).ok();
    let status = RunStatus::parse(&raw.status);

    match (input, output, timestamps, triggers, status) {
        (Some(input), Some(output), Some(timestamps), Some(triggers), Some(status)) => {
            Some(HistoryEntry {
                id: raw.id,
                tool_name: raw.tool_name,
                tool_route: raw.tool_route,
                input,
                output,
                status,
                timestamps,
                triggers,
                last_used: raw.last_used,
            })
        }
        _ => {
            tracing::warn!(entry_id = %raw.id, "discarding malformed history row");
            None
        }
    }
}

pub fn load_entries(connection: &Connection) -> Result<Vec<HistoryEntry>, rusqlite::Error> {
    let mut statement = connection.prepare(
        "
        SELECT id, tool_name, tool_route, input_json,
               output_json, status, timestamps_json, triggers_json, last_used
        FROM history_entries
        ORDER BY last_used DESC
        ",
    )?;
    let rows = statement.query_map([], map_raw_history_row)?;

    let mut entries = Vec::new();
    for row in rows {
        if let Some(entry) = decode_history_row(row?) {
            entries.push(entry);
        }
    }
    Ok(entries)
}

pub fn upsert_entry(
    connection: &Connection,
    entry: &HistoryEntry,
    fingerprint: &str,
) -> Result<(), rusqlite::Error> {
    let input_json = serde_json::to_string(&entry.input).unwrap_or_else(|_| "null".to_string());
    let output_json = serde_json::to_string(&entry.output).unwrap_or_else(|_| "null".to_string());
    let timestamps_json =
        serde_json::to_string(&entry.timestamps).unwrap_or_else(|_| "[]".to_string());
    let triggers_json = serde_json::to_string(&entry.triggers).unwrap_or_else(|_| "[]".to_string());

    connection.execute(
        "
        INSERT INTO history_entries (
          id, tool_name, tool_route, input_json, input_fingerprint,
          output_json, status, timestamps_json, triggers_json, last_used
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(tool_route, input_fingerprint) DO UPDATE SET
          tool_name = excluded.tool_name,
          input_json = excluded.input_json,
          output_json = excluded.output_json,
          status = excluded.status,
          timestamps_json = excluded.timestamps_json,
          triggers_json = excluded.triggers_json,
          last_used = excluded.last_used
        ",
        params![
            entry.id,
            entry.tool_name,
            entry.tool_route,
            input_json,
            fingerprint,
            output_json,
            entry.status.as_str(),
            timestamps_json,
            triggers_json,
            entry.last_used
        ],
    )?;

    Ok(())
}

pub fn delete_entry(connection: &Connection, id: &str) -> Result<usize, rusqlite::Error> {
    connection.execute("DELETE FROM history_entries WHERE id = ?1", params![id])
}

pub fn delete_entries(connection: &Connection, ids: &[String]) -> Result<usize, rusqlite::Error> {
    let mut statement = connection.prepare("DELETE FROM history_entries WHERE id = ?1")?;
    let mut deleted = 0usize;
    for id in ids {
        deleted += statement.execute(params![id])?;
    }
    Ok(deleted)
}

pub fn delete_for_tool(connection: &Connection, tool_route: &str) -> Result<usize, rusqlite::Error> {
    connection.execute(
        "DELETE FROM history_entries WHERE tool_route = ?1",
        params![tool_route],
    )
}

pub fn delete_all(connection: &Connection) -> Result<usize, rusqlite::Error> {
    connection.execute("DELETE FROM history_entries", [])
}

pub fn count_entries(connection: &Connection) -> Result<i64, rusqlite::Error> {
    connection.query_row("SELECT COUNT(*) FROM history_entries", [], |row| row.get(0))
}

/// Loads the persisted preference blob. A missing or malformed blob resets to
/// defaults; the corrupt value is discarded.
pub fn load_settings(connection: &Connection) -> PreferenceSettings {
    let raw = match get_setting_value(connection, SETTING_HISTORY_PREFERENCES) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(%err, "unable to read preference settings; using defaults");
            return PreferenceSettings::default();
        }
    };

    match raw {
        Some(blob) => serde_json::from_str::<PreferenceSettings>(&blob).unwrap_or_else(|err| {
            tracing::warn!(%err, "discarding malformed preference settings");
            PreferenceSettings::default()
        }),
        None => PreferenceSettings::default(),
    }
}

pub fn save_settings(
    connection: &Connection,
    settings: &PreferenceSettings,
) -> Result<(), rusqlite::Error> {
    let blob = serde_json::to_string(settings).unwrap_or_else(|_| "{}".to_string());
    set_setting_value(connection, SETTING_HISTORY_PREFERENCES, &blob)
}

fn set_setting_value(
    connection: &Connection,
    key: &str,
    value: &str,
) -> Result<(), rusqlite::Error> {
    connection.execute(
        "
    INSERT INTO settings (key, value)
    VALUES (?1, ?2)
    ON CONFLICT(key) DO UPDATE SET value = excluded.value
    ",
        params![key, value],
    )?;

    Ok(())
}

fn get_setting_value(
    connection: &Connection,
    key: &str,
) -> Result<Option<String>, rusqlite::Error> {
    connection
        .query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
}
