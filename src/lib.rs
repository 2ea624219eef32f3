use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

pub mod db;
pub mod history;
pub mod payload;
pub mod prefs;
pub mod thumbs;
pub mod urlstate;

pub use history::{
    AppendOutcome, HistoryEntry, HistoryError, HistoryLimits, HistoryStore, NewExecution,
    RunStatus, Trigger,
};
pub use payload::{Payload, REDACTED_OUTPUT};
pub use prefs::{
    DefaultSource, HttpDefaultSource, LogPreference, PreferenceResolver, PreferenceSettings,
    GLOBAL_DEFAULT_PREFERENCE,
};
pub use thumbs::{BrokerError, ThumbnailBroker, ThumbnailWorker, WorkerFailure, WorkerReply};
pub use urlstate::{AutoRunSignal, ParamKind, ParamSpec, QueryStateSync, SyncOutcome};

pub const DB_FILE_NAME: &str = "toolchest.db";

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Database file location; `None` keeps everything in memory.
    pub db_path: Option<PathBuf>,
    /// Base URL of the tool-metadata service serving default preferences.
    pub metadata_base_url: String,
    pub limits: HistoryLimits,
}

impl CoreConfig {
    pub fn new(db_path: Option<PathBuf>, metadata_base_url: impl Into<String>) -> Self {
        Self {
            db_path,
            metadata_base_url: metadata_base_url.into(),
            limits: HistoryLimits::default(),
        }
    }

    pub fn in_memory(metadata_base_url: impl Into<String>) -> Self {
        Self::new(None, metadata_base_url)
    }

    /// Config pointing at the standard database file under `data_dir`.
    pub fn at_data_dir(
        data_dir: impl Into<PathBuf>,
        metadata_base_url: impl Into<String>,
    ) -> Self {
        Self::new(Some(data_dir.into().join(DB_FILE_NAME)), metadata_base_url)
    }
}

/// The engine's service graph, built once at application start and handed to
/// UI surfaces by injection. Tool pages call `history` and `preferences`;
/// the image library owns its own `ThumbnailBroker`.
pub struct ToolchestCore {
    pub history: Arc<HistoryStore>,
    pub preferences: Arc<PreferenceResolver>,
}

impl ToolchestCore {
    pub fn open(config: CoreConfig) -> Result<Self, String> {
        let source = Arc::new(HttpDefaultSource::new(&config.metadata_base_url));
        Self::open_with_source(config, source)
    }

    /// Same as `open`, with the default-preference source injected. Used by
    /// tests and by shells that resolve tool metadata some other way.
    pub fn open_with_source(
        config: CoreConfig,
        source: Arc<dyn DefaultSource>,
    ) -> Result<Self, String> {
        let connection = open_connection(config.db_path.as_deref())
            .map_err(|err| format!("Unable to open history database: {err}"))?;
        db::create_tables(&connection)
            .map_err(|err| format!("Unable to initialize history database: {err}"))?;

        let connection = Arc::new(Mutex::new(connection));
        let preferences = Arc::new(PreferenceResolver::new(connection.clone(), source));
        let history = Arc::new(HistoryStore::new(
            connection,
            preferences.clone(),
            config.limits,
        ));

        Ok(Self {
            history,
            preferences,
        })
    }
}

fn open_connection(db_path: Option<&std::path::Path>) -> Result<Connection, rusqlite::Error> {
    match db_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    // A failed create surfaces through the rusqlite open error.
                    let _ = fs::create_dir_all(parent);
                }
            }
            Connection::open(path)
        }
        None => Connection::open_in_memory(),
    }
}

pub fn now_timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
