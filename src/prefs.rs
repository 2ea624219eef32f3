use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db;

pub const GLOBAL_DEFAULT_PREFERENCE: LogPreference = LogPreference::On;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogPreference {
    On,
    Restrictive,
    Off,
}

impl LogPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogPreference::On => "on",
            LogPreference::Restrictive => "restrictive",
            LogPreference::Off => "off",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "on" => Some(LogPreference::On),
            "restrictive" => Some(LogPreference::Restrictive),
            "off" => Some(LogPreference::Off),
            _ => None,
        }
    }
}

/// Persisted preference blob. Per-tool defaults are fetched lazily and cached
/// for the session only, so they never appear here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceSettings {
    #[serde(default = "default_history_enabled")]
    pub is_history_enabled: bool,
    #[serde(default)]
    pub tool_preferences: BTreeMap<String, LogPreference>,
}

fn default_history_enabled() -> bool {
    true
}

impl Default for PreferenceSettings {
    fn default() -> Self {
        Self {
            is_history_enabled: true,
            tool_preferences: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreferenceError {
    pub message: String,
}

impl PreferenceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for PreferenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for PreferenceError {}

/// Source of a tool's declared default logging preference. `Ok(None)` means
/// the tool declares no default and the global default applies.
#[async_trait]
pub trait DefaultSource: Send + Sync {
    async fn fetch_default(&self, tool_route: &str) -> Result<Option<LogPreference>, String>;
}

pub struct HttpDefaultSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDefaultSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Trailing segment of a tool route, e.g. `/t/case-converter` -> `case-converter`.
fn route_directive(tool_route: &str) -> &str {
    tool_route
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(tool_route)
}

#[async_trait]
impl DefaultSource for HttpDefaultSource {
    async fn fetch_default(&self, tool_route: &str) -> Result<Option<LogPreference>, String> {
        let directive = route_directive(tool_route);
        let url = endpoint(
            &self.base_url,
            &format!("/api/tool-metadata/{directive}.json"),
        );

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| format!("tool metadata request failed: {err}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!(
                "tool metadata request returned status {}",
                status.as_u16()
            ));
        }

        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| format!("tool metadata response was not JSON: {err}"))?;

        match payload.get("defaultLogging") {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(raw)) => LogPreference::parse(raw)
                .map(Some)
                .ok_or_else(|| format!("unknown defaultLogging value: {raw}")),
            Some(other) => Err(format!("invalid defaultLogging field: {other}")),
        }
    }
}

/// Resolves the logging level applied to a history write: explicit override,
/// then the tool's fetched default, then the global default.
pub struct PreferenceResolver {
    connection: Arc<Mutex<Connection>>,
    source: Arc<dyn DefaultSource>,
    settings: Mutex<PreferenceSettings>,
    defaults: Arc<Mutex<HashMap<String, LogPreference>>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl PreferenceResolver {
    pub fn new(connection: Arc<Mutex<Connection>>, source: Arc<dyn DefaultSource>) -> Self {
        let settings = {
            let guard = connection.lock().ok();
            guard
                .map(|conn| db::load_settings(&conn))
                .unwrap_or_default()
        };

        Self {
            connection,
            source,
            settings: Mutex::new(settings),
            defaults: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn settings(&self) -> PreferenceSettings {
        self.settings
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn is_history_enabled(&self) -> bool {
        self.settings
            .lock()
            .map(|guard| guard.is_history_enabled)
            .unwrap_or(true)
    }

    pub fn set_history_enabled(&self, enabled: bool) -> Result<(), PreferenceError> {
        let snapshot = {
            let mut guard = self
                .settings
                .lock()
                .map_err(|_| PreferenceError::new("preference state lock poisoned"))?;
            guard.is_history_enabled = enabled;
            guard.clone()
        };
        self.persist(&snapshot)
    }

    /// Effective preference for `tool_route`, resolved without waiting. A
    /// route with no cached default answers with the global default and kicks
    /// off a single background fetch; concurrent calls for the same route
    /// coalesce into that one fetch.
    pub fn effective_preference(&self, tool_route: &str) -> LogPreference {
        if let Ok(settings) = self.settings.lock() {
            if let Some(preference) = settings.tool_preferences.get(tool_route) {
                return *preference;
            }
        }

        if let Ok(defaults) = self.defaults.lock() {
            if let Some(preference) = defaults.get(tool_route) {
                return *preference;
            }
        }

        self.spawn_default_fetch(tool_route);
        GLOBAL_DEFAULT_PREFERENCE
    }

    /// The tool's default preference, fetching and caching it if this session
    /// has not seen it yet. Fetch failures cache the global default so the
    /// session does not retry indefinitely.
    pub async fn resolved_default(&self, tool_route: &str) -> LogPreference {
        if let Ok(defaults) = self.defaults.lock() {
            if let Some(preference) = defaults.get(tool_route) {
                return *preference;
            }
        }

        let fetched = resolve_fetch(self.source.fetch_default(tool_route).await, tool_route);
        if let Ok(mut defaults) = self.defaults.lock() {
            defaults.insert(tool_route.to_string(), fetched);
        }
        fetched
    }

    /// Stores `value` as the tool's override, or clears the override when
    /// `value` matches the tool's resolved default so the override map stays
    /// minimal.
    pub async fn set_preference(
        &self,
        tool_route: &str,
        value: LogPreference,
    ) -> Result<(), PreferenceError> {
        let resolved_default = self.resolved_default(tool_route).await;

        let snapshot = {
            let mut guard = self
                .settings
                .lock()
                .map_err(|_| PreferenceError::new("preference state lock poisoned"))?;
            if value == resolved_default {
                guard.tool_preferences.remove(tool_route);
            } else {
                guard.tool_preferences.insert(tool_route.to_string(), value);
            }
            guard.clone()
        };

        self.persist(&snapshot)
    }

    fn persist(&self, settings: &PreferenceSettings) -> Result<(), PreferenceError> {
        let connection = self
            .connection
            .lock()
            .map_err(|_| PreferenceError::new("database lock poisoned"))?;
        db::save_settings(&connection, settings)
            .map_err(|err| PreferenceError::new(format!("unable to save preferences: {err}")))
    }

    fn spawn_default_fetch(&self, tool_route: &str) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        {
            let Ok(mut in_flight) = self.in_flight.lock() else {
                return;
            };
            if !in_flight.insert(tool_route.to_string()) {
                return;
            }
        }

        let source = self.source.clone();
        let defaults = self.defaults.clone();
        let in_flight = self.in_flight.clone();
        let route = tool_route.to_string();
        handle.spawn(async move {
            let fetched = resolve_fetch(source.fetch_default(&route).await, &route);
            if let Ok(mut cache) = defaults.lock() {
                cache.insert(route.clone(), fetched);
            }
            if let Ok(mut pending) = in_flight.lock() {
                pending.remove(&route);
            }
        });
    }
}

fn resolve_fetch(
    outcome: Result<Option<LogPreference>, String>,
    tool_route: &str,
) -> LogPreference {
    match outcome {
        Ok(Some(preference)) => preference,
        Ok(None) => GLOBAL_DEFAULT_PREFERENCE,
        Err(message) => {
            tracing::debug!(%tool_route, %message, "tool default fetch failed; using global default");
            GLOBAL_DEFAULT_PREFERENCE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::GET, MockServer};

    fn open_resolver(source: Arc<dyn DefaultSource>) -> PreferenceResolver {
        let connection = Connection::open_in_memory().expect("in-memory database should open");
        db::create_tables(&connection).expect("schema should apply");
        PreferenceResolver::new(Arc::new(Mutex::new(connection)), source)
    }

    struct FixedSource(Option<LogPreference>);

    #[async_trait]
    impl DefaultSource for FixedSource {
        async fn fetch_default(&self, _tool_route: &str) -> Result<Option<LogPreference>, String> {
            Ok(self.0)
        }
    }

    struct FailingSource;

    #[async_trait]
    impl DefaultSource for FailingSource {
        async fn fetch_default(&self, _tool_route: &str) -> Result<Option<LogPreference>, String> {
            Err("metadata service unreachable".to_string())
        }
    }

    #[test]
    fn route_directive_should_take_the_trailing_segment() {
        assert_eq!(route_directive("/t/case-converter"), "case-converter");
        assert_eq!(route_directive("/t/zip-explorer/"), "zip-explorer");
        assert_eq!(route_directive("emoji-search"), "emoji-search");
    }

    #[test]
    fn settings_blob_should_tolerate_missing_fields() {
        let parsed: PreferenceSettings = serde_json::from_str("{}").expect("empty blob parses");
        assert!(parsed.is_history_enabled);
        assert!(parsed.tool_preferences.is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn set_preference_should_round_trip_through_effective_preference() {
        let resolver = open_resolver(Arc::new(FixedSource(Some(LogPreference::On))));

        resolver
            .set_preference("/t/json-formatter", LogPreference::Restrictive)
            .await
            .expect("set_preference should succeed");

        assert_eq!(
            resolver.effective_preference("/t/json-formatter"),
            LogPreference::Restrictive
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn set_preference_to_the_default_should_clear_the_override() {
        let resolver = open_resolver(Arc::new(FixedSource(Some(LogPreference::Restrictive))));

        resolver
            .set_preference("/t/wallet", LogPreference::Off)
            .await
            .expect("set_preference should succeed");
        assert!(resolver.settings().tool_preferences.contains_key("/t/wallet"));

        resolver
            .set_preference("/t/wallet", LogPreference::Restrictive)
            .await
            .expect("set_preference should succeed");
        assert!(!resolver.settings().tool_preferences.contains_key("/t/wallet"));
        // The cleared override falls back to the cached default.
        assert_eq!(
            resolver.effective_preference("/t/wallet"),
            LogPreference::Restrictive
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fetch_failure_should_cache_the_global_default() {
        let resolver = open_resolver(Arc::new(FailingSource));

        assert_eq!(
            resolver.resolved_default("/t/base64").await,
            GLOBAL_DEFAULT_PREFERENCE
        );
        // Cached for the session: a second call answers without the source.
        assert_eq!(
            resolver.effective_preference("/t/base64"),
            GLOBAL_DEFAULT_PREFERENCE
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unset_preference_should_answer_with_the_global_default() {
        let resolver = open_resolver(Arc::new(FixedSource(None)));
        assert_eq!(
            resolver.effective_preference("/t/never-seen"),
            GLOBAL_DEFAULT_PREFERENCE
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn http_source_should_read_the_default_logging_field() {
        let server = MockServer::start();
        let _mock = server.mock(|when, then| {
            when.method(GET).path("/api/tool-metadata/case-converter.json");
            then.status(200).json_body(serde_json::json!({
                "title": "Case Converter",
                "defaultLogging": "restrictive"
            }));
        });

        let source = HttpDefaultSource::new(server.base_url());
        let fetched = source
            .fetch_default("/t/case-converter")
            .await
            .expect("metadata fetch should succeed");
        assert_eq!(fetched, Some(LogPreference::Restrictive));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn http_source_should_treat_a_missing_field_as_no_default() {
        let server = MockServer::start();
        let _mock = server.mock(|when, then| {
            when.method(GET).path("/api/tool-metadata/emoji-search.json");
            then.status(200)
                .json_body(serde_json::json!({ "title": "Emoji Search" }));
        });

        let source = HttpDefaultSource::new(server.base_url());
        let fetched = source
            .fetch_default("/t/emoji-search")
            .await
            .expect("metadata fetch should succeed");
        assert_eq!(fetched, None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn http_source_should_report_non_ok_responses() {
        let server = MockServer::start();
        let _mock = server.mock(|when, then| {
            when.method(GET).path("/api/tool-metadata/missing.json");
            then.status(404);
        });

        let source = HttpDefaultSource::new(server.base_url());
        let outcome = source.fetch_default("/t/missing").await;
        assert!(outcome.is_err());

        // A resolver downgrades that failure to the global default.
        let resolver = open_resolver(Arc::new(source));
        assert_eq!(
            resolver.resolved_default("/t/missing").await,
            GLOBAL_DEFAULT_PREFERENCE
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn http_source_should_reject_unknown_preference_values() {
        let server = MockServer::start();
        let _mock = server.mock(|when, then| {
            when.method(GET).path("/api/tool-metadata/odd.json");
            then.status(200)
                .json_body(serde_json::json!({ "defaultLogging": "verbose" }));
        });

        let source = HttpDefaultSource::new(server.base_url());
        assert!(source.fetch_default("/t/odd").await.is_err());
    }
}
