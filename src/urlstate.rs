use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::payload::Payload;

/// Parameter name treated as the primary input when declared; otherwise the
/// first declared parameter takes that role.
pub const PRIMARY_PARAM_NAME: &str = "input";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    /// Free text, passed through verbatim.
    Text,
    /// One of a tool-defined set; passed through verbatim, the tool's own
    /// state setter is the gatekeeper.
    Choice,
    /// Case-insensitive `true`/`false`.
    Flag,
    Number,
    Json,
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub default: Payload,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, kind: ParamKind, default: Payload) -> Self {
        Self {
            name: name.into(),
            kind,
            default,
        }
    }
}

/// One-shot auto-run flag handed back to the tool: armed when the primary
/// input arrived through the URL, disarmed once consumed.
#[derive(Debug, Default)]
pub struct AutoRunSignal {
    armed: bool,
}

impl AutoRunSignal {
    fn armed(value: bool) -> Self {
        Self { armed: value }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Consumes the signal: returns whether the tool should run now and
    /// disarms it so a single navigation triggers at most one run.
    pub fn take(&mut self) -> bool {
        std::mem::take(&mut self.armed)
    }

    pub fn reset(&mut self) {
        self.armed = false;
    }
}

#[derive(Debug)]
pub struct SyncOutcome {
    /// Resolved value per declared parameter.
    pub values: BTreeMap<String, Payload>,
    pub auto_run: AutoRunSignal,
}

/// Reconciles a URL query string with a tool's declared parameters. Pure
/// derivation: the only side effects are the sink calls, and the only output
/// signal is the auto-run flag.
pub struct QueryStateSync {
    specs: Vec<ParamSpec>,
}

impl QueryStateSync {
    pub fn new(specs: Vec<ParamSpec>) -> Self {
        Self { specs }
    }

    /// Resolves every declared parameter against `query` and feeds each one
    /// to `sink` exactly once. Absent parameters resolve to their defaults;
    /// malformed values fall back to the default with a warning.
    pub fn apply<F>(&self, query: &str, mut sink: F) -> SyncOutcome
    where
        F: FnMut(&str, Payload),
    {
        let raw = parse_query(query);

        let mut values = BTreeMap::new();
        for spec in &self.specs {
            let resolved = match raw.get(spec.name.as_str()) {
                None => spec.default.clone(),
                Some(raw_value) => parse_param(spec, raw_value),
            };
            sink(&spec.name, resolved.clone());
            values.insert(spec.name.clone(), resolved);
        }

        let auto_run = self
            .primary_spec()
            .and_then(|spec| raw.get(spec.name.as_str()))
            .map(|raw_value| !raw_value.trim().is_empty())
            .unwrap_or(false);

        SyncOutcome {
            values,
            auto_run: AutoRunSignal::armed(auto_run),
        }
    }

    fn primary_spec(&self) -> Option<&ParamSpec> {
        self.specs
            .iter()
            .find(|spec| spec.name == PRIMARY_PARAM_NAME)
            .or_else(|| self.specs.first())
    }
}

fn parse_query(query: &str) -> BTreeMap<String, String> {
    let trimmed = query.trim_start_matches('?');
    // Later duplicates win, matching last-value query semantics.
    url::form_urlencoded::parse(trimmed.as_bytes())
        .into_owned()
        .collect()
}

fn parse_param(spec: &ParamSpec, raw_value: &str) -> Payload {
    match spec.kind {
        ParamKind::Text | ParamKind::Choice => Payload::Text(raw_value.to_string()),
        ParamKind::Flag => match raw_value.trim().to_ascii_lowercase().as_str() {
            "true" => Payload::Bool(true),
            "false" => Payload::Bool(false),
            _ => {
                tracing::warn!(param = %spec.name, value = %raw_value, "invalid flag parameter; using default");
                spec.default.clone()
            }
        },
        ParamKind::Number => match raw_value.trim().parse::<f64>() {
            Ok(number) if number.is_finite() => Payload::Number(number),
            _ => {
                tracing::warn!(param = %spec.name, value = %raw_value, "invalid number parameter; using default");
                spec.default.clone()
            }
        },
        ParamKind::Json => match serde_json::from_str::<Value>(raw_value) {
            Ok(value) => Payload::from(value),
            Err(err) => {
                tracing::warn!(param = %spec.name, %err, "invalid json parameter; using default");
                spec.default.clone()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn case_converter_specs() -> Vec<ParamSpec> {
        vec![
            ParamSpec::new(
                "input",
                ParamKind::Text,
                Payload::text(""),
            ),
            ParamSpec::new(
                "mode",
                ParamKind::Choice,
                Payload::text("upper"),
            ),
            ParamSpec::new("trim", ParamKind::Flag, Payload::Bool(false)),
            ParamSpec::new("width", ParamKind::Number, Payload::Number(80.0)),
            ParamSpec::new("options", ParamKind::Json, Payload::Null),
        ]
    }

    fn apply_collect(query: &str) -> (BTreeMap<String, Payload>, SyncOutcome) {
        let sync = QueryStateSync::new(case_converter_specs());
        let mut seen = BTreeMap::new();
        let outcome = sync.apply(query, |name, value| {
            seen.insert(name.to_string(), value);
        });
        (seen, outcome)
    }

    #[test]
    fn apply_should_resolve_each_declared_kind() {
        let (seen, outcome) = apply_collect(
            "?input=Hello%20World&mode=lower&trim=TRUE&width=42.5&options=%7B%22a%22%3A1%7D",
        );

        assert_eq!(seen["input"], Payload::text("Hello World"));
        assert_eq!(seen["mode"], Payload::text("lower"));
        assert_eq!(seen["trim"], Payload::Bool(true));
        assert_eq!(seen["width"], Payload::Number(42.5));
        assert_eq!(
            seen["options"],
            Payload::from(serde_json::json!({ "a": 1 }))
        );
        assert!(outcome.auto_run.is_armed());
        assert_eq!(outcome.values, seen);
    }

    #[test]
    fn absent_parameters_should_resolve_to_their_defaults() {
        let (seen, outcome) = apply_collect("");

        assert_eq!(seen.len(), 5);
        assert_eq!(seen["mode"], Payload::text("upper"));
        assert_eq!(seen["width"], Payload::Number(80.0));
        assert_eq!(seen["options"], Payload::Null);
        assert!(!outcome.auto_run.is_armed());
    }

    #[test]
    fn malformed_values_should_fall_back_to_defaults() {
        let (seen, _) = apply_collect("?trim=yes&width=wide&options=%7Bnope");

        assert_eq!(seen["trim"], Payload::Bool(false));
        assert_eq!(seen["width"], Payload::Number(80.0));
        assert_eq!(seen["options"], Payload::Null);
    }

    #[test]
    fn blank_primary_input_should_not_arm_auto_run() {
        let (_, outcome) = apply_collect("?input=%20%20&mode=lower");
        assert!(!outcome.auto_run.is_armed());
    }

    #[test]
    fn first_declared_parameter_is_primary_when_none_is_named_input() {
        let sync = QueryStateSync::new(vec![
            ParamSpec::new("text", ParamKind::Text, Payload::text("")),
            ParamSpec::new("sep", ParamKind::Text, Payload::text(",")),
        ]);

        let outcome = sync.apply("?text=a,b,c", |_, _| {});
        assert!(outcome.auto_run.is_armed());

        let outcome = sync.apply("?sep=;", |_, _| {});
        assert!(!outcome.auto_run.is_armed());
    }

    #[test]
    fn auto_run_signal_should_fire_once() {
        let (_, mut outcome) = apply_collect("?input=hi");

        assert!(outcome.auto_run.take());
        assert!(!outcome.auto_run.take());

        let (_, mut outcome) = apply_collect("?input=hi");
        outcome.auto_run.reset();
        assert!(!outcome.auto_run.take());
    }

    #[test]
    fn typed_values_should_round_trip_through_an_encoded_query() {
        let specs = case_converter_specs();
        let sync = QueryStateSync::new(specs);

        let options = serde_json::json!({ "b": 2, "a": 1 });
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("input", "round trip & more")
            .append_pair("mode", "title")
            .append_pair("trim", "false")
            .append_pair("width", "12")
            .append_pair("options", &options.to_string())
            .finish();

        let outcome = sync.apply(&query, |_, _| {});
        assert_eq!(outcome.values["input"], Payload::text("round trip & more"));
        assert_eq!(outcome.values["mode"], Payload::text("title"));
        assert_eq!(outcome.values["trim"], Payload::Bool(false));
        assert_eq!(outcome.values["width"], Payload::Number(12.0));
        assert_eq!(outcome.values["options"], Payload::from(options));
    }

    #[test]
    fn later_duplicate_parameters_should_win() {
        let (seen, _) = apply_collect("?input=first&input=second");
        assert_eq!(seen["input"], Payload::text("second"));
    }
}
