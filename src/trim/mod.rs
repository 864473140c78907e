//! Privacy filtering and size trimming of assembled traces.
//!
//! Both transforms are pure and deterministic, and neither can fail: they run on the way out of
//! the process, where a trace that cannot be filtered or trimmed perfectly is still better sent
//! than lost.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;

use crate::{
    api::{Event, MetadataValue, Trace},
    tracer::LABELS_KEY,
};

/// Replacement value for masked keys.
pub const REDACTED: &str = "****";

/// Structured values nested deeper than this are left untouched by [`filter_trace`].
pub const MAX_FILTER_DEPTH: usize = 32;

/// Metadata keys essential for correlating an event with the outside world. These survive
/// metadata trimming.
pub static STRONG_KEYS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "key",
        "id",
        "request_id",
        "requestId",
        "request-id",
        "message_id",
        "messageId",
        "message-id",
        "trace_id",
        "span_id",
        "parent_span_id",
        "traceparent",
        "sid",
        "user_id",
        "user",
        "url",
        "path",
        "status",
        "status_code",
        "function",
        "function_name",
        "resource_name",
        "table_name",
        "queue_name",
        "queue_url",
        "topic",
        "topic_arn",
        "subscription_arn",
        "bucket",
        "host",
        "database",
        "operation_id",
        "aws_account",
        "region",
    ]
    .into_iter()
    .collect()
});

/// A metadata key to filter, either an exact name (compared after [`normalize_key`]) or a
/// regular expression matched against the raw key.
#[derive(Clone, Debug)]
pub enum IgnoredKey {
    Exact(String),
    Pattern(Regex),
}

impl IgnoredKey {
    /// Parse a configured key. `/.../` denotes a pattern, anything else an exact key.
    pub fn parse(s: &str) -> Result<IgnoredKey, regex::Error> {
        let s = s.trim();
        if s.len() > 2 && s.starts_with('/') && s.ends_with('/') {
            Ok(IgnoredKey::Pattern(Regex::new(&s[1..s.len() - 1])?))
        } else {
            Ok(IgnoredKey::Exact(normalize_key(s)))
        }
    }

    /// Parse every configured key, skipping (and logging) invalid patterns.
    pub fn parse_all<S: AsRef<str>>(keys: &[S]) -> Vec<IgnoredKey> {
        keys.iter()
            .filter_map(|k| match IgnoredKey::parse(k.as_ref()) {
                Ok(key) => Some(key),
                Err(e) => {
                    tracing::warn!(
                        key = k.as_ref(),
                        err = &e as &dyn std::error::Error,
                        "Ignoring invalid ignored-key pattern"
                    );
                    None
                }
            })
            .collect()
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            IgnoredKey::Exact(normalized) => *normalized == normalize_key(key),
            IgnoredKey::Pattern(re) => re.is_match(key),
        }
    }
}

/// Lowercase, without `-`, `_` or spaces, so `X-Api-Key`, `x_api_key` and `xapikey` compare
/// equal.
pub fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

fn is_ignored(ignored: &[IgnoredKey], key: &str) -> bool {
    ignored.iter().any(|k| k.matches(key))
}

/// Mask (or, with `remove`, delete) every metadata key matching `ignored`, at any depth of
/// structured values. Text values holding a JSON document are filtered too; text that does not
/// parse is left alone.
pub fn filter_trace(trace: &mut Trace, ignored: &[IgnoredKey], remove: bool) {
    if ignored.is_empty() {
        return;
    }
    for event in &mut trace.events {
        filter_event(event, ignored, remove);
    }
}

fn filter_event(event: &mut Event, ignored: &[IgnoredKey], remove: bool) {
    let metadata = event.metadata_mut();
    let matched: Vec<String> = metadata
        .keys()
        .filter(|k| is_ignored(ignored, k))
        .cloned()
        .collect();

    for key in matched {
        if remove {
            metadata.remove(&key);
        } else {
            metadata.insert(key, MetadataValue::Text(REDACTED.to_string()));
        }
    }

    for value in metadata.values_mut() {
        match value {
            MetadataValue::Structured(v) => filter_value(v, ignored, remove, 0),
            MetadataValue::Text(s) => {
                if let Some(filtered) = filter_embedded_json(s, ignored, remove) {
                    *s = filtered;
                }
            }
        }
    }
}

fn filter_embedded_json(s: &str, ignored: &[IgnoredKey], remove: bool) -> Option<String> {
    let trimmed = s.trim_start();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return None;
    }
    let mut parsed: Value = serde_json::from_str(s).ok()?;
    let before = parsed.clone();
    filter_value(&mut parsed, ignored, remove, 0);
    if parsed == before {
        return None;
    }
    serde_json::to_string(&parsed).ok()
}

fn filter_value(value: &mut Value, ignored: &[IgnoredKey], remove: bool, depth: usize) {
    if depth >= MAX_FILTER_DEPTH {
        return;
    }
    match value {
        Value::Object(map) => {
            let matched: Vec<String> = map
                .keys()
                .filter(|k| is_ignored(ignored, k))
                .cloned()
                .collect();
            for key in matched {
                if remove {
                    map.remove(&key);
                } else {
                    map.insert(key, Value::String(REDACTED.to_string()));
                }
            }
            for v in map.values_mut() {
                filter_value(v, ignored, remove, depth + 1);
            }
        }
        Value::Array(items) => {
            for v in items {
                filter_value(v, ignored, remove, depth + 1);
            }
        }
        _ => (),
    }
}

/// Size of the trace's JSON encoding, in bytes.
pub fn serialized_size(trace: &Trace) -> Result<usize, serde_json::Error> {
    serde_json::to_vec(trace).map(|v| v.len())
}

fn measure(trace: &Trace) -> usize {
    // an unmeasurable trace is treated as too big, so trimming keeps going
    serialized_size(trace).unwrap_or(usize::MAX)
}

/// Shrink a trace of `size` bytes until it is under `max_size`, in strictly ordered steps,
/// re-measuring after each one:
///
/// 1. keep only the first process-level exception;
/// 2. move runner and trigger events to the front, then strip metadata down to [`STRONG_KEYS`]
///    from the last event backwards (the runner also keeps its labels);
/// 3. drop whole events from the end, never the runner or a trigger.
///
/// A trace already under `max_size` is returned unchanged.
pub fn get_trimmed_trace(size: usize, mut trace: Trace, max_size: usize) -> Trace {
    if size < max_size {
        return trace;
    }
    let mut size = size;

    if trace.exceptions.len() > 1 {
        trace.exceptions.truncate(1);
        size = measure(&trace);
    }

    // stable, so protected events keep their relative order, as do the rest
    trace.events.sort_by_key(|e| !e.origin.is_protected());

    for i in (0..trace.events.len()).rev() {
        if size < max_size {
            break;
        }
        strip_to_strong_keys(&mut trace.events[i]);
        size = measure(&trace);
    }

    while size >= max_size {
        let Some(last_disposable) = trace.events.iter().rposition(|e| !e.origin.is_protected())
        else {
            break;
        };
        trace.events.remove(last_disposable);
        size = measure(&trace);
    }

    tracing::debug!(size, max_size, events = trace.events.len(), "Trimmed trace");
    trace
}

fn strip_to_strong_keys(event: &mut Event) {
    let is_runner = event.origin.is_runner();
    event
        .metadata_mut()
        .retain(|k, _| STRONG_KEYS.contains(k.as_str()) || (is_runner && k == LABELS_KEY));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{proptest_strategies, Exception, ErrorInfo, Metadata, Origin, Resource};
    use crate::metadata;
    use proptest::prelude::*;
    use serde_json::json;

    fn event(name: &str, origin: impl Into<Origin>, metadata: Metadata) -> Event {
        let mut resource = Resource::new("http", name, "GET");
        resource.metadata = metadata;
        Event::new(resource, origin)
    }

    fn trace(events: Vec<Event>, exceptions: usize) -> Trace {
        Trace {
            app_name: "app".into(),
            token: "token".into(),
            events,
            exceptions: (0..exceptions)
                .map(|i| Exception::new(ErrorInfo::new("E", format!("exception {i}"))))
                .collect(),
            version: "1.0.0".into(),
            platform: "Rust".into(),
        }
    }

    fn keys(ignored: &[&str]) -> Vec<IgnoredKey> {
        IgnoredKey::parse_all(ignored)
    }

    #[test]
    fn key_normalization() {
        assert_eq!("xapikey", normalize_key("X-Api_Key"));
        assert!(IgnoredKey::parse("api-key").unwrap().matches("API_KEY"));
        assert!(IgnoredKey::parse("/^x-.*-token$/").unwrap().matches("x-auth-token"));
        assert!(!IgnoredKey::parse("/^x-.*-token$/").unwrap().matches("token"));
        assert!(IgnoredKey::parse("/[/").is_err());
        assert_eq!(1, keys(&["/[/", "password"]).len());
    }

    #[test]
    fn masks_nested_keys() {
        let mut t = trace(
            vec![event(
                "api",
                "http",
                metadata! {
                    "password" => "hunter2",
                    "request" => json!({"headers": {"Authorization": "Bearer x"}, "items": [{"password": "p"}]}),
                    "body" => r#"{"password": "inside", "ok": 1}"#,
                    "raw" => "{not json",
                },
            )],
            0,
        );
        filter_trace(&mut t, &keys(&["password", "authorization"]), false);

        let m = t.events[0].metadata();
        assert_eq!(Some(&MetadataValue::from(REDACTED)), m.get("password"));
        assert_eq!(
            Some(&MetadataValue::Structured(
                json!({"headers": {"Authorization": REDACTED}, "items": [{"password": REDACTED}]})
            )),
            m.get("request")
        );
        let body: Value = serde_json::from_str(m.get("body").unwrap().as_text().unwrap()).unwrap();
        assert_eq!(json!({"password": REDACTED, "ok": 1}), body);
        assert_eq!(Some(&MetadataValue::from("{not json")), m.get("raw"));
    }

    #[test]
    fn removes_nested_keys() {
        let mut t = trace(
            vec![event(
                "api",
                "http",
                metadata! { "secret" => "s", "nested" => json!({"secret": 1, "keep": 2}) },
            )],
            0,
        );
        filter_trace(&mut t, &keys(&["secret"]), true);
        let m = t.events[0].metadata();
        assert!(!m.contains_key("secret"));
        assert_eq!(
            Some(&MetadataValue::Structured(json!({"keep": 2}))),
            m.get("nested")
        );
    }

    #[test]
    fn deep_values_are_skipped() {
        let mut deep = json!({"password": "p"});
        for _ in 0..(MAX_FILTER_DEPTH + 4) {
            deep = json!({ "next": deep });
        }
        let mut t = trace(vec![event("api", "http", metadata! { "deep" => deep.clone() })], 0);
        filter_trace(&mut t, &keys(&["password"]), false);
        assert_eq!(
            Some(&MetadataValue::Structured(deep)),
            t.events[0].metadata().get("deep")
        );
    }

    /// Every key path in the trace's metadata. Values under ignored keys are not descended into,
    /// masking replaces them whole.
    fn key_paths(v: &Value, prefix: String, ignored: &[IgnoredKey], out: &mut Vec<String>) {
        match v {
            Value::Object(map) => {
                for (k, v) in map {
                    let path = format!("{prefix}/{k}");
                    out.push(path.clone());
                    if !is_ignored(ignored, k) {
                        key_paths(v, path, ignored, out);
                    }
                }
            }
            Value::Array(items) => {
                for (i, v) in items.iter().enumerate() {
                    key_paths(v, format!("{prefix}[{i}]"), ignored, out);
                }
            }
            _ => (),
        }
    }

    fn all_key_paths(t: &Trace, ignored: &[IgnoredKey]) -> Vec<String> {
        let mut out = Vec::new();
        for (i, e) in t.events.iter().enumerate() {
            for (k, v) in e.metadata() {
                let path = format!("{i}/{k}");
                out.push(path.clone());
                if let (MetadataValue::Structured(v), false) = (v, is_ignored(ignored, k)) {
                    key_paths(v, path, ignored, &mut out);
                }
            }
        }
        out.sort();
        out
    }

    proptest! {
        #[test]
        fn masking_preserves_key_set(events in prop::collection::vec(proptest_strategies::event(), 0..4)) {
            let ignored = keys(&["password", "apikey", "/^user/"]);
            let original = trace(events, 0);
            let mut masked = original.clone();
            filter_trace(&mut masked, &ignored, false);
            prop_assert_eq!(all_key_paths(&original, &ignored), all_key_paths(&masked, &ignored));
        }

        #[test]
        fn removal_only_removes(events in prop::collection::vec(proptest_strategies::event(), 0..4)) {
            let ignored = keys(&["password", "apikey"]);
            let original = trace(events, 0);
            let mut filtered = original.clone();
            filter_trace(&mut filtered, &ignored, true);

            let before = all_key_paths(&original, &[]);
            let after = all_key_paths(&filtered, &[]);
            for path in &after {
                prop_assert!(before.contains(path));
                let last = path.rsplit('/').next().unwrap();
                prop_assert!(!ignored.iter().any(|k| k.matches(last)));
            }
        }

        #[test]
        fn trimming_keeps_protected_events(
            events in prop::collection::vec(proptest_strategies::event(), 0..12),
            max_size in 200usize..4000,
        ) {
            let mut all = vec![event("runner", Origin::Runner, metadata! { "payload" => "r".repeat(100) })];
            all.extend(events);
            let t = trace(all, 2);
            let protected = t.events.iter().filter(|e| e.origin.is_protected()).count();
            let size = serialized_size(&t).unwrap();

            let trimmed = get_trimmed_trace(size, t, max_size);
            prop_assert!(trimmed.runner().is_some());
            prop_assert_eq!(
                protected,
                trimmed.events.iter().filter(|e| e.origin.is_protected()).count()
            );
        }
    }

    #[test]
    fn under_budget_is_unchanged() {
        let t = trace(
            vec![
                event("db", "sql", metadata! { "payload" => "x" }),
                event("job-1", Origin::Runner, Metadata::new()),
            ],
            3,
        );
        let size = serialized_size(&t).unwrap();
        assert_eq!(t, get_trimmed_trace(size, t.clone(), 1_000_000));
    }

    #[test]
    fn single_runner_within_budget() {
        let mut runner = event("job-1", Origin::Runner, Metadata::new());
        runner.resource.resource_type = "batch".into();
        runner.resource.operation = "invoke".into();
        let t = trace(vec![runner], 0);
        let size = serialized_size(&t).unwrap();
        assert!(size < 1_000_000);

        let trimmed = get_trimmed_trace(size, t.clone(), 1_000_000);
        assert_eq!(1, trimmed.events.len());
        assert_eq!(t, trimmed);
    }

    #[test]
    fn exceptions_trimmed_first() {
        let t = trace(
            vec![
                event("job-1", Origin::Runner, Metadata::new()),
                event("db", "sql", metadata! { "payload" => "x".repeat(500) }),
            ],
            3,
        );
        let size = serialized_size(&t).unwrap();
        let mut one_exception = t.clone();
        one_exception.exceptions.truncate(1);
        let budget = serialized_size(&one_exception).unwrap() + 1;
        assert!(size >= budget);

        let trimmed = get_trimmed_trace(size, t, budget);
        assert_eq!(1, trimmed.exceptions.len());
        assert_eq!("exception 0", trimmed.exceptions[0].message);
        // already under budget after exception trimming, so metadata is intact
        assert!(trimmed.events[1].metadata().contains_key("payload"));
    }

    #[test]
    fn metadata_trimming_resolves_without_dropping_events() {
        let mut events = vec![event(
            "job-1",
            Origin::Runner,
            metadata! { "request_id" => "r-1" },
        )];
        for i in 0..50 {
            events.push(event(
                &format!("call-{i}"),
                "http",
                metadata! {
                    "url" => format!("https://example.com/{i}"),
                    "response_body" => "b".repeat(1_000),
                },
            ));
        }
        let t = trace(events, 0);
        let size = serialized_size(&t).unwrap();

        let mut stripped = t.clone();
        for e in &mut stripped.events {
            strip_to_strong_keys(e);
        }
        let budget = serialized_size(&stripped).unwrap() + 1;
        assert!(size > budget * 2);

        let trimmed = get_trimmed_trace(size, t, budget);
        assert_eq!(51, trimmed.events.len());
        assert!(trimmed.events[0].origin.is_runner());
        for e in &trimmed.events[1..] {
            assert_eq!(vec!["url"], e.metadata().keys().collect::<Vec<_>>());
        }
        assert!(serialized_size(&trimmed).unwrap() < budget);
    }

    #[test]
    fn drops_disposable_events_from_the_end() {
        let mut events = vec![
            event("first", "http", Metadata::new()),
            event("trigger", Origin::Trigger, Metadata::new()),
        ];
        for i in 0..20 {
            events.push(event(&format!("call-{i}"), "http", Metadata::new()));
        }
        events.push(event("job-1", Origin::Runner, Metadata::new()));
        let t = trace(events, 0);
        let size = serialized_size(&t).unwrap();

        let trimmed = get_trimmed_trace(size, t, size / 3);
        assert!(serialized_size(&trimmed).unwrap() < size / 3);
        // protected events first, in their original relative order
        assert!(trimmed.events[0].origin == Origin::Trigger);
        assert!(trimmed.events[1].origin.is_runner());
        // survivors are the earliest disposable events
        assert_eq!("first", trimmed.events[2].resource.name);
    }

    #[test]
    fn runner_keeps_labels() {
        let mut runner = event(
            "job-1",
            Origin::Runner,
            metadata! { LABELS_KEY => json!({"team": "a"}), "payload" => "p".repeat(1_000) },
        );
        strip_to_strong_keys(&mut runner);
        assert_eq!(vec![LABELS_KEY], runner.metadata().keys().collect::<Vec<_>>());
    }

    #[test]
    fn never_drops_protected_even_if_over_budget() {
        let t = trace(
            vec![
                event("job-1", Origin::Runner, Metadata::new()),
                event("trigger", Origin::Trigger, Metadata::new()),
                event("db", "sql", Metadata::new()),
            ],
            0,
        );
        let size = serialized_size(&t).unwrap();
        let trimmed = get_trimmed_trace(size, t, 10);
        assert_eq!(2, trimmed.events.len());
        assert!(trimmed.events.iter().all(|e| e.origin.is_protected()));
    }
}
