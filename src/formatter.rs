use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::sync::Arc;

use crate::entry::{Context, Entry, ServiceContext};
use crate::error::FormatError;
use crate::origin::{self, BacktraceFrames, FrameSource};
use crate::record::{FieldValue, LogRecord, KEY_ERROR};

/// Field carrying the trace identifier.
pub const KEY_TRACE: &str = "trace";
/// Field carrying the span identifier.
pub const KEY_SPAN_ID: &str = "spanID";
/// Field carrying an [`HttpRequest`](crate::entry::HttpRequest).
pub const KEY_HTTP_REQUEST: &str = "httpRequest";
/// Field carrying the log id, promoted to `logName` when a project is set.
pub const KEY_LOG_ID: &str = "logID";

/// Packages skipped during origin resolution unless the caller adds more:
/// the host logging library itself.
pub const DEFAULT_STACK_SKIP: &[&str] = &["tracing", "tracing_core", "tracing_subscriber"];

/// Where entry timestamps come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Clock {
    /// The record's own capture time, stamped from the wall clock.
    #[default]
    System,
    /// Every entry carries the same instant.
    Fixed(DateTime<Utc>),
    /// No timestamp is emitted; used for golden-output tests.
    Disabled,
}

impl Clock {
    fn stamp(&self, record: &LogRecord) -> Option<String> {
        let at = match self {
            Clock::System => record.timestamp,
            Clock::Fixed(at) => *at,
            Clock::Disabled => return None,
        };
        Some(at.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }
}

/// Formatter settings, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatterConfig {
    pub service: String,
    pub version: String,
    pub project_id: Option<String>,
    /// Module paths excluded when resolving an error's origin.
    pub stack_skip: Vec<String>,
    pub clock: Clock,
}

impl Default for FormatterConfig {
    fn default() -> Self {
        Self {
            service: String::new(),
            version: String::new(),
            project_id: None,
            stack_skip: DEFAULT_STACK_SKIP.iter().map(|s| s.to_string()).collect(),
            clock: Clock::default(),
        }
    }
}

/// Builder for [`StackdriverFormatter`].
pub struct FormatterBuilder {
    config: FormatterConfig,
    frames: Arc<dyn FrameSource>,
}

impl Default for FormatterBuilder {
    fn default() -> Self {
        Self {
            config: FormatterConfig::default(),
            frames: Arc::new(BacktraceFrames),
        }
    }
}

impl FormatterBuilder {
    /// Service name reported to Error Reporting.
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.config.service = service.into();
        self
    }

    /// Service version reported to Error Reporting.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.config.version = version.into();
        self
    }

    /// Project used to build fully-qualified `logName`s.
    pub fn project_id(mut self, project_id: impl Into<String>) -> Self {
        self.config.project_id = Some(project_id.into());
        self
    }

    /// Skip frames from `module` (and its submodules) when locating an
    /// error. Appends to [`DEFAULT_STACK_SKIP`]; may be called repeatedly.
    pub fn stack_skip(mut self, module: impl Into<String>) -> Self {
        self.config.stack_skip.push(module.into());
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.config.clock = clock;
        self
    }

    /// Replace the call-stack capture, e.g. with fixed frames in tests.
    pub fn frame_source(mut self, frames: Arc<dyn FrameSource>) -> Self {
        self.frames = frames;
        self
    }

    pub fn build(self) -> StackdriverFormatter {
        StackdriverFormatter {
            config: self.config,
            frames: self.frames,
        }
    }
}

/// Turns [`LogRecord`]s into Cloud Logging JSON lines.
///
/// Stateless apart from its configuration, so one instance can be shared
/// across threads.
#[derive(Clone)]
pub struct StackdriverFormatter {
    config: FormatterConfig,
    frames: Arc<dyn FrameSource>,
}

impl Default for StackdriverFormatter {
    fn default() -> Self {
        FormatterBuilder::default().build()
    }
}

impl fmt::Debug for StackdriverFormatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackdriverFormatter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StackdriverFormatter {
    pub fn builder() -> FormatterBuilder {
        FormatterBuilder::default()
    }

    pub fn config(&self) -> &FormatterConfig {
        &self.config
    }

    /// Map a record onto the provider's entry structure.
    ///
    /// Recognized fields are moved out of `context.data` into their
    /// dedicated positions. Error-level entries fold an attached error into
    /// the message and carry the call-site location when one can be found.
    pub fn to_entry(&self, record: &LogRecord) -> Entry {
        let severity = record.level.severity();

        let data = record
            .fields
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    FieldValue::Error(text) => FieldValue::String(text.clone()),
                    other => other.clone(),
                };
                (k.clone(), v)
            })
            .collect();

        let mut entry = Entry {
            message: record.message.clone(),
            severity,
            context: Context {
                data,
                ..Default::default()
            },
            service_context: ServiceContext {
                service: self.config.service.clone(),
                version: self.config.version.clone(),
            },
            ..Default::default()
        };

        // Empty identifiers are consumed but not emitted.
        entry.trace = take_str(&mut entry.context, KEY_TRACE).filter(|s| !s.is_empty());
        entry.span_id = take_str(&mut entry.context, KEY_SPAN_ID).filter(|s| !s.is_empty());

        if let Some(FieldValue::HttpRequest(req)) = take_if(&mut entry.context, KEY_HTTP_REQUEST, |v| {
            v.as_http_request().is_some()
        }) {
            entry.context.http_request = Some(req.clone());
            entry.http_request = Some(req);
        }

        // Without a project the log id stays in the context data untouched.
        if let Some(project) = self.config.project_id.as_deref().filter(|p| !p.is_empty()) {
            if let Some(log_id) = take_str(&mut entry.context, KEY_LOG_ID) {
                entry.log_name = Some(format!("projects/{}/logs/{}", project, query_escape(&log_id)));
            }
        }

        entry.timestamp = self.config.clock.stamp(record);

        if severity.is_some_and(|s| s.is_error()) {
            // Error Reporting expects the error text as part of the message.
            if let Some(err) = entry.context.data.remove(KEY_ERROR) {
                entry.message = format!("{}: {}", record.message, err);
            }

            let frames = self.frames.caller_frames();
            if let Some(location) = origin::resolve(&frames, &self.config.stack_skip) {
                entry.context.report_location = Some(location.clone());
                entry.source_location = Some(location);
            }
        }

        entry
    }

    /// Format a record as one JSON document followed by a newline.
    pub fn format(&self, record: &LogRecord) -> Result<Vec<u8>, FormatError> {
        let entry = self.to_entry(record);
        let mut bytes = serde_json::to_vec(&entry)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

fn take_if(
    context: &mut Context,
    key: &str,
    accept: impl Fn(&FieldValue) -> bool,
) -> Option<FieldValue> {
    if context.data.get(key).is_some_and(accept) {
        context.data.remove(key)
    } else {
        None
    }
}

/// Query-component escaping: unreserved characters pass through and a space
/// becomes `+`.
fn query_escape(s: &str) -> String {
    urlencoding::encode(s).replace("%20", "+")
}

fn take_str(context: &mut Context, key: &str) -> Option<String> {
    match take_if(context, key, |v| v.as_str().is_some()) {
        Some(FieldValue::String(s)) => Some(s),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{HttpRequest, ReportLocation, Severity};
    use crate::origin::Frame;
    use crate::record::Level;
    use serde_json::{json, Value};

    struct FixedFrames(Vec<Frame>);

    impl FrameSource for FixedFrames {
        fn caller_frames(&self) -> Vec<Frame> {
            self.0.clone()
        }
    }

    fn app_frames() -> Arc<dyn FrameSource> {
        Arc::new(FixedFrames(vec![
            Frame::from_symbol("tracing_core::event::Event::dispatch", None, None),
            Frame::from_symbol("my_app::log::error", Some("src/log.rs".into()), Some(8)),
            Frame::from_symbol("my_app::handlers::create_user", Some("src/handlers.rs".into()), Some(42)),
        ]))
    }

    fn formatter() -> StackdriverFormatter {
        StackdriverFormatter::builder()
            .service("test")
            .version("0.1")
            .clock(Clock::Disabled)
            .frame_source(app_frames())
            .build()
    }

    fn render(formatter: &StackdriverFormatter, record: &LogRecord) -> Value {
        let bytes = formatter.format(record).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
        serde_json::from_slice(&bytes).unwrap()
    }

    fn location(file: &str, line: u32, function: &str) -> Value {
        json!({ "filePath": file, "lineNumber": line, "functionName": function })
    }

    #[test]
    fn bare_info_keeps_empty_context() {
        let out = render(&formatter(), &LogRecord::new(Level::Info, "up and running"));
        assert_eq!(
            out,
            json!({
                "serviceContext": { "service": "test", "version": "0.1" },
                "message": "up and running",
                "severity": "INFO",
                "context": {}
            })
        );
    }

    #[test]
    fn info_with_field() {
        let record = LogRecord::new(Level::Info, "my log entry").with_field("foo", "bar");
        let out = render(&formatter(), &record);
        assert_eq!(out["context"], json!({ "data": { "foo": "bar" } }));
        assert!(out.get("sourceLocation").is_none());
    }

    #[test]
    fn error_with_field_reports_location() {
        let record = LogRecord::new(Level::Error, "my log entry").with_field("foo", "bar");
        let out = render(&formatter(), &record);
        assert_eq!(
            out,
            json!({
                "serviceContext": { "service": "test", "version": "0.1" },
                "message": "my log entry",
                "severity": "ERROR",
                "context": {
                    "data": { "foo": "bar" },
                    "reportLocation": location("src/log.rs", 8, "error")
                },
                "sourceLocation": location("src/log.rs", 8, "error")
            })
        );
    }

    #[test]
    fn stack_skip_moves_location_to_real_caller() {
        let formatter = StackdriverFormatter::builder()
            .clock(Clock::Disabled)
            .stack_skip("my_app::log")
            .frame_source(app_frames())
            .build();
        let out = render(&formatter, &LogRecord::new(Level::Error, "boom"));
        let expected = location("src/handlers.rs", 42, "create_user");
        assert_eq!(out["sourceLocation"], expected);
        assert_eq!(out["context"]["reportLocation"], expected);
    }

    #[test]
    fn error_folds_attached_error_into_message() {
        let err = "text".parse::<i64>().unwrap_err();
        let record = LogRecord::new(Level::Error, "unable to parse integer")
            .with_field("foo", "bar")
            .with_error(&err);
        let out = render(&formatter(), &record);
        assert_eq!(
            out["message"],
            "unable to parse integer: invalid digit found in string"
        );
        assert_eq!(out["context"]["data"], json!({ "foo": "bar" }));
    }

    #[test]
    fn warning_keeps_error_as_plain_field() {
        let err = "text".parse::<i64>().unwrap_err();
        let record = LogRecord::new(Level::Warning, "unable to parse integer").with_error(&err);
        let out = render(&formatter(), &record);
        assert_eq!(out["message"], "unable to parse integer");
        assert_eq!(out["severity"], "WARNING");
        assert_eq!(
            out["context"]["data"],
            json!({ "error": "invalid digit found in string" })
        );
        assert!(out.get("sourceLocation").is_none());
        assert!(out["context"].get("reportLocation").is_none());
    }

    #[test]
    fn errors_under_other_keys_are_stringified() {
        let record = LogRecord::new(Level::Info, "retrying")
            .with_field("cause", FieldValue::Error("connection reset".into()));
        let entry = formatter().to_entry(&record);
        assert_eq!(
            entry.context.data.get("cause"),
            Some(&FieldValue::String("connection reset".into()))
        );
    }

    #[test]
    fn critical_and_alert_are_error_class() {
        for (level, severity) in [(Level::Fatal, "CRITICAL"), (Level::Panic, "ALERT")] {
            let record = LogRecord::new(level, "down").with_field("error", "disk full");
            let out = render(&formatter(), &record);
            assert_eq!(out["severity"], severity);
            assert_eq!(out["message"], "down: disk full");
            assert!(out.get("sourceLocation").is_some());
        }
    }

    #[test]
    fn trace_level_has_no_severity() {
        let entry = formatter().to_entry(&LogRecord::new(Level::Trace, "noise"));
        assert_eq!(entry.severity, None);
        let out = render(&formatter(), &LogRecord::new(Level::Trace, "noise"));
        assert!(out.get("severity").is_none());
    }

    #[test]
    fn trace_and_span_are_promoted() {
        let record = LogRecord::new(Level::Info, "my log entry")
            .with_field(KEY_TRACE, "my-trace")
            .with_field(KEY_SPAN_ID, "my-span");
        let out = render(&formatter(), &record);
        assert_eq!(out["trace"], "my-trace");
        assert_eq!(out["spanId"], "my-span");
        assert_eq!(out["context"], json!({}));
    }

    #[test]
    fn wrong_shape_under_recognized_key_stays_in_data() {
        let record = LogRecord::new(Level::Info, "odd")
            .with_field(KEY_TRACE, 42i64)
            .with_field(KEY_HTTP_REQUEST, "GET /");
        let out = render(&formatter(), &record);
        assert!(out.get("trace").is_none());
        assert!(out.get("httpRequest").is_none());
        assert_eq!(
            out["context"]["data"],
            json!({ "trace": 42, "httpRequest": "GET /" })
        );
    }

    #[test]
    fn http_request_is_echoed_in_context() {
        let req = HttpRequest {
            request_method: "GET".into(),
            ..Default::default()
        };
        let record = LogRecord::new(Level::Error, "my log entry")
            .with_field("foo", "bar")
            .with_field(KEY_HTTP_REQUEST, req);
        let out = render(&formatter(), &record);
        assert_eq!(out["httpRequest"], json!({ "requestMethod": "GET" }));
        assert_eq!(out["context"]["httpRequest"], json!({ "requestMethod": "GET" }));
        assert_eq!(out["context"]["data"], json!({ "foo": "bar" }));
    }

    #[test]
    fn log_id_with_project_builds_log_name() {
        let formatter = StackdriverFormatter::builder()
            .service("test")
            .version("0.1")
            .project_id("my-project-id")
            .clock(Clock::Disabled)
            .build();
        let record = LogRecord::new(Level::Info, "my log entry").with_field(KEY_LOG_ID, "my id/1");
        let out = render(&formatter, &record);
        assert_eq!(out["logName"], "projects/my-project-id/logs/my+id%2F1");
        assert_eq!(out["context"], json!({}));
    }

    #[test]
    fn log_id_without_project_stays_in_data() {
        let record = LogRecord::new(Level::Info, "my log entry").with_field(KEY_LOG_ID, "my-id");
        let out = render(&formatter(), &record);
        assert!(out.get("logName").is_none());
        assert_eq!(out["context"]["data"], json!({ "logID": "my-id" }));
    }

    #[test]
    fn empty_service_context_is_omitted() {
        let formatter = StackdriverFormatter::builder().clock(Clock::Disabled).build();
        let out = render(&formatter, &LogRecord::new(Level::Info, "hi"));
        assert_eq!(out, json!({ "message": "hi", "severity": "INFO", "context": {} }));
    }

    #[test]
    fn unresolved_origin_leaves_locations_unset() {
        let formatter = StackdriverFormatter::builder()
            .clock(Clock::Disabled)
            .frame_source(Arc::new(FixedFrames(vec![Frame::from_symbol(
                "tracing::__macro_support::dispatch",
                None,
                None,
            )])))
            .build();
        let entry = formatter.to_entry(&LogRecord::new(Level::Error, "boom"));
        assert_eq!(entry.severity, Some(Severity::Error));
        assert_eq!(entry.source_location, None::<ReportLocation>);
        assert_eq!(entry.context.report_location, None);
    }

    #[test]
    fn fixed_clock_uses_nanosecond_rfc3339() {
        let at = DateTime::parse_from_rfc3339("2020-10-12T12:26:00.5Z")
            .unwrap()
            .with_timezone(&Utc);
        let formatter = StackdriverFormatter::builder().clock(Clock::Fixed(at)).build();
        let out = render(&formatter, &LogRecord::new(Level::Info, "tick"));
        assert_eq!(out["timestamp"], "2020-10-12T12:26:00.500000000Z");
    }

    #[test]
    fn system_clock_uses_record_time() {
        let at = DateTime::parse_from_rfc3339("2021-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let record = LogRecord::new(Level::Info, "tick").with_timestamp(at);
        let entry = StackdriverFormatter::default().to_entry(&record);
        assert_eq!(entry.timestamp.as_deref(), Some("2021-01-02T03:04:05.000000000Z"));
    }

    #[test]
    fn output_has_no_nulls_or_empty_values() {
        let record = LogRecord::new(Level::Error, "m")
            .with_field("n", 1u64)
            .with_field(KEY_TRACE, "")
            .with_field(KEY_SPAN_ID, "");
        let out = render(&formatter(), &record);
        fn check(path: &str, v: &Value) {
            match v {
                Value::Null => panic!("null at {}", path),
                Value::String(s) => assert!(!s.is_empty(), "empty string at {}", path),
                Value::Object(map) => {
                    if path != "context" {
                        assert!(!map.is_empty(), "empty object at {}", path);
                    }
                    for (k, v) in map {
                        check(k, v);
                    }
                }
                _ => {}
            }
        }
        for (k, v) in out.as_object().unwrap() {
            check(k, v);
        }
    }

    #[test]
    fn empty_trace_and_span_are_dropped() {
        let record = LogRecord::new(Level::Info, "m")
            .with_field(KEY_TRACE, "")
            .with_field(KEY_SPAN_ID, "");
        let out = render(&formatter(), &record);
        assert!(out.get("trace").is_none());
        assert!(out.get("spanId").is_none());
        assert_eq!(out["context"], json!({}));
    }

    #[test]
    fn log_id_escaping_matches_query_component_rules() {
        assert_eq!(query_escape("a b~c*d"), "a+b~c%2Ad");
        assert_eq!(query_escape("svc/log-1_x.y"), "svc%2Flog-1_x.y");
    }

    #[test]
    fn json_string_error_folds_without_quotes() {
        let record = LogRecord::new(Level::Error, "sync failed")
            .with_field(KEY_ERROR, json!("upstream timeout"));
        let out = render(&formatter(), &record);
        assert_eq!(out["message"], "sync failed: upstream timeout");
    }

    #[test]
    fn default_skip_list_contains_host_library() {
        let formatter = StackdriverFormatter::builder().stack_skip("my_app::log").build();
        assert_eq!(
            formatter.config().stack_skip,
            vec!["tracing", "tracing_core", "tracing_subscriber", "my_app::log"]
        );
    }
}
