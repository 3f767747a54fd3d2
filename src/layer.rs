use crate::entry::HttpRequest;
use crate::formatter::{StackdriverFormatter, KEY_HTTP_REQUEST};
use crate::record::{FieldValue, Level, LogRecord};
use chrono::Utc;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::{Arc, atomic::{AtomicU64, Ordering}};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Field that overrides the event level, e.g. `severity = "critical"`.
pub const KEY_SEVERITY: &str = "severity";

/// `tracing_subscriber` layer that renders every event as one Cloud Logging
/// JSON line and writes it through a [`MakeWriter`] (stdout by default).
///
/// Fields recorded on the spans enclosing an event are merged into the
/// event's own fields, root span first, so request-scoped values such as
/// `trace` or `httpRequest` can be attached once on a request span.
pub struct StackdriverLayer<W = fn() -> io::Stdout> {
    formatter: StackdriverFormatter,
    make_writer: W,
    /// Total events seen by the layer.
    pub total_events: Arc<AtomicU64>,
    /// Events formatted and written successfully.
    pub written_events: Arc<AtomicU64>,
    /// Events lost to a serialization or write failure.
    pub failed_events: Arc<AtomicU64>,
}

impl StackdriverLayer {
    /// Create a layer writing to stdout.
    pub fn new(formatter: StackdriverFormatter) -> Self {
        Self {
            formatter,
            make_writer: io::stdout,
            total_events: Arc::new(AtomicU64::new(0)),
            written_events: Arc::new(AtomicU64::new(0)),
            failed_events: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<W> StackdriverLayer<W> {
    /// Send formatted lines to `make_writer` instead.
    pub fn with_writer<W2>(self, make_writer: W2) -> StackdriverLayer<W2>
    where
        W2: for<'w> MakeWriter<'w> + 'static,
    {
        StackdriverLayer {
            formatter: self.formatter,
            make_writer,
            total_events: self.total_events,
            written_events: self.written_events,
            failed_events: self.failed_events,
        }
    }

    pub fn formatter(&self) -> &StackdriverFormatter {
        &self.formatter
    }
}

/// Fields recorded on a span, kept in its extensions.
#[derive(Debug, Default)]
struct SpanFields(BTreeMap<String, FieldValue>);

impl<S, W> Layer<S> for StackdriverLayer<W>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    W: for<'w> MakeWriter<'w> + 'static,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut fields = BTreeMap::new();
        let mut message = None;
        attrs.record(&mut FieldVisitor { fields: &mut fields, message: &mut message });
        span.extensions_mut().insert(SpanFields(fields));
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut extensions = span.extensions_mut();
        if let Some(SpanFields(fields)) = extensions.get_mut::<SpanFields>() {
            let mut message = None;
            values.record(&mut FieldVisitor { fields, message: &mut message });
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        self.total_events.fetch_add(1, Ordering::Relaxed);

        let mut fields = BTreeMap::new();
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                if let Some(SpanFields(span_fields)) = span.extensions().get::<SpanFields>() {
                    fields.extend(span_fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
        }

        let mut message: Option<String> = None;
        let mut visitor = FieldVisitor { fields: &mut fields, message: &mut message };
        event.record(&mut visitor);

        let meta = event.metadata();
        let mut level = Level::from(*meta.level());
        if let Some(parsed) = fields
            .get(KEY_SEVERITY)
            .and_then(FieldValue::as_str)
            .and_then(|s| s.parse::<Level>().ok())
        {
            level = parsed;
            fields.remove(KEY_SEVERITY);
        }

        let record = LogRecord {
            timestamp: Utc::now(),
            level,
            message: message.unwrap_or_default(),
            fields,
        };

        let bytes = match self.formatter.format(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.failed_events.fetch_add(1, Ordering::Relaxed);
                eprintln!("error formatting log entry: {}", e);
                return;
            }
        };

        let mut writer = self.make_writer.make_writer_for(meta);
        match writer.write_all(&bytes) {
            Ok(()) => {
                self.written_events.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.failed_events.fetch_add(1, Ordering::Relaxed);
                eprintln!("error writing log entry: {}", e);
            }
        }
    }
}

use tracing::field::{Field, Visit};

/// Collects `tracing` field values into [`FieldValue`]s.
///
/// `message` is routed to the record's message. Values recorded under
/// `httpRequest` are decoded into an [`HttpRequest`] when they hold its
/// JSON form; anything else stays a plain string.
pub struct FieldVisitor<'a> {
    pub fields: &'a mut BTreeMap<String, FieldValue>,
    pub message: &'a mut Option<String>,
}

impl<'a> FieldVisitor<'a> {
    fn insert_text(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            *self.message = Some(value);
            return;
        }
        let value = if field.name() == KEY_HTTP_REQUEST {
            match serde_json::from_str::<HttpRequest>(&value) {
                Ok(req) => FieldValue::HttpRequest(req),
                Err(_) => FieldValue::String(value),
            }
        } else {
            FieldValue::String(value)
        };
        self.fields.insert(field.name().to_string(), value);
    }
}

impl<'a> Visit for FieldVisitor<'a> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert_text(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), FieldValue::I64(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), FieldValue::U64(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), FieldValue::F64(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), FieldValue::Bool(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.fields.insert(field.name().to_string(), FieldValue::Error(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.insert_text(field, format!("{:?}", value));
    }
}
