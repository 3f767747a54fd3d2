//! Output side of the formatter: the Cloud Logging `LogEntry` shape.
//!
//! Every field is dropped from the JSON when empty, except
//! [`Entry::context`], which is always emitted (possibly as `{}`).
//! See <https://cloud.google.com/logging/docs/reference/v2/rest/v2/LogEntry>.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::record::FieldValue;

/// Output-side severity vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
    Alert,
}

impl Severity {
    /// `true` for severities that are reported to Error Reporting.
    pub fn is_error(self) -> bool {
        matches!(self, Severity::Error | Severity::Critical | Severity::Alert)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
            Severity::Alert => "ALERT",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service identity used by Error Reporting to group errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceContext {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub service: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
}

impl ServiceContext {
    pub fn is_empty(&self) -> bool {
        self.service.is_empty() && self.version.is_empty()
    }
}

/// Where an error-level entry was logged from.
///
/// Appears twice in the output: under `context.reportLocation` (Error
/// Reporting) and as the top-level `sourceLocation` (Cloud Logging).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportLocation {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub file_path: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub line_number: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub function_name: String,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Details of an HTTP request/response pair attached to a log entry.
///
/// Attach it under the `httpRequest` field. Its [`Display`](fmt::Display)
/// form is the JSON document, so `tracing::info!(httpRequest = %req, ..)`
/// round-trips through the layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request_method: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request_size: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub response_size: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub remote_ip: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub server_ip: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub referer: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub latency: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

impl fmt::Display for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

/// Free-form part of the entry, always present in the output.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, FieldValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_location: Option<ReportLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_request: Option<HttpRequest>,
}

/// One output line, built per call by
/// [`StackdriverFormatter::to_entry`](crate::formatter::StackdriverFormatter::to_entry).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_request: Option<HttpRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(skip_serializing_if = "ServiceContext::is_empty")]
    pub service_context: ServiceContext,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    pub context: Context,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_location: Option<ReportLocation>,
}
