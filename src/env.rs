//! Environment variable names used by this crate for convenient
//! configuration of the formatter on managed Google Cloud runtimes.
//!
//! These are purely helpers; the formatter itself never reads the
//! environment unless [`FormatterBuilder::from_env`] is called.

use crate::formatter::FormatterBuilder;

/// Service name injected by Cloud Run and Knative.
pub const SERVICE_ENV: &str = "K_SERVICE";

/// Revision name injected by Cloud Run and Knative, used as the version.
pub const REVISION_ENV: &str = "K_REVISION";

/// Project identifier, used to qualify `logName`.
pub const PROJECT_ENV: &str = "GOOGLE_CLOUD_PROJECT";

impl FormatterBuilder {
    /// Builder pre-filled from [`SERVICE_ENV`], [`REVISION_ENV`] and
    /// [`PROJECT_ENV`]. Unset or empty variables leave the option unset.
    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Like [`FormatterBuilder::from_env`] with an injected lookup.
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let mut builder = FormatterBuilder::default();
        if let Some(service) = get(SERVICE_ENV) {
            builder = builder.service(service);
        }
        if let Some(version) = get(REVISION_ENV) {
            builder = builder.version(version);
        }
        if let Some(project) = get(PROJECT_ENV) {
            builder = builder.project_id(project);
        }
        builder
    }
}
