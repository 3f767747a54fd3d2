pub mod entry;
pub mod error;
pub mod record;
pub mod origin;
pub mod formatter;
pub mod layer;

pub mod env;
pub mod init;

pub use entry::{Entry, HttpRequest, ReportLocation, Severity};
pub use error::FormatError;
pub use formatter::{Clock, FormatterBuilder, StackdriverFormatter};
pub use layer::StackdriverLayer;
pub use record::{FieldValue, Level, LogRecord};
