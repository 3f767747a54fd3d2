use crate::formatter::StackdriverFormatter;
use crate::layer::StackdriverLayer;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::Registry;

/// Settings for the global subscriber installed by [`init_tracing_with_config`].
///
/// **Fields**
/// - `max_level`: most verbose level that reaches the formatter. Events
///   above it are discarded before any field is recorded.
#[derive(Clone, Debug)]
pub struct InitConfig {
    pub max_level: LevelFilter,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            max_level: LevelFilter::INFO,
        }
    }
}

/// Install a [`Registry`] combined with a stdout [`StackdriverLayer`] as the
/// global default subscriber.
///
/// **Parameters**
/// - `formatter`: configured [`StackdriverFormatter`].
/// - `config`: [`InitConfig`] controlling level filtering.
///
/// **Returns**
/// - `Err(..)` if a global subscriber was already installed.
pub fn init_tracing_with_config(
    formatter: StackdriverFormatter,
    config: InitConfig,
) -> Result<(), SetGlobalDefaultError> {
    let layer = StackdriverLayer::new(formatter).with_filter(config.max_level);
    let subscriber = Registry::default().with(layer);
    tracing::subscriber::set_global_default(subscriber)
}

/// Install the formatter with [`InitConfig::default`] (`INFO` and above).
///
/// This is the recommended entrypoint for services running on Cloud Run,
/// GKE or App Engine, where stdout is shipped to Cloud Logging.
pub fn init_tracing(formatter: StackdriverFormatter) -> Result<(), SetGlobalDefaultError> {
    init_tracing_with_config(formatter, InitConfig::default())
}
