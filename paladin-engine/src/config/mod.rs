//! Configuration loading and validation.

mod settings;

pub use settings::{
    ChainSettings, DatabaseSettings, DomainSettings, LoggingSettings, NodeSettings,
    PluginControllerSettings, RetrySettings, Settings, SigningSettings,
};
