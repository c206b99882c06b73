//! Settings structs and loading logic.
//!
//! All settings have sensible defaults and can be overridden via
//! environment variables or configuration files.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use paladin_plugin::{PluginConfig, PluginControllerConfig};

use crate::retry::RetryPolicy;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Node identity.
    pub node: NodeSettings,
    /// Shared-ledger chain parameters.
    pub chain: ChainSettings,
    /// State store persistence.
    pub database: DatabaseSettings,
    /// Plugin controller transport.
    pub plugins: PluginControllerSettings,
    /// Domain init retry policy.
    pub init_retry: RetrySettings,
    /// In-memory signing module.
    pub signing: SigningSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
    /// Configured domains by name.
    #[serde(default)]
    pub domains: BTreeMap<String, DomainSettings>,
}

impl Settings {
    /// Load settings from configuration files and environment variables.
    ///
    /// Files are loaded in this order (later overrides earlier):
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (if exists)
    /// 3. Environment variables with `PALADIN_` prefix
    pub fn load(environment: &str) -> Result<Self, ConfigError> {
        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("node.name", "node1")?
            .set_default("chain.chain_id", 1337)?
            .set_default("database.url", "memory:")?
            .set_default("database.max_connections", 10)?
            .set_default("plugins.address", "unix:/tmp/paladin-plugins.sock")?
            .set_default("plugins.shutdown_timeout_ms", 5000)?
            .set_default("init_retry.initial_ms", 250)?
            .set_default("init_retry.factor", 2.0)?
            .set_default("init_retry.max_ms", 30_000)?
            .set_default("signing.seed", Option::<String>::None)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "text")?
            // Load default configuration file
            .add_source(File::with_name(&format!("{config_dir}/default")).required(false))
            // Load environment-specific file
            .add_source(File::with_name(&format!("{config_dir}/{environment}")).required(false))
            // Override with environment variables (PALADIN_ prefix)
            .add_source(
                Environment::with_prefix("PALADIN")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Load settings from a specific file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()
    }

    /// Validate settings and return any validation errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.node.name.is_empty() {
            errors.push("node.name cannot be empty".into());
        }
        if self.chain.chain_id == 0 {
            errors.push("chain.chain_id must be non-zero".into());
        }
        if self.database.url.is_empty() {
            errors.push("database.url cannot be empty".into());
        }
        if !self.domains.is_empty() && self.plugins.address.is_empty() {
            errors.push("plugins.address must be set when domains are configured".into());
        }
        for (name, domain) in &self.domains {
            if domain
                .registry_address
                .parse::<alloy::primitives::Address>()
                .is_err()
            {
                errors.push(format!(
                    "domains.{name}.registry_address is not a valid address"
                ));
            }
        }
        if let Some(seed) = &self.signing.seed {
            let decoded = hex::decode(seed.trim_start_matches("0x"));
            if !decoded.is_ok_and(|b| b.len() == 32) {
                errors.push("signing.seed must be 32 bytes of hex".into());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// The domain init retry policy.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial: Duration::from_millis(self.init_retry.initial_ms),
            factor: self.init_retry.factor,
            max_delay: Duration::from_millis(self.init_retry.max_ms),
        }
    }

    /// The plugin controller configuration.
    #[must_use]
    pub fn plugin_controller_config(&self) -> PluginControllerConfig {
        PluginControllerConfig {
            address: self.plugins.address.clone(),
            shutdown_timeout: Duration::from_millis(self.plugins.shutdown_timeout_ms),
            domains: self
                .domains
                .iter()
                .map(|(name, domain)| (name.clone(), domain.plugin.clone()))
                .collect(),
        }
    }
}

/// Node identity.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSettings {
    /// This node's name within the network.
    pub name: String,
}

/// Shared-ledger parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainSettings {
    /// Chain ID bound into signing payloads.
    pub chain_id: u64,
}

/// State store persistence.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// `postgres://...` for persistent storage, `memory:` for embedded.
    pub url: String,
    /// Connection pool size for postgres.
    pub max_connections: u32,
}

/// Plugin controller transport settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginControllerSettings {
    /// Listen address (`unix:<path>`, `tcp4:<host>:<port>`, ...).
    pub address: String,
    /// How long `stop()` waits for the transport to drain.
    pub shutdown_timeout_ms: u64,
}

/// Domain init retry policy settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    /// Delay before the first retry.
    pub initial_ms: u64,
    /// Backoff multiplier.
    pub factor: f64,
    /// Delay ceiling.
    pub max_ms: u64,
}

/// In-memory signing module settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SigningSettings {
    /// 32-byte hex seed; generated at startup when unset.
    #[serde(default)]
    pub seed: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    /// Default level filter, e.g. `info` or `paladin_engine=debug`.
    pub level: String,
    /// `text` or `json`.
    pub format: String,
}

/// One configured domain.
#[derive(Debug, Clone, Deserialize)]
pub struct DomainSettings {
    /// Shared-ledger address where deployments are announced.
    pub registry_address: String,
    /// How the plugin is launched.
    pub plugin: PluginConfig,
    /// Domain-specific configuration passed at init.
    #[serde(default)]
    pub config: serde_json::Value,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_settings() -> Settings {
        Settings {
            node: NodeSettings {
                name: "node1".into(),
            },
            chain: ChainSettings { chain_id: 1337 },
            database: DatabaseSettings {
                url: "memory:".into(),
                max_connections: 10,
            },
            plugins: PluginControllerSettings {
                address: "unix:/tmp/x.sock".into(),
                shutdown_timeout_ms: 100,
            },
            init_retry: RetrySettings {
                initial_ms: 1,
                factor: 2.0,
                max_ms: 10,
            },
            signing: SigningSettings { seed: None },
            logging: LoggingSettings {
                level: "info".into(),
                format: "text".into(),
            },
            domains: BTreeMap::new(),
        }
    }

    #[test]
    fn valid_settings_pass() {
        base_settings().validate().unwrap();
    }

    #[test]
    fn zero_chain_id_rejected() {
        let mut settings = base_settings();
        settings.chain.chain_id = 0;
        let errors = settings.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("chain_id")));
    }

    #[test]
    fn bad_registry_address_rejected() {
        let mut settings = base_settings();
        settings.domains.insert(
            "noto".into(),
            DomainSettings {
                registry_address: "not-an-address".into(),
                plugin: PluginConfig {
                    library_type: paladin_plugin::LibraryType::CShared,
                    location: "lib.so".into(),
                },
                config: serde_json::Value::Null,
            },
        );
        let errors = settings.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("registry_address")));
    }

    #[test]
    fn short_seed_rejected() {
        let mut settings = base_settings();
        settings.signing.seed = Some("0xabcd".into());
        let errors = settings.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("signing.seed")));
    }

    #[test]
    fn load_layers_defaults_and_environment_overlay() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            "[node]\nname = \"basenode\"\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("production.toml"),
            "[chain]\nchain_id = 9\n",
        )
        .unwrap();
        std::env::set_var("CONFIG_DIR", dir.path());
        let settings = Settings::load("production");
        std::env::remove_var("CONFIG_DIR");

        let settings = settings.unwrap();
        // Code defaults < default.toml < environment overlay
        assert_eq!(settings.database.url, "memory:");
        assert_eq!(settings.node.name, "basenode");
        assert_eq!(settings.chain.chain_id, 9);
        settings.validate().unwrap();
    }

    #[test]
    fn loads_from_toml_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        write!(
            file,
            r#"
[node]
name = "testnode"

[chain]
chain_id = 7

[database]
url = "memory:"
max_connections = 4

[plugins]
address = "tcp4:127.0.0.1:0"
shutdown_timeout_ms = 100

[init_retry]
initial_ms = 1
factor = 2.0
max_ms = 10

[signing]

[logging]
level = "debug"
format = "text"

[domains.noto]
registry_address = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"

[domains.noto.plugin]
type = "c_shared"
location = "libs/noto.so"
"#
        )
        .unwrap();

        let settings = Settings::from_file(file.path()).unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.chain.chain_id, 7);
        assert_eq!(settings.domains.len(), 1);
        let controller = settings.plugin_controller_config();
        assert!(controller.domains.contains_key("noto"));
    }
}
