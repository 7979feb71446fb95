//! Configuration for opening a database.

use std::{collections::HashMap, path::Path};

use anyhow::Result;
use config::{Environment, File, Value};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::gateway::GatewayRegistry;

/// CONFIG_FILE_NAME is the name of the optional config file
pub const CONFIG_FILE_NAME: &str = "ember.config.toml";
/// ENV_PREFIX should be used along side the config field name to set a config field using
/// environment variables
/// For example, `EMBER_NAME=todos` would set the value of the `Config.name` field
pub const ENV_PREFIX: &str = "EMBER";

/// Number of car groups after which a commit triggers a compaction.
pub const DEFAULT_AUTO_COMPACT: usize = 100;
/// Maximum size of a single CAR file before a commit is split.
pub const DEFAULT_THRESHOLD: usize = 1_000_000;
/// Base URL of the in-memory gateway.
pub const DEFAULT_BASE_URL: &str = "memory://ember";

/// The file and environment backed configuration of a database.
#[derive(PartialEq, Eq, Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Name of the database.
    pub name: String,
    /// Where local stores live. The scheme selects the gateway.
    pub base_url: String,
    /// Optional remote to sync with.
    pub remote_url: Option<String>,
    pub auto_compact: usize,
    pub threshold: usize,
    /// Store CARs without encryption.
    pub public: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "ember".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            remote_url: None,
            auto_compact: DEFAULT_AUTO_COMPACT,
            threshold: DEFAULT_THRESHOLD,
            public: false,
        }
    }
}

impl Config {
    /// Make a config using a default, files, environment variables, and explicit overrides.
    ///
    /// Later items in the *file_paths* slice will have a higher priority than earlier ones.
    ///
    /// Environment variables are expected to start with the *env_prefix*, e.g.
    /// `EMBER_AUTO_COMPACT=10`.
    pub fn load<S, V>(
        file_paths: &[Option<&Path>],
        env_prefix: &str,
        flag_overrides: HashMap<S, V>,
    ) -> Result<Config>
    where
        S: AsRef<str>,
        V: Into<Value>,
    {
        let mut builder = config::Config::builder();

        // layer on config options from files
        for path in file_paths.iter().flatten() {
            if path.exists() {
                let p = path.to_str().ok_or_else(|| anyhow::anyhow!("empty path"))?;
                builder = builder.add_source(File::with_name(p));
            }
        }

        // next, add any environment variables
        builder = builder.add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        // finally, override any values
        for (flag, val) in flag_overrides.into_iter() {
            builder = builder.set_override(flag, val)?;
        }

        let cfg = builder.build()?;
        debug!("make_config:\n{:#?}\n", cfg);
        let cfg = cfg.try_deserialize()?;
        Ok(cfg)
    }

    /// Runtime options for this configuration, with stores resolved through `registry`.
    pub fn database_options(&self, registry: GatewayRegistry) -> crate::Result<DatabaseOptions> {
        let base_url = parse_url(&self.base_url)?;
        let remote_url = self.remote_url.as_deref().map(parse_url).transpose()?;
        Ok(DatabaseOptions {
            name: self.name.clone(),
            registry,
            base_url,
            remote_url,
            blockstore: BlockstoreOptions {
                auto_compact: self.auto_compact,
                threshold: self.threshold,
                public: self.public,
            },
        })
    }
}

fn parse_url(url: &str) -> crate::Result<Url> {
    Url::parse(url).map_err(|e| crate::Error::Configuration(format!("invalid url {url}: {e}")))
}

/// Tuning of a blockstore and its loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockstoreOptions {
    pub auto_compact: usize,
    pub threshold: usize,
    pub public: bool,
}

impl Default for BlockstoreOptions {
    fn default() -> Self {
        Self {
            auto_compact: DEFAULT_AUTO_COMPACT,
            threshold: DEFAULT_THRESHOLD,
            public: false,
        }
    }
}

/// Everything needed to open a database.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub name: String,
    pub registry: GatewayRegistry,
    pub base_url: Url,
    pub remote_url: Option<Url>,
    pub blockstore: BlockstoreOptions,
}

impl DatabaseOptions {
    /// Options for a database kept in a fresh in-memory gateway.
    pub fn memory(name: impl Into<String>) -> crate::Result<Self> {
        Config {
            name: name.into(),
            ..Default::default()
        }
        .database_options(GatewayRegistry::memory())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_settings() {
        let config = Config::load::<String, String>(&[][..], "__FOO", Default::default()).unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.auto_compact, 100);
        assert_eq!(config.threshold, 1_000_000);
    }

    #[test]
    fn file_then_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "name = \"todos\"\nauto_compact = 5\npublic = true").unwrap();

        let mut overrides = HashMap::new();
        overrides.insert("auto_compact", 7i64);
        let config = Config::load(&[Some(file.path())], "__BAR", overrides).unwrap();
        assert_eq!(config.name, "todos");
        assert_eq!(config.auto_compact, 7);
        assert!(config.public);

        let opts = config.database_options(GatewayRegistry::memory()).unwrap();
        assert_eq!(opts.blockstore.auto_compact, 7);
        assert_eq!(opts.base_url.scheme(), "memory");
    }

    #[test]
    fn bad_url_is_a_configuration_error() {
        let config = Config {
            base_url: "not a url".into(),
            ..Default::default()
        };
        assert!(matches!(
            config.database_options(GatewayRegistry::memory()),
            Err(crate::Error::Configuration(_))
        ));
    }
}
