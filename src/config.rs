use crate::database::Retention;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fmt::{self, Debug, Formatter},
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use url::Url;

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub node: Url,
    pub database: Url,
    pub spec: PathBuf,
    pub abi: Vec<PathBuf>,
    #[serde(default)]
    pub blocks: bool,
    #[serde(default)]
    pub start: u64,
    #[serde(default = "default_poll_interval", with = "seconds")]
    pub poll_interval: Duration,
    #[serde(default, with = "optional_seconds")]
    pub history_retention: Option<Duration>,
    #[serde(default = "default_notifications")]
    pub notifications: usize,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_notifications() -> usize {
    128
}

impl Config {
    /// Loads the configuration. Relative spec and ABI paths are resolved
    /// against the directory containing the configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let toml = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config = Self::from_toml(&toml)?;
        if let Some(dir) = path.parent() {
            config.spec = dir.join(&config.spec);
            for abi in &mut config.abi {
                *abi = dir.join(&*abi);
            }
        }
        Ok(config)
    }

    fn from_toml(toml: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml)?;
        anyhow::ensure!(
            config.notifications > 0,
            "notifications capacity must be positive"
        );
        Ok(config)
    }

    pub fn retention(&self) -> Retention {
        match self.history_retention {
            Some(window) => Retention::Window(window),
            None => Retention::Unbounded,
        }
    }
}

impl Debug for Config {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let mut database = self.database.clone();
        if database.password().is_some() {
            let _ = database.set_password(Some("********"));
        }
        f.debug_struct("Config")
            .field("node", &self.node.as_str())
            .field("database", &database.as_str())
            .field("spec", &self.spec)
            .field("abi", &self.abi)
            .field("blocks", &self.blocks)
            .field("start", &self.start)
            .field("poll_interval", &self.poll_interval)
            .field("history_retention", &self.history_retention)
            .field("notifications", &self.notifications)
            .finish()
    }
}

mod seconds {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod optional_seconds {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
