use serde::{Deserialize, Serialize};

/// Server configuration file (YAML).
///
/// Example `config.yaml`:
/// ```yaml
/// port: 8080
/// data-dir: /var/lib/slotd/data
/// archive-dir: /var/lib/slotd/archives
/// identity-url: https://identity.example.com
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotdConfigFile {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default, alias = "data-dir")]
    pub data_dir: Option<String>,
    #[serde(default, alias = "archive-dir")]
    pub archive_dir: Option<String>,
    /// External identity provider queried for display-name refreshes.
    #[serde(default, alias = "identity-url")]
    pub identity_url: Option<String>,
    /// Scheduler tick period override, in seconds.
    #[serde(default, alias = "tick-secs")]
    pub tick_secs: Option<u64>,
}

/// Load a YAML config file, returning the default if the file doesn't exist.
pub fn load_config_file<T: serde::de::DeserializeOwned + Default>(path: &str) -> anyhow::Result<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(T::default());
        }
        Err(e) => return Err(e.into()),
    };
    let config: T = serde_yaml::from_str(&content)?;
    Ok(config)
}
