//! Load config from file, environment and command line, in that order.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use gpstrack_core::ProtocolKind;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/gpstrack/config.toml or /etc/gpstrack/config.toml.
/// Env overrides: GPSTRACK_<FAMILY>_PORT, GPSTRACK_RELAY_ADDR, GPSTRACK_LOG.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address every listener binds to (default 0.0.0.0).
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    /// Log filter used when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Close connections silent for this long; 0 disables (default 1200).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Merge retries on a concurrent write before an append fails (default 5).
    #[serde(default = "default_max_append_retries")]
    pub max_append_retries: usize,
    /// Legacy relay `host:port`.
    #[serde(default)]
    pub relay_addr: Option<String>,
    /// Registry snapshot, loaded at startup and written on shutdown.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    /// `[listeners.<family>]` tables.
    #[serde(default)]
    pub listeners: BTreeMap<String, ListenerConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// The family is only listened on when set, or when `enabled` is.
    #[serde(default)]
    pub port: Option<u16>,
    /// Listen on [`ProtocolKind::default_port`] when `port` is unset.
    #[serde(default)]
    pub enabled: bool,
    /// Prepended to identities from this listener.
    #[serde(default)]
    pub id_prefix: String,
}

/// One listener to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerPlan {
    pub kind: ProtocolKind,
    pub port: u16,
    pub id_prefix: String,
}

/// Command-line values that win over file and environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<IpAddr>,
    pub ports: Vec<(ProtocolKind, u16)>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("unknown listener family {0:?}")]
    UnknownFamily(String),
    #[error("invalid value {value:?} for {var}")]
    Env { var: String, value: String },
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_idle_timeout_secs() -> u64 {
    1200
}
fn default_max_append_retries() -> usize {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            log_level: default_log_level(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_append_retries: default_max_append_retries(),
            relay_addr: None,
            state_file: None,
            listeners: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str, path: &Path) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(s).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        for family in config.listeners.keys() {
            if ProtocolKind::from_slug(family).is_none() {
                return Err(ConfigError::UnknownFamily(family.clone()));
            }
        }
        Ok(config)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        for kind in ProtocolKind::ALL {
            let var = format!("GPSTRACK_{}_PORT", kind.slug().to_uppercase());
            if let Some(value) = lookup(&var) {
                let port = value
                    .parse::<u16>()
                    .map_err(|_| ConfigError::Env { var, value })?;
                self.set_port(kind, port);
            }
        }
        if let Some(addr) = lookup("GPSTRACK_RELAY_ADDR") {
            self.relay_addr = (!addr.is_empty()).then_some(addr);
        }
        if let Some(level) = lookup("GPSTRACK_LOG") {
            self.log_level = level;
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(bind) = overrides.bind {
            self.bind = bind;
        }
        for &(kind, port) in &overrides.ports {
            self.set_port(kind, port);
        }
    }

    pub fn set_port(&mut self, kind: ProtocolKind, port: u16) {
        self.listeners
            .entry(kind.slug().to_string())
            .or_default()
            .port = Some(port);
    }

    /// Families with a port or enabled on their default one, in [`ProtocolKind::ALL`] order.
    pub fn listener_plans(&self) -> Vec<ListenerPlan> {
        ProtocolKind::ALL
            .into_iter()
            .filter_map(|kind| {
                let listener = self.listeners.get(kind.slug())?;
                let port = listener
                    .port
                    .or_else(|| listener.enabled.then(|| kind.default_port()))?;
                Some(ListenerPlan {
                    kind,
                    port,
                    id_prefix: listener.id_prefix.clone(),
                })
            })
            .collect()
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// Load config: defaults, then `explicit` or the first config file found, then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = match explicit {
        Some(path) => read_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => read_file(&path)?,
            None => Config::default(),
        },
    };
    config.apply_env(|var| std::env::var(var).ok())?;
    Ok(config)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/gpstrack/config.toml"));
    }
    out.push(PathBuf::from("/etc/gpstrack/config.toml"));
    out
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Config::from_toml_str(&s, path)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const SAMPLE: &str = r#"
        bind = "127.0.0.1"
        idle_timeout_secs = 0
        relay_addr = "relay.example.net:10000"

        [listeners.gt06]
        port = 5023

        [listeners.h02]
        port = 5013
        id_prefix = "h02-"

        [listeners.queclink]
        id_prefix = "q-"
    "#;

    fn parse(s: &str) -> Result<Config, ConfigError> {
        Config::from_toml_str(s, Path::new("test.toml"))
    }

    #[test]
    fn defaults() {
        let config = parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.bind, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(1200)));
        assert_eq!(config.max_append_retries, 5);
        assert!(config.listener_plans().is_empty());
    }

    #[test]
    fn file_listeners() {
        let config = parse(SAMPLE).unwrap();
        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.relay_addr.as_deref(), Some("relay.example.net:10000"));
        assert_eq!(
            config.listener_plans(),
            vec![
                ListenerPlan {
                    kind: ProtocolKind::Gt06,
                    port: 5023,
                    id_prefix: String::new(),
                },
                ListenerPlan {
                    kind: ProtocolKind::H02,
                    port: 5013,
                    id_prefix: "h02-".into(),
                },
            ]
        );
    }

    #[test]
    fn enabled_listener_uses_default_port() {
        let config = parse(
            "[listeners.xexun2]\nenabled = true\n\n\
             [listeners.mictrack]\nenabled = true\nport = 6191\n\n\
             [listeners.codec8]\nenabled = false\n",
        )
        .unwrap();
        let ports: Vec<(ProtocolKind, u16)> = config
            .listener_plans()
            .into_iter()
            .map(|p| (p.kind, p.port))
            .collect();
        assert_eq!(
            ports,
            vec![(ProtocolKind::MicTrack, 6191), (ProtocolKind::Xexun2, 5233)]
        );
    }

    #[test]
    fn rejects_unknown_keys_and_families() {
        assert!(matches!(
            parse("colour = \"blue\""),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            parse("[listeners.tk103]\nport = 1"),
            Err(ConfigError::UnknownFamily(f)) if f == "tk103"
        ));
        assert!(matches!(
            parse("[listeners.gt06]\nport = 1\nspeed = 2"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn env_then_cli_overrides() {
        let mut config = parse(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = [
            ("GPSTRACK_QUECLINK_PORT", "5004"),
            ("GPSTRACK_H02_PORT", "6013"),
            ("GPSTRACK_RELAY_ADDR", ""),
            ("GPSTRACK_LOG", "debug"),
        ]
        .into_iter()
        .collect();
        config
            .apply_env(|var| env.get(var).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.relay_addr, None);
        assert_eq!(config.log_level, "debug");

        config.apply_overrides(&Overrides {
            bind: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ports: vec![(ProtocolKind::H02, 7013), (ProtocolKind::Xexun2, 5233)],
        });
        let ports: Vec<(ProtocolKind, u16, String)> = config
            .listener_plans()
            .into_iter()
            .map(|p| (p.kind, p.port, p.id_prefix))
            .collect();
        assert_eq!(
            ports,
            vec![
                (ProtocolKind::Gt06, 5023, String::new()),
                (ProtocolKind::H02, 7013, "h02-".into()),
                (ProtocolKind::Queclink, 5004, "q-".into()),
                (ProtocolKind::Xexun2, 5233, String::new()),
            ]
        );
        assert_eq!(config.bind, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn bad_env_port() {
        let mut config = Config::default();
        let err = config
            .apply_env(|var| (var == "GPSTRACK_GT06_PORT").then(|| "ninety".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[listeners.codec8]\nport = 5027\n").unwrap();
        let config = read_file(&path).unwrap();
        assert_eq!(config.listener_plans()[0].kind, ProtocolKind::Codec8);
        assert!(matches!(
            read_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
