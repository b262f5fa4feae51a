/*
 * Created on Mon Mar 17 2025
 *
 * This file is a part of Vigil
 * Vigil is a free and open-source centralized audit log receiver that
 * records privileged command sessions into durable, relayable artifacts
 * without compromising on integrity or operability.
 *
 * Copyright (c) 2025, The Vigil Authors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! # Configuration
//!
//! Settings are layered: built-in defaults, then the YAML configuration
//! file, then `VIGILD_*` environment variables, then CLI arguments. The
//! resolved [`Config`] is immutable for the lifetime of a connection;
//! changes apply to connections accepted afterwards.

use {
    crate::util,
    core::fmt,
    serde::Deserialize,
    std::{env, fs, path::PathBuf, time::Duration},
};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 30344;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_IOLOG_DIR: &str = "/var/log/vigil/io";
pub const DEFAULT_IOLOG_FILE_MODE: u32 = 0o600;
pub const DEFAULT_EVENT_LOG: &str = "/var/log/vigil/events.log";

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug)]
pub enum ConfigError {
    /// the configuration file could not be read
    FileIo(String, std::io::Error),
    /// the configuration file is not valid YAML for our schema
    FileParse(String, serde_yaml::Error),
    /// an environment variable or CLI argument has a bad value
    BadValue(String),
    /// an unknown CLI argument
    UnknownArg(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileIo(path, e) => write!(f, "failed to read config file `{path}`: {e}"),
            Self::FileParse(path, e) => write!(f, "failed to parse config file `{path}`: {e}"),
            Self::BadValue(what) => write!(f, "invalid configuration value for {what}"),
            Self::UnknownArg(arg) => write!(f, "unknown argument `{arg}`"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Which sink every new connection is bound to
pub enum SinkKind {
    /// this daemon is the terminal store: event log + I/O log trees
    Local,
    /// this daemon relays: journal raw frames for an upstream receiver
    Journal,
}

/*
    decoded (file) configuration
*/

#[derive(Debug, Default, PartialEq, Deserialize)]
pub struct DecodedConfiguration {
    #[serde(default)]
    system: Option<DecodedSystemConfig>,
    #[serde(default)]
    logs: Option<DecodedLogsConfig>,
    #[serde(default)]
    relay: Option<DecodedRelayConfig>,
    #[serde(default)]
    test: Option<DecodedTestConfig>,
}

#[derive(Debug, Default, PartialEq, Deserialize)]
struct DecodedSystemConfig {
    host: Option<String>,
    port: Option<u16>,
    tls: Option<DecodedTlsConfig>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, PartialEq, Deserialize)]
struct DecodedTlsConfig {
    cert: String,
    private_key: String,
    #[serde(default)]
    passphrase: String,
}

#[derive(Debug, Default, PartialEq, Deserialize)]
struct DecodedLogsConfig {
    dir: Option<String>,
    /// octal string, e.g. "0600"
    file_mode: Option<String>,
    compress: Option<bool>,
    event_log: Option<String>,
}

#[derive(Debug, PartialEq, Deserialize)]
struct DecodedRelayConfig {
    dir: String,
}

#[derive(Debug, Default, PartialEq, Deserialize)]
struct DecodedTestConfig {
    random_drop: Option<f64>,
}

/*
    resolved configuration
*/

#[derive(Debug, Clone, PartialEq)]
pub struct TlsConfig {
    pub cert: String,
    pub private_key: String,
    pub passphrase: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    host: String,
    port: u16,
    tls: Option<TlsConfig>,
    timeout: Duration,
    iolog_dir: PathBuf,
    iolog_file_mode: u32,
    iolog_compress: bool,
    event_log: PathBuf,
    relay_dir: Option<PathBuf>,
    random_drop: f64,
    hostname: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            tls: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            iolog_dir: PathBuf::from(DEFAULT_IOLOG_DIR),
            iolog_file_mode: DEFAULT_IOLOG_FILE_MODE,
            iolog_compress: false,
            event_log: PathBuf::from(DEFAULT_EVENT_LOG),
            relay_dir: None,
            random_drop: 0.0,
            hostname: util::os::hostname(),
        }
    }
}

impl Config {
    pub fn host(&self) -> &str {
        &self.host
    }
    pub fn port(&self) -> u16 {
        self.port
    }
    pub fn tls(&self) -> Option<&TlsConfig> {
        self.tls.as_ref()
    }
    /// Per-read deadline for established connections
    pub fn server_timeout(&self) -> Duration {
        self.timeout
    }
    pub fn iolog_dir(&self) -> &std::path::Path {
        &self.iolog_dir
    }
    /// Mode bits for files created inside an I/O log tree
    pub fn iolog_mode(&self) -> u32 {
        self.iolog_file_mode
    }
    pub fn iolog_compress(&self) -> bool {
        self.iolog_compress
    }
    pub fn event_log(&self) -> &std::path::Path {
        &self.event_log
    }
    /// The relay spool; `Some` selects the journal sink for new connections
    pub fn relay_dir(&self) -> Option<&std::path::Path> {
        self.relay_dir.as_deref()
    }
    /// Probability of failing an I/O buffer write, to exercise restart
    /// paths from test harnesses. Must stay 0.0 in production.
    pub fn random_drop(&self) -> f64 {
        self.random_drop
    }
    pub fn hostname(&self) -> &str {
        &self.hostname
    }
    pub fn sink_kind(&self) -> SinkKind {
        if self.relay_dir.is_some() {
            SinkKind::Journal
        } else {
            SinkKind::Local
        }
    }
}

#[cfg(test)]
impl Config {
    /// A local-sink configuration rooted at test-owned directories
    pub fn test_local(iolog_dir: &std::path::Path, event_log: &std::path::Path) -> Self {
        Self {
            iolog_dir: iolog_dir.to_owned(),
            event_log: event_log.to_owned(),
            ..Self::default()
        }
    }
    /// A journal-sink configuration spooling to a test-owned relay dir
    pub fn test_journal(relay_dir: &std::path::Path) -> Self {
        Self {
            relay_dir: Some(relay_dir.to_owned()),
            ..Self::default()
        }
    }
    pub fn test_set_compress(&mut self, on: bool) {
        self.iolog_compress = on;
    }
    pub fn test_set_random_drop(&mut self, p: f64) {
        self.random_drop = p;
    }
}

/*
    layering
*/

impl Config {
    fn apply_decoded(&mut self, dec: DecodedConfiguration) -> ConfigResult<()> {
        if let Some(sys) = dec.system {
            if let Some(host) = sys.host {
                self.host = host;
            }
            if let Some(port) = sys.port {
                self.port = port;
            }
            if let Some(tls) = sys.tls {
                self.tls = Some(TlsConfig {
                    cert: tls.cert,
                    private_key: tls.private_key,
                    passphrase: tls.passphrase,
                });
            }
            if let Some(secs) = sys.timeout_secs {
                self.timeout = Duration::from_secs(secs);
            }
        }
        if let Some(logs) = dec.logs {
            if let Some(dir) = logs.dir {
                self.iolog_dir = PathBuf::from(dir);
            }
            if let Some(mode) = logs.file_mode {
                self.iolog_file_mode = parse_mode(&mode)?;
            }
            if let Some(compress) = logs.compress {
                self.iolog_compress = compress;
            }
            if let Some(evlog) = logs.event_log {
                self.event_log = PathBuf::from(evlog);
            }
        }
        if let Some(relay) = dec.relay {
            self.relay_dir = Some(PathBuf::from(relay.dir));
        }
        if let Some(test) = dec.test {
            if let Some(p) = test.random_drop {
                if !(0.0..1.0).contains(&p) {
                    return Err(ConfigError::BadValue("test.random_drop".to_owned()));
                }
                self.random_drop = p;
            }
        }
        Ok(())
    }
    fn apply_env(&mut self) -> ConfigResult<()> {
        if let Ok(host) = env::var("VIGILD_HOST") {
            self.host = host;
        }
        if let Ok(port) = env::var("VIGILD_PORT") {
            self.port = port
                .parse()
                .map_err(|_| ConfigError::BadValue("VIGILD_PORT".to_owned()))?;
        }
        if let Ok(dir) = env::var("VIGILD_RELAY_DIR") {
            self.relay_dir = Some(PathBuf::from(dir));
        }
        if let Ok(dir) = env::var("VIGILD_IOLOG_DIR") {
            self.iolog_dir = PathBuf::from(dir);
        }
        Ok(())
    }
    fn apply_args(&mut self, args: &[String]) -> ConfigResult<Option<String>> {
        let mut cfg_file = None;
        let mut it = args.iter();
        while let Some(arg) = it.next() {
            let mut take = |what: &str| {
                it.next()
                    .cloned()
                    .ok_or_else(|| ConfigError::BadValue(what.to_owned()))
            };
            match arg.as_str() {
                "--config" | "-c" => cfg_file = Some(take("--config")?),
                "--host" => self.host = take("--host")?,
                "--port" => {
                    self.port = take("--port")?
                        .parse()
                        .map_err(|_| ConfigError::BadValue("--port".to_owned()))?
                }
                "--relay-dir" => self.relay_dir = Some(PathBuf::from(take("--relay-dir")?)),
                unknown => return Err(ConfigError::UnknownArg(unknown.to_owned())),
            }
        }
        Ok(cfg_file)
    }
}

fn parse_mode(s: &str) -> ConfigResult<u32> {
    u32::from_str_radix(s, 8)
        .ok()
        .filter(|m| *m & !0o777 == 0)
        .ok_or_else(|| ConfigError::BadValue("logs.file_mode".to_owned()))
}

/// Resolve the full configuration from defaults, the YAML file (if any),
/// the environment and the CLI arguments (everything after argv[0]).
pub fn load(args: &[String]) -> ConfigResult<Config> {
    let mut cfg = Config::default();
    // a --config passed on the CLI must win over the default path, so scan
    // args first, then re-apply them on top of the file and env layers
    let cfg_file = cfg.apply_args(args)?;
    let mut cfg = Config::default();
    if let Some(path) = cfg_file.or_else(|| env::var("VIGILD_CONFIG").ok()) {
        let raw = fs::read_to_string(&path).map_err(|e| ConfigError::FileIo(path.clone(), e))?;
        let dec: DecodedConfiguration =
            serde_yaml::from_str(&raw).map_err(|e| ConfigError::FileParse(path.clone(), e))?;
        cfg.apply_decoded(dec)?;
    }
    cfg.apply_env()?;
    cfg.apply_args(args)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_full_document() {
        let doc = r#"
system:
  host: 0.0.0.0
  port: 40444
  timeout_secs: 5
logs:
  dir: /tmp/vigil-io
  file_mode: "0640"
  compress: true
  event_log: /tmp/vigil-events.log
relay:
  dir: /tmp/vigil-relay
test:
  random_drop: 0.25
"#;
        let dec: DecodedConfiguration = serde_yaml::from_str(doc).unwrap();
        let mut cfg = Config::default();
        cfg.apply_decoded(dec).unwrap();
        assert_eq!(cfg.host(), "0.0.0.0");
        assert_eq!(cfg.port(), 40444);
        assert_eq!(cfg.server_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.iolog_mode(), 0o640);
        assert!(cfg.iolog_compress());
        assert_eq!(cfg.random_drop(), 0.25);
        assert_eq!(cfg.sink_kind(), SinkKind::Journal);
    }

    #[test]
    fn empty_document_keeps_defaults() {
        let dec: DecodedConfiguration = serde_yaml::from_str("{}").unwrap();
        let mut cfg = Config::default();
        cfg.apply_decoded(dec).unwrap();
        assert_eq!(cfg.port(), DEFAULT_PORT);
        assert_eq!(cfg.sink_kind(), SinkKind::Local);
        assert_eq!(cfg.random_drop(), 0.0);
    }

    #[test]
    fn bad_mode_and_bad_drop_are_rejected() {
        let mut cfg = Config::default();
        let dec: DecodedConfiguration =
            serde_yaml::from_str("logs:\n  file_mode: \"9999\"").unwrap();
        assert!(cfg.apply_decoded(dec).is_err());
        let dec: DecodedConfiguration =
            serde_yaml::from_str("test:\n  random_drop: 1.5").unwrap();
        assert!(cfg.apply_decoded(dec).is_err());
    }

    #[test]
    fn cli_args_override() {
        let args: Vec<String> = ["--host", "10.0.0.1", "--port", "4040"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut cfg = Config::default();
        cfg.apply_args(&args).unwrap();
        assert_eq!(cfg.host(), "10.0.0.1");
        assert_eq!(cfg.port(), 4040);
        assert!(matches!(
            Config::default().apply_args(&["--bogus".to_owned()]),
            Err(ConfigError::UnknownArg(_))
        ));
    }
}
