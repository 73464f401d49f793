use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::portrelay::{
    net::{AddrSpecError, HostSpec},
    relay::{self, RelayPolicy},
    scan, supervisor,
};

pub const DEFAULT_CONFIG_FILE: &str = "config.json";
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(5000);

pub const USAGE: &[&str] = &[
    "usage: portrelay [host] [target] [timeout_ms]",
    r#"or create config.json with {"host": string, "target": string}"#,
    r#"example: "portrelay 127.0.0.1:80 192.168.100.10:3000""#,
];

/// Raw inputs from the command line.
#[derive(Debug, Clone, Default)]
pub struct Args {
    pub host: Option<String>,
    pub target: Option<String>,
    pub timeout_ms: Option<String>,
    pub config_path: PathBuf,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    pub log_output: Option<String>,
    pub relay: Option<String>,
    pub rescan_interval: Option<Duration>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing listen host or target")]
    MissingEndpoints,
    #[error("read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },
    #[error("unsupported config extension {0:?} (expected .json, .toml or .yaml/.yml)")]
    UnsupportedExtension(String),
    #[error("{field}: {source}")]
    Address {
        field: &'static str,
        #[source]
        source: AddrSpecError,
    },
    #[error("{field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub scan: ScanConfig,
    pub forward: ForwardConfig,
    pub restart_delay: Duration,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// At least one spec carries a port: one listener on the addresses as
    /// given, no scanning, no restarts.
    Direct {
        listen_addr: String,
        target_addr: String,
    },
    /// Both specs are bare hosts: ports come from scanning the target.
    Discovery {
        listen_host: String,
        target_host: String,
    },
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Direct { .. } => f.write_str("direct"),
            Mode::Discovery { .. } => f.write_str("discovery"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub from_port: u16,
    /// Exclusive; up to 65536 so port 65535 can be scanned.
    pub to_port: u32,
    pub workers: usize,
    pub timeout: Duration,
    pub rescan_interval: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ForwardConfig {
    pub dial_timeout: Duration,
    pub buffer_size: usize,
    pub relay: RelayPolicy,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stdout".into(),
            add_source: false,
        }
    }
}

/// Unknown top-level keys (e.g. `"comment"`) are ignored; the nested
/// sections are strict.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    host: String,
    #[serde(default)]
    target: String,
    timeout_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
    buffer_size: Option<i64>,
    restart_delay_ms: Option<i64>,
    relay: Option<String>,
    scan: Option<FileScan>,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileScan {
    from_port: Option<u16>,
    to_port: Option<u32>,
    workers: Option<i64>,
    rescan_interval_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

/// Positional `host target` win; with fewer than two of them the config file
/// is read instead. A missing file behaves like an empty one.
pub fn load(args: &Args) -> Result<Config, ConfigError> {
    let fc = match (&args.host, &args.target) {
        (Some(host), Some(target)) => FileConfig {
            host: host.clone(),
            target: target.clone(),
            timeout_ms: args
                .timeout_ms
                .as_deref()
                .and_then(|s| s.trim().parse::<i64>().ok()),
            ..FileConfig::default()
        },
        _ => read_file_config(&args.config_path)?,
    };
    Config::from_file_config(fc, args)
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(FileConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };

    match ext.as_str() {
        "json" | "" => serde_json::from_str(&s).map_err(|e| parse_err(e.to_string())),
        "toml" => toml::from_str(&s).map_err(|e| parse_err(e.to_string())),
        "yaml" | "yml" => serde_yaml::from_str(&s).map_err(|e| parse_err(e.to_string())),
        other => Err(ConfigError::UnsupportedExtension(other.to_string())),
    }
}

fn millis_or(v: Option<i64>, default: Duration) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => default,
    }
}

fn non_empty(v: Option<&String>) -> Option<String> {
    v.map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl Config {
    fn from_file_config(fc: FileConfig, args: &Args) -> Result<Config, ConfigError> {
        let host = fc.host.trim();
        let target = fc.target.trim();
        if host.is_empty() || target.is_empty() {
            return Err(ConfigError::MissingEndpoints);
        }

        let listen_spec = HostSpec::parse(host).map_err(|source| ConfigError::Address {
            field: "host",
            source,
        })?;
        let target_spec = HostSpec::parse(target).map_err(|source| ConfigError::Address {
            field: "target",
            source,
        })?;

        // Anything but two bare hosts is forwarded as written; a spec without
        // a port then fails at bind (fatal) or per connection at dial.
        let mode = match (listen_spec, target_spec) {
            (HostSpec::Bare(listen_host), HostSpec::Bare(target_host)) => Mode::Discovery {
                listen_host,
                target_host,
            },
            _ => Mode::Direct {
                listen_addr: host.to_string(),
                target_addr: target.to_string(),
            },
        };

        // --- Scan ---
        let file_scan = fc.scan.as_ref();
        let from_port = file_scan.and_then(|s| s.from_port).unwrap_or(0);
        let to_port = file_scan
            .and_then(|s| s.to_port)
            .unwrap_or(supervisor::DISCOVERY_PORT_END);
        if u32::from(from_port) >= to_port || to_port > scan::PORT_RANGE_END {
            return Err(ConfigError::Invalid {
                field: "scan",
                message: format!(
                    "need from_port < to_port <= {} (got {from_port}..{to_port})",
                    scan::PORT_RANGE_END
                ),
            });
        }
        let workers = match file_scan.and_then(|s| s.workers) {
            Some(w) if w > 0 => w as usize,
            _ => scan::DEFAULT_WORKERS,
        };
        let rescan_interval = args.rescan_interval.or_else(|| {
            file_scan
                .and_then(|s| s.rescan_interval_ms)
                .filter(|ms| *ms > 0)
                .map(|ms| Duration::from_millis(ms as u64))
        });

        // --- Forwarding ---
        let relay_policy = match non_empty(args.relay.as_ref()).or(non_empty(fc.relay.as_ref())) {
            Some(s) => RelayPolicy::parse(&s).ok_or_else(|| ConfigError::Invalid {
                field: "relay",
                message: format!("unknown relay policy {s:?} (expected first_close or drain)"),
            })?,
            None => RelayPolicy::default(),
        };
        let buffer_size = match fc.buffer_size {
            Some(n) if n > 0 => n as usize,
            _ => relay::DEFAULT_BUFFER_SIZE,
        };

        // --- Logging ---
        let mut logging = LoggingConfig::default();
        if let Some(l) = &fc.logging {
            if let Some(level) = non_empty(l.level.as_ref()) {
                logging.level = level;
            }
            if let Some(format) = non_empty(l.format.as_ref()) {
                logging.format = format;
            }
            if let Some(output) = non_empty(l.output.as_ref()) {
                logging.output = output;
            }
            logging.add_source = l.add_source;
        }
        if let Some(level) = non_empty(args.log_level.as_ref()) {
            logging.level = level;
        }
        if let Some(format) = non_empty(args.log_format.as_ref()) {
            logging.format = format;
        }
        if let Some(output) = non_empty(args.log_output.as_ref()) {
            logging.output = output;
        }

        Ok(Config {
            mode,
            scan: ScanConfig {
                from_port,
                to_port,
                workers,
                timeout: millis_or(fc.timeout_ms, scan::DEFAULT_PROBE_TIMEOUT),
                rescan_interval,
            },
            forward: ForwardConfig {
                dial_timeout: millis_or(fc.dial_timeout_ms, DEFAULT_DIAL_TIMEOUT),
                buffer_size,
                relay: relay_policy,
            },
            restart_delay: millis_or(fc.restart_delay_ms, supervisor::DEFAULT_RESTART_DELAY),
            logging,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "portrelay_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    fn args_for(path: &Path) -> Args {
        Args {
            config_path: path.to_path_buf(),
            ..Args::default()
        }
    }

    fn positional(host: &str, target: &str, timeout: Option<&str>) -> Args {
        Args {
            host: Some(host.into()),
            target: Some(target.into()),
            timeout_ms: timeout.map(str::to_string),
            config_path: PathBuf::from("does-not-exist.json"),
            ..Args::default()
        }
    }

    #[test]
    fn json_file_selects_direct_mode() {
        let dir = temp_dir("json_direct");
        let cfg_path = dir.join("config.json");
        std::fs::write(
            &cfg_path,
            r#"{"host":"127.0.0.1:9000","target":"127.0.0.1:9001"}"#,
        )
        .expect("write");

        let cfg = load(&args_for(&cfg_path)).expect("load");
        assert_eq!(
            cfg.mode,
            Mode::Direct {
                listen_addr: "127.0.0.1:9000".into(),
                target_addr: "127.0.0.1:9001".into(),
            }
        );
        assert_eq!(cfg.scan.timeout, Duration::from_millis(100));
        assert_eq!(cfg.restart_delay, Duration::from_secs(3));
        assert_eq!(cfg.forward.relay, RelayPolicy::FirstClose);
        assert_eq!(cfg.logging.format, "text");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_means_missing_endpoints() {
        let dir = temp_dir("missing");
        let err = load(&args_for(&dir.join("config.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEndpoints));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn single_positional_argument_falls_back_to_file() {
        let dir = temp_dir("single_arg");
        let cfg_path = dir.join("config.json");
        std::fs::write(&cfg_path, r#"{"host":"0.0.0.0","target":"10.0.0.5"}"#).expect("write");

        let args = Args {
            host: Some("127.0.0.1:1".into()),
            ..args_for(&cfg_path)
        };
        let cfg = load(&args).expect("load");
        assert_eq!(
            cfg.mode,
            Mode::Discovery {
                listen_host: "0.0.0.0".into(),
                target_host: "10.0.0.5".into(),
            }
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn positional_timeout_defaults_when_unusable() {
        let cases = [
            (None, 100),
            (Some("250"), 250),
            (Some("abc"), 100),
            (Some("0"), 100),
            (Some("-5"), 100),
        ];
        for (raw, want_ms) in cases {
            let cfg = load(&positional("127.0.0.1", "10.0.0.1", raw)).expect("load");
            assert_eq!(cfg.scan.timeout, Duration::from_millis(want_ms), "raw={raw:?}");
        }
    }

    #[test]
    fn bare_hosts_select_discovery_over_registered_ports() {
        let cfg = load(&positional("0.0.0.0", "[fd00::1]", None)).expect("load");
        assert_eq!(
            cfg.mode,
            Mode::Discovery {
                listen_host: "0.0.0.0".into(),
                target_host: "fd00::1".into(),
            }
        );
        assert_eq!(cfg.scan.from_port, 0);
        assert_eq!(cfg.scan.to_port, 49152);
        assert_eq!(cfg.scan.workers, 8);
        assert_eq!(cfg.scan.rescan_interval, None);
    }

    #[test]
    fn one_explicit_port_selects_direct_mode_as_written() {
        let cfg = load(&positional("127.0.0.1:9000", "10.0.0.1", None)).expect("load");
        assert_eq!(
            cfg.mode,
            Mode::Direct {
                listen_addr: "127.0.0.1:9000".into(),
                target_addr: "10.0.0.1".into(),
            }
        );

        let cfg = load(&positional(" 127.0.0.1 ", "10.0.0.1:22", None)).expect("load");
        assert_eq!(
            cfg.mode,
            Mode::Direct {
                listen_addr: "127.0.0.1".into(),
                target_addr: "10.0.0.1:22".into(),
            }
        );
    }

    #[test]
    fn scan_range_may_end_past_the_last_port() {
        let dir = temp_dir("full_range");

        let full = dir.join("full.json");
        std::fs::write(
            &full,
            r#"{"host":"0.0.0.0","target":"10.0.0.5","scan":{"from_port":65000,"to_port":65536}}"#,
        )
        .expect("write");
        let cfg = load(&args_for(&full)).expect("load");
        assert_eq!(cfg.scan.from_port, 65000);
        assert_eq!(cfg.scan.to_port, 65536);

        let beyond = dir.join("beyond.json");
        std::fs::write(
            &beyond,
            r#"{"host":"0.0.0.0","target":"10.0.0.5","scan":{"to_port":65537}}"#,
        )
        .expect("write");
        assert!(matches!(
            load(&args_for(&beyond)).unwrap_err(),
            ConfigError::Invalid { field: "scan", .. }
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_top_level_keys_are_ignored() {
        let dir = temp_dir("unknown_keys");
        let cfg_path = dir.join("config.json");
        std::fs::write(
            &cfg_path,
            r#"{"comment":"forward ssh","host":"127.0.0.1:2222","target":"10.0.0.1:22"}"#,
        )
        .expect("write");

        let cfg = load(&args_for(&cfg_path)).expect("load");
        assert_eq!(
            cfg.mode,
            Mode::Direct {
                listen_addr: "127.0.0.1:2222".into(),
                target_addr: "10.0.0.1:22".into(),
            }
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn toml_and_yaml_carry_optional_sections() {
        let dir = temp_dir("toml_yaml");

        let toml_path = dir.join("portrelay.toml");
        std::fs::write(
            &toml_path,
            r#"
host = "0.0.0.0"
target = "192.168.1.10"
timeout_ms = 250
relay = "drain"

[scan]
from_port = 1
to_port = 1024
workers = 16
rescan_interval_ms = 60000

[logging]
level = "debug"
format = "json"
"#,
        )
        .expect("write");
        let cfg = load(&args_for(&toml_path)).expect("load toml");
        assert_eq!(cfg.scan.from_port, 1);
        assert_eq!(cfg.scan.to_port, 1024);
        assert_eq!(cfg.scan.workers, 16);
        assert_eq!(cfg.scan.timeout, Duration::from_millis(250));
        assert_eq!(cfg.scan.rescan_interval, Some(Duration::from_secs(60)));
        assert_eq!(cfg.forward.relay, RelayPolicy::Drain);
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, "json");

        let yaml_path = dir.join("portrelay.yaml");
        std::fs::write(
            &yaml_path,
            "host: \"127.0.0.1:8080\"\ntarget: \"10.0.0.2:80\"\ndial_timeout_ms: 1500\n",
        )
        .expect("write");
        let cfg = load(&args_for(&yaml_path)).expect("load yaml");
        assert_eq!(cfg.forward.dial_timeout, Duration::from_millis(1500));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn flags_override_file_values() {
        let dir = temp_dir("flags");
        let cfg_path = dir.join("config.json");
        std::fs::write(
            &cfg_path,
            r#"{"host":"0.0.0.0","target":"10.0.0.5","relay":"drain","logging":{"level":"warn"}}"#,
        )
        .expect("write");

        let args = Args {
            relay: Some("first-close".into()),
            log_level: Some("debug".into()),
            rescan_interval: Some(Duration::from_secs(30)),
            ..args_for(&cfg_path)
        };
        let cfg = load(&args).expect("load");
        assert_eq!(cfg.forward.relay, RelayPolicy::FirstClose);
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.scan.rescan_interval, Some(Duration::from_secs(30)));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn broken_files_are_config_errors() {
        let dir = temp_dir("broken");

        let bad_json = dir.join("config.json");
        std::fs::write(&bad_json, "{ not json").expect("write");
        assert!(matches!(
            load(&args_for(&bad_json)).unwrap_err(),
            ConfigError::Parse { .. }
        ));

        let unknown = dir.join("unknown.json");
        std::fs::write(
            &unknown,
            r#"{"host":"a","target":"b","scan":{"workrs":4}}"#,
        )
        .expect("write");
        let err = load(&args_for(&unknown)).unwrap_err();
        assert!(err.to_string().contains("workrs"), "got: {err}");

        let ini = dir.join("config.ini");
        std::fs::write(&ini, "host=a").expect("write");
        assert!(matches!(
            load(&args_for(&ini)).unwrap_err(),
            ConfigError::UnsupportedExtension(_)
        ));

        let bad_range = dir.join("range.json");
        std::fs::write(
            &bad_range,
            r#"{"host":"a","target":"b","scan":{"from_port":100,"to_port":100}}"#,
        )
        .expect("write");
        assert!(matches!(
            load(&args_for(&bad_range)).unwrap_err(),
            ConfigError::Invalid { field: "scan", .. }
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
