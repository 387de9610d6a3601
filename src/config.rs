//! On-disk configuration, grounded on `original_source/INIFile.cpp`'s
//! group/field model and on the teacher's `config.rs` loader shape
//! (`config::Config::builder()` + a manual `From<Config>` with per-field
//! defaults), adapted from JSON to INI per spec.md §6.3.

use std::net::Ipv4Addr;
use std::str::FromStr;

use config::{Config, File, FileFormat};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::DnsProxyError;

const CONFIG_LOCATIONS: &[&str] = &["./dnsfilterd.ini", "/etc/dnsfilterd.ini"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigFile {
    pub general: GeneralConfig,
    pub tcp: TcpConfig,
    pub query_filter: PoolConfig,
    pub reply_filter: PoolConfig,
    pub forward: ForwardConfig,
    pub blocking: BlockingConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    pub net_filter: Vec<Ipv4Net>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GeneralConfig {
    pub log_files: String,
    pub server_port: u16,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            log_files: "/tmp".to_string(),
            server_port: 53,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TcpConfig {
    pub session_timeout: u64,
    pub session_limit: u32,
    pub listen_backlog: u32,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            session_timeout: 5,
            session_limit: 32,
            listen_backlog: 8,
        }
    }
}

/// Shared shape of `QueryFilter`/`ReplyFilter`: a starting worker count and
/// a saturation ceiling, per spec.md §9 (the Worker/Queue growth policy).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    pub start_threads: usize,
    pub limit_threads: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            start_threads: 2,
            limit_threads: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForwardConfig {
    pub server_addr: Ipv4Addr,
    pub server_port: u16,
    pub local_addr: Ipv4Addr,
    pub local_port: u16,
    pub local_count: u16,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        ForwardConfig {
            server_addr: Ipv4Addr::new(8, 8, 8, 8),
            server_port: 53,
            local_addr: Ipv4Addr::UNSPECIFIED,
            local_port: 5320,
            local_count: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockingConfig {
    pub server_addr: Ipv4Addr,
}

impl Default for BlockingConfig {
    fn default() -> Self {
        BlockingConfig {
            server_addr: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// Hex-dump verbosity switches. Stored as the integers the INI file and
/// `original_source/dnsproxy.cpp` use (`0` disabled, non-zero enabled)
/// rather than booleans, since `ClientBinary=2` is a valid way to enable
/// the dump and the `config` crate's bool coercion doesn't accept it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LoggingConfig {
    pub client_binary: u32,
    pub server_binary: u32,
    pub database: u32,
}

impl LoggingConfig {
    pub fn client_binary_enabled(&self) -> bool {
        self.client_binary != 0
    }

    pub fn server_binary_enabled(&self) -> bool {
        self.server_binary != 0
    }

    pub fn database_enabled(&self) -> bool {
        self.database != 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DatabaseConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
    pub database: String,
    pub port: u16,
}

impl Default for ConfigFile {
    fn default() -> Self {
        ConfigFile {
            general: GeneralConfig::default(),
            tcp: TcpConfig::default(),
            query_filter: PoolConfig::default(),
            reply_filter: PoolConfig::default(),
            forward: ForwardConfig::default(),
            blocking: BlockingConfig::default(),
            logging: LoggingConfig::default(),
            database: DatabaseConfig::default(),
            net_filter: Vec::new(),
        }
    }
}

impl ConfigFile {
    /// Loads configuration from an explicit path, or the first of
    /// `./dnsfilterd.ini` / `/etc/dnsfilterd.ini` that exists, per
    /// spec.md §6.3 / `original_source/dnsproxy.cpp::load_configuration`.
    pub fn load(path: Option<&str>) -> Result<ConfigFile, DnsProxyError> {
        let candidates: Vec<String> = match path {
            Some(p) => vec![p.to_string()],
            None => CONFIG_LOCATIONS.iter().map(|s| s.to_string()).collect(),
        };

        for candidate in &candidates {
            if !std::path::Path::new(candidate).exists() {
                continue;
            }

            info!(path = %candidate, "loading configuration");
            let builder = Config::builder().add_source(File::new(candidate, FileFormat::Ini));
            let raw = builder
                .build()
                .map_err(|e| DnsProxyError::StartupError(format!("reading {candidate}: {e}")))?;
            return Self::from_raw(raw);
        }

        warn!("no configuration file found, using defaults");
        Ok(ConfigFile::default())
    }

    fn from_raw(raw: Config) -> Result<ConfigFile, DnsProxyError> {
        let default = ConfigFile::default();

        let general = GeneralConfig {
            log_files: raw
                .get("General.LogFiles")
                .unwrap_or(default.general.log_files),
            server_port: raw
                .get("General.ServerPort")
                .unwrap_or(default.general.server_port),
        };

        let tcp = TcpConfig {
            session_timeout: raw
                .get("TCP.SessionTimeout")
                .unwrap_or(default.tcp.session_timeout),
            session_limit: raw
                .get("TCP.SessionLimit")
                .unwrap_or(default.tcp.session_limit),
            listen_backlog: raw
                .get("TCP.ListenBacklog")
                .unwrap_or(default.tcp.listen_backlog),
        };

        let query_filter = PoolConfig {
            start_threads: raw
                .get("QueryFilter.StartThreads")
                .unwrap_or(default.query_filter.start_threads),
            limit_threads: raw
                .get("QueryFilter.LimitThreads")
                .unwrap_or(default.query_filter.limit_threads),
        };

        let reply_filter = PoolConfig {
            start_threads: raw
                .get("ReplyFilter.StartThreads")
                .unwrap_or(default.reply_filter.start_threads),
            limit_threads: raw
                .get("ReplyFilter.LimitThreads")
                .unwrap_or(default.reply_filter.limit_threads),
        };

        let forward = ForwardConfig {
            server_addr: parse_addr_or("Forward.ServerAddr", &raw, default.forward.server_addr),
            server_port: raw
                .get("Forward.ServerPort")
                .unwrap_or(default.forward.server_port),
            local_addr: parse_addr_or("Forward.LocalAddr", &raw, default.forward.local_addr),
            local_port: raw
                .get("Forward.LocalPort")
                .unwrap_or(default.forward.local_port),
            local_count: raw
                .get("Forward.LocalCount")
                .unwrap_or(default.forward.local_count),
        };

        let blocking = BlockingConfig {
            server_addr: parse_addr_or("Blocking.ServerAddr", &raw, default.blocking.server_addr),
        };

        let logging = LoggingConfig {
            client_binary: raw.get("Logging.ClientBinary").unwrap_or(0),
            server_binary: raw.get("Logging.ServerBinary").unwrap_or(0),
            database: raw.get("Logging.Database").unwrap_or(0),
        };

        let database = DatabaseConfig {
            hostname: raw.get("Database.Hostname").unwrap_or_default(),
            username: raw.get("Database.Username").unwrap_or_default(),
            password: raw.get("Database.Password").unwrap_or_default(),
            database: raw.get("Database.Database").unwrap_or_default(),
            port: raw.get("Database.Port").unwrap_or(3306),
        };

        let total: usize = raw.get("NetFilter.Total").unwrap_or(0);
        let mut net_filter = Vec::with_capacity(total);
        for i in 1..=total {
            let key = format!("NetFilter.{i}");
            let Ok(entry) = raw.get::<String>(&key) else {
                continue;
            };
            if entry.trim().is_empty() {
                continue;
            }
            match entry.parse::<Ipv4Net>() {
                Ok(net) => net_filter.push(net),
                Err(_) => match entry.parse::<Ipv4Addr>() {
                    Ok(addr) => net_filter.push(Ipv4Net::new(addr, 32).expect("/32 is always valid")),
                    Err(_) => warn!(entry, "ignoring unparseable NetFilter entry"),
                },
            }
        }

        Ok(ConfigFile {
            general,
            tcp,
            query_filter,
            reply_filter,
            forward,
            blocking,
            logging,
            database,
            net_filter,
        })
    }
}

fn parse_addr_or(key: &str, raw: &Config, default: Ipv4Addr) -> Ipv4Addr {
    raw.get::<String>(key)
        .ok()
        .and_then(|s| Ipv4Addr::from_str(&s).ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_original_source() {
        let cfg = ConfigFile::default();
        assert_eq!(cfg.general.server_port, 53);
        assert_eq!(cfg.forward.local_count, 10);
        assert_eq!(cfg.forward.server_addr, Ipv4Addr::new(8, 8, 8, 8));
    }

    #[test]
    fn loads_ini_with_net_filter_entries() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[General]\nServerPort=5353\n\n[Forward]\nServerAddr=1.1.1.1\nLocalCount=4\n\n[NetFilter]\nTotal=2\n1=10.0.0.0/8\n2=127.0.0.1\n"
        )
        .unwrap();

        let cfg = ConfigFile::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(cfg.general.server_port, 5353);
        assert_eq!(cfg.forward.server_addr, Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(cfg.forward.local_count, 4);
        assert_eq!(cfg.net_filter.len(), 2);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = ConfigFile::load(Some("/nonexistent/dnsfilterd.ini")).unwrap();
        assert_eq!(cfg, ConfigFile::default());
    }
}
