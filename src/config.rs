use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};

use crate::error::Error;

/// Where the DNS resolver gets its name servers from
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ResolverSetup {
    /// Use the host's resolver configuration (`/etc/resolv.conf` on unix)
    SystemConf,
    Google,
    Cloudflare,
    Quad9,
    /// A fully spelled-out resolver configuration
    Custom(ResolverConfig),
}

impl Default for ResolverSetup {
    fn default() -> ResolverSetup {
        ResolverSetup::SystemConf
    }
}

/// Dispatcher configuration settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory the inbound collector writes finished messages into
    pub queue_dir: PathBuf,

    /// Queue files are named `<file_prefix><nanosecond timestamp><file_suffix>`
    pub file_prefix: String,
    pub file_suffix: String,

    /// Number of worker threads, independent of the queue size
    pub worker_count: usize,

    /// Identity announced in EHLO/HELO.  Defaults to this host's name as
    /// the system reports it; left empty (and refused) when that fails.
    pub helo_name: String,

    /// Port the exchangers are contacted on
    pub smtp_port: u16,

    pub connect_timeout_secs: u64,

    /// Read/write timeout applied to every step of the SMTP exchange
    pub smtp_timeout_secs: u64,

    pub resolver_setup: ResolverSetup,

    pub dns_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            queue_dir: PathBuf::from("/var/mailqueue"),
            file_prefix: "mail-".to_owned(),
            file_suffix: ".eml".to_owned(),
            worker_count: 30,
            helo_name: local_hostname(),
            smtp_port: 25,
            connect_timeout_secs: 30,
            smtp_timeout_secs: 60,
            resolver_setup: ResolverSetup::default(),
            dns_timeout_secs: 5,
        }
    }
}

impl Config {
    /// Load a TOML configuration file. Missing keys take their default value.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, Error> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
            path: path.display().to_string(),
            cause: e,
        })?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.worker_count == 0 {
            return Err(Error::InvalidConfig("worker_count must be at least 1".to_owned()));
        }
        if self.helo_name.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "helo_name is empty and the local hostname could not be determined".to_owned(),
            ));
        }
        if self.smtp_port == 0 {
            return Err(Error::InvalidConfig("smtp_port must not be 0".to_owned()));
        }
        if self.file_prefix.contains('/') || self.file_suffix.contains('/') {
            return Err(Error::InvalidConfig(
                "file_prefix and file_suffix must not contain a path separator".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn smtp_timeout(&self) -> Duration {
        Duration::from_secs(self.smtp_timeout_secs)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_timeout_secs)
    }
}

/// This host's name, or an empty string if the system won't tell us
fn local_hostname() -> String {
    match hostname::get() {
        Err(e) => {
            warn!("Unable to get hostname: {}", e);
            String::new()
        }
        Ok(name) => match name.into_string() {
            Err(e) => {
                warn!("Unable to use hostname {:?}", e);
                String::new()
            }
            Ok(name) => {
                if !name.contains('.') {
                    warn!("Hostname {} is not fully qualified; consider setting helo_name", name);
                }
                name
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.is_valid());
        assert_eq!(config.smtp_port, 25);
        assert_eq!(config.file_prefix, "mail-");
        assert_eq!(config.file_suffix, ".eml");
    }

    #[test]
    fn helo_name_defaults_to_hostname() {
        let expected = hostname::get().unwrap().into_string().unwrap();
        assert_eq!(Config::default().helo_name, expected);
    }

    #[test]
    fn empty_helo_name_is_rejected() {
        let config = Config {
            helo_name: "  ".to_owned(),
            ..Default::default()
        };
        match config.validate() {
            Err(Error::InvalidConfig(msg)) => assert!(msg.contains("helo_name")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = Config {
            worker_count: 0,
            ..Default::default()
        };
        assert!(!config.is_valid());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            queue_dir = "/tmp/q"
            worker_count = 4
            helo_name = "relay.example.org"
            "#,
        )
        .unwrap();
        assert_eq!(config.queue_dir, PathBuf::from("/tmp/q"));
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.helo_name, "relay.example.org");
        assert_eq!(config.smtp_port, 25);
        assert_eq!(config.smtp_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn from_file_reports_missing_file() {
        match Config::from_file("/nonexistent/mailrelay.toml") {
            Err(Error::ConfigRead { .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
