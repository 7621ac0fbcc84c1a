//! Daemon configuration: structures, defaults, and validation.
//!
//! Both daemons can be driven from a TOML file or assembled
//! programmatically; the binaries map command-line flags onto these same
//! structs. `validate` enforces every documented range and the rule that a
//! partially configured TLS block is a startup error, never a silent
//! fallback to plain TCP.

use crate::error::{Error, Result};
use crate::transport::Credentials;
use regex::Regex;
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

pub const DEFAULT_POLLING_INTERVAL: u64 = 15;
pub const DEFAULT_SEND_ATTEMPTS: u32 = 5;
pub const DEFAULT_BLOCK_SIZE: u32 = 8192;
pub const DEFAULT_RECONNECT_INTERVAL: u64 = 15;
pub const MIN_BLOCK_SIZE: u32 = 256;
pub const MAX_BLOCK_SIZE: u32 = 65_535;
pub const MAX_SEND_ATTEMPTS: u32 = 65_535;

fn default_polling_interval() -> u64 {
    DEFAULT_POLLING_INTERVAL
}

fn default_send_attempts() -> u32 {
    DEFAULT_SEND_ATTEMPTS
}

fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE
}

fn default_reconnect_interval() -> u64 {
    DEFAULT_RECONNECT_INTERVAL
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Dial each configured peer.
    Client,
    /// Bind and accept.
    #[default]
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Low,
    #[default]
    Medium,
    High,
    Ultra,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub ca_bundle: Option<PathBuf>,
    pub certificate: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub crl: Option<PathBuf>,
    pub pkcs12: Option<PathBuf>,
    /// Name of the environment variable holding the bundle password.
    pub password_env: Option<String>,
    #[serde(default)]
    pub security_level: SecurityLevel,
    #[serde(default)]
    pub debug_level: u8,
}

impl TlsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.debug_level > 99 {
            return Err(Error::generic("tls debug_level must be 0-99"));
        }
        if self.pkcs12.is_some() {
            return Err(Error::generic(
                "PKCS#12 bundles are not supported by this build; convert to a PEM \
                 certificate and key",
            ));
        }
        let have_ca = self.ca_bundle.is_some();
        let have_cert = self.certificate.is_some();
        let have_key = self.key.is_some();
        if have_ca && have_cert && have_key {
            return Ok(());
        }
        // Partial TLS configuration is a hard error; there is no silent
        // fallback to plain TCP.
        Err(Error::generic(
            "incomplete TLS configuration: ca_bundle, certificate, and key are all required",
        ))
    }

    pub fn build(&self) -> Result<Credentials> {
        self.validate()?;
        let require_tls13 = matches!(
            self.security_level,
            SecurityLevel::High | SecurityLevel::Ultra
        );
        match (&self.ca_bundle, &self.certificate, &self.key) {
            (Some(ca), Some(cert), Some(key)) => {
                Credentials::from_pem(ca, cert, key, self.crl.as_deref(), require_tls13)
            }
            _ => Err(Error::generic("incomplete TLS configuration")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    /// Identity the peer must present during the handshake.
    pub ident: String,
    /// `host:port` endpoints tried in order when dialing.
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl PeerConfig {
    /// Resolve every address, keeping the host name for TLS verification.
    pub fn resolve(&self) -> Result<Vec<(String, SocketAddr)>> {
        let mut out = Vec::new();
        for spec in &self.addresses {
            let host = spec
                .rsplit_once(':')
                .map(|(h, _)| h.trim_matches(&['[', ']'][..]))
                .unwrap_or(spec.as_str())
                .to_string();
            let addrs = spec
                .to_socket_addrs()
                .map_err(|e| Error::generic(format!("cannot resolve {spec}: {e}")))?;
            for addr in addrs {
                out.push((host.clone(), addr));
            }
        }
        if out.is_empty() {
            return Err(Error::generic(format!(
                "peer {} has no usable addresses",
                self.ident
            )));
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalDirectory {
    /// Optional identity used for filter matching; an unnamed mirror takes
    /// every file.
    pub ident: Option<String>,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterRule {
    pub ident: String,
    pub pattern: String,
}

impl FilterRule {
    pub fn compile(&self) -> Result<Regex> {
        Regex::new(&self.pattern)
            .map_err(|e| Error::generic(format!("bad filter pattern {:?}: {e}", self.pattern)))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriorityRule {
    /// 0-100; above 50 is high priority.
    pub priority: u8,
    pub pattern: String,
}

impl PriorityRule {
    pub fn compile(&self) -> Result<Regex> {
        Regex::new(&self.pattern)
            .map_err(|e| Error::generic(format!("bad priority pattern {:?}: {e}", self.pattern)))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SenderConfig {
    /// Identity presented to peers.
    pub ident: String,
    pub incoming_dir: PathBuf,
    pub processing_dir: PathBuf,
    pub error_dir: PathBuf,
    #[serde(default)]
    pub local_directories: Vec<LocalDirectory>,
    #[serde(default)]
    pub unique_local_copies: bool,
    #[serde(default)]
    pub filters: Vec<FilterRule>,
    #[serde(default)]
    pub priorities: Vec<PriorityRule>,
    /// Seconds between incoming-directory scans.
    #[serde(default = "default_polling_interval")]
    pub polling_interval: u64,
    /// Per-file attempt ceiling; 0 means unlimited.
    #[serde(default = "default_send_attempts")]
    pub send_attempts: u32,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    pub peers: Vec<PeerConfig>,
    #[serde(default = "sender_default_mode")]
    pub mode: Mode,
    /// Bind addresses for server mode.
    #[serde(default)]
    pub listen: Vec<SocketAddr>,
    /// Keepalive seconds on every connection; 0 disables.
    #[serde(default)]
    pub keepalive: u32,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,
    pub tls: Option<TlsConfig>,
}

fn sender_default_mode() -> Mode {
    Mode::Client
}

impl SenderConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::generic(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| Error::generic(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ident.is_empty() {
            return Err(Error::generic("sender ident must not be empty"));
        }
        if self.polling_interval < 1 {
            return Err(Error::generic("polling_interval must be at least 1 second"));
        }
        if self.send_attempts > MAX_SEND_ATTEMPTS {
            return Err(Error::generic(format!(
                "send_attempts must be at most {MAX_SEND_ATTEMPTS}"
            )));
        }
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size) {
            return Err(Error::generic(format!(
                "block_size must be within {MIN_BLOCK_SIZE}-{MAX_BLOCK_SIZE}"
            )));
        }
        if self.peers.is_empty() && self.local_directories.is_empty() {
            return Err(Error::generic(
                "at least one peer or local directory is required",
            ));
        }
        match self.mode {
            Mode::Client => {
                for peer in &self.peers {
                    if peer.addresses.is_empty() {
                        return Err(Error::generic(format!(
                            "peer {} needs addresses in client mode",
                            peer.ident
                        )));
                    }
                }
            }
            Mode::Server => {
                if self.listen.is_empty() {
                    return Err(Error::generic("server mode needs listen addresses"));
                }
            }
        }
        for rule in &self.filters {
            rule.compile()?;
        }
        for rule in &self.priorities {
            rule.compile()?;
            if rule.priority > 100 {
                return Err(Error::generic("priority must be within 0-100"));
            }
        }
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverConfig {
    /// Identity presented to peers.
    pub ident: String,
    pub destination_dir: PathBuf,
    #[serde(default)]
    pub duplicate_destinations: Vec<PathBuf>,
    #[serde(default)]
    pub unique_duplicates: bool,
    /// Absolute number of bytes that must stay free.
    pub freespace_minimum: Option<u64>,
    /// Ceiling on total space used, in percent.
    pub space_maximum_percent: Option<f64>,
    /// Shell template run for each landed file; `%s` is the path, `%I` the
    /// peer identity.
    pub post_command: Option<String>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub listen: Vec<SocketAddr>,
    /// Known senders. In client mode these are dialed; in server mode the
    /// list (when non-empty) is an identity allowlist.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub keepalive: u32,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,
    pub tls: Option<TlsConfig>,
}

impl ReceiverConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::generic(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| Error::generic(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ident.is_empty() {
            return Err(Error::generic("receiver ident must not be empty"));
        }
        if self.destination_dir.as_os_str().is_empty() {
            return Err(Error::generic("destination_dir is required"));
        }
        if let Some(pct) = self.space_maximum_percent {
            if !(0.0..=100.0).contains(&pct) {
                return Err(Error::generic(
                    "space_maximum_percent must be within 0.0-100.0",
                ));
            }
        }
        match self.mode {
            Mode::Client => {
                if self.peers.is_empty() {
                    return Err(Error::generic("client mode needs peers to dial"));
                }
                for peer in &self.peers {
                    if peer.addresses.is_empty() {
                        return Err(Error::generic(format!(
                            "peer {} needs addresses in client mode",
                            peer.ident
                        )));
                    }
                }
            }
            Mode::Server => {
                if self.listen.is_empty() {
                    return Err(Error::generic("server mode needs listen addresses"));
                }
            }
        }
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        Ok(())
    }

    /// Identity allowlist for inbound sessions; `None` accepts anyone.
    pub fn allowed_idents(&self) -> Option<Vec<String>> {
        if self.peers.is_empty() {
            None
        } else {
            Some(self.peers.iter().map(|p| p.ident.clone()).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender_toml() -> &'static str {
        r#"
            ident = "site-a"
            incoming_dir = "/spool/incoming"
            processing_dir = "/spool/processing"
            error_dir = "/spool/error"

            [[peers]]
            ident = "site-b"
            addresses = ["127.0.0.1:7777"]

            [[filters]]
            ident = "site-b"
            pattern = "\\.bin$"

            [[priorities]]
            priority = 80
            pattern = "^urgent-"
        "#
    }

    #[test]
    fn sender_defaults_apply() {
        let config: SenderConfig = toml::from_str(sender_toml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.polling_interval, 15);
        assert_eq!(config.send_attempts, 5);
        assert_eq!(config.block_size, 8192);
        assert_eq!(config.mode, Mode::Client);
        assert_eq!(config.reconnect_interval, 15);
    }

    #[test]
    fn sender_rejects_bad_ranges() {
        let mut config: SenderConfig = toml::from_str(sender_toml()).unwrap();
        config.block_size = 128;
        assert!(config.validate().is_err());

        let mut config: SenderConfig = toml::from_str(sender_toml()).unwrap();
        config.polling_interval = 0;
        assert!(config.validate().is_err());

        let mut config: SenderConfig = toml::from_str(sender_toml()).unwrap();
        config.priorities[0].priority = 101;
        assert!(config.validate().is_err());

        let mut config: SenderConfig = toml::from_str(sender_toml()).unwrap();
        config.filters[0].pattern = "([".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn receiver_minimal_is_valid() {
        let config: ReceiverConfig = toml::from_str(
            r#"
                ident = "site-b"
                destination_dir = "/srv/landing"
                listen = ["127.0.0.1:7777"]
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert!(config.allowed_idents().is_none());
        assert_eq!(config.mode, Mode::Server);
    }

    #[test]
    fn receiver_percent_range_enforced() {
        let mut config: ReceiverConfig = toml::from_str(
            r#"
                ident = "site-b"
                destination_dir = "/srv/landing"
                listen = ["127.0.0.1:7777"]
                space_maximum_percent = 95.0
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        config.space_maximum_percent = Some(120.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_tls_is_a_hard_error() {
        let tls = TlsConfig {
            ca_bundle: Some(PathBuf::from("/etc/ferry/ca.pem")),
            certificate: None,
            key: None,
            crl: None,
            pkcs12: None,
            password_env: None,
            security_level: SecurityLevel::Medium,
            debug_level: 0,
        };
        assert!(tls.validate().is_err());
    }

    #[test]
    fn peer_resolution_keeps_host_for_sni() {
        let peer = PeerConfig {
            ident: "b".to_string(),
            addresses: vec!["127.0.0.1:9000".to_string()],
        };
        let resolved = peer.resolve().unwrap();
        assert_eq!(resolved[0].0, "127.0.0.1");
        assert_eq!(resolved[0].1.port(), 9000);
    }

    #[test]
    fn allowlist_reflects_peers() {
        let config: ReceiverConfig = toml::from_str(
            r#"
                ident = "site-b"
                destination_dir = "/srv/landing"
                listen = ["127.0.0.1:7777"]

                [[peers]]
                ident = "site-a"
            "#,
        )
        .unwrap();
        assert_eq!(config.allowed_idents(), Some(vec!["site-a".to_string()]));
    }
}
