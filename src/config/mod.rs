//! Configuration management
//!
//! One [`Config`] value is built at startup (defaults, then the TOML file,
//! then command line overrides) and handed to every component by reference.
//! Nothing reads configuration from ambient state after that point.

pub mod cli;

pub use cli::TransportArgs;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Smallest MTU accepted for the UDP transport
pub const MIN_MTU: usize = 128;

/// Largest MTU accepted for the UDP transport
pub const MAX_MTU: usize = 1500;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Tunables shared by both ends of the tunnel
    #[serde(default)]
    pub transport: TransportConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from file if it exists, otherwise use defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check every section that is present
    pub fn validate(&self) -> crate::Result<()> {
        self.transport.validate()?;
        if let Some(client) = &self.client {
            client.validate()?;
        }
        if let Some(server) = &self.server {
            server.validate()?;
        }
        Ok(())
    }
}

/// Retransmission profile of the reliable UDP transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Normal,
    Fast,
    Fast2,
    Fast3,
    /// Use `nodelay`, `interval`, `resend` and `nc` exactly as configured
    Manual,
}

impl Mode {
    /// Preset `(nodelay, interval, resend, nc)` for this profile
    pub fn preset(self) -> Option<Retransmission> {
        let (nodelay, interval, resend, nc) = match self {
            Mode::Normal => (0, 40, 2, 1),
            Mode::Fast => (0, 30, 2, 1),
            Mode::Fast2 => (1, 20, 2, 1),
            Mode::Fast3 => (1, 10, 2, 1),
            Mode::Manual => return None,
        };
        Some(Retransmission {
            nodelay,
            interval,
            resend,
            nc,
        })
    }
}

impl FromStr for Mode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(Mode::Normal),
            "fast" => Ok(Mode::Fast),
            "fast2" => Ok(Mode::Fast2),
            "fast3" => Ok(Mode::Fast3),
            "manual" => Ok(Mode::Manual),
            other => Err(crate::Error::Config(format!("Unknown mode: {}", other))),
        }
    }
}

/// Packet encryption used on the UDP wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherKind {
    /// AES-256-GCM
    Aes,
    /// ChaCha20-Poly1305
    Chacha20,
    /// Plaintext datagrams
    None,
}

impl FromStr for CipherKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "aes" | "aes-256-gcm" => Ok(CipherKind::Aes),
            "chacha20" | "chacha20-poly1305" => Ok(CipherKind::Chacha20),
            "none" => Ok(CipherKind::None),
            other => Err(crate::Error::Config(format!("Unknown cipher: {}", other))),
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CipherKind::Aes => "aes",
            CipherKind::Chacha20 => "chacha20",
            CipherKind::None => "none",
        };
        f.write_str(name)
    }
}

/// Effective retransmission knobs after applying [`Mode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retransmission {
    pub nodelay: u32,
    pub interval: u32,
    pub resend: u32,
    pub nc: u32,
}

/// Tunables of the encrypted reliable UDP transport and the multiplexer
/// running on top of it. Client and server must agree on `key`, `salt`,
/// `crypt`, `mtu`, `datashard` and `parityshard`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Pre-shared secret
    pub key: String,
    /// PBKDF2 salt
    pub salt: String,
    /// Packet cipher
    pub crypt: CipherKind,
    /// Retransmission profile
    pub mode: Mode,
    /// Non-zero enables nodelay
    pub nodelay: u32,
    /// Internal update interval in milliseconds
    pub interval: u32,
    /// Fast retransmit after this many duplicate acks, 0 disables
    pub resend: u32,
    /// Non-zero disables congestion control
    pub nc: u32,
    /// Send window in packets
    pub sndwnd: u32,
    /// Receive window in packets
    pub rcvwnd: u32,
    /// Maximum UDP payload in bytes
    pub mtu: usize,
    /// DSCP code point (6 bits)
    pub dscp: u32,
    /// Socket buffer size in bytes, also the multiplexer receive buffer
    pub sockbuf: usize,
    /// Multiplexer keep-alive interval in seconds
    pub keepalive: u64,
    /// Reed-Solomon data shards
    pub datashard: usize,
    /// Reed-Solomon parity shards
    pub parityshard: usize,
    /// Flush acknowledgements as soon as a packet is received
    pub acknodelay: bool,
    /// Period of the transport statistics log in seconds, 0 disables
    pub snmp_period: u64,
    /// Disable snappy compression of the multiplexed stream
    pub nocomp: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            key: "1024".to_string(),
            salt: "kcp-go".to_string(),
            crypt: CipherKind::Aes,
            mode: Mode::Manual,
            nodelay: 1,
            interval: 20,
            resend: 2,
            nc: 1,
            sndwnd: 1024,
            rcvwnd: 1024,
            mtu: 1350,
            dscp: 46,
            sockbuf: 4_194_304,
            keepalive: 10,
            datashard: 10,
            parityshard: 3,
            acknodelay: true,
            snmp_period: 60,
            nocomp: false,
        }
    }
}

impl TransportConfig {
    /// Knobs actually applied to each connection
    pub fn retransmission(&self) -> Retransmission {
        self.mode.preset().unwrap_or(Retransmission {
            nodelay: self.nodelay,
            interval: self.interval,
            resend: self.resend,
            nc: self.nc,
        })
    }

    /// Multiplexer keep-alive interval
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive)
    }

    /// Whether forward error correction is active
    pub fn fec_enabled(&self) -> bool {
        self.datashard > 0 && self.parityshard > 0
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.key.is_empty() {
            return Err(crate::Error::Config("key must not be empty".into()));
        }
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(crate::Error::Config(format!(
                "mtu {} out of range {}..={}",
                self.mtu, MIN_MTU, MAX_MTU
            )));
        }
        if self.sndwnd == 0 || self.rcvwnd == 0 {
            return Err(crate::Error::Config("window sizes must be positive".into()));
        }
        let interval = self.retransmission().interval;
        if !(10..=5000).contains(&interval) {
            return Err(crate::Error::Config(format!(
                "interval {}ms out of range 10..=5000",
                interval
            )));
        }
        if self.datashard + self.parityshard > 256 {
            return Err(crate::Error::Config(format!(
                "datashard + parityshard must not exceed 256, got {}",
                self.datashard + self.parityshard
            )));
        }
        if self.keepalive == 0 {
            return Err(crate::Error::Config("keepalive must be positive".into()));
        }
        if self.dscp > 63 {
            return Err(crate::Error::Config(format!(
                "dscp {} does not fit in 6 bits",
                self.dscp
            )));
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// UDP listen address
    pub listen: String,
    /// Plain TCP target every stream is relayed to
    pub target: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:29900".to_string(),
            target: "127.0.0.1:12948".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.listen.is_empty() || self.target.is_empty() {
            return Err(crate::Error::Config(
                "server listen and target addresses are required".into(),
            ));
        }
        Ok(())
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local plain TCP listen address
    pub listen: String,
    /// Server UDP address
    pub remote: String,
    /// Number of pooled sessions
    pub conn: usize,
    /// Session lifetime in seconds, 0 keeps sessions until they die
    pub autoexpire: u64,
    /// Seconds a retired session may keep streams open, negative waits forever
    pub scavengettl: i64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:12948".to_string(),
            remote: "127.0.0.1:29900".to_string(),
            conn: 1,
            autoexpire: 0,
            scavengettl: 600,
        }
    }
}

impl ClientConfig {
    pub fn auto_expire(&self) -> Option<Duration> {
        (self.autoexpire > 0).then(|| Duration::from_secs(self.autoexpire))
    }

    pub fn scavenge_ttl(&self) -> Option<Duration> {
        u64::try_from(self.scavengettl).ok().map(Duration::from_secs)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.listen.is_empty() || self.remote.is_empty() {
            return Err(crate::Error::Config(
                "client listen and remote addresses are required".into(),
            ));
        }
        if self.conn == 0 {
            return Err(crate::Error::Config("conn must be at least 1".into()));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: Some(ServerConfig::default()),
        client: Some(ClientConfig::default()),
        transport: TransportConfig::default(),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_profile() {
        let t = TransportConfig::default();
        assert_eq!(t.key, "1024");
        assert_eq!(t.salt, "kcp-go");
        assert_eq!(t.mtu, 1350);
        assert_eq!(t.sockbuf, 4_194_304);
        assert_eq!((t.datashard, t.parityshard), (10, 3));
        assert!(t.acknodelay);
        assert!(t.validate().is_ok());

        let c = ClientConfig::default();
        assert_eq!(c.auto_expire(), None);
        assert_eq!(c.scavenge_ttl(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_negative_ttl_disables_forced_scavenging() {
        let c = ClientConfig {
            scavengettl: -1,
            ..Default::default()
        };
        assert_eq!(c.scavenge_ttl(), None);
    }

    #[test]
    fn test_mode_presets() {
        let mut t = TransportConfig {
            mode: Mode::Fast3,
            ..Default::default()
        };
        assert_eq!(t.retransmission().interval, 10);

        t.mode = Mode::Manual;
        t.interval = 33;
        assert_eq!(t.retransmission().interval, 33);
        assert_eq!("FAST2".parse::<Mode>().unwrap(), Mode::Fast2);
        assert!("turbo".parse::<Mode>().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let bad_mtu = TransportConfig {
            mtu: 20,
            ..Default::default()
        };
        assert!(bad_mtu.validate().is_err());

        let bad_shards = TransportConfig {
            datashard: 200,
            parityshard: 100,
            ..Default::default()
        };
        assert!(bad_shards.validate().is_err());

        let no_conn = ClientConfig {
            conn: 0,
            ..Default::default()
        };
        assert!(no_conn.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = generate_example_config();
        config.transport.crypt = CipherKind::Chacha20;
        config.client.as_mut().unwrap().conn = 4;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.transport.crypt, CipherKind::Chacha20);
        assert_eq!(loaded.client.unwrap().conn, 4);
        assert!(loaded.server.is_some());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [client]
            remote = "203.0.113.7:29900"

            [transport]
            mode = "fast2"
            "#,
        )
        .unwrap();

        let client = config.client.unwrap();
        assert_eq!(client.remote, "203.0.113.7:29900");
        assert_eq!(client.conn, 1);
        assert_eq!(config.transport.mode, Mode::Fast2);
        assert_eq!(config.transport.mtu, 1350);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_errors_are_classified() {
        let dir = tempfile::tempdir().unwrap();
        // a directory cannot be read as a file
        assert!(matches!(Config::load(dir.path()), Err(crate::Error::Io(_))));

        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[transport\nmtu = ").unwrap();
        assert!(matches!(Config::load(&path), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert!(config.client.is_none());
        assert_eq!(config.transport.sndwnd, 1024);
    }
}
