//! Command line overrides for the transport tunables
//!
//! Both binaries flatten [`TransportArgs`] into their own argument parser.
//! Every flag is optional; a flag that is given replaces the value loaded
//! from the configuration file.

use super::{CipherKind, Mode, TransportConfig};
use clap::Args;

#[derive(Args, Debug, Clone, Default)]
pub struct TransportArgs {
    /// Pre-shared secret between client and server
    #[arg(long)]
    pub key: Option<String>,

    /// PBKDF2 salt
    #[arg(long)]
    pub salt: Option<String>,

    /// Packet cipher: aes, chacha20, none
    #[arg(long)]
    pub crypt: Option<CipherKind>,

    /// Profile: fast3, fast2, fast, normal, manual
    #[arg(long)]
    pub mode: Option<Mode>,

    /// Maximum UDP payload in bytes
    #[arg(long)]
    pub mtu: Option<usize>,

    /// Send window in packets
    #[arg(long)]
    pub sndwnd: Option<u32>,

    /// Receive window in packets
    #[arg(long)]
    pub rcvwnd: Option<u32>,

    /// Reed-Solomon data shards
    #[arg(long)]
    pub datashard: Option<usize>,

    /// Reed-Solomon parity shards
    #[arg(long)]
    pub parityshard: Option<usize>,

    /// DSCP code point (6 bits)
    #[arg(long)]
    pub dscp: Option<u32>,

    /// Flush acknowledgements immediately
    #[arg(long)]
    pub acknodelay: Option<bool>,

    /// Manual mode: non-zero enables nodelay
    #[arg(long)]
    pub nodelay: Option<u32>,

    /// Manual mode: update interval in milliseconds
    #[arg(long)]
    pub interval: Option<u32>,

    /// Manual mode: fast retransmit threshold
    #[arg(long)]
    pub resend: Option<u32>,

    /// Manual mode: non-zero disables congestion control
    #[arg(long)]
    pub nc: Option<u32>,

    /// Socket buffer size in bytes
    #[arg(long)]
    pub sockbuf: Option<usize>,

    /// Multiplexer keep-alive interval in seconds
    #[arg(long)]
    pub keepalive: Option<u64>,

    /// Statistics log period in seconds, 0 disables
    #[arg(long)]
    pub snmp_period: Option<u64>,

    /// Disable stream compression
    #[arg(long)]
    pub nocomp: Option<bool>,
}

macro_rules! override_fields {
    ($args:expr, $config:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $args.$field.clone() {
                $config.$field = value;
            }
        )+
    };
}

impl TransportArgs {
    /// Replace every configured value that was given on the command line
    pub fn apply(&self, config: &mut TransportConfig) {
        override_fields!(
            self, config, key, salt, crypt, mode, mtu, sndwnd, rcvwnd, datashard, parityshard,
            dscp, acknodelay, nodelay, interval, resend, nc, sockbuf, keepalive, snmp_period,
            nocomp,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        transport: TransportArgs,
    }

    #[test]
    fn test_only_given_flags_override() {
        let cli = Cli::parse_from(["test", "--key", "secret", "--crypt", "chacha20", "--mtu", "1200"]);
        let mut config = TransportConfig::default();
        cli.transport.apply(&mut config);

        assert_eq!(config.key, "secret");
        assert_eq!(config.crypt, CipherKind::Chacha20);
        assert_eq!(config.mtu, 1200);
        assert_eq!(config.salt, TransportConfig::default().salt);
        assert_eq!(config.datashard, 10);
    }

    #[test]
    fn test_mode_flag_parses() {
        let cli = Cli::parse_from(["test", "--mode", "fast3"]);
        let mut config = TransportConfig::default();
        cli.transport.apply(&mut config);
        assert_eq!(config.retransmission().interval, 10);
    }

    #[test]
    fn test_nocomp_flag_disables_compression() {
        let mut config = TransportConfig::default();
        assert!(!config.nocomp);
        Cli::parse_from(["test", "--nocomp", "true"]).transport.apply(&mut config);
        assert!(config.nocomp);
    }

    #[test]
    fn test_unknown_cipher_rejected() {
        assert!(Cli::try_parse_from(["test", "--crypt", "rot13"]).is_err());
    }
}
