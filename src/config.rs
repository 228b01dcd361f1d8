use clap::Parser;

use crate::Error;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "TLS 1.3 tunneling proxy",
    long_about = "tlstun relays traffic through a TLS 1.3 tunnel authenticated by a shared secret.\n\nRoles:\n- proxy   : terminate TLS, serve SOCKS5 (and optionally HTTP/HTTPS proxy) to the peer (--cert/--key)\n- forward : listen for plaintext local connections and forward them to a proxy server verified by public-key pinning (--server)\n"
)]
pub struct Cli {
    /// Listen address as host:port, or a bare port to bind all interfaces
    #[arg(short = 'l', long, default_value = "1080")]
    pub listen: String,

    /// Remote server address (host:port); enables the forward role
    #[arg(short = 's', long, default_value = "")]
    pub server: String,

    /// TLS certificate chain file (PEM); enables the proxy role
    #[arg(long, default_value = "")]
    pub cert: String,

    /// TLS private key file (PEM)
    #[arg(long, default_value = "")]
    pub key: String,

    /// Shared secret exchanged after the TLS handshake
    #[arg(short = 'k', long, default_value = "anonymous")]
    pub secret: String,

    /// Also accept HTTP and HTTPS proxy requests (proxy role)
    #[arg(long)]
    pub with_http: bool,

    /// Proxy role: destination path for the exported public key PEM.
    /// Forward role: pin source, either a path or "inline:<PEM or base64>"
    #[arg(long, default_value = "")]
    pub public_key: String,

    /// Suppress per-connection log lines
    #[arg(short, long)]
    pub quiet: bool,
}

/// Active role derived from a [`ListenConfig`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Role {
    /// Client side: local plaintext listener forwarding into the tunnel.
    Forward,
    /// Server side: TLS-terminating SOCKS5/HTTP proxy.
    Proxy,
}

/// Listener configuration handed to [`crate::start_server`].
///
/// Empty strings mean "unset". Exactly one role must be configured:
/// `server_address` for the forward role, or `server_cert_file` (with
/// `server_key_file`) for the proxy role.
#[derive(Clone, Debug)]
pub struct ListenConfig {
    /// host:port, or a bare port implying bind on all interfaces.
    pub listen_port: String,
    /// Remote proxy address; non-empty selects the forward role.
    pub server_address: String,
    /// Certificate chain file; non-empty (with `server_address` empty)
    /// selects the proxy role.
    pub server_cert_file: String,
    /// Private key file for `server_cert_file`.
    pub server_key_file: String,
    /// Shared secret line used for post-TLS authentication.
    pub secret: String,
    /// Proxy role: accept HTTP and HTTPS proxying in addition to SOCKS5.
    pub with_http: bool,
    /// Proxy role: export destination for the leaf SPKI PEM.
    /// Forward role: pin source path, or an `inline:` literal.
    /// Empty defaults to `public.key` in both roles.
    pub public_key_file: String,
}

impl ListenConfig {
    /// Defaults: listen port `1080`, secret `anonymous`, HTTP off, all
    /// other fields empty.
    pub fn new() -> Self {
        Self {
            listen_port: "1080".to_string(),
            server_address: String::new(),
            server_cert_file: String::new(),
            server_key_file: String::new(),
            secret: "anonymous".to_string(),
            with_http: false,
            public_key_file: String::new(),
        }
    }

    /// Create a ListenConfig from CLI arguments
    pub fn from_cli(args: Cli) -> Self {
        Self {
            listen_port: args.listen,
            server_address: args.server,
            server_cert_file: args.cert,
            server_key_file: args.key,
            secret: args.secret,
            with_http: args.with_http,
            public_key_file: args.public_key,
        }
    }

    /// Select the active role, first match wins.
    pub fn role(&self) -> Result<Role, Error> {
        if !self.server_address.is_empty() {
            Ok(Role::Forward)
        } else if !self.server_cert_file.is_empty() {
            Ok(Role::Proxy)
        } else {
            Err(Error::MissConfig)
        }
    }

    /// Bind address for the local listener. A bare port binds all
    /// interfaces.
    pub(crate) fn listen_addr(&self) -> String {
        if self.listen_port.contains(':') {
            self.listen_port.clone()
        } else {
            format!("0.0.0.0:{}", self.listen_port)
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ListenConfig::new();
        assert_eq!(config.listen_port, "1080");
        assert_eq!(config.secret, "anonymous");
        assert!(!config.with_http);
        assert!(config.server_address.is_empty());
        assert!(config.public_key_file.is_empty());
    }

    #[test]
    fn role_selection_prefers_forward() {
        let mut config = ListenConfig::new();
        config.server_address = "example.com:1080".into();
        config.server_cert_file = "server.crt".into();
        assert_eq!(config.role().unwrap(), Role::Forward);
    }

    #[test]
    fn role_selection_proxy() {
        let mut config = ListenConfig::new();
        config.server_cert_file = "server.crt".into();
        assert_eq!(config.role().unwrap(), Role::Proxy);
    }

    #[test]
    fn role_selection_missing() {
        let config = ListenConfig::new();
        assert!(matches!(config.role(), Err(Error::MissConfig)));
        assert_eq!(Error::MissConfig.to_string(), "miss config");
    }

    #[test]
    fn bare_port_binds_all_interfaces() {
        let mut config = ListenConfig::new();
        config.listen_port = "1080".into();
        assert_eq!(config.listen_addr(), "0.0.0.0:1080");

        config.listen_port = "127.0.0.1:2080".into();
        assert_eq!(config.listen_addr(), "127.0.0.1:2080");
    }
}
