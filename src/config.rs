//! Runtime configuration for the server and the client

use std::net::{Ipv4Addr, SocketAddr};

/// TCP port of the reference deployment
pub const DEFAULT_PORT: u16 = 6010;

/// Longest accepted line, in bytes (excluding the separator)
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to
    pub bind_addr: SocketAddr,
    /// Lines longer than this are treated as a connection fault
    pub max_line_length: usize,
}

impl ServerConfig {
    /// Config listening on the given address with default limits
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// Client settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub max_line_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 6010);
        assert!(config.bind_addr.ip().is_loopback());
        assert_eq!(config.max_line_length, DEFAULT_MAX_LINE_LENGTH);
    }

    #[test]
    fn test_server_config_new_keeps_limits() {
        let addr: SocketAddr = "0.0.0.0:7000".parse().unwrap();
        let config = ServerConfig::new(addr);
        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.max_line_length, DEFAULT_MAX_LINE_LENGTH);
    }
}
