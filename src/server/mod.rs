//! Control plane: framed JSON calls over a Unix socket or loopback TCP.
//!
//! - **protocol**: messages, frame codec, and the outbox writer
//! - **daemon**: the session server accepting clients
//! - **client**: the attaching terminal client and one-shot commands

pub mod client;
pub mod daemon;
pub mod protocol;

use std::fmt;
use std::io;
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use crate::config::Config;

/// Any byte stream a connection can run over
pub trait Stream: AsyncRead + AsyncWrite + Unpin {}

impl<T: AsyncRead + AsyncWrite + Unpin> Stream for T {}

/// Where the server listens and clients connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl Endpoint {
    /// TCP when configured, otherwise the Unix socket
    pub fn from_config(config: &Config) -> Self {
        match &config.server.tcp {
            Some(addr) => Endpoint::Tcp(addr.clone()),
            None => Endpoint::Unix(config.socket_path()),
        }
    }

    pub async fn connect(&self) -> io::Result<Box<dyn Stream>> {
        Ok(match self {
            Endpoint::Unix(path) => Box::new(UnixStream::connect(path).await?),
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Box::new(stream)
            }
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    #[test]
    fn test_endpoint_prefers_tcp() {
        let mut config = Config {
            server: ServerConfig {
                socket: Some(PathBuf::from("/tmp/t.sock")),
                tcp: None,
            },
            ..Config::default()
        };
        assert_eq!(Endpoint::from_config(&config), Endpoint::Unix(PathBuf::from("/tmp/t.sock")));

        config.server.tcp = Some("127.0.0.1:9".to_string());
        let endpoint = Endpoint::from_config(&config);
        assert_eq!(endpoint, Endpoint::Tcp("127.0.0.1:9".to_string()));
        assert_eq!(endpoint.to_string(), "tcp:127.0.0.1:9");
    }
}
