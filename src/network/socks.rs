//! Minimal async SOCKS5 client for dialing hidden services through the
//! local overlay proxy.
//!
//! Only CONNECT with no authentication is implemented; the target is
//! always sent as a domain name so the proxy does the resolution.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const RESERVED: u8 = 0x00;

#[derive(Error, Debug)]
pub enum SocksError {
    #[error("proxy unreachable: {0}")]
    ProxyUnreachable(std::io::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timed out")]
    TimedOut,
    #[error("proxy rejected handshake")]
    HandshakeRejected,
    #[error("connect refused by proxy (reply {0})")]
    ConnectRefused(u8),
    #[error("target host too long")]
    HostTooLong,
}

pub type Result<T> = std::result::Result<T, SocksError>;

/// Open a TCP stream to `target_host:target_port` through the SOCKS5
/// proxy at `proxy_host:proxy_port`.
pub async fn connect(
    proxy_host: &str,
    proxy_port: u16,
    target_host: &str,
    target_port: u16,
    limit: Duration,
) -> Result<TcpStream> {
    if target_host.len() > 255 {
        return Err(SocksError::HostTooLong);
    }

    let fut = async {
        let mut stream = TcpStream::connect((proxy_host, proxy_port))
            .await
            .map_err(SocksError::ProxyUnreachable)?;

        // Greeting: VER NMETHODS METHODS
        stream
            .write_all(&[SOCKS5_VERSION, 0x01, AUTH_NO_AUTH])
            .await?;
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply != [SOCKS5_VERSION, AUTH_NO_AUTH] {
            return Err(SocksError::HandshakeRejected);
        }

        // Connect request: VER CMD RSV ATYP LEN HOST PORT
        let mut request = Vec::with_capacity(7 + target_host.len());
        request.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, RESERVED, ATYP_DOMAIN]);
        request.push(target_host.len() as u8);
        request.extend_from_slice(target_host.as_bytes());
        request.extend_from_slice(&target_port.to_be_bytes());
        stream.write_all(&request).await?;
        stream.flush().await?;

        // Reply: VER REP RSV ATYP BND.ADDR BND.PORT
        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[0] != SOCKS5_VERSION {
            return Err(SocksError::HandshakeRejected);
        }
        if head[1] != 0x00 {
            return Err(SocksError::ConnectRefused(head[1]));
        }

        let addr_len = match head[3] {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize
            }
            _ => return Err(SocksError::HandshakeRejected),
        };
        let mut bound = vec![0u8; addr_len + 2];
        stream.read_exact(&mut bound).await?;

        Ok(stream)
    };

    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SocksError::TimedOut),
    }
}

/// Check that the proxy is accepting TCP connections at all. Cheap
/// health probe; does not complete a SOCKS handshake.
pub async fn probe(proxy_host: &str, proxy_port: u16, limit: Duration) -> bool {
    matches!(
        timeout(limit, TcpStream::connect((proxy_host, proxy_port))).await,
        Ok(Ok(_))
    )
}
