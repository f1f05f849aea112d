//! Minimal SOCKS5 front-end: no authentication, CONNECT only, IPv4 and
//! domain addresses.

use std::net::Ipv4Addr;
use thiserror::Error;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("unsupported SOCKS version {0:#04x}")]
    Version(u8),
    #[error("client offered no acceptable authentication method")]
    NoAcceptableMethod,
    #[error("unsupported command {0:#04x}")]
    Command(u8),
    #[error("unsupported address type {0:#04x}")]
    AddressType(u8),
    #[error("invalid domain name")]
    Domain,
}

/// Destination requested by a CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
}

impl ConnectRequest {
    /// `host:port`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Runs method negotiation and reads the CONNECT request. On failure the
/// matching error reply has already been sent.
pub async fn handshake<S>(stream: &mut S) -> Result<ConnectRequest, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        return Err(Socks5Error::Version(header[0]));
    }
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        return Err(Socks5Error::NoAcceptableMethod);
    }
    stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;

    // VER CMD RSV ATYP
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != VERSION {
        return Err(Socks5Error::Version(request[0]));
    }
    if request[1] != CMD_CONNECT {
        send_reply(stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(Socks5Error::Command(request[1]));
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            match String::from_utf8(name) {
                Ok(name) if !name.is_empty() => name,
                _ => {
                    send_reply(stream, REPLY_GENERAL_FAILURE).await?;
                    return Err(Socks5Error::Domain);
                }
            }
        }
        other => {
            if other == ATYP_IPV6 {
                // Drain the address so the reply is not read as garbage
                let mut rest = [0u8; 18];
                let _ = stream.read_exact(&mut rest).await;
            }
            send_reply(stream, REPLY_ADDRESS_NOT_SUPPORTED).await?;
            return Err(Socks5Error::AddressType(other));
        }
    };
    let port = stream.read_u16().await?;

    Ok(ConnectRequest { host, port })
}

/// Sends a reply with an unspecified bound address.
pub async fn send_reply<S>(stream: &mut S, code: u8) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    stream.flush().await
}

/// Reply code for a failed upstream dial.
pub fn reply_for_error(error: &io::Error) -> u8 {
    match error.kind() {
        io::ErrorKind::ConnectionRefused => REPLY_CONNECTION_REFUSED,
        io::ErrorKind::TimedOut | io::ErrorKind::NotFound | io::ErrorKind::HostUnreachable => {
            REPLY_HOST_UNREACHABLE
        }
        _ => REPLY_GENERAL_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_domain() {
        let (mut client, mut server) = io::duplex(256);
        let task = tokio::spawn(async move { handshake(&mut server).await });

        client.write_all(&[0x05, 0x02, 0x02, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x00]);

        let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let request = task.await.unwrap().unwrap();
        assert_eq!(request.addr(), "example.com:80");
    }

    #[tokio::test]
    async fn test_connect_ipv4() {
        let (mut client, mut server) = io::duplex(256);
        let task = tokio::spawn(async move { handshake(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x01, 0xBB])
            .await
            .unwrap();

        let request = task.await.unwrap().unwrap();
        assert_eq!(request, ConnectRequest { host: "10.0.0.1".to_string(), port: 443 });
    }

    #[tokio::test]
    async fn test_no_acceptable_method() {
        let (mut client, mut server) = io::duplex(256);
        let task = tokio::spawn(async move { handshake(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0xFF]);
        assert!(matches!(task.await.unwrap(), Err(Socks5Error::NoAcceptableMethod)));
    }

    #[tokio::test]
    async fn test_bind_command_rejected() {
        let (mut client, mut server) = io::duplex(256);
        let task = tokio::spawn(async move { handshake(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_COMMAND_NOT_SUPPORTED);
        assert!(matches!(task.await.unwrap(), Err(Socks5Error::Command(0x02))));
    }

    #[tokio::test]
    async fn test_ipv6_rejected() {
        let (mut client, mut server) = io::duplex(256);
        let task = tokio::spawn(async move { handshake(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        let mut req = vec![0x05, 0x01, 0x00, 0x04];
        req.extend_from_slice(&[0u8; 16]);
        req.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_ADDRESS_NOT_SUPPORTED);
        assert!(matches!(task.await.unwrap(), Err(Socks5Error::AddressType(0x04))));
    }
}
