use log::{debug, info};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::common::auth::{AuthManager, Credentials, AUTH_FAILURE_DELAY};
use crate::common::config::Config;
use crate::net::conn::Connection;
use crate::proxy::forward::{self, ConnectError, Connector};

#[derive(Error, Debug)]
pub enum Socks5ProxyError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Invalid SOCKS version: {0:#04x}")]
    InvalidVersion(u8),
    #[error("Invalid authentication sub-negotiation version: {0:#04x}")]
    InvalidAuthVersion(u8),
    #[error("Username/password method not offered")]
    NoSupportedAuthMethod,
    #[error("Invalid username/password for user '{0}'")]
    AuthenticationFailed(String),
    #[error("Unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),
    #[error("Invalid address type: {0:#04x}")]
    InvalidAddressType(u8),
    #[error("Outgoing connection error: {0}")]
    ConnectError(#[from] ConnectError),
    #[error("Loopback connection denied: {0}")]
    LoopbackDenied(String),
}

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NOT_ACCEPTABLE: u8 = 0xFF;

const AUTH_SUCCESS: u8 = 0x00;
const AUTH_FAILURE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 reply codes (RFC 1928 §6)
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Destination requested by a CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(IpAddr, u16),
    Domain(String, u16),
}

/// Renders as a dialable "host:port", with IPv6 literals bracketed.
impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(IpAddr::V4(ip), port) => write!(f, "{}:{}", ip, port),
            TargetAddr::Ip(IpAddr::V6(ip), port) => write!(f, "[{}]:{}", ip, port),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// Runs one SOCKS5 session:
/// negotiate -> (authenticate) -> read request -> dial -> reply -> relay.
///
/// A failing stage ends the session on the spot. At most one request reply
/// is ever written, and only once a request has been parsed.
pub struct Socks5Proxy {
    config: Arc<Config>,
    auth_manager: AuthManager,
    connect_timeout: Duration,
    connector: Connector,
}

impl Socks5Proxy {
    pub fn new(config: Arc<Config>) -> Self {
        Socks5Proxy {
            auth_manager: AuthManager::new(&config),
            connect_timeout: Duration::from_secs(config.connect_timeout),
            connector: forward::tcp_connector(),
            config,
        }
    }

    pub async fn handle_connection<S>(&self, mut conn: Connection<S>) -> Result<(), Socks5ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let peer = conn.peer_addr();

        self.handshake(&mut conn).await?;

        let target = self.read_request(&mut conn).await?.to_string();

        info!("{}: dial {:?}", peer, target);
        let connect = (self.connector)(target.clone());
        let target_stream = match forward::connect_with_timeout(connect, self.connect_timeout).await
        {
            Ok(stream) => stream,
            Err(e) => {
                let _ = Self::send_reply(&mut conn, ReplyCode::ConnectionRefused).await;
                return Err(e.into());
            }
        };

        if !self.config.allow_loopback {
            let local_ip = target_stream.local_addr()?.ip();
            if local_ip.to_canonical().is_loopback() {
                let _ = Self::send_reply(&mut conn, ReplyCode::ConnectionNotAllowed).await;
                return Err(Socks5ProxyError::LoopbackDenied(target));
            }
        }

        Self::send_reply(&mut conn, ReplyCode::Succeeded).await?;

        info!("{}: proxying begin", peer);
        let outcome = forward::relay(conn.into_inner(), target_stream).await;
        match (outcome.direction, outcome.result) {
            (Some(direction), Ok(bytes)) => info!(
                "{}: proxying end ({} closed after {} bytes)",
                peer, direction, bytes
            ),
            (Some(direction), Err(e)) => {
                info!("{}: proxying end ({} error: {})", peer, direction, e)
            }
            (None, result) => info!("{}: proxying end (relay task failed: {:?})", peer, result),
        }

        Ok(())
    }

    /// Method selection. A version mismatch gets no answer at all.
    async fn handshake<S>(&self, conn: &mut Connection<S>) -> Result<(), Socks5ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let [version, nmethods] = conn.read_array::<2>().await?;
        if version != SOCKS5_VERSION {
            return Err(Socks5ProxyError::InvalidVersion(version));
        }

        let methods = conn.read_exact_bytes(nmethods as usize).await?;

        if !self.auth_manager.has_users() {
            conn.write(&[SOCKS5_VERSION, METHOD_NO_AUTH]).await?;
            return Ok(());
        }

        if !methods.contains(&METHOD_USER_PASS) {
            conn.write(&[SOCKS5_VERSION, METHOD_NOT_ACCEPTABLE]).await?;
            return Err(Socks5ProxyError::NoSupportedAuthMethod);
        }

        conn.write(&[SOCKS5_VERSION, METHOD_USER_PASS]).await?;
        self.authenticate(conn).await
    }

    /// RFC 1929 Username/Password sub-negotiation:
    /// +----+------+----------+------+----------+
    /// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    /// +----+------+----------+------+----------+
    /// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    /// +----+------+----------+------+----------+
    async fn authenticate<S>(&self, conn: &mut Connection<S>) -> Result<(), Socks5ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let auth_version = conn.read_u8().await?;
        if auth_version != AUTH_VERSION {
            return Err(Socks5ProxyError::InvalidAuthVersion(auth_version));
        }

        let username = conn.read_length_prefixed().await?;
        let password = conn.read_length_prefixed().await?;
        let credentials = Credentials::new(username, password);

        if !self.auth_manager.authenticate(&credentials) {
            tokio::time::sleep(AUTH_FAILURE_DELAY).await;
            conn.write(&[AUTH_VERSION, AUTH_FAILURE]).await?;
            return Err(Socks5ProxyError::AuthenticationFailed(
                credentials.username_lossy().into_owned(),
            ));
        }

        conn.write(&[AUTH_VERSION, AUTH_SUCCESS]).await?;
        debug!(
            "{}: user '{}' authenticated",
            conn.peer_addr(),
            credentials.username_lossy()
        );
        Ok(())
    }

    /// +----+-----+-------+------+----------+----------+
    /// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    /// +----+-----+-------+------+----------+----------+
    ///
    /// Rejected commands and address types are not answered with a reply.
    async fn read_request<S>(&self, conn: &mut Connection<S>) -> Result<TargetAddr, Socks5ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let [version, command, _reserved, addr_type] = conn.read_array::<4>().await?;

        if version != SOCKS5_VERSION {
            return Err(Socks5ProxyError::InvalidVersion(version));
        }

        if command != CMD_CONNECT {
            return Err(Socks5ProxyError::UnsupportedCommand(command));
        }

        let host = match addr_type {
            ATYP_IPV4 => Host::Ip(Ipv4Addr::from(conn.read_array::<4>().await?).into()),
            // Taken as-is; a name that is not valid UTF-8 simply fails to resolve.
            ATYP_DOMAIN => Host::Domain(
                String::from_utf8_lossy(&conn.read_length_prefixed().await?).into_owned(),
            ),
            ATYP_IPV6 => Host::Ip(Ipv6Addr::from(conn.read_array::<16>().await?).into()),
            _ => return Err(Socks5ProxyError::InvalidAddressType(addr_type)),
        };

        let port = u16::from_be_bytes(conn.read_array::<2>().await?);

        Ok(match host {
            Host::Ip(ip) => TargetAddr::Ip(ip, port),
            Host::Domain(name) => TargetAddr::Domain(name, port),
        })
    }

    /// The bound address is always reported as 0.0.0.0:0.
    async fn send_reply<S>(conn: &mut Connection<S>, reply_code: ReplyCode) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        conn.write(&encode_reply(reply_code)).await
    }
}

enum Host {
    Ip(IpAddr),
    Domain(String),
}

fn encode_reply(reply_code: ReplyCode) -> [u8; 10] {
    [
        SOCKS5_VERSION,
        reply_code as u8,
        0x00,
        ATYP_IPV4,
        0x00,
        0x00,
        0x00,
        0x00,
        0x00,
        0x00,
    ]
}
