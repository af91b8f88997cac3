//! SOCKS4, SOCKS4a and SOCKS5 (RFC 1928) server-side negotiation, no auth.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const SOCKS4_VERSION: u8 = 0x04;
pub const SOCKS5_VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const MAX_NUL_TERMINATED: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    V4,
    V5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksCommand {
    Connect,
    Bind,
    UdpAssociate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub version: SocksVersion,
    pub command: SocksCommand,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unsupported SOCKS version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("client offered no acceptable auth method")]
    NoAcceptableAuth,

    #[error("unknown SOCKS command {0:#04x}")]
    UnknownCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("malformed request: {0}")]
    Malformed(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Reply codes, mapped onto each version's wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Succeeded,
    GeneralFailure,
    HostUnreachable,
    ConnectionRefused,
    CommandNotSupported,
    AddressTypeNotSupported,
}

impl Reply {
    fn socks5_code(self) -> u8 {
        match self {
            Reply::Succeeded => 0x00,
            Reply::GeneralFailure => 0x01,
            Reply::HostUnreachable => 0x04,
            Reply::ConnectionRefused => 0x05,
            Reply::CommandNotSupported => 0x07,
            Reply::AddressTypeNotSupported => 0x08,
        }
    }

    fn socks4_code(self) -> u8 {
        match self {
            Reply::Succeeded => 0x5a,
            _ => 0x5b,
        }
    }
}

/// Reads the client's greeting and request. Failure replies the protocol
/// defines are written before the error is returned.
pub async fn negotiate<S>(s: &mut S) -> Result<SocksRequest, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match read_u8(s).await? {
        SOCKS4_VERSION => negotiate_v4(s).await,
        SOCKS5_VERSION => negotiate_v5(s).await,
        other => Err(HandshakeError::UnsupportedVersion(other)),
    }
}

async fn negotiate_v5<S>(s: &mut S) -> Result<SocksRequest, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // VER (consumed), NMETHODS, METHODS...
    let nmethods = read_u8(s).await? as usize;
    let mut methods = vec![0u8; nmethods];
    s.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        s.write_all(&[SOCKS5_VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        return Err(HandshakeError::NoAcceptableAuth);
    }
    s.write_all(&[SOCKS5_VERSION, METHOD_NO_AUTH]).await?;

    // VER, CMD, RSV, ATYP, DST.ADDR, DST.PORT
    let ver = read_u8(s).await?;
    if ver != SOCKS5_VERSION {
        return Err(HandshakeError::Malformed("request version differs from greeting"));
    }
    let cmd = read_u8(s).await?;
    let _rsv = read_u8(s).await?;
    let atyp = read_u8(s).await?;

    let host = match atyp {
        0x01 => {
            let mut ip = [0u8; 4];
            s.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let len = read_u8(s).await? as usize;
            let mut name = vec![0u8; len];
            s.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| HandshakeError::Malformed("domain is not UTF-8"))?
        }
        0x04 => {
            let mut ip6 = [0u8; 16];
            s.read_exact(&mut ip6).await?;
            Ipv6Addr::from(ip6).to_string()
        }
        other => {
            send_reply(s, SocksVersion::V5, Reply::AddressTypeNotSupported, None).await?;
            return Err(HandshakeError::UnsupportedAddressType(other));
        }
    };
    let port = read_u16(s).await?;

    let command = match cmd {
        0x01 => SocksCommand::Connect,
        0x02 => SocksCommand::Bind,
        0x03 => SocksCommand::UdpAssociate,
        other => {
            send_reply(s, SocksVersion::V5, Reply::CommandNotSupported, None).await?;
            return Err(HandshakeError::UnknownCommand(other));
        }
    };
    if host.is_empty() {
        send_reply(s, SocksVersion::V5, Reply::GeneralFailure, None).await?;
        return Err(HandshakeError::Malformed("empty destination host"));
    }

    Ok(SocksRequest {
        version: SocksVersion::V5,
        command,
        host,
        port,
    })
}

async fn negotiate_v4<S>(s: &mut S) -> Result<SocksRequest, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // VN (consumed), CD, DSTPORT, DSTIP, USERID, NUL [, DOMAIN, NUL]
    let cmd = read_u8(s).await?;
    let port = read_u16(s).await?;
    let mut ip = [0u8; 4];
    s.read_exact(&mut ip).await?;
    let _user_id = read_nul_terminated(s).await?;

    // 4a: 0.0.0.x with x != 0 means a domain name follows
    let host = if ip[..3] == [0, 0, 0] && ip[3] != 0 {
        let name = read_nul_terminated(s).await?;
        String::from_utf8(name).map_err(|_| HandshakeError::Malformed("domain is not UTF-8"))?
    } else {
        Ipv4Addr::from(ip).to_string()
    };

    let command = match cmd {
        0x01 => SocksCommand::Connect,
        0x02 => SocksCommand::Bind,
        other => {
            send_reply(s, SocksVersion::V4, Reply::CommandNotSupported, None).await?;
            return Err(HandshakeError::UnknownCommand(other));
        }
    };
    if host.is_empty() {
        send_reply(s, SocksVersion::V4, Reply::GeneralFailure, None).await?;
        return Err(HandshakeError::Malformed("empty destination host"));
    }

    Ok(SocksRequest {
        version: SocksVersion::V4,
        command,
        host,
        port,
    })
}

/// Writes a reply. `bound` fills BND.ADDR/BND.PORT when it is IPv4; zeros otherwise.
pub async fn send_reply<S>(
    s: &mut S,
    version: SocksVersion,
    reply: Reply,
    bound: Option<SocketAddr>,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let (ip, port) = match bound {
        Some(SocketAddr::V4(a)) => (a.ip().octets(), a.port()),
        _ => ([0u8; 4], 0),
    };
    let [p_hi, p_lo] = port.to_be_bytes();
    match version {
        SocksVersion::V5 => {
            // VER, REP, RSV, ATYP=1 (IPv4), BND.ADDR, BND.PORT
            s.write_all(&[
                SOCKS5_VERSION,
                reply.socks5_code(),
                0x00,
                0x01,
                ip[0],
                ip[1],
                ip[2],
                ip[3],
                p_hi,
                p_lo,
            ])
            .await?;
        }
        SocksVersion::V4 => {
            s.write_all(&[0x00, reply.socks4_code(), p_hi, p_lo, ip[0], ip[1], ip[2], ip[3]])
                .await?;
        }
    }
    s.flush().await
}

async fn read_u8<S: AsyncRead + Unpin>(s: &mut S) -> io::Result<u8> {
    let mut b = [0u8; 1];
    s.read_exact(&mut b).await?;
    Ok(b[0])
}

async fn read_u16<S: AsyncRead + Unpin>(s: &mut S) -> io::Result<u16> {
    let mut b = [0u8; 2];
    s.read_exact(&mut b).await?;
    Ok(u16::from_be_bytes(b))
}

async fn read_nul_terminated<S: AsyncRead + Unpin>(s: &mut S) -> Result<Vec<u8>, HandshakeError> {
    let mut out = Vec::new();
    loop {
        match read_u8(s).await? {
            0 => return Ok(out),
            b if out.len() < MAX_NUL_TERMINATED => out.push(b),
            _ => return Err(HandshakeError::Malformed("unterminated string")),
        }
    }
}
