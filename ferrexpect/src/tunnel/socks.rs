//! Server side of the SOCKS4, SOCKS4a and SOCKS5 CONNECT handshakes.

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TunnelError;

const SOCKS4: u8 = 0x04;
const SOCKS5: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const NO_AUTH: u8 = 0x00;
const NO_ACCEPTABLE_METHOD: u8 = 0xFF;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const SOCKS4_GRANTED: u8 = 0x5A;
const SOCKS4_REJECTED: u8 = 0x5B;

const SOCKS5_SUCCEEDED: u8 = 0x00;
const SOCKS5_GENERAL_FAILURE: u8 = 0x01;
const SOCKS5_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const SOCKS5_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Longest user id or domain accepted in a SOCKS4 request.
const MAX_SOCKS4_FIELD: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    V4,
    V5,
}

/// A CONNECT request read from a SOCKS client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    pub version: SocksVersion,
    pub host: String,
    pub port: u16,
}

/// Run the handshake up to (not including) the final reply.
///
/// Unsupported commands and address types are answered with the matching
/// error reply before the error is returned.
pub async fn read_request<S>(stream: &mut S) -> Result<SocksRequest, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match stream.read_u8().await? {
        SOCKS4 => read_socks4(stream).await,
        SOCKS5 => read_socks5(stream).await,
        other => Err(TunnelError::Socks(format!("unsupported SOCKS version {other}"))),
    }
}

async fn read_socks4<S>(stream: &mut S) -> Result<SocksRequest, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let command = stream.read_u8().await?;
    let port = stream.read_u16().await?;
    let mut ip = [0u8; 4];
    stream.read_exact(&mut ip).await?;
    // user id, unused
    read_null_terminated(stream).await?;

    if command != CMD_CONNECT {
        send_reply(stream, SocksVersion::V4, false).await?;
        return Err(TunnelError::Socks(format!("unsupported SOCKS4 command {command}")));
    }

    // SOCKS4a: 0.0.0.x with x != 0 means a domain name follows
    let host = if ip[..3] == [0, 0, 0] && ip[3] != 0 {
        read_null_terminated(stream).await?
    } else {
        Ipv4Addr::from(ip).to_string()
    };

    Ok(SocksRequest {
        version: SocksVersion::V4,
        host,
        port,
    })
}

async fn read_socks5<S>(stream: &mut S) -> Result<SocksRequest, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method_count = stream.read_u8().await?;
    let mut methods = vec![0u8; usize::from(method_count)];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&NO_AUTH) {
        stream.write_all(&[SOCKS5, NO_ACCEPTABLE_METHOD]).await?;
        return Err(TunnelError::Socks(
            "client offers no supported authentication method".into(),
        ));
    }
    stream.write_all(&[SOCKS5, NO_AUTH]).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, command, _reserved, address_type] = header;

    if version != SOCKS5 {
        return Err(TunnelError::Socks(format!(
            "unexpected version {version} in SOCKS5 request"
        )));
    }
    if command != CMD_CONNECT {
        send_socks5_reply(stream, SOCKS5_COMMAND_NOT_SUPPORTED).await?;
        return Err(TunnelError::Socks(format!("unsupported SOCKS5 command {command}")));
    }

    let host = match address_type {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut name = vec![0u8; usize::from(len)];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name)
                .map_err(|_| TunnelError::Socks("domain name is not valid UTF-8".into()))?
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            Ipv6Addr::from(ip).to_string()
        }
        other => {
            send_socks5_reply(stream, SOCKS5_ADDRESS_NOT_SUPPORTED).await?;
            return Err(TunnelError::Socks(format!("unsupported address type {other}")));
        }
    };
    let port = stream.read_u16().await?;

    Ok(SocksRequest {
        version: SocksVersion::V5,
        host,
        port,
    })
}

async fn read_null_terminated<S>(stream: &mut S) -> Result<String, TunnelError>
where
    S: AsyncRead + Unpin,
{
    let mut field = Vec::new();
    loop {
        match stream.read_u8().await? {
            0 => break,
            byte if field.len() < MAX_SOCKS4_FIELD => field.push(byte),
            _ => return Err(TunnelError::Socks("SOCKS4 field too long".into())),
        }
    }
    String::from_utf8(field).map_err(|_| TunnelError::Socks("SOCKS4 field is not valid UTF-8".into()))
}

/// Tell the client whether the connection was established.
pub async fn send_reply<S>(stream: &mut S, version: SocksVersion, granted: bool) -> Result<(), TunnelError>
where
    S: AsyncWrite + Unpin,
{
    match version {
        SocksVersion::V4 => {
            let status = if granted { SOCKS4_GRANTED } else { SOCKS4_REJECTED };
            stream.write_all(&[0, status, 0, 0, 0, 0, 0, 0]).await?;
            stream.flush().await?;
            Ok(())
        }
        SocksVersion::V5 => {
            let status = if granted {
                SOCKS5_SUCCEEDED
            } else {
                SOCKS5_GENERAL_FAILURE
            };
            send_socks5_reply(stream, status).await
        }
    }
}

async fn send_socks5_reply<S>(stream: &mut S, status: u8) -> Result<(), TunnelError>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS5, status, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    stream.flush().await?;
    Ok(())
}
