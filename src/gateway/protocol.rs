//! Wire format between clients and a server's client port. All integers are little-endian.
//!
//! ```text
//! Client -> server:  | len (i32) | command (len bytes) |
//! Server -> client:  | len (i32) | response (len bytes) |
//!               or:  |  -1 (i32) | leader ipv4 (4 bytes) | leader port (u16) |
//! ```
//!
//! The server closes the connection after either reply. A hint of `0.0.0.0:0` means the server
//! doesn't know who the leader is.
use bytes::Bytes;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const REDIRECT_SENTINEL: i32 = -1;

/// Client commands are shell command lines. Anything this large is garbage.
pub(crate) const MAX_MESSAGE_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, PartialEq)]
pub(crate) enum ServerReply {
    Response(Bytes),
    Redirect(Option<SocketAddrV4>),
}

pub(crate) async fn write_message<W>(writer: &mut W, message: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = i32::try_from(message.len())
        .ok()
        .filter(|len| *len as usize <= MAX_MESSAGE_LENGTH)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(message).await?;
    writer.flush().await
}

pub(crate) async fn write_redirect<W>(writer: &mut W, leader: Option<SocketAddrV4>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let leader = leader.unwrap_or_else(|| SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));

    let mut buffer = Vec::with_capacity(10);
    buffer.extend_from_slice(&REDIRECT_SENTINEL.to_le_bytes());
    buffer.extend_from_slice(&leader.ip().octets());
    buffer.extend_from_slice(&leader.port().to_le_bytes());
    writer.write_all(&buffer).await?;
    writer.flush().await
}

/// Reads a client's command.
pub(crate) async fn read_message<R>(reader: &mut R) -> io::Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_i32_le().await?;
    read_payload(reader, len).await
}

pub(crate) async fn read_reply<R>(reader: &mut R) -> io::Result<ServerReply>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_i32_le().await?;
    if len != REDIRECT_SENTINEL {
        return Ok(ServerReply::Response(read_payload(reader, len).await?));
    }

    let mut octets = [0u8; 4];
    reader.read_exact(&mut octets).await?;
    let port = reader.read_u16_le().await?;

    let leader = SocketAddrV4::new(Ipv4Addr::from(octets), port);
    if leader.ip().is_unspecified() && port == 0 {
        Ok(ServerReply::Redirect(None))
    } else {
        Ok(ServerReply::Redirect(Some(leader)))
    }
}

async fn read_payload<R>(reader: &mut R, len: i32) -> io::Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let len = usize::try_from(len)
        .ok()
        .filter(|len| *len <= MAX_MESSAGE_LENGTH)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("bad message length {}", len)))?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}
