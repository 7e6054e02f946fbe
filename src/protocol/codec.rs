//! Client wire protocol: `len(4) | cmd(4) | body[len]`
//! framed requests, `len(4) | cmd(4) | status(4) | body[len]` framed
//! replies. All integers little-endian unless noted.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{ResponderError, Result};

const MAX_FRAME_LEN: u32 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    GetVersion = 0,
    GetpwNam = 1,
    GetpwUid = 2,
    SetpwEnt = 3,
    GetpwEnt = 4,
    EndpwEnt = 5,
    GetgrNam = 6,
    GetgrGid = 7,
    SetgrEnt = 8,
    GetgrEnt = 9,
    EndgrEnt = 10,
    Initgr = 11,
    SetNetgrEnt = 12,
    GetNetgrEnt = 13,
    EndNetgrEnt = 14,
    GetservByName = 15,
    GetservByPort = 16,
    SetservEnt = 17,
    GetservEnt = 18,
    EndservEnt = 19,
    GetsidByName = 20,
    GetsidById = 21,
    GetnameBySid = 22,
    GetidBySid = 23,
}

impl Command {
    pub fn from_u32(v: u32) -> Option<Self> {
        use Command::*;
        Some(match v {
            0 => GetVersion,
            1 => GetpwNam,
            2 => GetpwUid,
            3 => SetpwEnt,
            4 => GetpwEnt,
            5 => EndpwEnt,
            6 => GetgrNam,
            7 => GetgrGid,
            8 => SetgrEnt,
            9 => GetgrEnt,
            10 => EndgrEnt,
            11 => Initgr,
            12 => SetNetgrEnt,
            13 => GetNetgrEnt,
            14 => EndNetgrEnt,
            15 => GetservByName,
            16 => GetservByPort,
            17 => SetservEnt,
            18 => GetservEnt,
            19 => EndservEnt,
            20 => GetsidByName,
            21 => GetsidById,
            22 => GetnameBySid,
            23 => GetidBySid,
            _ => return None,
        })
    }

    pub fn is_netgroup(self) -> bool {
        matches!(self, Command::SetNetgrEnt | Command::GetNetgrEnt | Command::EndNetgrEnt)
    }
}

#[derive(Debug)]
pub struct Frame {
    pub cmd: Command,
    pub body: Bytes,
}

pub struct ReplyFrame {
    pub cmd: Command,
    pub status: i32,
    pub body: BytesMut,
}

pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let len = reader.read_u32_le().await?;
    if len > MAX_FRAME_LEN {
        return Err(ResponderError::InvalidInput("frame too large".into()));
    }
    let cmd_raw = reader.read_u32_le().await?;
    let cmd = Command::from_u32(cmd_raw).ok_or(ResponderError::Unsupported)?;
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Frame {
        cmd,
        body: Bytes::from(body),
    })
}

pub async fn write_reply<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, reply: ReplyFrame) -> Result<()> {
    let mut header = BytesMut::with_capacity(12);
    header.put_u32_le(reply.body.len() as u32);
    header.put_u32_le(reply.cmd as u32);
    header.put_i32_le(reply.status);
    writer.write_all(&header).await?;
    writer.write_all(&reply.body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a nul-terminated string out of a body buffer, advancing past it.
pub fn read_cstr(buf: &mut Bytes) -> Result<String> {
    let pos = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ResponderError::InvalidInput("missing nul terminator".into()))?;
    let raw = buf.split_to(pos);
    buf.advance(1);
    String::from_utf8(raw.to_vec()).map_err(|_| ResponderError::InvalidInput("non-UTF-8 name".into()))
}

pub fn read_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.len() < 4 {
        return Err(ResponderError::InvalidInput("truncated body".into()));
    }
    Ok(buf.get_u32_le())
}

pub fn read_u16(buf: &mut Bytes) -> Result<u16> {
    if buf.len() < 2 {
        return Err(ResponderError::InvalidInput("truncated body".into()));
    }
    Ok(buf.get_u16_le())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trips_over_a_duplex_stream() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let body = b"alice\0".to_vec();
        let mut header = BytesMut::new();
        header.put_u32_le(body.len() as u32);
        header.put_u32_le(Command::GetpwNam as u32);
        client.write_all(&header).await.unwrap();
        client.write_all(&body).await.unwrap();

        let frame = read_frame(&mut server).await.unwrap();
        assert_eq!(frame.cmd, Command::GetpwNam);
        let mut b = frame.body.clone();
        assert_eq!(read_cstr(&mut b).unwrap(), "alice");
    }

    #[test]
    fn read_cstr_rejects_missing_terminator() {
        let mut buf = Bytes::from_static(b"no-nul");
        assert!(read_cstr(&mut buf).is_err());
    }

    #[test]
    fn netgroup_commands_are_recognized_by_the_codec() {
        assert!(Command::SetNetgrEnt.is_netgroup());
        assert!(!Command::GetpwNam.is_netgroup());
    }
}
