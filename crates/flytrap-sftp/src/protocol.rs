//! SFTP wire format
//!
//! SFTP version 3 (draft-ietf-secsh-filexfer-02) as spoken by OpenSSH and
//! most attack tooling. Every packet on the subsystem stream is a `u32`
//! big-endian length followed by a type byte and the payload.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::catalog::SyntheticEntry;

/// SFTP Protocol Version
pub const SFTP_VERSION: u32 = 3;

/// Largest packet accepted from a peer (256 KiB)
pub const MAX_PACKET_LEN: u32 = 256 * 1024;

/// SFTP message types (draft-ietf-secsh-filexfer-02)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Init = 1,
    Version = 2,
    Open = 3,
    Close = 4,
    Read = 5,
    Write = 6,
    Lstat = 7,
    Fstat = 8,
    Setstat = 9,
    Fsetstat = 10,
    Opendir = 11,
    Readdir = 12,
    Remove = 13,
    Mkdir = 14,
    Rmdir = 15,
    Realpath = 16,
    Stat = 17,
    Rename = 18,
    Readlink = 19,
    Symlink = 20,
    Status = 101,
    Handle = 102,
    Data = 103,
    Name = 104,
    Attrs = 105,
    Extended = 200,
    ExtendedReply = 201,
}

impl TryFrom<u8> for MessageType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Init),
            2 => Ok(MessageType::Version),
            3 => Ok(MessageType::Open),
            4 => Ok(MessageType::Close),
            5 => Ok(MessageType::Read),
            6 => Ok(MessageType::Write),
            7 => Ok(MessageType::Lstat),
            8 => Ok(MessageType::Fstat),
            9 => Ok(MessageType::Setstat),
            10 => Ok(MessageType::Fsetstat),
            11 => Ok(MessageType::Opendir),
            12 => Ok(MessageType::Readdir),
            13 => Ok(MessageType::Remove),
            14 => Ok(MessageType::Mkdir),
            15 => Ok(MessageType::Rmdir),
            16 => Ok(MessageType::Realpath),
            17 => Ok(MessageType::Stat),
            18 => Ok(MessageType::Rename),
            19 => Ok(MessageType::Readlink),
            20 => Ok(MessageType::Symlink),
            101 => Ok(MessageType::Status),
            102 => Ok(MessageType::Handle),
            103 => Ok(MessageType::Data),
            104 => Ok(MessageType::Name),
            105 => Ok(MessageType::Attrs),
            200 => Ok(MessageType::Extended),
            201 => Ok(MessageType::ExtendedReply),
            _ => Err(crate::Error::Protocol(format!(
                "Unknown message type: {}",
                value
            ))),
        }
    }
}

/// SFTP Status codes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 0,
    Eof = 1,
    NoSuchFile = 2,
    PermissionDenied = 3,
    Failure = 4,
    BadMessage = 5,
    NoConnection = 6,
    ConnectionLost = 7,
    OpUnsupported = 8,
}

impl From<StatusCode> for u32 {
    fn from(code: StatusCode) -> u32 {
        code as u32
    }
}

/// File open flags (`pflags` of SSH_FXP_OPEN)
#[derive(Debug, Clone, Copy)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const READ: u32 = 0x00000001;
    pub const WRITE: u32 = 0x00000002;
    pub const APPEND: u32 = 0x00000004;
    pub const CREAT: u32 = 0x00000008;
    pub const TRUNC: u32 = 0x00000010;
    pub const EXCL: u32 = 0x00000020;

    /// Any flag that means the client intends to upload
    pub fn is_upload(&self) -> bool {
        self.0 & (Self::WRITE | Self::APPEND | Self::CREAT | Self::TRUNC | Self::EXCL) != 0
    }
}

/// File attributes (draft-ietf-secsh-filexfer-02, section 5)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttrs {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub permissions: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

impl FileAttrs {
    const FLAG_SIZE: u32 = 0x00000001;
    const FLAG_UIDGID: u32 = 0x00000002;
    const FLAG_PERMISSIONS: u32 = 0x00000004;
    const FLAG_ACMODTIME: u32 = 0x00000008;
    const FLAG_EXTENDED: u32 = 0x80000000;

    /// Encode file attributes to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        let mut flags = 0u32;

        if self.size.is_some() {
            flags |= Self::FLAG_SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= Self::FLAG_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= Self::FLAG_PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= Self::FLAG_ACMODTIME;
        }

        buf.put_u32(flags);

        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }

        buf
    }

    /// Decode file attributes from bytes
    ///
    /// Extended attribute pairs are consumed and dropped.
    pub fn decode(buf: &mut &[u8]) -> crate::Result<Self> {
        let flags = codec::get_u32(buf)?;
        let mut attrs = FileAttrs::default();

        if flags & Self::FLAG_SIZE != 0 {
            attrs.size = Some(codec::get_u64(buf)?);
        }

        if flags & Self::FLAG_UIDGID != 0 {
            attrs.uid = Some(codec::get_u32(buf)?);
            attrs.gid = Some(codec::get_u32(buf)?);
        }

        if flags & Self::FLAG_PERMISSIONS != 0 {
            attrs.permissions = Some(codec::get_u32(buf)?);
        }

        if flags & Self::FLAG_ACMODTIME != 0 {
            attrs.atime = Some(codec::get_u32(buf)?);
            attrs.mtime = Some(codec::get_u32(buf)?);
        }

        if flags & Self::FLAG_EXTENDED != 0 {
            let count = codec::get_u32(buf)?;
            for _ in 0..count {
                codec::get_bytes(buf)?;
                codec::get_bytes(buf)?;
            }
        }

        Ok(attrs)
    }
}

/// Reply packet builders
///
/// Each returns the packet body without the length prefix; [`write_packet`]
/// adds it.
pub mod reply {
    use super::*;

    pub fn version() -> Bytes {
        let mut response = BytesMut::new();
        response.put_u8(MessageType::Version as u8);
        response.put_u32(SFTP_VERSION);
        response.freeze()
    }

    pub fn status(request_id: u32, code: StatusCode, msg: &str) -> Bytes {
        status_raw(request_id, code.into(), msg)
    }

    /// STATUS from an error, with the sanitized message
    pub fn status_error(request_id: u32, error: &crate::Error) -> Bytes {
        status_raw(request_id, error.to_status_code(), &error.sanitized_message())
    }

    fn status_raw(request_id: u32, code: u32, msg: &str) -> Bytes {
        let mut response = BytesMut::new();
        response.put_u8(MessageType::Status as u8);
        response.put_u32(request_id);
        response.put_u32(code);
        codec::put_string(&mut response, msg);
        codec::put_string(&mut response, "en"); // language tag
        response.freeze()
    }

    pub fn handle(request_id: u32, handle: &[u8]) -> Bytes {
        let mut response = BytesMut::new();
        response.put_u8(MessageType::Handle as u8);
        response.put_u32(request_id);
        codec::put_bytes(&mut response, handle);
        response.freeze()
    }

    pub fn data(request_id: u32, data: &[u8]) -> Bytes {
        let mut response = BytesMut::new();
        response.put_u8(MessageType::Data as u8);
        response.put_u32(request_id);
        codec::put_bytes(&mut response, data);
        response.freeze()
    }

    pub fn attrs(request_id: u32, attrs: &FileAttrs) -> Bytes {
        let mut response = BytesMut::new();
        response.put_u8(MessageType::Attrs as u8);
        response.put_u32(request_id);
        response.put(attrs.encode());
        response.freeze()
    }

    /// NAME reply listing synthetic entries
    pub fn name(request_id: u32, entries: &[SyntheticEntry]) -> Bytes {
        let mut response = BytesMut::new();
        response.put_u8(MessageType::Name as u8);
        response.put_u32(request_id);
        response.put_u32(entries.len() as u32);
        for entry in entries {
            codec::put_string(&mut response, &entry.name);
            codec::put_string(&mut response, &entry.longname());
            response.put(entry.attrs().encode());
        }
        response.freeze()
    }

    /// NAME reply with a single bare path (realpath)
    pub fn single_name(request_id: u32, path: &str) -> Bytes {
        let mut response = BytesMut::new();
        response.put_u8(MessageType::Name as u8);
        response.put_u32(request_id);
        response.put_u32(1);
        codec::put_string(&mut response, path);
        codec::put_string(&mut response, path); // longname
        response.put(FileAttrs::default().encode());
        response.freeze()
    }
}

/// Read one length-prefixed packet
///
/// # Returns
///
/// `Ok(None)` on a clean end of stream before a new packet starts.
///
/// # Errors
///
/// `Error::Protocol` for empty or oversized frames, `Error::Io` when the
/// stream breaks mid-packet.
pub async fn read_packet<R>(reader: &mut R) -> crate::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len == 0 {
        return Err(crate::Error::Protocol("Empty packet".into()));
    }
    if len > MAX_PACKET_LEN {
        return Err(crate::Error::Protocol(format!(
            "Packet of {} bytes exceeds limit of {}",
            len, MAX_PACKET_LEN
        )));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(Bytes::from(body)))
}

/// Write one packet with its length prefix and flush
pub async fn write_packet<W>(writer: &mut W, body: &[u8]) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = BytesMut::with_capacity(4 + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_slice(body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Helper functions for encoding/decoding SFTP protocol fields
pub mod codec {
    use bytes::{Buf, BufMut, BytesMut};

    /// Encode a string as SFTP string (length + data)
    pub fn put_string(buf: &mut BytesMut, s: &str) {
        buf.put_u32(s.len() as u32);
        buf.put_slice(s.as_bytes());
    }

    /// Decode an SFTP string
    ///
    /// Paths from hostile clients are not always valid UTF-8; invalid
    /// sequences are replaced rather than rejected so they still get logged.
    pub fn get_string(buf: &mut &[u8]) -> crate::Result<String> {
        let bytes = get_bytes(buf)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Encode bytes as SFTP string (length + data)
    pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
    }

    /// Decode SFTP bytes
    pub fn get_bytes(buf: &mut &[u8]) -> crate::Result<Vec<u8>> {
        let len = get_u32(buf)? as usize;
        if buf.remaining() < len {
            return Err(crate::Error::Protocol("Insufficient data for bytes".into()));
        }

        let bytes = buf[..len].to_vec();
        buf.advance(len);
        Ok(bytes)
    }

    pub fn get_u8(buf: &mut &[u8]) -> crate::Result<u8> {
        if buf.remaining() < 1 {
            return Err(crate::Error::Protocol("Insufficient data for u8".into()));
        }
        Ok(buf.get_u8())
    }

    pub fn get_u32(buf: &mut &[u8]) -> crate::Result<u32> {
        if buf.remaining() < 4 {
            return Err(crate::Error::Protocol("Insufficient data for u32".into()));
        }
        Ok(buf.get_u32())
    }

    pub fn get_u64(buf: &mut &[u8]) -> crate::Result<u64> {
        if buf.remaining() < 8 {
            return Err(crate::Error::Protocol("Insufficient data for u64".into()));
        }
        Ok(buf.get_u64())
    }
}
