//! SFTP request loop
//!
//! Decodes SFTP v3 requests from the subsystem stream, turns them into
//! [`FileHandlers`] calls and encodes the replies. Requests are served one at
//! a time, so a delay inside a handler stalls the whole session.

use bytes::Bytes;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::handlers::{ContentReader, DiscardWriter, FileHandlers, Method, Request};
use crate::listing::{Listing, Page};
use crate::protocol::{
    codec, read_packet, reply, write_packet, FileAttrs, MessageType, OpenFlags, StatusCode,
    SFTP_VERSION,
};
use crate::{Error, Result};

/// Open handles allowed per session
const MAX_HANDLES: usize = 1024;

/// Entries per READDIR reply
const READDIR_BATCH: usize = 100;

/// Largest DATA payload per READ reply
const MAX_READ_LEN: u32 = 255 * 1024;

/// Serve one SFTP session until the peer closes the stream
///
/// # Errors
///
/// Returns an error when the stream breaks or the peer sends an unframeable
/// packet. Malformed requests inside a well-framed packet are answered with a
/// STATUS and do not end the session.
pub async fn serve<S, H>(mut stream: S, handlers: H) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: FileHandlers,
{
    let mut session = SftpSession::new(handlers);

    while let Some(packet) = read_packet(&mut stream).await? {
        if let Some(response) = session.handle_packet(&packet).await {
            write_packet(&mut stream, &response).await?;
        }
    }

    debug!(open_handles = session.handles.len(), "SFTP stream closed");
    Ok(())
}

/// Per-stream SFTP state
pub struct SftpSession<H> {
    handlers: H,
    handles: HashMap<Vec<u8>, Handle>,
    next_handle_id: u32,
    initialized: bool,
}

enum Handle {
    File {
        path: String,
        /// `None` for handles opened for upload
        reader: Option<ContentReader>,
        writer: DiscardWriter,
    },
    Dir {
        path: String,
        listing: Listing,
        cursor: usize,
    },
}

impl Handle {
    fn path(&self) -> &str {
        match self {
            Handle::File { path, .. } | Handle::Dir { path, .. } => path,
        }
    }
}

impl<H: FileHandlers> SftpSession<H> {
    pub fn new(handlers: H) -> Self {
        Self {
            handlers,
            handles: HashMap::new(),
            next_handle_id: 0,
            initialized: false,
        }
    }

    /// Handle one packet body (length prefix already stripped)
    ///
    /// # Returns
    ///
    /// The reply body, or `None` when nothing can be answered.
    pub async fn handle_packet(&mut self, packet: &[u8]) -> Option<Bytes> {
        let mut buf = packet;
        let type_byte = codec::get_u8(&mut buf).ok()?;

        match self.dispatch(type_byte, &mut buf).await {
            Ok(response) => Some(response),
            Err(e) => {
                if e.is_security_event() {
                    warn!(
                        event = "malformed_request",
                        message_type = type_byte,
                        error = %e,
                        "Rejected SFTP request"
                    );
                } else {
                    debug!(message_type = type_byte, error = %e, "SFTP request failed");
                }

                // INIT carries a version, not a request id
                if type_byte == MessageType::Init as u8 {
                    return None;
                }
                let mut id_buf = &packet[1..];
                let request_id = codec::get_u32(&mut id_buf).ok()?;
                Some(reply::status_error(request_id, &e))
            }
        }
    }

    async fn dispatch(&mut self, type_byte: u8, buf: &mut &[u8]) -> Result<Bytes> {
        let msg_type = MessageType::try_from(type_byte)
            .map_err(|_| Error::NotSupported(format!("Message type {}", type_byte)))?;

        if !self.initialized && msg_type != MessageType::Init {
            return Err(Error::Protocol("Session not initialized".into()));
        }

        debug!("Received SFTP message: {:?}", msg_type);

        match msg_type {
            MessageType::Init => self.handle_init(buf),
            MessageType::Open => self.handle_open(buf).await,
            MessageType::Close => self.handle_close(buf),
            MessageType::Read => self.handle_read(buf),
            MessageType::Write => self.handle_write(buf),
            MessageType::Stat => self.handle_stat(buf, Method::Stat).await,
            MessageType::Lstat => self.handle_stat(buf, Method::Lstat).await,
            MessageType::Fstat => self.handle_fstat(buf).await,
            MessageType::Setstat => self.handle_setstat(buf).await,
            MessageType::Fsetstat => self.handle_fsetstat(buf).await,
            MessageType::Opendir => self.handle_opendir(buf).await,
            MessageType::Readdir => self.handle_readdir(buf),
            MessageType::Remove => self.handle_path_cmd(buf, Method::Remove).await,
            MessageType::Mkdir => self.handle_mkdir(buf).await,
            MessageType::Rmdir => self.handle_path_cmd(buf, Method::Rmdir).await,
            MessageType::Realpath => self.handle_realpath(buf),
            MessageType::Rename => self.handle_two_path_cmd(buf, Method::Rename).await,
            MessageType::Readlink => self.handle_readlink(buf).await,
            MessageType::Symlink => self.handle_two_path_cmd(buf, Method::Symlink).await,
            _ => Err(Error::NotSupported(format!(
                "Message type {:?} is not supported",
                msg_type
            ))),
        }
    }

    fn handle_init(&mut self, buf: &mut &[u8]) -> Result<Bytes> {
        let version = codec::get_u32(buf)?;
        info!(client_version = version, server_version = SFTP_VERSION, "SFTP session initialized");
        self.initialized = true;
        Ok(reply::version())
    }

    async fn handle_open(&mut self, buf: &mut &[u8]) -> Result<Bytes> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;
        let flags = OpenFlags(codec::get_u32(buf)?);
        let _attrs = FileAttrs::decode(buf)?;

        self.ensure_handle_capacity()?;

        let handle = if flags.is_upload() {
            let writer = self.handlers.file_write(&Request::new(Method::Put, &path)).await?;
            Handle::File {
                path,
                reader: None,
                writer,
            }
        } else {
            let reader = self.handlers.file_read(&Request::new(Method::Get, &path)).await?;
            Handle::File {
                path,
                reader: Some(reader),
                writer: DiscardWriter::new(),
            }
        };

        let handle_id = self.allocate_handle(handle);
        Ok(reply::handle(request_id, &handle_id))
    }

    fn handle_close(&mut self, buf: &mut &[u8]) -> Result<Bytes> {
        let request_id = codec::get_u32(buf)?;
        let handle = codec::get_bytes(buf)?;

        match self.handles.remove(&handle) {
            Some(Handle::File { path, writer, .. }) if writer.bytes_discarded() > 0 => {
                debug!(path = %path, bytes = writer.bytes_discarded(), "Upload discarded");
            }
            Some(_) => {}
            None => return Err(Error::invalid_handle("Handle does not exist")),
        }

        Ok(reply::status(request_id, StatusCode::Ok, "Success"))
    }

    fn handle_read(&mut self, buf: &mut &[u8]) -> Result<Bytes> {
        let request_id = codec::get_u32(buf)?;
        let handle = codec::get_bytes(buf)?;
        let offset = codec::get_u64(buf)?;
        let len = codec::get_u32(buf)?;

        match self.handles.get(&handle) {
            Some(Handle::File { reader, .. }) => {
                match reader.as_ref().and_then(|r| r.read_at(offset, len.min(MAX_READ_LEN))) {
                    Some(data) => Ok(reply::data(request_id, &data)),
                    None => Ok(reply::status(request_id, StatusCode::Eof, "End of file")),
                }
            }
            Some(Handle::Dir { .. }) => {
                Err(Error::invalid_handle("Cannot read from directory handle"))
            }
            None => Err(Error::invalid_handle("Handle does not exist or is closed")),
        }
    }

    fn handle_write(&mut self, buf: &mut &[u8]) -> Result<Bytes> {
        let request_id = codec::get_u32(buf)?;
        let handle = codec::get_bytes(buf)?;
        let offset = codec::get_u64(buf)?;
        let data = codec::get_bytes(buf)?;

        match self.handles.get_mut(&handle) {
            Some(Handle::File { writer, .. }) => {
                writer.write_at(offset, &data);
                Ok(reply::status(request_id, StatusCode::Ok, "Success"))
            }
            Some(Handle::Dir { .. }) => {
                Err(Error::invalid_handle("Cannot write to directory handle"))
            }
            None => Err(Error::invalid_handle("Handle does not exist or is closed")),
        }
    }

    async fn handle_stat(&mut self, buf: &mut &[u8], method: Method) -> Result<Bytes> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;
        self.stat_reply(request_id, Request::new(method, path)).await
    }

    async fn handle_fstat(&mut self, buf: &mut &[u8]) -> Result<Bytes> {
        let request_id = codec::get_u32(buf)?;
        let path = self.handle_path(&codec::get_bytes(buf)?)?;
        self.stat_reply(request_id, Request::new(Method::Stat, path)).await
    }

    async fn stat_reply(&self, request_id: u32, request: Request) -> Result<Bytes> {
        let listing = self.handlers.file_list(&request).await?;
        let attrs = listing
            .entries()
            .first()
            .map(|entry| entry.attrs())
            .unwrap_or_default();
        Ok(reply::attrs(request_id, &attrs))
    }

    async fn handle_setstat(&mut self, buf: &mut &[u8]) -> Result<Bytes> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;
        let _attrs = FileAttrs::decode(buf)?;
        self.command_reply(request_id, Request::new(Method::Setstat, path)).await
    }

    async fn handle_fsetstat(&mut self, buf: &mut &[u8]) -> Result<Bytes> {
        let request_id = codec::get_u32(buf)?;
        let path = self.handle_path(&codec::get_bytes(buf)?)?;
        let _attrs = FileAttrs::decode(buf)?;
        self.command_reply(request_id, Request::new(Method::Setstat, path)).await
    }

    async fn handle_mkdir(&mut self, buf: &mut &[u8]) -> Result<Bytes> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;
        let _attrs = FileAttrs::decode(buf)?;
        self.command_reply(request_id, Request::new(Method::Mkdir, path)).await
    }

    async fn handle_path_cmd(&mut self, buf: &mut &[u8], method: Method) -> Result<Bytes> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;
        self.command_reply(request_id, Request::new(method, path)).await
    }

    async fn handle_two_path_cmd(&mut self, buf: &mut &[u8], method: Method) -> Result<Bytes> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;
        let target = codec::get_string(buf)?;
        self.command_reply(request_id, Request::new(method, path).with_target(target))
            .await
    }

    async fn command_reply(&self, request_id: u32, request: Request) -> Result<Bytes> {
        self.handlers.file_cmd(&request).await?;
        Ok(reply::status(request_id, StatusCode::Ok, "Success"))
    }

    async fn handle_opendir(&mut self, buf: &mut &[u8]) -> Result<Bytes> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;

        self.ensure_handle_capacity()?;
        let listing = self.handlers.file_list(&Request::new(Method::List, &path)).await?;

        let handle_id = self.allocate_handle(Handle::Dir {
            path,
            listing,
            cursor: 0,
        });
        Ok(reply::handle(request_id, &handle_id))
    }

    fn handle_readdir(&mut self, buf: &mut &[u8]) -> Result<Bytes> {
        let request_id = codec::get_u32(buf)?;
        let handle = codec::get_bytes(buf)?;

        let Some(Handle::Dir { listing, cursor, .. }) = self.handles.get_mut(&handle) else {
            return Err(Error::invalid_handle("Not an open directory handle"));
        };

        let (entries, page) = listing.page(*cursor, READDIR_BATCH);
        if page == Page::Exhausted {
            return Ok(reply::status(request_id, StatusCode::Eof, "End of directory"));
        }

        *cursor += page.copied();
        Ok(reply::name(request_id, &entries))
    }

    fn handle_realpath(&mut self, buf: &mut &[u8]) -> Result<Bytes> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;

        let resolved = if path.is_empty() || path == "." {
            "/".to_string()
        } else if path.starts_with('/') {
            path
        } else {
            format!("/{}", path)
        };

        Ok(reply::single_name(request_id, &resolved))
    }

    async fn handle_readlink(&mut self, buf: &mut &[u8]) -> Result<Bytes> {
        let request_id = codec::get_u32(buf)?;
        let path = codec::get_string(buf)?;

        let listing = self
            .handlers
            .file_list(&Request::new(Method::Readlink, path))
            .await?;
        Ok(reply::name(request_id, listing.entries()))
    }

    // Helper methods

    fn handle_path(&self, handle: &[u8]) -> Result<String> {
        self.handles
            .get(handle)
            .map(|h| h.path().to_string())
            .ok_or_else(|| Error::invalid_handle("Handle does not exist or is closed"))
    }

    fn ensure_handle_capacity(&self) -> Result<()> {
        if self.handles.len() >= MAX_HANDLES {
            warn!("Maximum file handles reached ({})", MAX_HANDLES);
            return Err(Error::Other("Too many open handles".into()));
        }
        Ok(())
    }

    fn allocate_handle(&mut self, handle: Handle) -> Vec<u8> {
        let id = self.next_handle_id;
        self.next_handle_id = self.next_handle_id.wrapping_add(1);

        let handle_id = id.to_be_bytes().to_vec();
        self.handles.insert(handle_id.clone(), handle);
        handle_id
    }
}
