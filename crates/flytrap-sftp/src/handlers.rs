//! Request handler interface for the SFTP loop
//!
//! The packet loop in [`crate::sftp`] decodes wire requests into [`Request`]s
//! and hands them to a [`FileHandlers`] implementation. Handles, offsets and
//! paging stay in the loop; the handlers only decide *what* a path looks like.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

use crate::listing::Listing;
use crate::Result;

/// Operation requested by the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Put,
    Open,
    Setstat,
    Rename,
    Rmdir,
    Mkdir,
    Remove,
    Symlink,
    List,
    Stat,
    Lstat,
    Readlink,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "Get",
            Method::Put => "Put",
            Method::Open => "Open",
            Method::Setstat => "Setstat",
            Method::Rename => "Rename",
            Method::Rmdir => "Rmdir",
            Method::Mkdir => "Mkdir",
            Method::Remove => "Remove",
            Method::Symlink => "Symlink",
            Method::List => "List",
            Method::Stat => "Stat",
            Method::Lstat => "Lstat",
            Method::Readlink => "Readlink",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    /// Second path for rename and symlink
    pub target: Option<String>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            target: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// Position-addressable reader over served content
#[derive(Debug, Clone)]
pub struct ContentReader {
    data: Bytes,
}

impl ContentReader {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes in `[offset, offset + len)`, clipped to the content
    ///
    /// # Returns
    ///
    /// `None` when `offset` is at or past the end of the content.
    pub fn read_at(&self, offset: u64, len: u32) -> Option<Bytes> {
        let start = usize::try_from(offset).ok()?;
        if start >= self.data.len() {
            return None;
        }
        let end = start.saturating_add(len as usize).min(self.data.len());
        Some(self.data.slice(start..end))
    }
}

/// Writer that accepts and drops everything
#[derive(Debug, Clone, Default)]
pub struct DiscardWriter {
    bytes_discarded: u64,
}

impl DiscardWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a chunk at any offset and throw it away
    pub fn write_at(&mut self, _offset: u64, data: &[u8]) -> usize {
        self.bytes_discarded += data.len() as u64;
        data.len()
    }

    pub fn bytes_discarded(&self) -> u64 {
        self.bytes_discarded
    }
}

/// Capability set served to an SFTP session
#[async_trait]
pub trait FileHandlers: Send + Sync {
    /// Serve a download (`Get`)
    async fn file_read(&self, request: &Request) -> Result<ContentReader>;

    /// Accept an upload (`Put`)
    async fn file_write(&self, request: &Request) -> Result<DiscardWriter>;

    /// Run a mutating command (setstat, rename, mkdir, rmdir, remove, symlink)
    async fn file_cmd(&self, request: &Request) -> Result<()>;

    /// Answer `List`, `Stat`, `Lstat` or `Readlink`
    async fn file_list(&self, request: &Request) -> Result<Listing>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_at_clips_and_ends() {
        let reader = ContentReader::new("hello world");
        assert_eq!(reader.read_at(0, 5).unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(reader.read_at(6, 100).unwrap(), Bytes::from_static(b"world"));
        assert!(reader.read_at(11, 1).is_none());
        assert!(reader.read_at(u64::MAX, 1).is_none());
    }

    #[test]
    fn test_discard_writer_counts_only() {
        let mut writer = DiscardWriter::new();
        assert_eq!(writer.write_at(0, b"#!/bin/sh\n"), 10);
        assert_eq!(writer.write_at(4096, &[0u8; 32]), 32);
        assert_eq!(writer.bytes_discarded(), 42);
    }

    #[test]
    fn test_request_builder() {
        let request = Request::new(Method::Rename, "/a").with_target("/b");
        assert_eq!(request.method.to_string(), "Rename");
        assert_eq!(request.target.as_deref(), Some("/b"));
    }
}
