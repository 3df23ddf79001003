//! The decoy filesystem
//!
//! Every path exists, every upload succeeds and nothing is ever stored.
//! Content comes from the configured catalog; metadata is invented per call.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::catalog::SyntheticEntry;
use crate::handlers::{ContentReader, DiscardWriter, FileHandlers, Method, Request};
use crate::listing::Listing;
use crate::recorder::Recorder;
use crate::{Config, Result};

/// Served for any path missing from the catalog
pub const FALLBACK_CONTENT: &str = "hello world";

/// Per-connection handler bound to the authenticated identity
#[derive(Clone)]
pub struct DecoyFs {
    config: Arc<Config>,
    recorder: Arc<Recorder>,
    ip: String,
    user: String,
}

impl DecoyFs {
    pub fn new(
        config: Arc<Config>,
        recorder: Arc<Recorder>,
        ip: impl Into<String>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            config,
            recorder,
            ip: ip.into(),
            user: user.into(),
        }
    }

    async fn record(&self, kind: &str, request: &Request) {
        let mut action = format!(
            "File {} Operation: {}, Path: {}",
            kind, request.method, request.path
        );
        if let Some(target) = &request.target {
            action.push_str(", Target: ");
            action.push_str(target);
        }
        self.recorder
            .record_activity(&self.ip, &self.user, action)
            .await;
    }

    /// Stall the peer; awaited inline so the whole SFTP session waits
    async fn delay(&self) {
        let delay = self.config.command_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn catalog_listing(&self) -> Listing {
        Listing::new(
            self.config
                .catalog
                .values()
                .map(|entry| SyntheticEntry::file(entry.name.clone()))
                .collect(),
        )
    }
}

#[async_trait]
impl FileHandlers for DecoyFs {
    async fn file_read(&self, request: &Request) -> Result<ContentReader> {
        self.record("Read", request).await;

        let reader = match self.config.catalog.get(&request.path) {
            Some(entry) => ContentReader::new(entry.content.clone()),
            None => {
                debug!(path = %request.path, "Serving fallback content");
                ContentReader::new(FALLBACK_CONTENT)
            }
        };
        Ok(reader)
    }

    async fn file_write(&self, request: &Request) -> Result<DiscardWriter> {
        self.record("Write", request).await;
        Ok(DiscardWriter::new())
    }

    async fn file_cmd(&self, request: &Request) -> Result<()> {
        self.record("Command", request).await;
        self.delay().await;
        Ok(())
    }

    async fn file_list(&self, request: &Request) -> Result<Listing> {
        self.record("List", request).await;
        self.delay().await;

        let listing = match request.method {
            Method::List => self.catalog_listing(),
            Method::Readlink => Listing::empty(),
            // Stat, Lstat and anything else routed here: the path always exists
            _ => Listing::new(vec![SyntheticEntry::file(request.path.clone())]),
        };
        Ok(listing)
    }
}
