//! Synthetic file catalog and directory entries

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::protocol::FileAttrs;

/// Regular file, `rwxrwxrwx`
pub const SYNTHETIC_MODE: u32 = 0o100_777;

/// One file in the decoy catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Name shown in directory listings
    pub name: String,
    /// Bytes served on read
    #[serde(default)]
    pub content: String,
}

/// Directory entry fabricated for a listing or stat reply
///
/// Size and mtime are produced when the entry is built, so two listings of
/// the same catalog never agree on them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyntheticEntry {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: DateTime<Utc>,
    pub is_dir: bool,
}

impl SyntheticEntry {
    /// Fabricate a plain file entry with a random size and the current time
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: rand::thread_rng().gen_range(0..=i64::MAX as u64),
            mode: SYNTHETIC_MODE,
            mtime: Utc::now(),
            is_dir: false,
        }
    }

    /// SFTP attribute block for this entry
    pub fn attrs(&self) -> FileAttrs {
        let mtime = u32::try_from(self.mtime.timestamp()).unwrap_or(u32::MAX);
        FileAttrs {
            size: Some(self.size),
            uid: Some(0),
            gid: Some(0),
            permissions: Some(self.mode),
            atime: Some(mtime),
            mtime: Some(mtime),
        }
    }

    /// `ls -l` style line sent as the SFTP long name
    pub fn longname(&self) -> String {
        let kind = if self.is_dir { 'd' } else { '-' };
        format!(
            "{}{} 1 root root {:>8} {} {}",
            kind,
            permission_string(self.mode),
            self.size,
            self.mtime.format("%b %e %H:%M"),
            self.name
        )
    }
}

fn permission_string(mode: u32) -> String {
    const FLAGS: [(u32, char); 9] = [
        (0o400, 'r'),
        (0o200, 'w'),
        (0o100, 'x'),
        (0o040, 'r'),
        (0o020, 'w'),
        (0o010, 'x'),
        (0o004, 'r'),
        (0o002, 'w'),
        (0o001, 'x'),
    ];
    FLAGS
        .iter()
        .map(|&(bit, c)| if mode & bit != 0 { c } else { '-' })
        .collect()
}
