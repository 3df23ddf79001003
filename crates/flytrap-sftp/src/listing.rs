//! Paged enumeration of synthetic directory entries
//!
//! A [`Listing`] is a frozen snapshot. Callers keep their own cursor and ask
//! for a page at an offset, the same way a positional read works on a file.

use crate::catalog::SyntheticEntry;

/// Outcome of one [`Listing::list_at`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    /// Destination filled completely; more entries may follow
    Full(usize),
    /// Fewer entries than requested remained; the sequence ends here
    Short(usize),
    /// Offset at or past the end; nothing copied
    Exhausted,
}

impl Page {
    /// Number of entries copied
    pub fn copied(self) -> usize {
        match self {
            Page::Full(n) | Page::Short(n) => n,
            Page::Exhausted => 0,
        }
    }

    /// Whether the caller has reached the end of the sequence
    pub fn is_end(self) -> bool {
        !matches!(self, Page::Full(_))
    }
}

/// Snapshot of entries returned by a list, stat or readlink request
#[derive(Debug, Clone, Default)]
pub struct Listing {
    entries: Vec<SyntheticEntry>,
}

impl Listing {
    pub fn new(entries: Vec<SyntheticEntry>) -> Self {
        Self { entries }
    }

    /// Listing with no entries (readlink)
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[SyntheticEntry] {
        &self.entries
    }

    /// Copy entries starting at `offset` into `dest`
    ///
    /// # Returns
    ///
    /// [`Page::Full`] when `dest` was filled, [`Page::Short`] when the
    /// remaining entries did not fill it and [`Page::Exhausted`] when
    /// `offset` is already at or past the end.
    pub fn list_at(&self, dest: &mut [SyntheticEntry], offset: usize) -> Page {
        if offset >= self.entries.len() {
            return Page::Exhausted;
        }

        let remaining = &self.entries[offset..];
        let n = remaining.len().min(dest.len());
        dest[..n].clone_from_slice(&remaining[..n]);

        if n < dest.len() {
            Page::Short(n)
        } else {
            Page::Full(n)
        }
    }

    /// Owned page of at most `capacity` entries starting at `offset`
    pub fn page(&self, offset: usize, capacity: usize) -> (Vec<SyntheticEntry>, Page) {
        let mut dest = vec![SyntheticEntry::default(); capacity];
        let page = self.list_at(&mut dest, offset);
        dest.truncate(page.copied());
        (dest, page)
    }
}
