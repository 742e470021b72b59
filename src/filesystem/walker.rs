//! Lazy directory listings.
//!
//! A [`DirListing`] pulls one directory block at a time from the driver's cursor, decodes
//! it, and hands entries out in on-disk order. Nothing below the listed directory is read,
//! and dropping the listing early releases everything it holds.

use log::{debug, warn};
use std::collections::{HashSet, VecDeque};
use std::sync::Weak;

use super::entry::DirectoryEntry;
use super::exfat::ExFatDirCursor;
use super::ext::ExtDirCursor;
use super::fat::FatDirCursor;
use crate::error::InspectError;
use crate::image::{ImageSource, VolumeView};

/// Block-at-a-time access to one directory.
pub(crate) trait DirBlocks {
    /// Reads the next block of directory records, `None` once the directory is exhausted.
    fn next_block(&mut self, view: &VolumeView<'_>) -> Result<Option<Vec<u8>>, InspectError>;

    /// Decodes the records of one block into `batch`, in on-disk order.
    fn decode_block(&mut self, view: &VolumeView<'_>, block: &[u8], batch: &mut EntryBatch);
}

/// Driver-specific directory cursor.
pub(crate) enum DirCursor {
    Fat(FatDirCursor),
    ExFat(ExFatDirCursor),
    Ext(ExtDirCursor),
}

impl DirBlocks for DirCursor {
    fn next_block(&mut self, view: &VolumeView<'_>) -> Result<Option<Vec<u8>>, InspectError> {
        match self {
            DirCursor::Fat(cursor) => cursor.next_block(view),
            DirCursor::ExFat(cursor) => cursor.next_block(view),
            DirCursor::Ext(cursor) => cursor.next_block(view),
        }
    }

    fn decode_block(&mut self, view: &VolumeView<'_>, block: &[u8], batch: &mut EntryBatch) {
        match self {
            DirCursor::Fat(cursor) => cursor.decode_block(view, block, batch),
            DirCursor::ExFat(cursor) => cursor.decode_block(view, block, batch),
            DirCursor::Ext(cursor) => cursor.decode_block(view, block, batch),
        }
    }
}

/// Entries decoded from one directory block.
#[derive(Default)]
pub(crate) struct EntryBatch {
    entries: Vec<DirectoryEntry>,
    skipped: usize,
}

impl EntryBatch {
    /// Adds an entry. A later record claiming the identifier of an earlier one in the same
    /// block replaces it.
    pub(crate) fn push(&mut self, entry: DirectoryEntry) {
        if let Some(pos) = self.entries.iter().position(|e| e.id == entry.id) {
            debug!(
                "Record {:?} supersedes {:?} for identifier {}",
                entry.name, self.entries[pos].name, entry.id
            );
            self.entries.remove(pos);
        }
        self.entries.push(entry);
    }

    /// Records a corrupt entry that was left out of the listing.
    pub(crate) fn skip(&mut self, reason: impl AsRef<str>) {
        warn!("Skipping corrupt directory entry: {}", reason.as_ref());
        self.skipped += 1;
    }

    #[cfg(test)]
    pub(crate) fn entries(&self) -> &[DirectoryEntry] {
        &self.entries
    }

    #[cfg(test)]
    pub(crate) fn skipped(&self) -> usize {
        self.skipped
    }
}

/// A finite, pull-based sequence of the entries of one directory.
///
/// Each item is either an entry or the error that cut the listing short (an unreadable
/// block, or the session being closed). Corrupt individual records are skipped and counted
/// in [`DirListing::skipped`] instead.
///
/// Identifiers are unique within one listing. Inside a block the last record claiming an
/// identifier wins; across blocks the first one yielded wins and later records with the
/// same identifier are dropped with a warning.
///
/// Each call to `list_directory` starts a fresh pass over the on-disk structures, so two
/// listings of an unchanged directory yield the same sequence.
pub struct DirListing {
    image: Weak<ImageSource>,
    volume: usize,
    volume_start: u64,
    volume_len: u64,
    cursor: DirCursor,
    pending: VecDeque<DirectoryEntry>,
    yielded: HashSet<u64>,
    include_deleted: bool,
    skipped: usize,
    finished: bool,
}

impl DirListing {
    pub(crate) fn new(
        image: Weak<ImageSource>,
        volume: usize,
        volume_start: u64,
        volume_len: u64,
        cursor: DirCursor,
        include_deleted: bool,
    ) -> Self {
        Self {
            image,
            volume,
            volume_start,
            volume_len,
            cursor,
            pending: VecDeque::new(),
            yielded: HashSet::new(),
            include_deleted,
            skipped: 0,
            finished: false,
        }
    }

    /// Number of corrupt records skipped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Reads and decodes the next block into `pending`.
    fn fill(&mut self) -> Result<(), InspectError> {
        let image = self.image.upgrade().ok_or(InspectError::SessionClosed)?;
        let view = VolumeView::new(&image, self.volume_start, self.volume_len);

        match self.cursor.next_block(&view)? {
            Some(block) => {
                let mut batch = EntryBatch::default();
                self.cursor.decode_block(&view, &block, &mut batch);
                self.skipped += batch.skipped;

                let volume = self.volume;
                let include_deleted = self.include_deleted;
                self.pending.extend(
                    batch
                        .entries
                        .into_iter()
                        .filter(|e| include_deleted || !e.is_deleted)
                        .map(|mut e| {
                            e.volume = volume;
                            e
                        }),
                );
            }
            None => self.finished = true,
        }

        Ok(())
    }
}

impl Iterator for DirListing {
    type Item = Result<DirectoryEntry, InspectError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                if !self.yielded.insert(entry.id) {
                    warn!(
                        "Dropping {:?}: identifier {} was already listed",
                        entry.name, entry.id
                    );
                    continue;
                }
                return Some(Ok(entry));
            }

            if self.finished {
                return None;
            }

            if let Err(err) = self.fill() {
                self.finished = true;
                if !matches!(err, InspectError::SessionClosed) {
                    warn!("Directory listing cut short: {err}");
                }
                return Some(Err(err));
            }
        }
    }
}
