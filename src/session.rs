//! Inspection session.
//!
//! This module provides functionality for:
//! - Opening a disk image and parsing its volume system
//! - Mounting volumes on demand, at most once each
//! - Listing directories and resolving paths on mounted volumes
//! - Tearing everything down on close
//!
//! The session owns the only strong reference to the image. Mounted filesystems and
//! directory listings hold weak references, so closing the session invalidates them.

use getset::CopyGetters;
use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::error::InspectError;
use crate::filesystem::entry::{DirRef, DirectoryEntry};
use crate::filesystem::walker::DirListing;
use crate::filesystem::{self, MountedFilesystem};
use crate::image::{BlockSource, ImageSource};
use crate::options::InspectOptions;
use crate::partition::gpt;
use crate::partition::table::{PartitionTable, Scheme, Volume, VolumeKind};
use crate::traits::LayoutDisplay;

/// Mount state of one volume.
#[derive(Debug, Clone)]
pub enum MountState {
    Unmounted,
    Mounted(Arc<MountedFilesystem>),
    /// No driver matched; the volume is not probed again.
    ProbeFailed,
}

/// Observable mount status of a volume, without the mounted state itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStatus {
    Unmounted,
    Mounted,
    ProbeFailed,
}

impl fmt::Display for MountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MountStatus::Unmounted => "unmounted",
            MountStatus::Mounted => "mounted",
            MountStatus::ProbeFailed => "no filesystem found",
        };
        write!(f, "{s}")
    }
}

/// One opened image with its volumes and their mount state.
#[derive(CopyGetters)]
pub struct Session {
    image: Option<Arc<ImageSource>>,
    label: String,
    table: PartitionTable,
    mounts: HashMap<usize, MountState>,
    options: InspectOptions,
    /// Number of driver probes run so far; cached mounts do not count.
    #[getset(get_copy = "pub")]
    probe_count: usize,
}

impl Session {
    /// Opens a disk image file or block device and parses its volume system.
    ///
    /// # Errors
    /// - `InspectError::NotFound` / `InspectError::PermissionDenied` if the path cannot be
    ///   opened
    /// - `InspectError::Io` for any other failure of the underlying file
    pub fn open(path: impl AsRef<Path>, options: InspectOptions) -> Result<Self, InspectError> {
        let image = ImageSource::open(path.as_ref())?;
        Ok(Self::from_image(image, options))
    }

    /// Opens an arbitrary source, e.g. an in-memory image.
    pub fn from_source<S: BlockSource + 'static>(
        source: S,
        label: &str,
        options: InspectOptions,
    ) -> Result<Self, InspectError> {
        let image = ImageSource::from_source(source, label)?;
        Ok(Self::from_image(image, options))
    }

    fn from_image(mut image: ImageSource, options: InspectOptions) -> Self {
        let sector_size = match options.forced_sector_size() {
            Some(size) if size >= 512 && size.is_power_of_two() => size,
            Some(size) => {
                warn!("Ignoring invalid sector size {size}; probing instead");
                gpt::probe_sector_size(&image)
            }
            None => gpt::probe_sector_size(&image),
        };
        image.set_sector_size(sector_size);

        let table = PartitionTable::parse(&image);
        info!(
            "Session opened on {}: {} bytes, {}-byte sectors, {}",
            image.label(),
            image.len(),
            sector_size,
            table.scheme()
        );

        Self {
            label: image.label().to_string(),
            image: Some(Arc::new(image)),
            table,
            mounts: HashMap::new(),
            options,
            probe_count: 0,
        }
    }

    fn image(&self) -> Result<&Arc<ImageSource>, InspectError> {
        self.image.as_ref().ok_or(InspectError::SessionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.image.is_none()
    }

    /// Name of the image, usually its path.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn options(&self) -> &InspectOptions {
        &self.options
    }

    pub fn image_len(&self) -> Result<u64, InspectError> {
        Ok(self.image()?.len())
    }

    pub fn sector_size(&self) -> Result<usize, InspectError> {
        Ok(self.image()?.sector_size())
    }

    pub fn scheme(&self) -> Result<Scheme, InspectError> {
        self.image()?;
        Ok(self.table.scheme())
    }

    /// The ordered volume list.
    pub fn volumes(&self) -> Result<&[Volume], InspectError> {
        self.image()?;
        Ok(self.table.volumes())
    }

    pub fn volume(&self, index: usize) -> Result<&Volume, InspectError> {
        self.volumes()?
            .get(index)
            .ok_or(InspectError::InvalidVolume(index))
    }

    pub fn mount_status(&self, index: usize) -> Result<MountStatus, InspectError> {
        self.volume(index)?;
        Ok(match self.mounts.get(&index) {
            None | Some(MountState::Unmounted) => MountStatus::Unmounted,
            Some(MountState::Mounted(_)) => MountStatus::Mounted,
            Some(MountState::ProbeFailed) => MountStatus::ProbeFailed,
        })
    }

    /// Mounts a volume, probing it on the first call only.
    ///
    /// # Errors
    /// - `InspectError::InvalidVolume` if the index is not in the volume list
    /// - `InspectError::UnrecognizedFilesystem` if no driver matches (now or previously)
    /// - `InspectError::SessionClosed` once the session is closed
    pub fn mount(&mut self, index: usize) -> Result<Arc<MountedFilesystem>, InspectError> {
        let volume = self.volume(index)?.clone();

        match self.mounts.get(&index) {
            Some(MountState::Mounted(mounted)) => return Ok(Arc::clone(mounted)),
            Some(MountState::ProbeFailed) => {
                return Err(InspectError::UnrecognizedFilesystem(index));
            }
            None | Some(MountState::Unmounted) => {}
        }

        let image = Arc::clone(self.image()?);
        self.probe_count += 1;
        match filesystem::probe(&image, &volume, &self.options) {
            Some(mounted) => {
                let mounted = Arc::new(mounted);
                self.mounts
                    .insert(index, MountState::Mounted(Arc::clone(&mounted)));
                Ok(mounted)
            }
            None => {
                warn!("No supported filesystem found on volume #{index}");
                self.mounts.insert(index, MountState::ProbeFailed);
                Err(InspectError::UnrecognizedFilesystem(index))
            }
        }
    }

    /// Returns the root directory of a volume, mounting it if needed.
    pub fn root(&mut self, index: usize) -> Result<DirRef, InspectError> {
        Ok(self.mount(index)?.root())
    }

    /// Opens a lazy listing of a directory of a mounted volume.
    ///
    /// # Errors
    /// - `InspectError::SessionClosed` once the session is closed
    /// - `InspectError::InvalidVolume` if the directory's volume is not mounted
    pub fn list_directory(&self, dir: &DirRef) -> Result<DirListing, InspectError> {
        self.image()?;
        match self.mounts.get(&dir.volume()) {
            Some(MountState::Mounted(mounted)) => mounted.list_directory(dir),
            _ => Err(InspectError::InvalidVolume(dir.volume())),
        }
    }

    /// Resolves a `/`-separated path from the root of a volume, listing one directory per
    /// component. Names are matched case-insensitively; live entries win over deleted ones.
    ///
    /// # Errors
    /// - `InspectError::NotFound` if a component does not exist
    /// - `InspectError::NotADirectory` if a component is a file
    pub fn resolve_dir(&mut self, index: usize, path: &str) -> Result<DirRef, InspectError> {
        let mut current = self.root(index)?;
        let mut walked = String::new();

        for part in path.split('/').filter(|p| !p.is_empty() && *p != ".") {
            walked.push('/');
            walked.push_str(part);

            let mut found: Option<DirectoryEntry> = None;
            for entry in self.list_directory(&current)? {
                let entry = entry?;
                if !entry.name().eq_ignore_ascii_case(part) {
                    continue;
                }
                let better = found.as_ref().is_none_or(|f| f.is_deleted() && !entry.is_deleted());
                if better {
                    found = Some(entry);
                }
            }

            let entry = found.ok_or_else(|| InspectError::NotFound(walked.clone()))?;
            current = entry
                .dir_ref()
                .ok_or_else(|| InspectError::NotADirectory(walked.clone()))?;
        }

        Ok(current)
    }

    /// Walks the tree below `root` depth first, calling `visit` with the depth and each
    /// entry, directories before their contents.
    ///
    /// Deleted directories are not entered. A directory reached a second time, through
    /// a corrupt or looping structure, is reported and skipped. A listing error ends that
    /// directory only.
    pub fn walk_tree<F>(&self, root: &DirRef, mut visit: F) -> Result<(), InspectError>
    where
        F: FnMut(usize, &DirectoryEntry),
    {
        let mut visited = HashSet::from([*root]);
        let mut stack = vec![self.list_directory(root)?];

        while let Some(listing) = stack.last_mut() {
            match listing.next() {
                None => {
                    stack.pop();
                }
                Some(Err(err)) => {
                    warn!("Listing interrupted: {err}");
                    stack.pop();
                }
                Some(Ok(entry)) => {
                    visit(stack.len() - 1, &entry);
                    let Some(sub) = entry.dir_ref().filter(|_| !entry.is_deleted()) else {
                        continue;
                    };
                    if !visited.insert(sub) {
                        warn!("Skipping {}: directory already visited", entry.name());
                        continue;
                    }
                    stack.push(self.list_directory(&sub)?);
                }
            }
        }
        Ok(())
    }

    /// Registers a volume starting at an arbitrary sector, for filesystems the partition
    /// table does not describe. Returns its index.
    ///
    /// The volume runs up to the next volume or to the end of the image. The synthetic
    /// whole-image volume of a table-less image does not bound it.
    ///
    /// # Errors
    /// - `InspectError::OutOfRange` if the sector lies past the end of the image
    /// - `InspectError::OverlappingVolume` if the sector lies inside an existing volume
    pub fn add_volume_at(&mut self, sector: u64) -> Result<usize, InspectError> {
        let image = self.image()?;
        let sector_size = image.sector_size() as u64;
        let len = image.len();
        let start = sector
            .checked_mul(sector_size)
            .filter(|&start| start < len)
            .ok_or(InspectError::OutOfRange {
                offset: sector.saturating_mul(sector_size),
                length: 0,
                limit: len,
            })?;

        let siblings = || {
            self.table
                .volumes()
                .iter()
                .filter(|v| *v.kind() != VolumeKind::Whole)
        };
        if let Some(volume) = siblings().find(|v| v.start() <= start && start < v.end()) {
            return Err(InspectError::OverlappingVolume {
                offset: start,
                volume: volume.index(),
            });
        }
        let end = siblings()
            .map(|v| v.start())
            .filter(|&s| s > start)
            .min()
            .unwrap_or(len);

        let volume = Volume::new(
            start,
            end - start,
            VolumeKind::Manual,
            false,
            format!("Manual volume at sector {sector}"),
        );
        let index = self.table.push(volume);
        info!("Registered volume #{index} at bytes {start}..{end}");
        Ok(index)
    }

    /// Reads raw bytes from the image.
    pub fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>, InspectError> {
        self.image()?.read(offset, length)
    }

    /// Releases the image. Every handle derived from this session becomes invalid.
    pub fn close(&mut self) {
        if let Some(image) = self.image.take() {
            info!("Closing session on {}", image.label());
        }
        self.mounts.clear();
    }

    /// Renders the volume table followed by the layout of every mounted volume.
    pub fn layout(&self, indent: u8) -> Result<String, InspectError> {
        self.image()?;
        let mut out = self.table.display_layout(indent).map_err(fmt_error)?;

        for volume in self.table.volumes() {
            if let Some(MountState::Mounted(mounted)) = self.mounts.get(&volume.index()) {
                out.push('\n');
                out.push_str(&format!(
                    "{}Volume #{}: {}\n",
                    " ".repeat(indent as usize + 3),
                    volume.index(),
                    mounted.kind()
                ));
                out.push_str(&mounted.fs().display_layout(indent + 3).map_err(fmt_error)?);
            }
        }
        Ok(out)
    }
}

fn fmt_error(err: fmt::Error) -> InspectError {
    InspectError::Io(io::Error::other(err))
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
