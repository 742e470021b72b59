//! Filesystem driver registry.
//!
//! This module provides functionality for:
//! - Probing a volume with each supported driver in a fixed priority order
//! - Holding the mounted state of a volume (driver, block size, root directory)
//! - Opening lazy directory listings on a mounted volume
//!
//! Drivers with a strict magic number are tried before the FAT driver, whose detection
//! relies on boot sector heuristics that other formats could accidentally satisfy.

pub mod bpb;
pub mod dir_entry;
pub mod entry;
pub mod exfat;
pub mod ext;
pub mod fat;
pub mod fat_type;
pub mod fs_error;
pub mod walker;

use getset::{CopyGetters, Getters};
use log::{debug, info};
use std::fmt;
use std::sync::{Arc, Weak};

use crate::error::InspectError;
use crate::image::{ImageSource, VolumeView};
use crate::options::InspectOptions;
use crate::partition::table::Volume;
use crate::traits::LayoutDisplay;
use entry::{DirLocation, DirRef};
use exfat::ExFatVol;
use ext::ExtVol;
use fat::FATVol;
use walker::{DirCursor, DirListing};

/// Tag of the driver that mounted a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Ext,
    ExFat,
    Fat12,
    Fat16,
    Fat32,
}

impl fmt::Display for FsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FsKind::Ext => "ext2/3/4",
            FsKind::ExFat => "exFAT",
            FsKind::Fat12 => "FAT12",
            FsKind::Fat16 => "FAT16",
            FsKind::Fat32 => "FAT32",
        };
        write!(f, "{s}")
    }
}

/// A driver instance bound to one volume.
#[derive(Debug)]
pub enum Filesystem {
    Ext(Arc<ExtVol>),
    ExFat(Arc<ExFatVol>),
    Fat(Arc<FATVol>),
}

impl Filesystem {
    /// Tries every driver in priority order; the first one whose validation succeeds wins.
    pub fn probe(view: &VolumeView<'_>, options: &InspectOptions) -> Option<Filesystem> {
        let strict = options.is_strict_bpb();

        match ExtVol::probe(view, strict) {
            Ok(fs) => return Some(Filesystem::Ext(Arc::new(fs))),
            Err(err) => debug!("ext driver: {err}"),
        }
        match ExFatVol::probe(view, strict) {
            Ok(fs) => return Some(Filesystem::ExFat(Arc::new(fs))),
            Err(err) => debug!("exFAT driver: {err}"),
        }
        match FATVol::probe(view, strict) {
            Ok(fs) => return Some(Filesystem::Fat(Arc::new(fs))),
            Err(err) => debug!("FAT driver: {err}"),
        }
        None
    }

    pub fn kind(&self) -> FsKind {
        match self {
            Filesystem::Ext(_) => FsKind::Ext,
            Filesystem::ExFat(_) => FsKind::ExFat,
            Filesystem::Fat(fs) => match fs.fat_type() {
                fat_type::FATType::FAT12 => FsKind::Fat12,
                fat_type::FATType::FAT16 => FsKind::Fat16,
                fat_type::FATType::FAT32 => FsKind::Fat32,
            },
        }
    }

    /// Allocation unit in bytes: the ext block or the (ex)FAT cluster.
    pub fn block_size(&self) -> u64 {
        match self {
            Filesystem::Ext(fs) => fs.block_size(),
            Filesystem::ExFat(fs) => fs.cluster_size() as u64,
            Filesystem::Fat(fs) => fs.cluster_size() as u64,
        }
    }

    fn root_location(&self) -> DirLocation {
        match self {
            Filesystem::Ext(fs) => fs.root_location(),
            Filesystem::ExFat(fs) => fs.root_location(),
            Filesystem::Fat(fs) => fs.root_location(),
        }
    }

    fn open_dir(&self, location: DirLocation) -> DirCursor {
        match self {
            Filesystem::Ext(fs) => DirCursor::Ext(fs.open_dir(location)),
            Filesystem::ExFat(fs) => DirCursor::ExFat(fs.open_dir(location)),
            Filesystem::Fat(fs) => DirCursor::Fat(fs.open_dir(location)),
        }
    }
}

impl LayoutDisplay for Filesystem {
    fn display_layout(&self, indent: u8) -> Result<String, std::fmt::Error> {
        match self {
            Filesystem::Ext(fs) => fs.display_layout(indent),
            Filesystem::ExFat(fs) => fs.display_layout(indent),
            Filesystem::Fat(fs) => fs.display_layout(indent),
        }
    }
}

/// A volume recognized by one of the drivers.
///
/// Holds only a weak reference to the image: once the owning session is closed, every
/// operation reports [`InspectError::SessionClosed`].
#[derive(Debug, Getters, CopyGetters)]
pub struct MountedFilesystem {
    #[getset(get = "pub")]
    volume: Volume,
    #[getset(get = "pub")]
    fs: Filesystem,
    #[getset(get_copy = "pub")]
    root: DirRef,
    image: Weak<ImageSource>,
    include_deleted: bool,
}

impl MountedFilesystem {
    pub fn kind(&self) -> FsKind {
        self.fs.kind()
    }

    pub fn block_size(&self) -> u64 {
        self.fs.block_size()
    }

    /// Opens a lazy listing of the directory referenced by `dir`.
    ///
    /// # Errors
    /// - `InspectError::SessionClosed` if the owning session was closed
    /// - `InspectError::InvalidVolume` if `dir` belongs to another volume
    pub fn list_directory(&self, dir: &DirRef) -> Result<DirListing, InspectError> {
        if self.image.strong_count() == 0 {
            return Err(InspectError::SessionClosed);
        }
        if dir.volume() != self.volume.index() {
            return Err(InspectError::InvalidVolume(dir.volume()));
        }

        Ok(DirListing::new(
            self.image.clone(),
            self.volume.index(),
            self.volume.start(),
            self.volume.len(),
            self.fs.open_dir(dir.location()),
            self.include_deleted,
        ))
    }
}

/// Probes `volume` and returns its mounted state, or `None` if no driver matches.
pub fn probe(
    image: &Arc<ImageSource>,
    volume: &Volume,
    options: &InspectOptions,
) -> Option<MountedFilesystem> {
    let view = VolumeView::new(image, volume.start(), volume.len());
    let fs = Filesystem::probe(&view, options)?;
    info!(
        "Volume #{} mounted as {} ({}-byte blocks)",
        volume.index(),
        fs.kind(),
        fs.block_size()
    );

    Some(MountedFilesystem {
        root: DirRef::new(volume.index(), fs.root_location()),
        volume: volume.clone(),
        fs,
        image: Arc::downgrade(image),
        include_deleted: options.shows_deleted(),
    })
}
