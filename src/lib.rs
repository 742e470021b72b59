//!
//! vol_forensics: A library and CLI for inspecting the volumes and filesystems of disk images.
//!
//! This crate provides tools for:
//! - Parsing MBR (with extended partitions) and GPT volume systems
//! - Recognizing ext2/3/4, exFAT and FAT12/16/32 filesystems
//! - Listing directories lazily, including deleted entries still present on disk
//! - Handling user commands for interactive inspection
//! - Printing disk and filesystem layouts
//!
//! The library is designed to be used both as a CLI tool and as a Rust library.
//!
//! # Re-exports
//! - [`Session`]: An opened image with its volumes and their mount state
//! - [`Volume`]: One region of the image, from its partition table
//! - [`MountedFilesystem`]: A volume recognized by one of the drivers
//! - [`DirectoryEntry`]: One record of a directory listing

pub mod commands;
pub mod error;
pub mod filesystem;
pub mod image;
pub mod options;
pub mod partition;
pub mod session;
pub mod traits;
pub mod utils;

/// Error type of every public operation (see [`error::InspectError`]).
pub use crate::error::InspectError;
/// Directory listing types (see [`filesystem::entry`]).
pub use crate::filesystem::entry::{DirRef, DirectoryEntry, FileKind};
/// Lazy directory listing (see [`filesystem::walker::DirListing`]).
pub use crate::filesystem::walker::DirListing;
/// Mounted state of a volume (see [`filesystem::MountedFilesystem`]).
pub use crate::filesystem::{FsKind, MountedFilesystem};
/// Session configuration (see [`options::InspectOptions`]).
pub use crate::options::InspectOptions;
/// Volume list entry (see [`partition::table::Volume`]).
pub use crate::partition::table::Volume;
/// Inspection session (see [`session::Session`]).
pub use crate::session::{MountStatus, Session};
