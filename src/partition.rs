//! Partition table parsing.
//!
//! This module provides functionality for:
//! - Decoding legacy Master Boot Records, including extended partition chains
//! - Decoding GUID partition tables with header and array checksums
//! - Turning either scheme into an ordered list of volumes, falling back to a single
//!   volume spanning the whole image when no table can be trusted

pub mod gpt;
pub mod mbr;
pub mod partition_error;
pub mod table;
