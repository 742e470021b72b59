//! FAT directory entry structures and parsing.
//!
//! This module implements the two 32-byte record shapes found in FAT directories:
//! - the short (8.3) entry, which carries attributes, timestamps and cluster allocation
//! - the long file name (LFN) entry, 13 UTF-16 units of a long name spread over several records

use binread::{BinRead, BinReaderExt};
use chrono::{DateTime, NaiveDate, Utc};
use getset::CopyGetters;
use std::io;

use super::fs_error::FsError;

/// Size of one directory record.
pub const DIR_ENTRY_SIZE: usize = 32;

pub const ATTR_VOLUME_ID: u8 = 0x08;
pub const ATTR_DIRECTORY: u8 = 0x10;
pub const ATTR_LONG_NAME: u8 = 0x0F;

/// First name byte of a released record.
pub const DELETED_MARKER: u8 = 0xE5;
/// First name byte of a record whose real first character is 0xE5.
const KANJI_E5: u8 = 0x05;

/// Lowercase basename / extension flags in the NT reserved byte.
const NT_LOWER_BASE: u8 = 0x08;
const NT_LOWER_EXT: u8 = 0x10;

const ILLEGAL_NAME_CHARS: &[u8] = b"\"*+,/:;<=>?[\\]|";

/// FAT short directory entry.
///
/// # Fields
/// - `name`: 8.3 format filename (8 characters for name, 3 for extension)
/// - `attr`: File attributes (read-only, hidden, system, volume label, directory, archive)
/// - `fst_clus_hi`: High 16 bits of the first cluster number
/// - `fst_clus_lo`: Low 16 bits of the first cluster number
/// - `file_size`: Size of the file in bytes (0 for directories)
#[derive(BinRead, Debug, Clone, CopyGetters)]
#[br(little)]
pub struct DirEntry {
    /// Filename in 8.3 format (8 characters name + 3 characters extension)
    #[getset(get_copy = "pub")]
    name: [u8; 11],
    /// File attributes byte
    #[getset(get_copy = "pub")]
    attr: u8,
    /// NT reserved, holds the case flags
    nt_res: u8,
    /// Creation time, 10ms units
    crt_time_tenth: u8,
    crt_time: u16,
    crt_date: u16,
    lst_acc_date: u16,
    /// High 16 bits of first cluster number
    fst_clus_hi: u16,
    wrt_time: u16,
    wrt_date: u16,
    /// Low 16 bits of first cluster number
    fst_clus_lo: u16,
    /// File size in bytes (0 for directories)
    #[getset(get_copy = "pub")]
    file_size: u32,
}

impl DirEntry {
    /// Creates a directory entry from a 32-byte record.
    pub fn from_slice(buf: &[u8]) -> Result<Self, FsError> {
        let mut reader = io::Cursor::new(buf);
        Ok(reader.read_le()?)
    }

    /// Returns the complete first cluster number for this entry.
    pub fn cluster_number(&self) -> u32 {
        ((self.fst_clus_hi as u32) << 16) | self.fst_clus_lo as u32
    }

    pub fn is_dir(&self) -> bool {
        self.attr & ATTR_DIRECTORY != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.name[0] == DELETED_MARKER
    }

    pub fn is_volume_label(&self) -> bool {
        self.attr & ATTR_VOLUME_ID != 0 && !self.is_dir()
    }

    /// `.` and `..` records.
    pub fn is_dot_entry(&self) -> bool {
        self.name[0] == b'.' && self.name[1..].iter().all(|&b| b == b' ' || b == b'.')
    }

    /// Returns a reason if the record cannot be a real short entry.
    pub fn corruption(&self) -> Option<String> {
        if self.attr & 0xC0 != 0 {
            return Some(format!("reserved attribute bits set (0x{:02X})", self.attr));
        }
        if self.name[0] == b' ' {
            return Some(String::from("name starts with a space"));
        }
        let first = if self.is_deleted() || self.name[0] == KANJI_E5 {
            1
        } else {
            0
        };
        if let Some(bad) = self.name[first..]
            .iter()
            .find(|&&b| b < 0x20 || ILLEGAL_NAME_CHARS.contains(&b))
        {
            return Some(format!("illegal byte 0x{bad:02X} in short name"));
        }
        None
    }

    /// Decodes the 8.3 name, honoring the NT lowercase flags.
    ///
    /// The first character of a released record is unknown and rendered as `_`.
    pub fn short_name(&self) -> String {
        let mut raw = self.name;
        match raw[0] {
            KANJI_E5 => raw[0] = 0xE5,
            DELETED_MARKER => raw[0] = b'_',
            _ => {}
        }

        let mut base = oem_to_string(&raw[0..8]);
        let mut ext = oem_to_string(&raw[8..11]);
        if self.nt_res & NT_LOWER_BASE != 0 {
            base = base.to_lowercase();
        }
        if self.nt_res & NT_LOWER_EXT != 0 {
            ext = ext.to_lowercase();
        }

        if ext.is_empty() {
            base
        } else {
            format!("{base}.{ext}")
        }
    }

    /// Checksum an LFN run must carry to belong to this record.
    ///
    /// For a released record the first name byte is gone; `first` stands in for it.
    pub fn lfn_checksum_with(&self, first: Option<u8>) -> u8 {
        let mut name = self.name;
        if let Some(b) = first {
            name[0] = b;
        }
        lfn_checksum(&name)
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        fat_datetime(self.crt_date, self.crt_time, self.crt_time_tenth)
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        fat_datetime(self.wrt_date, self.wrt_time, 0)
    }

    pub fn accessed(&self) -> Option<DateTime<Utc>> {
        fat_datetime(self.lst_acc_date, 0, 0)
    }
}

/// Long file name directory entry.
#[derive(BinRead, Debug, Clone, CopyGetters)]
#[br(little)]
pub struct LfnEntry {
    /// Sequence number; 0x40 flags the last (first stored) part
    #[getset(get_copy = "pub")]
    ord: u8,
    name1: [u16; 5],
    attr: u8,
    lfn_type: u8,
    #[getset(get_copy = "pub")]
    checksum: u8,
    name2: [u16; 6],
    fst_clus_lo: u16,
    name3: [u16; 2],
}

impl LfnEntry {
    pub fn from_slice(buf: &[u8]) -> Result<Self, FsError> {
        let mut reader = io::Cursor::new(buf);
        Ok(reader.read_le()?)
    }

    /// Returns true if the record layout is plausible for an LFN part.
    pub fn is_well_formed(&self) -> bool {
        self.attr & 0x3F == ATTR_LONG_NAME && self.lfn_type == 0 && self.fst_clus_lo == 0
    }

    pub fn is_last_part(&self) -> bool {
        self.ord & 0x40 != 0
    }

    /// The 13 name units carried by this part.
    pub fn units(&self) -> [u16; 13] {
        let mut units = [0u16; 13];
        units[0..5].copy_from_slice(&self.name1);
        units[5..11].copy_from_slice(&self.name2);
        units[11..13].copy_from_slice(&self.name3);
        units
    }
}

/// Returns true if a raw 32-byte record is an LFN part.
pub fn is_lfn_record(record: &[u8]) -> bool {
    record.len() >= DIR_ENTRY_SIZE && record[11] & 0x3F == ATTR_LONG_NAME
}

/// Rotating checksum of an 11-byte short name, as stored in its LFN parts.
pub fn lfn_checksum(name: &[u8; 11]) -> u8 {
    name.iter()
        .fold(0u8, |sum, &b| (sum >> 1).wrapping_add(sum << 7).wrapping_add(b))
}

/// Converts a FAT date/time triple. A zero or impossible date yields `None`.
///
/// FAT date: bits 15-9 year since 1980, bits 8-5 month, bits 4-0 day.
/// FAT time: bits 15-11 hours, bits 10-5 minutes, bits 4-0 seconds/2.
pub fn fat_datetime(date: u16, time: u16, tenth: u8) -> Option<DateTime<Utc>> {
    if date == 0 {
        return None;
    }
    let year = ((date >> 9) & 0x7F) as i32 + 1980;
    let month = ((date >> 5) & 0x0F) as u32;
    let day = (date & 0x1F) as u32;

    let hour = ((time >> 11) & 0x1F) as u32;
    let minute = ((time >> 5) & 0x3F) as u32;
    let second = (time & 0x1F) as u32 * 2 + tenth as u32 / 100;
    let millis = (tenth as u32 % 100) * 10;

    NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_milli_opt(hour, minute, second, millis)
        .map(|dt| dt.and_utc())
}

/// Space-trimmed OEM bytes; bytes above 0x7F are read as Latin-1.
fn oem_to_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| char::from(b))
        .collect::<String>()
        .trim_end_matches(' ')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    fn record(name: &[u8; 11], attr: u8, nt_res: u8) -> Vec<u8> {
        let mut rec = vec![0u8; 32];
        rec[0..11].copy_from_slice(name);
        rec[11] = attr;
        rec[12] = nt_res;
        rec
    }

    #[test]
    fn case_flags_lowercase_the_name() {
        let entry = DirEntry::from_slice(&record(b"README  TXT", 0x20, 0x18)).unwrap();
        assert_eq!(entry.short_name(), "readme.txt");

        let entry = DirEntry::from_slice(&record(b"README  TXT", 0x20, 0x10)).unwrap();
        assert_eq!(entry.short_name(), "README.txt");
    }

    #[test]
    fn deleted_record_gets_placeholder_first_char() {
        let entry = DirEntry::from_slice(&record(b"\xE5OTES   MD ", 0x20, 0)).unwrap();
        assert!(entry.is_deleted());
        assert_eq!(entry.short_name(), "_OTES.MD");
        assert!(entry.corruption().is_none());
    }

    #[test]
    fn control_bytes_are_corrupt() {
        let entry = DirEntry::from_slice(&record(b"AB\x01     TXT", 0x20, 0)).unwrap();
        assert!(entry.corruption().is_some());
        let entry = DirEntry::from_slice(&record(b"A*      TXT", 0x20, 0)).unwrap();
        assert!(entry.corruption().is_some());
    }

    #[test]
    fn dot_entries_are_recognized() {
        let dot = DirEntry::from_slice(&record(b".          ", 0x10, 0)).unwrap();
        let dotdot = DirEntry::from_slice(&record(b"..         ", 0x10, 0)).unwrap();
        let other = DirEntry::from_slice(&record(b".GIT       ", 0x10, 0)).unwrap();
        assert!(dot.is_dot_entry());
        assert!(dotdot.is_dot_entry());
        assert!(!other.is_dot_entry());
    }

    #[test]
    fn lfn_checksum_matches_known_value() {
        // mkfs.fat / Windows value for "FOO     BAR"
        let mut expected = 0u8;
        for &b in b"FOO     BAR" {
            expected = (if expected & 1 != 0 { 0x80u8 } else { 0 })
                .wrapping_add(expected >> 1)
                .wrapping_add(b);
        }
        assert_eq!(lfn_checksum(b"FOO     BAR"), expected);
    }

    #[test]
    fn fat_dates_convert() {
        // 2020-06-15 13:45:30 plus 150 tenths
        let date = ((2020 - 1980) << 9) | (6 << 5) | 15;
        let time = (13 << 11) | (45 << 5) | 15;
        let dt = fat_datetime(date, time, 150).unwrap();
        assert_eq!((dt.year(), dt.month(), dt.day()), (2020, 6, 15));
        assert_eq!((dt.hour(), dt.minute(), dt.second()), (13, 45, 31));
        assert_eq!(dt.timestamp_subsec_millis(), 500);

        assert!(fat_datetime(0, 0, 0).is_none());
        // Month 13 does not exist.
        assert!(fat_datetime((13 << 5) | 1, 0, 0).is_none());
    }
}
