//! FAT Bpb structure.
//!
//! This module implements:
//! - BIOS Parameter Block (Bpb) parsing for FAT12, FAT16 and FAT32 layouts
//! - FAT type detection
//! - Filesystem structure validation according to Microsoft's FAT specification

use binread::{BinRead, BinReaderExt};
use getset::{CopyGetters, Getters};
use std::fmt;
use std::io::{self, SeekFrom};

use super::fat_type::FATType;
use super::fs_error::FsError;

/// FAT32-only fields that sit between the common Bpb and the extended boot record.
#[derive(BinRead, Debug, Clone, CopyGetters)]
#[br(little)]
pub struct Fat32Bpb {
    /// Sectors per FAT
    #[getset(get_copy = "pub")]
    fat_sz_32: u32,
    /// FAT flags (mirroring, active FAT)
    ext_flags: u16,
    /// Filesystem version (should be 0:0)
    fs_ver: u16,
    /// First cluster of root directory (typically 2)
    #[getset(get_copy = "pub")]
    root_clus: u32,
    /// Sector number of FSINFO structure
    fs_info: u16,
    /// Sector number of backup boot sector
    bk_boot_sec: u16,
    /// Reserved for future expansion
    _reserved: [u8; 12],
}

/// BIOS Parameter Block structure for FAT filesystems.
///
/// The Bpb contains essential information about the filesystem layout and properties.
/// FAT32 volumes carry an extra block of fields before the extended boot record, which is
/// detected by a zero 16-bit FAT size.
#[derive(BinRead, Debug, Clone, Getters, CopyGetters)]
#[br(little)]
pub struct Bpb {
    /// Jump instruction to boot code (must be 0xEB ?? 0x90 or 0xE9 ?? ??)
    jmp: [u8; 3],
    /// OEM identifier (e.g., "MSWIN4.1")
    oem_name: [u8; 8],
    /// Number of bytes per sector (512, 1024, 2048, or 4096)
    #[getset(get_copy = "pub")]
    bytes_per_sec: u16,
    /// Number of sectors per cluster (power of 2: 1, 2, 4, 8, 16, 32, 64, or 128)
    #[getset(get_copy = "pub")]
    sec_per_clus: u8,
    /// Number of reserved sectors from start of volume
    #[getset(get_copy = "pub")]
    rsvd_sec_cnt: u16,
    /// Number of FAT copies (typically 2 for redundancy)
    #[getset(get_copy = "pub")]
    num_fat: u8,
    /// Maximum number of root directory entries (0 for FAT32)
    #[getset(get_copy = "pub")]
    root_ent_cnt: u16,
    /// Total sectors for volumes < 32MB (0 for FAT32)
    tot_sec_16: u16,
    /// Media descriptor (0xF8 for fixed disk)
    media: u8,
    /// Sectors per FAT for FAT12/FAT16 (0 for FAT32)
    fat_sz_16: u16,
    /// Sectors per track
    sec_per_trk: u16,
    /// Number of heads
    num_heads: u16,
    /// Number of hidden sectors preceding the partition
    hidd_sec: u32,
    /// Total sectors for volumes >= 32MB
    tot_sec_32: u32,

    #[br(if(fat_sz_16 == 0))]
    #[getset(get = "pub")]
    fat32: Option<Fat32Bpb>,

    /// Drive number (0x80 for hard disk)
    drv_num: u8,
    /// Reserved (used by Windows NT)
    _reserved_1: u8,
    /// Extended boot signature (0x29)
    boot_sig: u8,
    /// Volume serial number
    #[getset(get_copy = "pub")]
    vol_id: u32,
    /// Volume label (11 bytes)
    vol_lab: [u8; 11],
    /// Filesystem type label ("FAT32   ")
    fil_sys_type: [u8; 8],

    /// Boot sector signature (0x55 0xAA)
    #[br(seek_before = SeekFrom::Start(510))]
    sig: [u8; 2],
}

impl Bpb {
    /// Parses a Bpb from the first sector of a volume and validates it.
    ///
    /// # Parameters
    /// - `sector`: The boot sector bytes (at least 512)
    /// - `strict`: Whether to perform the full validation instead of the probe minimum
    /// - `volume_len`: Length of the volume in bytes, used by the strict size checks
    ///
    /// # Errors
    /// - Returns `FsError::Read` if the sector is too short
    /// - Returns various `FsError` variants if validation fails
    pub fn from_sector(sector: &[u8], strict: bool, volume_len: u64) -> Result<Bpb, FsError> {
        let mut reader = io::Cursor::new(sector);
        let bpb: Bpb = reader.read_le()?;

        bpb.validate()?;
        if strict {
            bpb.validate_strict(volume_len)?;
        }
        Ok(bpb)
    }

    /// Determines the number of clusters in the data section.
    pub fn cluster_count(&self) -> u32 {
        let data_sec = (self.tot_sec() as u64).saturating_sub(self.data_start_sector());
        match self.sec_per_clus {
            0 => 0,
            n => (data_sec / n as u64) as u32,
        }
    }

    /// Sectors occupied by the fixed root directory (0 for FAT32).
    pub fn root_dir_sectors(&self) -> u32 {
        match self.bytes_per_sec {
            0 => 0,
            bps => (self.root_ent_cnt as u32 * 32).div_ceil(bps as u32),
        }
    }

    /// First sector of the data region, relative to the volume start.
    pub fn data_start_sector(&self) -> u64 {
        self.rsvd_sec_cnt as u64
            + self.num_fat as u64 * self.fat_sz() as u64
            + self.root_dir_sectors() as u64
    }

    pub fn fat_sz(&self) -> u32 {
        match &self.fat32 {
            Some(ext) if self.fat_sz_16 == 0 => ext.fat_sz_32,
            _ => self.fat_sz_16.into(),
        }
    }

    pub fn tot_sec(&self) -> u32 {
        if self.tot_sec_16 == 0 {
            self.tot_sec_32
        } else {
            self.tot_sec_16.into()
        }
    }

    /// First cluster of the root directory, 0 when the root is the fixed FAT12/16 region.
    pub fn root_clus(&self) -> u32 {
        self.fat32.as_ref().map(|ext| ext.root_clus).unwrap_or(0)
    }

    /// Volume label from the extended boot record, trimmed.
    pub fn volume_label(&self) -> String {
        String::from_utf8_lossy(&self.vol_lab).trim_end().to_string()
    }

    /// Determines the FAT type.
    ///
    /// A volume laid out with the FAT32 extension block is FAT32; otherwise the cluster
    /// count decides between FAT12 (< 4085 clusters) and FAT16.
    pub fn fat_type(&self) -> FATType {
        if self.fat32.is_some() {
            return FATType::FAT32;
        }

        if self.cluster_count() < 4085 {
            FATType::FAT12
        } else {
            FATType::FAT16
        }
    }

    /// Checks the fields every FAT volume must get right. This is what probing relies on.
    ///
    /// # Errors
    /// - `FsError::InvalidSignature`: If boot sector signature is not 0x55AA
    /// - `FsError::InvalidBytesPerSec`: If bytes per sector is not a valid value
    /// - `FsError::InvalidSecPerClus`: If sectors per cluster is not a valid value
    /// - `FsError::InvalidRsvdSecCnt`: If reserved sector count is 0
    /// - `FsError::InvalidNumFat`: If number of FATs is 0
    /// - `FsError::InvalidTotSec` / `FsError::InvalidFatSz`: If sizes are zero
    /// - `FsError::InvalidRootClus`: If a FAT32 root directory cluster is less than 2
    fn validate(&self) -> Result<(), FsError> {
        const SIG: [u8; 2] = [0x55, 0xAA];
        if !self.sig.eq(&SIG) {
            return Err(FsError::InvalidSignature(format!(
                "0x{:02X}{:02X}",
                self.sig[0], self.sig[1]
            )));
        }

        const VALID_BYTES_PER_SEC: [u16; 4] = [512, 1024, 2048, 4096];
        if !VALID_BYTES_PER_SEC.contains(&self.bytes_per_sec) {
            return Err(FsError::InvalidBytesPerSec(self.bytes_per_sec.into()));
        }

        const VALID_SEC_PER_CLUS: [u8; 8] = [1, 2, 4, 8, 16, 32, 64, 128];
        if !VALID_SEC_PER_CLUS.contains(&self.sec_per_clus) {
            return Err(FsError::InvalidSecPerClus(self.sec_per_clus.into()));
        }

        if self.rsvd_sec_cnt == 0 {
            return Err(FsError::InvalidRsvdSecCnt(self.rsvd_sec_cnt));
        }

        if self.num_fat == 0 {
            return Err(FsError::InvalidNumFat(self.num_fat));
        }

        if self.media != 0xF0 && self.media < 0xF8 {
            return Err(FsError::InvalidField {
                field: "media descriptor",
                value: self.media.into(),
            });
        }

        if self.tot_sec() == 0 {
            return Err(FsError::InvalidTotSec(String::from(
                "Neither BPB_TotSec16 nor BPB_TotSec32 is set.",
            )));
        }

        if self.fat_sz() == 0 {
            return Err(FsError::InvalidFatSz(String::from(
                "The FAT size should be greater than 0.",
            )));
        }

        if self.data_start_sector() >= self.tot_sec() as u64 {
            return Err(FsError::InvalidFatSz(format!(
                "the FATs and root directory end at sector {}, past the {} sectors of the volume",
                self.data_start_sector(),
                self.tot_sec()
            )));
        }

        if self.cluster_count() == 0 {
            return Err(FsError::InvalidTotSec(String::from(
                "The volume leaves no room for a data region.",
            )));
        }

        if self.fat32.is_some() && self.root_clus() < 2 {
            return Err(FsError::InvalidRootClus(self.root_clus()));
        }

        Ok(())
    }

    /// Performs the stricter checks of the Microsoft FAT document. Some formatters break them.
    ///
    /// # Errors
    /// - `FsError::InvalidJmp`: If the jump instruction is invalid
    /// - `FsError::InvalidClusSz`: If cluster size exceeds 32 KiB
    /// - `FsError::InvalidNumFat`: If there are more than two FATs
    /// - `FsError::InvalidRootEntCnt`: If the root entry count does not match the FAT type
    /// - `FsError::InvalidTotSec`: If the volume is larger than its partition
    fn validate_strict(&self, volume_len: u64) -> Result<(), FsError> {
        if !((self.jmp[0] == 0xEB && self.jmp[2] == 0x90) || self.jmp[0] == 0xE9) {
            return Err(FsError::InvalidJmp(format!(
                "0x{:02X}{:02X}{:02X}",
                self.jmp[0], self.jmp[1], self.jmp[2],
            )));
        }

        let cluster_size = self.bytes_per_sec as u32 * self.sec_per_clus as u32;
        if cluster_size > 32 * 1024 {
            return Err(FsError::InvalidClusSz(cluster_size));
        }

        if self.num_fat > 2 {
            return Err(FsError::InvalidNumFat(self.num_fat));
        }

        match self.fat_type() {
            FATType::FAT32 => {
                if self.root_ent_cnt != 0 {
                    return Err(FsError::InvalidRootEntCnt(self.root_ent_cnt));
                }
                if self.tot_sec_16 != 0 {
                    return Err(FsError::InvalidTotSec(String::from(
                        "BPB_TotSec16 should be 0 for a FAT32 volume.",
                    )));
                }
            }
            _ => {
                if self.root_ent_cnt == 0 {
                    return Err(FsError::InvalidRootEntCnt(self.root_ent_cnt));
                }
            }
        }

        let fs_len = self.tot_sec() as u64 * self.bytes_per_sec as u64;
        if fs_len > volume_len {
            return Err(FsError::InvalidTotSec(format!(
                "{fs_len} bytes declared on a {volume_len}-byte volume"
            )));
        }

        Ok(())
    }
}

/// Implements the Display trait for Bpb
impl fmt::Display for Bpb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        macro_rules! field {
            ($name:expr, $val:expr) => {{
                writeln!(f, "  {:<20} {}", $name, $val)?;
            }};
        }

        writeln!(f, "BIOS Parameter Block (Bpb):")?;

        field!("jmp", format!("{:02X?}", self.jmp));
        field!("oem_name", String::from_utf8_lossy(&self.oem_name));
        field!("bytes_per_sec", self.bytes_per_sec);
        field!("sec_per_clus", self.sec_per_clus);
        field!("rsvd_sec_cnt", self.rsvd_sec_cnt);
        field!("num_fat", self.num_fat);
        field!("root_ent_cnt", self.root_ent_cnt);
        field!("tot_sec_16", self.tot_sec_16);
        field!("media", format!("0x{:X}", self.media));
        field!("fat_sz_16", self.fat_sz_16);
        field!("sec_per_trk", self.sec_per_trk);
        field!("num_heads", self.num_heads);
        field!("hidd_sec", self.hidd_sec);
        field!("tot_sec_32", self.tot_sec_32);
        if let Some(ext) = &self.fat32 {
            field!("fat_sz_32", ext.fat_sz_32);
            field!("ext_flags", format!("0x{:X}", ext.ext_flags));
            field!("fs_ver", ext.fs_ver);
            field!("root_clus", ext.root_clus);
            field!("fs_info", ext.fs_info);
            field!("bk_boot_sec", ext.bk_boot_sec);
        }
        field!("drv_num", format!("0x{:X}", self.drv_num));
        field!("boot_sig", format!("0x{:X}", self.boot_sig));
        field!("vol_id", format!("0x{:X}", self.vol_id));
        field!("vol_lab", String::from_utf8_lossy(&self.vol_lab));
        field!("fil_sys_type", String::from_utf8_lossy(&self.fil_sys_type));
        field!("signature", format!("{:02X?}", self.sig));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Boot sector of a 4 MiB FAT16 volume with 512-byte clusters.
    fn fat16_sector() -> Vec<u8> {
        let mut s = vec![0u8; 512];
        s[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
        s[3..11].copy_from_slice(b"MSDOS5.0");
        s[11..13].copy_from_slice(&512u16.to_le_bytes());
        s[13] = 1;
        s[14..16].copy_from_slice(&1u16.to_le_bytes());
        s[16] = 2;
        s[17..19].copy_from_slice(&512u16.to_le_bytes());
        s[19..21].copy_from_slice(&8192u16.to_le_bytes());
        s[21] = 0xF8;
        s[22..24].copy_from_slice(&32u16.to_le_bytes());
        s[38] = 0x29;
        s[43..54].copy_from_slice(b"NO NAME    ");
        s[54..62].copy_from_slice(b"FAT16   ");
        s[510] = 0x55;
        s[511] = 0xAA;
        s
    }

    #[test]
    fn fat16_geometry() {
        let bpb = Bpb::from_sector(&fat16_sector(), true, 4 * 1024 * 1024).unwrap();
        assert_eq!(bpb.fat_type(), FATType::FAT16);
        assert_eq!(bpb.root_dir_sectors(), 32);
        assert_eq!(bpb.data_start_sector(), 1 + 2 * 32 + 32);
        assert_eq!(bpb.cluster_count(), 8192 - 97);
        assert_eq!(bpb.root_clus(), 0);
        assert_eq!(bpb.volume_label(), "NO NAME");
    }

    #[test]
    fn oversized_fat32_fats_are_rejected_without_overflow() {
        let mut sector = fat16_sector();
        sector[17..19].fill(0);
        sector[19..21].fill(0);
        sector[22..24].fill(0);
        sector[32..36].copy_from_slice(&1_000_000u32.to_le_bytes());
        sector[36..40].copy_from_slice(&0x8000_0000u32.to_le_bytes());
        sector[44..48].copy_from_slice(&2u32.to_le_bytes());
        assert!(matches!(
            Bpb::from_sector(&sector, false, 512 * 1_000_000),
            Err(FsError::InvalidFatSz(_))
        ));
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut sector = fat16_sector();
        sector[511] = 0;
        assert!(matches!(
            Bpb::from_sector(&sector, false, 4 * 1024 * 1024),
            Err(FsError::InvalidSignature(_))
        ));
    }

    #[test]
    fn strict_checks_only_apply_when_asked() {
        let mut sector = fat16_sector();
        sector[0] = 0x00;
        assert!(Bpb::from_sector(&sector, false, 4 * 1024 * 1024).is_ok());
        assert!(matches!(
            Bpb::from_sector(&sector, true, 4 * 1024 * 1024),
            Err(FsError::InvalidJmp(_))
        ));
    }

    #[test]
    fn volume_smaller_than_declared_fails_strict_validation() {
        assert!(matches!(
            Bpb::from_sector(&fat16_sector(), true, 1024 * 1024),
            Err(FsError::InvalidTotSec(_))
        ));
    }
}
