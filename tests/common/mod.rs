//! Builders for small disk images used by the integration tests.

#![allow(dead_code)]

use std::io::Write;
use tempfile::NamedTempFile;

pub const SECTOR: usize = 512;

/// Sectors of the FAT16 volumes built by [`fat16_volume`].
pub const FAT16_SECTORS: usize = 10240;
/// Sector offsets inside a [`fat16_volume`]: 1 reserved, 2 FATs of 40, 512 root entries.
pub const FAT_START: usize = 1;
pub const ROOT_START: usize = 81;
pub const DATA_START: usize = 113;

/// A blank, valid FAT16 volume of 5 MiB with 512-byte clusters.
pub fn fat16_volume() -> Vec<u8> {
    let mut vol = vec![0u8; FAT16_SECTORS * SECTOR];
    let s = &mut vol[0..SECTOR];
    s[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
    s[3..11].copy_from_slice(b"MSWIN4.1");
    s[11..13].copy_from_slice(&512u16.to_le_bytes());
    s[13] = 1;
    s[14..16].copy_from_slice(&1u16.to_le_bytes());
    s[16] = 2;
    s[17..19].copy_from_slice(&512u16.to_le_bytes());
    s[19..21].copy_from_slice(&(FAT16_SECTORS as u16).to_le_bytes());
    s[21] = 0xF8;
    s[22..24].copy_from_slice(&40u16.to_le_bytes());
    s[38] = 0x29;
    s[43..54].copy_from_slice(b"EVIDENCE   ");
    s[54..62].copy_from_slice(b"FAT16   ");
    s[510] = 0x55;
    s[511] = 0xAA;

    let fat = FAT_START * SECTOR;
    vol[fat..fat + 4].copy_from_slice(&[0xF8, 0xFF, 0xFF, 0xFF]);
    vol
}

/// An 8.3 directory record.
pub fn short_record(name: &[u8; 11], attr: u8, case_flags: u8, cluster: u16, size: u32) -> [u8; 32] {
    let mut rec = [0u8; 32];
    rec[0..11].copy_from_slice(name);
    rec[11] = attr;
    rec[12] = case_flags;
    rec[26..28].copy_from_slice(&cluster.to_le_bytes());
    rec[28..32].copy_from_slice(&size.to_le_bytes());
    rec
}

/// Stamps the last write date and time of a record.
pub fn set_modified(rec: &mut [u8; 32], year: u16, month: u16, day: u16, hour: u16, min: u16) {
    let date = ((year - 1980) << 9) | (month << 5) | day;
    let time = (hour << 11) | (min << 5);
    rec[22..24].copy_from_slice(&time.to_le_bytes());
    rec[24..26].copy_from_slice(&date.to_le_bytes());
}

/// A single long name record holding up to 13 characters.
pub fn lfn_record(ord: u8, checksum: u8, chars: &str) -> [u8; 32] {
    let mut units: Vec<u16> = chars.encode_utf16().collect();
    if units.len() < 13 {
        units.push(0);
    }
    units.resize(13, 0xFFFF);
    let mut rec = [0u8; 32];
    rec[0] = ord;
    rec[11] = 0x0F;
    rec[13] = checksum;
    let slots = (1..11)
        .step_by(2)
        .chain((14..26).step_by(2))
        .chain((28..32).step_by(2));
    for (unit, off) in units.iter().zip(slots) {
        rec[off..off + 2].copy_from_slice(&unit.to_le_bytes());
    }
    rec
}

/// Checksum of an 8.3 name, as stored in its long name records.
pub fn lfn_checksum(name: &[u8; 11]) -> u8 {
    name.iter()
        .fold(0u8, |sum, &b| sum.rotate_right(1).wrapping_add(b))
}

/// Writes `records` consecutively from the start of the root directory.
pub fn put_root_records(vol: &mut [u8], records: &[[u8; 32]]) {
    put_records(vol, ROOT_START * SECTOR, records);
}

/// Writes `records` consecutively from the start of a data cluster.
pub fn put_cluster_records(vol: &mut [u8], cluster: u16, records: &[[u8; 32]]) {
    let off = (DATA_START + cluster as usize - 2) * SECTOR;
    put_records(vol, off, records);
}

fn put_records(vol: &mut [u8], off: usize, records: &[[u8; 32]]) {
    for (i, rec) in records.iter().enumerate() {
        vol[off + i * 32..off + (i + 1) * 32].copy_from_slice(rec);
    }
}

pub fn set_fat16(vol: &mut [u8], cluster: u16, value: u16) {
    let off = FAT_START * SECTOR + cluster as usize * 2;
    vol[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

/// A disk of `total_sectors` with an MBR describing `parts` as (type, start, sectors).
pub fn mbr_disk(total_sectors: usize, parts: &[(u8, u32, u32)]) -> Vec<u8> {
    let mut disk = vec![0u8; total_sectors * SECTOR];
    for (slot, &(ty, start, count)) in parts.iter().enumerate() {
        let off = 446 + slot * 16;
        disk[off + 4] = ty;
        disk[off + 8..off + 12].copy_from_slice(&start.to_le_bytes());
        disk[off + 12..off + 16].copy_from_slice(&count.to_le_bytes());
    }
    disk[510] = 0x55;
    disk[511] = 0xAA;
    disk
}

/// Copies `volume` into `disk` at sector `lba`.
pub fn place(disk: &mut [u8], lba: usize, volume: &[u8]) {
    disk[lba * SECTOR..lba * SECTOR + volume.len()].copy_from_slice(volume);
}

/// 10 MiB disk whose only partition is a FAT16 volume at sector 2048 holding `a.txt`
/// (100 bytes) and the deleted `b.txt` (50 bytes).
pub fn evidence_disk() -> Vec<u8> {
    let mut vol = fat16_volume();

    let mut a = short_record(b"A       TXT", 0x20, 0x18, 2, 100);
    set_modified(&mut a, 2024, 3, 15, 10, 30);
    let b_sum = lfn_checksum(b"B       TXT");
    put_root_records(
        &mut vol,
        &[
            a,
            lfn_record(0xE5, b_sum, "b.txt"),
            short_record(b"\xE5       TXT", 0x20, 0, 3, 50),
        ],
    );
    set_fat16(&mut vol, 2, 0xFFFF);

    let mut disk = mbr_disk(20480, &[(0x06, 2048, FAT16_SECTORS as u32)]);
    place(&mut disk, 2048, &vol);
    disk
}

/// Persists an image to a temporary file.
pub fn image_file(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}
