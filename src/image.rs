//! Random-access byte reader over a disk image or block device.
//!
//! The reader is byte-granular: callers ask for any `(offset, length)` range and the reader
//! internally widens the request to whole sectors before touching the backing source.

use log::info;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::InspectError;

/// Default sector size, used until a partition table says otherwise.
pub const SECTOR_SIZE: usize = 512;

/// Anything an image can be read from: a file, a block device, or an in-memory buffer.
pub trait BlockSource: Read + Seek + Send {}

impl<T: Read + Seek + Send> BlockSource for T {}

/// An opened image.
///
/// The source is wrapped in a mutex so the handle can be shared with derived objects
/// through an `Arc`, while every read stays a seek + read pair.
pub struct ImageSource {
    source: Mutex<Box<dyn BlockSource>>,
    len: u64,
    sector_size: usize,
    label: String,
}

impl ImageSource {
    /// Opens a disk image file or a raw block device for reading.
    ///
    /// # Errors
    /// - `InspectError::NotFound` if the path does not exist
    /// - `InspectError::PermissionDenied` if the path cannot be opened for reading
    /// - `InspectError::Io` for any other failure
    pub fn open(path: &Path) -> Result<Self, InspectError> {
        let label = path.display().to_string();
        let file = File::open(path).map_err(|err| InspectError::from_open(err, &label))?;
        let image = Self::from_source(file, &label)?;
        info!("Opened image {} ({} bytes)", image.label, image.len);
        Ok(image)
    }

    /// Wraps an arbitrary source. The length is taken by seeking to its end, which also
    /// works for block devices whose metadata reports a length of zero.
    pub fn from_source<S: BlockSource + 'static>(
        mut source: S,
        label: &str,
    ) -> Result<Self, InspectError> {
        let len = source.seek(SeekFrom::End(0))?;
        Ok(Self {
            source: Mutex::new(Box::new(source)),
            len,
            sector_size: SECTOR_SIZE,
            label: label.to_string(),
        })
    }

    /// Total length of the image in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    pub fn set_sector_size(&mut self, sector_size: usize) {
        self.sector_size = sector_size;
    }

    /// Human-readable name of the image (usually its path).
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Reads exactly `length` bytes starting at `offset`.
    ///
    /// # Errors
    /// - `InspectError::OutOfRange` if `offset + length` exceeds the image length
    /// - `InspectError::Io` if the underlying source fails
    pub fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>, InspectError> {
        let end = check_range(offset, length, self.len)?;
        if length == 0 {
            return Ok(Vec::new());
        }

        let sector = self.sector_size as u64;
        let aligned_start = offset - offset % sector;
        let aligned_end = end.div_ceil(sector).saturating_mul(sector).min(self.len);

        let mut buf = vec![0; (aligned_end - aligned_start) as usize];
        {
            let mut source = self.source.lock();
            source.seek(SeekFrom::Start(aligned_start))?;
            source.read_exact(&mut buf)?;
        }

        let skip = (offset - aligned_start) as usize;
        buf.drain(..skip);
        buf.truncate(length);
        Ok(buf)
    }

    /// Reads one sector by number.
    pub fn read_sector(&self, sector: u64) -> Result<Vec<u8>, InspectError> {
        self.read(sector * self.sector_size as u64, self.sector_size)
    }
}

/// Checks `[offset, offset + length)` against `limit` and returns the range end.
fn check_range(offset: u64, length: usize, limit: u64) -> Result<u64, InspectError> {
    match offset.checked_add(length as u64) {
        Some(end) if end <= limit => Ok(end),
        _ => Err(InspectError::OutOfRange {
            offset,
            length: length as u64,
            limit,
        }),
    }
}

/// A byte window over one volume of an image.
///
/// Offsets passed to [`VolumeView::read`] are relative to the start of the volume and are
/// bounded by its length, so a filesystem driver can never read into a sibling volume.
#[derive(Clone, Copy)]
pub struct VolumeView<'a> {
    image: &'a ImageSource,
    start: u64,
    len: u64,
}

impl<'a> VolumeView<'a> {
    pub fn new(image: &'a ImageSource, start: u64, len: u64) -> Self {
        Self { image, start, len }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads `length` bytes at `offset` from the start of the volume.
    pub fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>, InspectError> {
        check_range(offset, length, self.len)?;
        self.image.read(self.start + offset, length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn image_of(len: usize) -> ImageSource {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        ImageSource::from_source(Cursor::new(data), "mem").unwrap()
    }

    #[test]
    fn unaligned_read_returns_exact_bytes() {
        let image = image_of(4096);
        let buf = image.read(510, 7).unwrap();
        let expected: Vec<u8> = (510..517).map(|i| (i % 251) as u8).collect();
        assert_eq!(buf, expected);
    }

    #[test]
    fn read_up_to_the_last_byte_succeeds() {
        let image = image_of(1000);
        assert_eq!(image.read(990, 10).unwrap().len(), 10);
        assert!(image.read(1000, 0).unwrap().is_empty());
    }

    #[test]
    fn read_past_the_end_is_out_of_range() {
        let image = image_of(1000);
        match image.read(995, 10) {
            Err(InspectError::OutOfRange { offset, length, limit }) => {
                assert_eq!((offset, length, limit), (995, 10, 1000));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // The image stays usable after a rejected read.
        assert_eq!(image.read(0, 4).unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn overflowing_offset_is_out_of_range() {
        let image = image_of(512);
        assert!(matches!(
            image.read(u64::MAX, 2),
            Err(InspectError::OutOfRange { .. })
        ));
    }

    #[test]
    fn volume_view_is_bounded_by_the_volume() {
        let image = image_of(4096);
        let view = VolumeView::new(&image, 1024, 512);
        assert_eq!(view.read(0, 1).unwrap(), vec![(1024 % 251) as u8]);
        assert!(matches!(
            view.read(500, 20),
            Err(InspectError::OutOfRange { limit: 512, .. })
        ));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.img");
        assert!(matches!(
            ImageSource::open(&missing),
            Err(InspectError::NotFound(_))
        ));
    }
}
