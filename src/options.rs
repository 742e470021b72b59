//! Settings applied to a session when it opens an image.

/// Inspection settings.
///
/// ```
/// use vol_forensics::InspectOptions;
///
/// let options = InspectOptions::default().sector_size(4096).include_deleted(false);
/// assert_eq!(options.forced_sector_size(), Some(4096));
/// ```
#[derive(Debug, Clone)]
pub struct InspectOptions {
    sector_size: Option<usize>,
    strict_bpb: bool,
    include_deleted: bool,
}

impl Default for InspectOptions {
    fn default() -> Self {
        Self {
            sector_size: None,
            strict_bpb: true,
            include_deleted: true,
        }
    }
}

impl InspectOptions {
    /// Forces the sector size instead of probing it from the partition table.
    pub fn sector_size(mut self, sector_size: usize) -> Self {
        self.sector_size = Some(sector_size);
        self
    }

    /// Enables or disables the full BIOS Parameter Block checks of the FAT driver.
    pub fn strict_bpb(mut self, strict: bool) -> Self {
        self.strict_bpb = strict;
        self
    }

    /// Controls whether directory listings surface deleted entries.
    pub fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }

    pub fn forced_sector_size(&self) -> Option<usize> {
        self.sector_size
    }

    pub fn is_strict_bpb(&self) -> bool {
        self.strict_bpb
    }

    pub fn shows_deleted(&self) -> bool {
        self.include_deleted
    }
}
