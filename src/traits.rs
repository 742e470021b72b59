//! Declaration of traits reused across the code.

/// Implementation of the LayoutDisplay trait.
/// It is used to display the layout of a given structure such as a partition table or a
/// mounted filesystem.
pub trait LayoutDisplay {
    fn display_layout(&self, indent: u8) -> Result<String, std::fmt::Error>;
}
