//! Little-endian field extraction and string decoding helpers.

/// Extracts a 64-bit unsigned integer from a buffer at a given offset.
///
/// Returns 0 if the buffer does not hold 8 bytes at `offset`.
pub fn u64_at(buffer: &[u8], offset: usize) -> u64 {
    buffer
        .get(offset..offset + 8)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u64::from_le_bytes)
        .unwrap_or(0)
}

/// Extracts a 32-bit unsigned integer from a buffer at a given offset.
///
/// Returns 0 if the buffer does not hold 4 bytes at `offset`.
pub fn u32_at(buffer: &[u8], offset: usize) -> u32 {
    buffer
        .get(offset..offset + 4)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_le_bytes)
        .unwrap_or(0)
}

/// Extracts a 16-bit unsigned integer from a buffer at a given offset.
///
/// Returns 0 if the buffer does not hold 2 bytes at `offset`.
pub fn u16_at(buffer: &[u8], offset: usize) -> u16 {
    buffer
        .get(offset..offset + 2)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u16::from_le_bytes)
        .unwrap_or(0)
}

/// Extracts a byte from a buffer at a given offset, or 0 past the end.
pub fn u8_at(buffer: &[u8], offset: usize) -> u8 {
    buffer.get(offset).copied().unwrap_or(0)
}

/// Decodes UTF-16LE code units up to the first NUL (or 0xFFFF padding).
///
/// Unpaired surrogates are replaced with U+FFFD rather than failing, since names
/// recovered from damaged structures are still worth showing.
pub fn utf16_to_string(units: &[u16]) -> String {
    let end = units
        .iter()
        .position(|&u| u == 0x0000 || u == 0xFFFF)
        .unwrap_or(units.len());

    char::decode_utf16(units[..end].iter().copied())
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Reinterprets a little-endian byte slice as UTF-16 code units.
pub fn le_units(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_buffers_read_as_zero() {
        let buf = [0x01, 0x02, 0x03];
        assert_eq!(u16_at(&buf, 0), 0x0201);
        assert_eq!(u32_at(&buf, 0), 0);
        assert_eq!(u8_at(&buf, 5), 0);
    }

    #[test]
    fn utf16_stops_at_padding() {
        let units = [b'a' as u16, b'.' as u16, b'b' as u16, 0x0000, 0xFFFF];
        assert_eq!(utf16_to_string(&units), "a.b");
        assert_eq!(utf16_to_string(&[0xD800, b'x' as u16]), "\u{FFFD}x");
    }
}
