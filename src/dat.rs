//! Reading and writing volumes in the raw `.dat` format.
//!
//! A `.dat` file is a header of four integers `w h d c` followed by
//! `w * h * d * c` bytes of voxel data with interleaved channels.
//! The header is either four contiguous little-endian 32-bit words or
//! the same numbers as whitespace-separated ASCII text; reading
//! detects the variant, writing always produces the binary form.

use std::{
    fs,
    io::{self, Write},
    path::Path,
};

use crate::volume::{ArrayDim, Layout, Volume};

// ======================================================================
// FUNCTIONS - PUBLIC

/// Reads a volume from a `.dat` file.
pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Volume<u8>> {
    parse(&fs::read(path)?)
}

/// Writes a volume to a `.dat` file with a binary header.
pub fn save<P: AsRef<Path>>(path: P, volume: &Volume<u8>) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    write_to(&mut file, volume)
}

/// Parses a volume from the bytes of a `.dat` file.
pub fn parse(bytes: &[u8]) -> io::Result<Volume<u8>> {
    if let Some(volume) = parse_binary(bytes) {
        return Ok(volume);
    }
    if let Some(volume) = parse_text(bytes) {
        return Ok(volume);
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "not a volume: header and payload size do not line up",
    ))
}

/// Writes a volume as `.dat` bytes with a binary header.
pub fn write_to<W: Write>(mut writer: W, volume: &Volume<u8>) -> io::Result<()> {
    let dim = volume.dim();
    for extent in [dim.w, dim.h, dim.d, dim.c] {
        let word = u32::try_from(extent)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "extent exceeds u32"))?;
        writer.write_all(&word.to_le_bytes())?;
    }
    writer.write_all(volume.data())
}

// ======================================================================
// FUNCTIONS - PRIVATE

fn volume_from(dim: ArrayDim, payload: &[u8]) -> Option<Volume<u8>> {
    // Header words are untrusted; a corrupt binary header can hold
    // values whose product overflows.
    let elems = dim
        .w
        .checked_mul(dim.h)?
        .checked_mul(dim.d)?
        .checked_mul(dim.c)?;
    if dim.is_empty() || payload.len() != elems {
        return None;
    }
    // The interlaced layout stores channels fastest, then x, y, z,
    // which is exactly the payload order.
    Volume::from_vec(payload.to_vec(), dim, Layout::Interlaced).ok()
}

fn parse_binary(bytes: &[u8]) -> Option<Volume<u8>> {
    if bytes.len() < 16 {
        return None;
    }
    let mut words = [0usize; 4];
    for (n, word) in words.iter_mut().enumerate() {
        let le: [u8; 4] = bytes[4 * n..4 * n + 4].try_into().ok()?;
        *word = u32::from_le_bytes(le) as usize;
    }
    let dim = ArrayDim::new(words[0], words[1], words[2], words[3]);
    volume_from(dim, &bytes[16..])
}

fn parse_text(bytes: &[u8]) -> Option<Volume<u8>> {
    let mut words = [0usize; 4];
    let mut pos = 0;
    for word in &mut words {
        while bytes.get(pos)?.is_ascii_whitespace() {
            pos += 1;
        }
        let start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        if pos == start {
            return None;
        }
        *word = std::str::from_utf8(&bytes[start..pos]).ok()?.parse().ok()?;
    }
    // Exactly one whitespace separates the header from the payload.
    if !bytes.get(pos)?.is_ascii_whitespace() {
        return None;
    }
    pos += 1;
    let dim = ArrayDim::new(words[0], words[1], words[2], words[3]);
    volume_from(dim, &bytes[pos..])
}

// ======================================================================
// TESTS

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_volume() -> Volume<u8> {
        let dim = ArrayDim::new(3, 2, 2, 2);
        let data: Vec<u8> = (0..dim.num_elem() as u8).collect();
        Volume::from_vec(data, dim, Layout::Interlaced).unwrap()
    }

    // ============================================================
    // ROUNDTRIP

    #[test]
    fn binary_roundtrip() {
        let volume = sample_volume();
        let mut bytes = Vec::new();
        write_to(&mut bytes, &volume).unwrap();

        assert_eq!(&bytes[..16], &[3, 0, 0, 0, 2, 0, 0, 0, 2, 0, 0, 0, 2, 0, 0, 0]);
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed, volume);
    }

    #[test]
    fn text_header_is_detected() {
        let mut bytes = b"3 2 2 2\n".to_vec();
        bytes.extend(0..24u8);
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed, sample_volume());
    }

    #[test]
    fn text_header_with_extra_whitespace() {
        let mut bytes = b"  16 1\t1 1\n".to_vec();
        bytes.extend(std::iter::repeat(9).take(16));
        let parsed = parse(&bytes).unwrap();
        assert_eq!(parsed.dim(), ArrayDim::new(16, 1, 1, 1));
        assert_eq!(parsed.get(3, 0, 0, 0), 9);
    }

    // ============================================================
    // ERRORS

    #[test]
    fn truncated_payload_is_rejected() {
        let volume = sample_volume();
        let mut bytes = Vec::new();
        write_to(&mut bytes, &volume).unwrap();
        bytes.pop();
        assert!(parse(&bytes).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse(b"not a volume at all").is_err());
        assert!(parse(b"").is_err());
        assert!(parse(b"1 2 3").is_err());
    }

    #[test]
    fn zero_extent_is_rejected() {
        let mut bytes = Vec::new();
        for word in [3u32, 0, 2, 2] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        assert!(parse(&bytes).is_err());
    }
}
