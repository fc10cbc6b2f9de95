//! Firmware image files
//!
//! Raw binaries are used as-is. Intel HEX files are flattened into one
//! image starting at address 0, with gaps filled with 0xFF (erased flash).

use std::fs;
use std::path::Path;

/// Largest address span a HEX file may describe
const MAX_IMAGE_SPAN: usize = 16 * 1024 * 1024;

/// Whether `data` looks like an Intel HEX file
pub fn is_intel_hex(data: &[u8]) -> bool {
    let text = match std::str::from_utf8(data) {
        Ok(text) => text,
        Err(_) => return false,
    };
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    matches!(lines.next(), Some(first) if first.starts_with(':'))
}

/// Flatten an Intel HEX document into a binary image
pub fn flatten_hex(text: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut binfile = bin_file::BinFile::new();
    let lines: Vec<&str> = text.lines().collect();
    binfile
        .add_strings(lines, false)
        .map_err(|e| format!("Invalid Intel HEX: {:?}", e))?;

    let segments = binfile.segments_list();
    let end = segments
        .iter()
        .map(|(address, data)| address + data.len())
        .max()
        .unwrap_or(0);
    if end > MAX_IMAGE_SPAN {
        return Err(format!("HEX file spans {} bytes", end).into());
    }

    let mut image = vec![0xFF; end];
    for (address, data) in segments {
        image[address..address + data.len()].copy_from_slice(&data);
    }
    Ok(image)
}

/// Read an image file, converting Intel HEX if needed
pub fn load_image(path: &Path) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let data = fs::read(path)?;
    if is_intel_hex(&data) {
        let text = String::from_utf8(data)?;
        let image = flatten_hex(&text)?;
        println!("Read {} bytes from Intel HEX {:?}", image.len(), path);
        Ok(image)
    } else {
        println!("Read {} bytes from {:?}", data.len(), path);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLINK_HEX: &str = "\
:100000000C945C000C946E000C946E000C946E00CA
:020010000C944E
:00000001FF
";

    #[test]
    fn test_detects_hex() {
        assert!(is_intel_hex(BLINK_HEX.as_bytes()));
        assert!(!is_intel_hex(&[0x0C, 0x94, 0x5C, 0x00]));
        assert!(!is_intel_hex(b""));
    }

    #[test]
    fn test_flatten_hex() {
        let image = flatten_hex(BLINK_HEX).unwrap();
        assert_eq!(image.len(), 18);
        assert_eq!(&image[..4], &[0x0C, 0x94, 0x5C, 0x00]);
        assert_eq!(&image[16..], &[0x0C, 0x94]);
    }

    #[test]
    fn test_gaps_are_erased() {
        let hex = ":02000000AABB99\n:02000400CCDD51\n:00000001FF\n";
        let image = flatten_hex(hex).unwrap();
        assert_eq!(image, vec![0xAA, 0xBB, 0xFF, 0xFF, 0xCC, 0xDD]);
    }

    #[test]
    fn test_load_binary_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blink.bin");
        fs::write(&path, [1, 2, 3]).unwrap();
        assert_eq!(load_image(&path).unwrap(), vec![1, 2, 3]);
    }
}
