//! Firmware store commands

use std::path::Path;
use stkbridge_store::FirmwareStore;

use crate::image::load_image;

/// Add an image file to the store
pub fn run_store(
    store: &FirmwareStore,
    input: &Path,
    name: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let data = load_image(input)?;
    let image = store.store(name, &data)?;
    println!(
        "Stored {} version {} ({} bytes, CRC 0x{:08X})",
        image.name, image.version, image.length, image.crc32
    );
    Ok(())
}

/// Print every stored image
pub fn run_list(store: &FirmwareStore) -> Result<(), Box<dyn std::error::Error>> {
    let images = store.list()?;
    if images.is_empty() {
        println!("No images in {}", store.root().display());
        return Ok(());
    }

    println!("{:<24} {:>8} {:>10}  {:<10}", "Name", "Version", "Bytes", "CRC-32");
    println!("{}", "-".repeat(58));
    for image in &images {
        println!(
            "{:<24} {:>8} {:>10}  {:08X}",
            image.name, image.version, image.length, image.crc32
        );
    }
    println!();
    println!(
        "{} image(s), {} bytes total",
        images.len(),
        images.iter().map(|i| i.length).sum::<u64>()
    );
    Ok(())
}

/// Delete one stored version
pub fn run_remove(
    store: &FirmwareStore,
    name: &str,
    version: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    store.remove(name, version)?;
    println!("Removed {} version {}", name, version);
    Ok(())
}
