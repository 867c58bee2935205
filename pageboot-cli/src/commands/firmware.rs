//! Firmware file loading and inspection.

use {
    anyhow::{Context, Result, bail},
    console::style,
    pageboot::FirmwareImage,
    std::path::Path,
};

/// Decode a hex file, rejecting files without data records.
pub(crate) fn load_image(path: &Path) -> Result<FirmwareImage> {
    let image = FirmwareImage::from_file(path)
        .with_context(|| format!("could not load firmware {}", path.display()))?;
    match image {
        Some(image) => Ok(image),
        None => bail!("{} contains no data records", path.display()),
    }
}

/// Inspect command implementation.
pub(crate) fn cmd_inspect(firmware: &Path, page_size: u16, json: bool) -> Result<()> {
    let image = load_image(firmware)?;
    let pages = image.page_count(usize::from(page_size));

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "file": firmware.display().to_string(),
                "start_address": image.start_address(),
                "end_address": image.end_address(),
                "length": image.len(),
                "page_size": page_size,
                "pages": pages,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!(
        "{}",
        style(format!("Firmware {}", firmware.display()))
            .bold()
            .underlined()
    );
    eprintln!(
        "  Start address: 0x{:04X}",
        image.start_address()
    );
    eprintln!("  End address:   0x{:04X}", image.end_address());
    eprintln!("  Length:        {} bytes", image.len());
    eprintln!("  Pages:         {pages} of {page_size} bytes");

    Ok(())
}
