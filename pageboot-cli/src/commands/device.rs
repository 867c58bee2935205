//! Commands that talk to the bootloader: info, read, write and verify.

use {
    super::firmware::load_image,
    crate::{
        CliError,
        session::{Progress, RunContext},
    },
    anyhow::{Context, Result},
    console::style,
    pageboot::DeviceInfo,
    serde::Serialize,
    std::{
        ffi::OsString,
        path::{Path, PathBuf},
    },
};

/// `info --json` payload: the session plus what the bootloader reported.
#[derive(Serialize)]
struct InfoOutput<'a> {
    port: &'a str,
    baud: u32,
    #[serde(flatten)]
    device: &'a DeviceInfo,
    usable_bytes: usize,
    pages: usize,
}

/// Info command implementation.
pub(crate) fn cmd_info(ctx: &RunContext<'_>, json: bool) -> Result<()> {
    let mut session = ctx.connect()?;
    let Some(info) = session.flasher.device_info().cloned() else {
        anyhow::bail!("bootloader disconnected before reporting its identity");
    };
    session.flasher.finish();
    ctx.remember(&session, None, None);

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": InfoOutput {
                port: &session.port,
                baud: session.baud,
                device: &info,
                usable_bytes: info.usable_bytes(),
                pages: info.page_count(),
            },
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    }
    Ok(())
}

/// Read command implementation.
pub(crate) fn cmd_read(ctx: &RunContext<'_>, output: &Path) -> Result<()> {
    let output = with_hex_extension(output);
    let quiet = ctx.cli.quiet;

    let mut session = ctx.connect()?;
    let progress = Progress::start(quiet)?;
    let result = session.flasher.read_flash(&mut progress.callback());
    progress.finish();
    session.flasher.finish();
    let image = result.context("reading flash failed")?;

    image
        .write_file(&output)
        .with_context(|| format!("could not write {}", output.display()))?;
    ctx.remember(&session, None, None);

    if !quiet {
        eprintln!(
            "\n{} Read {} bytes into {}",
            style("✓").green().bold(),
            image.len(),
            output.display()
        );
    }
    Ok(())
}

/// Write command implementation.
pub(crate) fn cmd_write(
    ctx: &RunContext<'_>,
    firmware: Option<&Path>,
    verify: Option<bool>,
) -> Result<()> {
    let firmware = resolve_firmware(ctx, firmware)?;
    let verify = verify
        .or(ctx.config.write.verify)
        .or(ctx.last_used.verify)
        .unwrap_or(true);
    let quiet = ctx.cli.quiet;

    let image = load_image(&firmware)?;
    if !quiet {
        eprintln!(
            "{} Loaded {} bytes at 0x{:04X} from {}",
            style("📦").cyan(),
            image.len(),
            image.start_address(),
            firmware.display()
        );
    }

    let mut session = ctx.connect()?;
    let progress = Progress::start(quiet)?;
    let result = session
        .flasher
        .write_flash(&image, verify, &mut progress.callback());
    progress.finish();
    session.flasher.finish();
    result.with_context(|| format!("writing {} failed", firmware.display()))?;
    ctx.remember(&session, Some(&firmware), Some(verify));

    if !quiet {
        let verified = if verify { ", verified" } else { "" };
        eprintln!(
            "\n{} Wrote {} bytes{verified}",
            style("🎉").green().bold(),
            image.len()
        );
    }
    Ok(())
}

/// Verify command implementation.
pub(crate) fn cmd_verify(ctx: &RunContext<'_>, firmware: Option<&Path>) -> Result<()> {
    let firmware = resolve_firmware(ctx, firmware)?;
    let image = load_image(&firmware)?;

    let mut session = ctx.connect()?;
    let progress = Progress::start(ctx.cli.quiet)?;
    let result = session.flasher.verify(&image, &mut progress.callback());
    progress.finish();
    session.flasher.finish();
    result.with_context(|| format!("flash does not match {}", firmware.display()))?;
    ctx.remember(&session, Some(&firmware), None);

    if !ctx.cli.quiet {
        eprintln!(
            "\n{} Flash matches {}",
            style("✓").green().bold(),
            firmware.display()
        );
    }
    Ok(())
}

/// The firmware argument, or the file used last time if it still exists.
fn resolve_firmware(ctx: &RunContext<'_>, firmware: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = firmware {
        return Ok(path.to_path_buf());
    }
    match ctx.last_used.existing_firmware() {
        Some(path) => {
            log::info!("Using last firmware file {}", path.display());
            Ok(path.to_path_buf())
        },
        None => Err(CliError::Usage("no firmware file given and none used before".into()).into()),
    }
}

/// Append ".hex" unless the name already ends with it.
fn with_hex_extension(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == "hex") {
        return path.to_path_buf();
    }
    let mut name = OsString::from(path.as_os_str());
    name.push(".hex");
    PathBuf::from(name)
}
