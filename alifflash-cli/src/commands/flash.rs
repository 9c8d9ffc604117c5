//! Flash, write, and TOC generation command implementations.

use alifflash::{
    FirmwareTable, FlashReport, ImageDescriptor, NativeConnector, TransferReport, flash_resolved,
    generate_toc, write_image,
};
use anyhow::{Context, Result};
use console::style;
use log::debug;
use std::path::{Path, PathBuf};

use crate::commands::maintenance::{entry_strategy, print_steps};
use crate::commands::{finish, progress_bar, track};
use crate::config::Config;
use crate::{Cli, CliError, ResetArgs, isp_serial, jlink_reset};

/// Relative ATOC config paths are taken from the SE tools directory when one is known.
fn resolve_atoc_config(path: &Path, setools_dir: Option<&Path>) -> PathBuf {
    match setools_dir {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    }
}

fn print_transfer(report: &TransferReport) {
    let reconnects = if report.reconnects > 0 {
        style(format!(", {} reconnects", report.reconnects))
            .yellow()
            .to_string()
    } else {
        String::new()
    };
    eprintln!(
        "    {} {} @ 0x{:08X}: {} bytes in {:.1}s ({} B/s{})",
        style("•").dim(),
        report.file,
        report.address,
        report.original_bytes,
        report.elapsed_seconds,
        report.bytes_per_second,
        reconnects
    );
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &Config,
    atoc: &Path,
    maintenance: bool,
    reset: ResetArgs,
) -> Result<()> {
    let layout = cli.board(config)?.layout();
    let path = resolve_atoc_config(atoc, cli.setools_dir(config).as_deref());
    if cli.chatty() {
        eprintln!("{} Loading {}", style("📦").cyan(), path.display());
    }

    // Resolve every image before touching the device
    let images = match FirmwareTable::from_file(&path).and_then(|table| table.resolve(&layout)) {
        Ok(images) => images,
        Err(e) => {
            let report = FlashReport::config_failure(e.to_string());
            return finish(cli, &report, false, &report.message);
        },
    };

    if cli.chatty() {
        eprintln!("{} Found {} images", style("ℹ").blue(), images.len());
        for image in &images {
            eprintln!(
                "    {} {} @ 0x{:08X} ({} bytes)",
                style("•").dim(),
                image.name(),
                image.address(),
                image.len()
            );
        }
    }

    let (serial, _) = isp_serial(cli, config)?;
    let jlink = jlink_reset(config, &layout);
    let enter = maintenance || reset.jlink_reset || reset.wait_replug;
    if enter && !maintenance {
        debug!("Reset mode given; entering maintenance mode first");
    }
    let strategy = enter.then(|| entry_strategy(reset, &jlink));

    let pb = progress_bar(cli);
    let mut progress = track(&pb);
    let report = flash_resolved(&NativeConnector, &serial, &images, strategy, &mut progress)?;
    pb.finish_and_clear();

    if cli.chatty() {
        if let Some(entered) = &report.maintenance {
            eprintln!("{} Maintenance", style("🔧").cyan());
            print_steps(entered);
        }
        if !report.images.is_empty() {
            eprintln!("{} Images", style("📝").cyan());
            report
                .images
                .iter()
                .for_each(print_transfer);
        }
        if report.success && !report.reset_sent {
            eprintln!(
                "{} Final reset was not sent; power cycle the board manually.",
                style("⚠").yellow()
            );
        }
    }
    finish(cli, &report, report.success, &report.message)
}

/// Write command implementation.
pub(crate) fn cmd_write(cli: &Cli, config: &Config, file: &Path, address: u32) -> Result<()> {
    let image = ImageDescriptor::from_file(file, address)
        .with_context(|| format!("Failed to load {}", file.display()))?;
    if cli.chatty() {
        eprintln!(
            "{} {} → 0x{:08X} ({} bytes)",
            style("📦").cyan(),
            image.name(),
            image.address(),
            image.len()
        );
    }

    let (serial, _) = isp_serial(cli, config)?;
    let pb = progress_bar(cli);
    let mut progress = track(&pb);
    let report = write_image(&NativeConnector, &serial, &image, &mut progress)?;
    pb.finish_and_clear();

    if cli.chatty() && report.success {
        print_transfer(&report);
    }
    let message = if report.success {
        format!("Wrote {} to 0x{:08X}", report.file, report.address)
    } else {
        report.message.clone()
    };
    finish(cli, &report, report.success, &message)
}

/// Gen-toc command implementation.
pub(crate) fn cmd_gen_toc(cli: &Cli, config: &Config, atoc_config: &str) -> Result<()> {
    let setools_dir = cli.setools_dir(config).ok_or_else(|| {
        CliError::Usage(
            "gen-toc needs the SE tools directory: pass --setools-dir or set ALIFFLASH_SETOOLS_DIR"
                .to_string(),
        )
    })?;

    if cli.chatty() {
        eprintln!(
            "{} Running app-gen-toc -f {} in {}",
            style("⚙").cyan(),
            atoc_config,
            setools_dir.display()
        );
    }
    let report = generate_toc(&setools_dir, atoc_config);

    if cli.chatty() {
        if !report.stdout.is_empty() {
            eprintln!("{}", style(report.stdout.trim_end()).dim());
        }
        if !report.success && !report.stderr.is_empty() {
            eprintln!("{}", style(report.stderr.trim_end()).red());
        }
    }
    finish(cli, &report, report.success, &report.message)
}
