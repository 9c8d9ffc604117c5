//! Console capture command implementation.

use alifflash::{NativeConnector, SerialConfig, capture};
use anyhow::Result;
use console::style;
use std::io::{self, Write as _};
use std::time::Duration;

use crate::commands::finish;
use crate::config::Config;
use crate::{Cli, get_port};

/// Monitor command implementation.
///
/// Text is streamed to stdout as it arrives unless `--json` is given, in
/// which case the whole capture ends up in the report.
pub(crate) fn cmd_monitor(
    cli: &Cli,
    config: &Config,
    monitor_baud: u32,
    duration: u64,
    wait_replug: bool,
) -> Result<()> {
    let port = get_port(cli, config)?;
    let serial = SerialConfig::new(port, monitor_baud).with_adapters(config.adapter_filter());

    if cli.chatty() {
        if wait_replug {
            eprintln!(
                "{} Power cycle the board (unplug/replug PRG_USB)...",
                style("⏳").yellow()
            );
        }
        eprintln!(
            "{} Capturing {} @ {} baud for {}s",
            style("📡").cyan(),
            style(&serial.port_name).green(),
            monitor_baud,
            duration
        );
    }

    let stream = !cli.json;
    let mut stdout = io::stdout();
    let report = capture(
        &NativeConnector,
        &serial,
        Duration::from_secs(duration),
        wait_replug,
        &mut |text| {
            if stream {
                print!("{text}");
                stdout.flush().ok();
            }
        },
    )?;

    let message = if report.success {
        format!("Captured {} bytes in {:.1}s", report.bytes, report.duration_seconds)
    } else {
        report.message.clone()
    };
    if stream && report.success {
        println!();
    }
    finish(cli, &report, report.success, &message)
}
