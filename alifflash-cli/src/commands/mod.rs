//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

use anyhow::Result;
use console::style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::Serialize;

use crate::{Cli, CliError, use_fancy_output};

pub(crate) mod completions;
pub(crate) mod flash;
pub(crate) mod info;
pub(crate) mod maintenance;
pub(crate) mod monitor;

/// Print `report` as JSON when asked, then turn `success == false` into an
/// exit-status-1 error carrying `message`.
pub(crate) fn finish<T: Serialize>(cli: &Cli, report: &T, success: bool, message: &str) -> Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else if success && !cli.quiet {
        eprintln!("{} {}", style("✓").green().bold(), message);
    }

    if success {
        Ok(())
    } else {
        Err(CliError::Failed(message.to_string()).into())
    }
}

/// Byte-based progress bar on stderr, hidden when output is not a terminal.
pub(crate) fn progress_bar(cli: &Cli) -> ProgressBar {
    if !cli.chatty() || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(0);
    if let Ok(bar_style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
    {
        pb.set_style(bar_style.progress_chars("#>-"));
    }
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb
}

/// Progress callback driving `pb`: one bar per image, restarted on each new name.
pub(crate) fn track<'a>(pb: &'a ProgressBar) -> impl FnMut(&str, usize, usize) + 'a {
    let mut current = String::new();
    move |name: &str, done: usize, total: usize| {
        if name != current {
            current = name.to_string();
            pb.reset();
            pb.set_message(current.clone());
        }
        pb.set_length(total as u64);
        pb.set_position(done as u64);
    }
}
