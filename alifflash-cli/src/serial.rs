//! SE-UART port selection.
//!
//! Selection order:
//! - `--port` / `ALIFFLASH_PORT`
//! - `[port] serial` from the config file
//! - the preferred ISP candidate (FTDI before J-Link VCOM)
//!
//! When several FTDI adapters are plugged in and both stdin and stderr are
//! terminals, the user picks one interactively. `--non-interactive` never prompts.

use {
    crate::{CliError, config::Config},
    alifflash::{DetectedPort, DeviceKind, discover_ports, format_port_list, preferred_port},
    anyhow::Result,
    console::style,
    dialoguer::{Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, info},
    std::io::IsTerminal,
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Non-interactive mode (never prompt).
    pub non_interactive: bool,
}

/// Outcome of the selection policy.
#[derive(Debug, PartialEq, Eq)]
enum Choice {
    Use(DetectedPort),
    Ask(Vec<DetectedPort>),
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Built-in ISP adapters plus any VID/PID pairs from the config.
fn isp_candidates(ports: Vec<DetectedPort>, config: &Config) -> Vec<DetectedPort> {
    let adapters = config.adapter_filter();
    ports
        .into_iter()
        .filter(|p| adapters.accepts(p))
        .collect()
}

fn choose(candidates: Vec<DetectedPort>, can_prompt: bool) -> Result<Choice> {
    if candidates.is_empty() {
        return Err(usage_err(
            "No ISP-capable serial port found. Connect PRG_USB or pass --port.",
        ));
    }

    let ftdi = candidates
        .iter()
        .filter(|p| p.device == DeviceKind::Ftdi)
        .count();
    if ftdi > 1 && can_prompt {
        return Ok(Choice::Ask(candidates));
    }

    let chosen = preferred_port(&candidates)
        .or_else(|| candidates.first())
        .cloned()
        .ok_or_else(|| usage_err("No ISP-capable serial port found."))?;
    Ok(Choice::Use(chosen))
}

/// Select the SE-UART endpoint.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<String> {
    if let Some(port_name) = &options.port {
        return Ok(port_name.clone());
    }

    if let Some(port_name) = &config.port.serial {
        debug!("Using port from config: {port_name}");
        return Ok(port_name.clone());
    }

    let candidates = isp_candidates(discover_ports(), config);
    let can_prompt = !options.non_interactive && is_interactive_terminal();
    match choose(candidates, can_prompt)? {
        Choice::Use(port) => {
            info!("Auto-selected port: {} [{}]", port.name, port.device.name());
            Ok(port.name)
        },
        Choice::Ask(ports) => select_port_interactive(ports),
    }
}

fn is_interactive_terminal() -> bool {
    std::io::stdin().is_terminal() && std::io::stderr().is_terminal()
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Port selection cancelled".to_string()).into()
            } else {
                CliError::Usage("Port selection prompt failed".to_string()).into()
            }
        },
    }
}

fn select_port_interactive(mut ports: Vec<DetectedPort>) -> Result<String> {
    eprintln!(
        "{} Found {} ISP-capable ports",
        style("ℹ").blue(),
        ports.len()
    );

    // FTDI first, then by name
    ports.sort_by(|a, b| a.device.cmp(&b.device).then_with(|| a.name.cmp(&b.name)));

    // Truncate labels to the terminal width so they do not wrap.
    let term_width = console::Term::stderr()
        .size()
        .1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = format_port_list(&ports)
        .into_iter()
        .map(|label| console::truncate_str(&label, max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the SE-UART port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => ports
            .into_iter()
            .nth(index)
            .map(|port| port.name)
            .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("Port selection cancelled".to_string()).into()),
    }
}
