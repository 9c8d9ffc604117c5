//! alifflash CLI - Command-line tool for flashing Alif Ensemble devices.
//!
//! ## Features
//!
//! - Flash every image of an ATOC config over the SE-UART
//! - Write a single binary to an MRAM address
//! - Enter maintenance mode (J-Link reset or manual replug)
//! - Probe the Secure Enclave and capture the boot console
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable support
//! - JSON reports for scripting

use alifflash::{Board, JLinkReset, MramLayout, SerialConfig, monitor::CONSOLE_BAUD};
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Errors that map to a specific exit status.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing setup; exit 2.
    #[error("{0}")]
    Usage(String),
    /// The user aborted a prompt; exit 130.
    #[error("{0}")]
    Cancelled(String),
    /// The operation ran and reported failure; exit 1.
    #[error("{0}")]
    Failed(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled(_) => 130,
            Self::Failed(_) => 1,
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<CliError>()
        .map_or(1, CliError::exit_code)
}

/// alifflash - Flash Alif Ensemble devices over the SE-UART ISP protocol.
///
/// Environment variables:
///   ALIFFLASH_PORT              - SE-UART serial port
///   ALIFFLASH_BOARD             - Board (alif-e7, alif-e8)
///   ALIFFLASH_SETOOLS_DIR       - SE tools directory (app-gen-toc, build/)
///   ALIFFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "alifflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:
  alifflash list-ports
  alifflash --setools-dir ~/app-release-exec gen-toc --atoc-config build/config/linux-boot-e7.json
  alifflash --setools-dir ~/app-release-exec flash build/config/linux-boot-e7.json --maintenance --jlink-reset
  alifflash write app.bin --address 0x80000000
  alifflash monitor --duration 20 --wait-replug")]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// SE-UART serial port (auto-detected if not specified).
    #[arg(short, long, global = true, env = "ALIFFLASH_PORT")]
    port: Option<String>,

    /// Target board [default: alif-e7].
    #[arg(short, long, global = true, env = "ALIFFLASH_BOARD")]
    board: Option<Board>,

    /// SE tools directory holding app-gen-toc and the build tree.
    #[arg(long, global = true, env = "ALIFFLASH_SETOOLS_DIR", value_name = "DIR")]
    setools_dir: Option<PathBuf>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "ALIFFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Print the operation report as JSON on stdout.
    #[arg(long, global = true)]
    json: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// How the board is rebooted into a fresh SE session.
#[derive(Args, Debug, Clone, Copy, Default)]
pub(crate) struct ResetArgs {
    /// Reset the board through a J-Link debug probe.
    #[arg(long, conflicts_with = "wait_replug")]
    jlink_reset: bool,

    /// Wait for PRG_USB to be unplugged and plugged back in.
    #[arg(long)]
    wait_replug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports and mark the ones that can reach the SE-UART.
    ListPorts,

    /// Check that the Secure Enclave answers ISP and read its maintenance flag.
    Probe,

    /// Put the Secure Enclave into maintenance mode.
    Maintenance {
        #[command(flatten)]
        reset: ResetArgs,
    },

    /// Build AppTocPackage.bin with app-gen-toc.
    GenToc {
        /// ATOC config, relative to the SE tools directory.
        #[arg(long, value_name = "PATH")]
        atoc_config: String,
    },

    /// Flash every enabled image of an ATOC config.
    Flash {
        /// ATOC config JSON (relative paths resolve against --setools-dir).
        config: PathBuf,

        /// Enter maintenance mode before writing.
        #[arg(long)]
        maintenance: bool,

        #[command(flatten)]
        reset: ResetArgs,
    },

    /// Write one binary to an MRAM address.
    Write {
        /// Binary file.
        file: PathBuf,

        /// Destination address (hex, e.g. 0x80000000).
        #[arg(short, long, value_parser = parse_hex_u32)]
        address: u32,
    },

    /// Capture console output for a fixed time.
    Monitor {
        /// Console baud rate.
        #[arg(long, default_value_t = CONSOLE_BAUD)]
        monitor_baud: u32,

        /// Capture duration in seconds.
        #[arg(long, default_value_t = 15)]
        duration: u64,

        /// Wait for the board to be power-cycled before capturing.
        #[arg(long)]
        wait_replug: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    // Support underscore separators like 0x8000_0000
    let s: String = s
        .chars()
        .filter(|c| *c != '_')
        .collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex address: {e}"))
}

impl Cli {
    /// Board from the flag, then the config file, then the default.
    pub(crate) fn board(&self, config: &Config) -> Result<Board> {
        if let Some(board) = self.board {
            return Ok(board);
        }
        match &config.flash.board {
            Some(name) => Board::from_name(name).map_err(|e| CliError::Usage(e.to_string()).into()),
            None => Ok(Board::default()),
        }
    }

    /// SE tools directory from the flag or the config file.
    pub(crate) fn setools_dir(&self, config: &Config) -> Option<PathBuf> {
        self.setools_dir
            .clone()
            .or_else(|| config.flash.setools_dir.clone())
    }

    /// Whether human-readable progress should be printed.
    pub(crate) fn chatty(&self) -> bool {
        !self.quiet && !self.json
    }
}

/// Select the SE-UART port.
pub(crate) fn get_port(cli: &Cli, config: &Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };
    select_serial_port(&options, config)
}

/// Select the SE-UART port and build its ISP settings for the current board.
pub(crate) fn isp_serial(cli: &Cli, config: &Config) -> Result<(SerialConfig, MramLayout)> {
    let layout = cli.board(config)?.layout();
    let port = get_port(cli, config)?;
    let baud = config.port.baud.unwrap_or(layout.isp_baud);
    if cli.chatty() {
        eprintln!(
            "{} Using {} @ {} baud",
            style("🔌").cyan(),
            style(&port).green(),
            baud
        );
    }
    let serial = SerialConfig::new(port, baud).with_adapters(config.adapter_filter());
    Ok((serial, layout))
}

/// J-Link reset helper configured for `layout`.
pub(crate) fn jlink_reset(config: &Config, layout: &MramLayout) -> JLinkReset {
    let mut reset = JLinkReset::new(layout.reset_core);
    if let Some(exe) = &config.jlink.exe {
        reset = reset.with_exe(exe);
    }
    if let Some(speed) = config.jlink.speed {
        reset = reset.with_speed(speed);
    }
    reset
}

fn init_logging(cli: &Cli) {
    // Setup logging based on verbosity
    let log_level = if cli.quiet || cli.json {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    debug!(
        "alifflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::ListPorts => commands::info::cmd_list_ports(cli),
        Commands::Probe => commands::info::cmd_probe(cli, &config),
        Commands::Maintenance { reset } => commands::maintenance::cmd_maintenance(cli, &config, *reset),
        Commands::GenToc { atoc_config } => commands::flash::cmd_gen_toc(cli, &config, atoc_config),
        Commands::Flash {
            config: atoc,
            maintenance,
            reset,
        } => commands::flash::cmd_flash(cli, &config, atoc, *maintenance, *reset),
        Commands::Write { file, address } => commands::flash::cmd_write(cli, &config, file, *address),
        Commands::Monitor {
            monitor_baud,
            duration,
            wait_replug,
        } => commands::monitor::cmd_monitor(cli, &config, *monitor_baud, *duration, *wait_replug),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

fn main() {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        // Disable all color output
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        std::process::exit(exit_code_for(&err));
    }
}
