//! External tools the flashing flow drives as subprocesses.
//!
//! - [`JLinkReset`]: reboots the board through a SEGGER J-Link so the SE
//!   comes back up ISP-responsive without a manual power cycle.
//! - [`generate_toc`]: runs the SE tools' `app-gen-toc` to produce the
//!   ATOC package that gets flashed ahead of the images.

use std::{
    io::{self, Read, Write},
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use serde::Serialize;

use crate::error::FailureKind;

/// Default JLinkExe location.
pub const DEFAULT_JLINK_EXE: &str = "/usr/local/bin/JLinkExe";

/// Default SWD speed in kHz.
pub const DEFAULT_JLINK_SPEED: u32 = 4000;

/// JLinkExe is given this long to reset the target.
const JLINK_TIMEOUT: Duration = Duration::from_secs(15);

/// app-gen-toc is given this long to build the package.
const GEN_TOC_TIMEOUT: Duration = Duration::from_secs(60);

/// Reported tool output is cut to its last characters.
const OUTPUT_TAIL: usize = 500;

const WAIT_POLL: Duration = Duration::from_millis(50);

/// Reset, give the SE time to start booting, leave.
const RESET_SCRIPT: &str = "r\nsleep 100\nexit\n";

/// Output markers meaning JLinkExe never reached the target.
///
/// "Failed to halt CPU" is not among them: the SE owns the A32 power domain,
/// and the reset still happens.
const JLINK_CONNECT_FAILURES: [&str; 2] = ["Could not find core", "Cannot connect"];

/// Outcome of an external tool run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolReport {
    /// The tool did what was asked.
    pub success: bool,
    /// Human-readable summary.
    pub message: String,
    /// Failure classification, `None` on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

impl ToolReport {
    fn ok(message: impl Into<String>, stdout: String, stderr: String) -> Self {
        Self {
            success: true,
            message: message.into(),
            failure: None,
            stdout,
            stderr,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            failure: Some(FailureKind::Tool),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    fn with_output(mut self, stdout: String, stderr: String) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }
}

/// Out-of-band way to reboot the target.
pub trait TargetReset {
    /// Reset the target. Never panics, never returns `Err`.
    fn reset_target(&self) -> ToolReport;
}

/// Reset through SEGGER JLinkExe attached to the application core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JLinkReset {
    /// Path to JLinkExe.
    pub exe: PathBuf,
    /// J-Link device name of the core to attach to.
    pub device: String,
    /// Debug interface.
    pub interface: String,
    /// Interface speed in kHz.
    pub speed: u32,
}

impl Default for JLinkReset {
    fn default() -> Self {
        Self {
            exe: PathBuf::from(DEFAULT_JLINK_EXE),
            device: "Cortex-A32".to_string(),
            interface: "SWD".to_string(),
            speed: DEFAULT_JLINK_SPEED,
        }
    }
}

impl JLinkReset {
    /// Reset `device` using the default executable and speed.
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ..Self::default()
        }
    }

    /// Use a different JLinkExe.
    #[must_use]
    pub fn with_exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.exe = exe.into();
        self
    }

    /// Use a different interface speed.
    #[must_use]
    pub fn with_speed(mut self, speed: u32) -> Self {
        self.speed = speed;
        self
    }

    fn run(&self) -> io::Result<Option<ToolOutput>> {
        let mut script = tempfile::Builder::new()
            .prefix("alifflash-reset")
            .suffix(".jlink")
            .tempfile()?;
        script.write_all(RESET_SCRIPT.as_bytes())?;
        script.flush()?;

        let mut command = Command::new(&self.exe);
        command
            .arg("-device")
            .arg(&self.device)
            .arg("-if")
            .arg(&self.interface)
            .arg("-speed")
            .arg(self.speed.to_string())
            .args(["-autoconnect", "1", "-NoGui", "1", "-CommanderScript"])
            .arg(script.path());
        run_with_timeout(&mut command, JLINK_TIMEOUT)
    }
}

impl TargetReset for JLinkReset {
    fn reset_target(&self) -> ToolReport {
        if !self.exe.exists() {
            return ToolReport::failed(format!("JLinkExe not found at {}", self.exe.display()));
        }

        info!("Resetting {} via J-Link ({} kHz)", self.device, self.speed);
        let output = match self.run() {
            Ok(Some(output)) => output,
            Ok(None) => return ToolReport::failed("JLink command timed out"),
            Err(e) => return ToolReport::failed(format!("Failed to run JLinkExe: {e}")),
        };
        debug!("JLinkExe exited with {}", output.status);

        let stdout = tail(&output.stdout, OUTPUT_TAIL);
        let stderr = tail(&output.stderr, OUTPUT_TAIL);
        let unreachable = JLINK_CONNECT_FAILURES
            .iter()
            .any(|marker| output.stdout.contains(marker) || output.stderr.contains(marker));
        if unreachable {
            warn!("J-Link could not connect to {}", self.device);
            return ToolReport::failed("JLink could not connect to target").with_output(stdout, stderr);
        }
        ToolReport::ok("Board reset via JLink", stdout, stderr)
    }
}

/// Run `app-gen-toc -f <config_rel>` inside the SE tools directory.
pub fn generate_toc(setools_dir: &Path, config_rel: &str) -> ToolReport {
    let tool = setools_dir.join("app-gen-toc");
    if !tool.exists() {
        return ToolReport::failed(format!("app-gen-toc not found at {}", tool.display()));
    }

    info!("Generating ATOC package from {config_rel}");
    let mut command = Command::new("./app-gen-toc");
    command
        .arg("-f")
        .arg(config_rel)
        .current_dir(setools_dir);

    match run_with_timeout(&mut command, GEN_TOC_TIMEOUT) {
        Ok(Some(output)) if output.status.success() => {
            ToolReport::ok("ATOC package generated", output.stdout, output.stderr)
        },
        Ok(Some(output)) => {
            let message = format!("app-gen-toc failed:\n{}", output.stderr);
            ToolReport::failed(message).with_output(output.stdout, output.stderr)
        },
        Ok(None) => ToolReport::failed(format!(
            "app-gen-toc timed out after {}s",
            GEN_TOC_TIMEOUT.as_secs()
        )),
        Err(e) => ToolReport::failed(format!("Failed to run app-gen-toc: {e}")),
    }
}

/// Captured result of a finished child process.
#[derive(Debug)]
pub struct ToolOutput {
    /// Exit status.
    pub status: ExitStatus,
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

fn collect<R: Read + Send + 'static>(stream: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buf);
        }
        buf
    })
}

/// Run `command` to completion, killing it after `timeout`.
///
/// Returns `Ok(None)` when the deadline passed. Output is read on helper
/// threads so a chatty child cannot block on a full pipe.
pub fn run_with_timeout(command: &mut Command, timeout: Duration) -> io::Result<Option<ToolOutput>> {
    debug!("Running {command:?}");
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = collect(child.stdout.take());
    let stderr = collect(child.stderr.take());

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            warn!("{command:?} still running after {}s, killing", timeout.as_secs_f64());
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(WAIT_POLL);
    };

    let stdout = stdout
        .join()
        .unwrap_or_default();
    let stderr = stderr
        .join()
        .unwrap_or_default();
    Ok(Some(ToolOutput {
        status,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    }))
}

/// Last `max` characters of `text`.
fn tail(text: &str, max: usize) -> String {
    let count = text.chars().count();
    text.chars()
        .skip(count.saturating_sub(max))
        .collect()
}
