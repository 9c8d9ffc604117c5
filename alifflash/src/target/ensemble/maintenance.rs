//! Maintenance-mode entry.
//!
//! MRAM writes are only accepted while the SE is in maintenance mode, which
//! takes a flag plus a reboot:
//!
//! ```text
//! Unresponsive --START_ISP--> IspReady --SET_MAINT, STOP, RESET--> MaintenancePending
//!     --reopen, START_ISP, ENQUIRY[9] != 0--> MaintenanceConfirmed
//! ```
//!
//! An unconfirmed flag after the reboot is reported as success with
//! `maintenance_mode == false`: some SE firmware revisions never surface the
//! flag even though writes go through.

use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;

use super::link::IspLink;
use crate::{
    error::{FailureKind, Result},
    host::{REPLUG_DISAPPEAR_TIMEOUT, REPLUG_TOTAL_TIMEOUT, await_replug},
    port::{Connector, OPEN_RETRIES, OPEN_RETRY_DELAY, REOPEN_RETRIES, SerialConfig},
    protocol::isp::CommandId,
    tools::TargetReset,
};

/// Time the SE needs to reboot after RESET_DEVICE.
pub const REBOOT_SETTLE: Duration = Duration::from_secs(5);

/// Time the SE needs after a debug-probe reset before its port is usable.
pub const PROBE_RESET_SETTLE: Duration = Duration::from_secs(2);

/// Offset of the maintenance flag in the ENQUIRY response.
pub const MAINTENANCE_FLAG_OFFSET: usize = 9;

/// Device state as observed from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No ISP handshake yet.
    Unresponsive,
    /// START_ISP acknowledged.
    IspReady,
    /// Flag set and reset sent; not yet confirmed.
    MaintenancePending,
    /// ENQUIRY reported the maintenance flag.
    MaintenanceConfirmed,
}

/// How the SE is brought to a fresh boot before the handshake.
#[derive(Clone, Copy)]
pub enum EntryStrategy<'a> {
    /// The caller already made sure the SE just booted.
    AlreadyBooted,
    /// Reset through a debug probe.
    ProbeReset(&'a dyn TargetReset),
    /// Wait for the operator to unplug and replug PRG_USB.
    AwaitReplug,
}

impl std::fmt::Debug for EntryStrategy<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyBooted => f.write_str("AlreadyBooted"),
            Self::ProbeReset(_) => f.write_str("ProbeReset"),
            Self::AwaitReplug => f.write_str("AwaitReplug"),
        }
    }
}

/// Outcome of [`enter_maintenance`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// The SE went through the flag-and-reset cycle and answers ISP again.
    pub success: bool,
    /// ENQUIRY confirmed the maintenance flag.
    pub maintenance_mode: bool,
    /// Endpoint used, which may differ from the requested one after a replug.
    pub port: String,
    /// Last state reached.
    pub state: SessionState,
    /// Human-readable trail of what happened.
    pub steps: Vec<String>,
    /// Failure classification, `None` on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Summary or explanation.
    pub message: String,
}

/// Maintenance flag from an ENQUIRY payload, `None` when it is too short.
pub fn maintenance_flag(payload: &[u8]) -> Option<bool> {
    payload
        .get(MAINTENANCE_FLAG_OFFSET)
        .map(|&flag| flag != 0)
}

struct Trail {
    port: String,
    state: SessionState,
    steps: Vec<String>,
}

impl Trail {
    fn step(&mut self, step: impl Into<String>) {
        let step = step.into();
        debug!("maintenance: {step}");
        self.steps.push(step);
    }

    fn enter(&mut self, state: SessionState) {
        debug!("session {:?} -> {state:?}", self.state);
        self.state = state;
    }

    fn fail(self, kind: FailureKind, message: impl Into<String>) -> MaintenanceReport {
        let message = message.into();
        warn!("{message}");
        MaintenanceReport {
            success: false,
            maintenance_mode: false,
            port: self.port,
            state: self.state,
            steps: self.steps,
            failure: Some(kind),
            message,
        }
    }

    fn finish(self, message: impl Into<String>) -> MaintenanceReport {
        MaintenanceReport {
            success: true,
            maintenance_mode: self.state == SessionState::MaintenanceConfirmed,
            port: self.port,
            state: self.state,
            steps: self.steps,
            failure: None,
            message: message.into(),
        }
    }
}

/// Put the SE into maintenance mode.
///
/// Every expected failure is reported in the returned report and leaves the
/// port closed. `Err` is reserved for contract violations.
pub fn enter_maintenance<C: Connector>(
    connector: &C,
    config: &SerialConfig,
    strategy: EntryStrategy<'_>,
) -> Result<MaintenanceReport> {
    let mut trail = Trail {
        port: config.port_name.clone(),
        state: SessionState::Unresponsive,
        steps: Vec::new(),
    };

    match strategy {
        EntryStrategy::AlreadyBooted => {},
        EntryStrategy::ProbeReset(reset) => {
            trail.step("resetting board via debug probe...");
            let report = reset.reset_target();
            if !report.success {
                return Ok(trail.fail(FailureKind::Tool, report.message));
            }
            trail.step("probe reset: OK");
            connector.pause(PROBE_RESET_SETTLE);
            trail.step(format!("using port: {}", trail.port));
        },
        EntryStrategy::AwaitReplug => {
            trail.step("waiting for unplug/replug...");
            let replugged = await_replug(
                connector,
                &config.adapters,
                REPLUG_DISAPPEAR_TIMEOUT,
                REPLUG_TOTAL_TIMEOUT,
            );
            match replugged {
                Some(port) => {
                    trail.step(format!("port reappeared: {port}"));
                    trail.port = port;
                },
                None => {
                    return Ok(trail.fail(
                        FailureKind::PortUnavailable,
                        "Timed out waiting for board replug.",
                    ));
                },
            }
        },
    }

    let config = config
        .clone()
        .with_port_name(&trail.port);
    let mut link = match IspLink::open(connector, &config, OPEN_RETRIES, OPEN_RETRY_DELAY) {
        Ok(link) => link,
        Err(e) => {
            let message = format!("Failed to open {}: {e}", trail.port);
            return Ok(trail.fail(FailureKind::PortUnavailable, message));
        },
    };

    if !link.start_isp()?.ok {
        return Ok(trail.fail(
            FailureKind::Unresponsive,
            "SE did not respond. Try: unplug/replug PRG_USB, then run within 2-3s.",
        ));
    }
    trail.enter(SessionState::IspReady);
    trail.step("START_ISP: ACK");

    let set = link.command(CommandId::SetMaintenance)?;
    if !set.ok {
        let message = format!("SET_MAINTENANCE rejected: {}", set.status());
        return Ok(trail.fail(FailureKind::Rejected, message));
    }
    trail.step("SET_MAINTENANCE: ACK");

    let stop = link.command(CommandId::StopIsp)?;
    if !stop.ok {
        let message = format!("STOP_ISP before reset rejected: {}", stop.status());
        return Ok(trail.fail(FailureKind::Rejected, message));
    }
    trail.step("STOP_ISP: ACK");

    link.send_unacked(CommandId::Reset)?;
    link.close();
    trail.enter(SessionState::MaintenancePending);
    trail.step("RESET_DEVICE: sent");

    info!("Waiting {}s for SE reboot...", REBOOT_SETTLE.as_secs());
    connector.pause(REBOOT_SETTLE);
    trail.step(format!("waited {}s for reboot", REBOOT_SETTLE.as_secs()));

    if let Err(e) = link.reopen(REOPEN_RETRIES, OPEN_RETRY_DELAY) {
        debug!("reopen after reset failed: {e}");
        return Ok(trail.fail(
            FailureKind::PortUnavailable,
            "SE not responding after reset. Try power cycling.",
        ));
    }
    trail.step("reconnected");

    if !link.start_isp()?.ok {
        return Ok(trail.fail(
            FailureKind::Unresponsive,
            "SE not responding after reset. Try power cycling.",
        ));
    }
    trail.step("START_ISP (post-reset): ACK");

    let enquiry = link.command(CommandId::Enquiry)?;
    let flag = if enquiry.ok {
        maintenance_flag(enquiry.payload())
    } else {
        None
    };
    link.command_quiet(CommandId::StopIsp)?;
    link.close();

    if flag == Some(true) {
        trail.enter(SessionState::MaintenanceConfirmed);
        trail.step("ENQUIRY: maintenance=YES");
        info!("Maintenance mode confirmed on {}", trail.port);
        return Ok(trail.finish("Maintenance mode confirmed"));
    }

    let seen = match flag {
        Some(_) => "0",
        None => "unknown",
    };
    trail.step(format!("ENQUIRY: maintenance={seen} (proceeding anyway)"));
    warn!("Maintenance flag not confirmed");
    Ok(trail.finish("Maintenance flag not confirmed, but MRAM write may still work."))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::{
        port::{
            ISP_BAUD,
            mock::{MockConnector, Reply, ftdi_port},
        },
        tools::ToolReport,
    };

    fn config() -> SerialConfig {
        SerialConfig::new("/dev/cu.usbserial-SE", ISP_BAUD)
    }

    fn enquiry_reply(payload: Vec<u8>) -> MockConnector {
        MockConnector::new(move |w| match w.command() {
            Some(CommandId::Enquiry) => Reply::Data(payload.clone()),
            _ => Reply::Ack,
        })
    }

    struct FakeReset {
        ok: bool,
        calls: Cell<usize>,
    }

    impl TargetReset for FakeReset {
        fn reset_target(&self) -> ToolReport {
            self.calls
                .set(self.calls.get() + 1);
            ToolReport {
                success: self.ok,
                message: String::from(if self.ok {
                    "reset"
                } else {
                    "JLink could not connect to target"
                }),
                failure: (!self.ok).then_some(FailureKind::Tool),
                stdout: String::new(),
                stderr: String::new(),
            }
        }
    }

    #[test]
    fn test_maintenance_flag() {
        assert_eq!(maintenance_flag(&[0; 10]), Some(false));
        let mut set = vec![0; 16];
        set[9] = 1;
        assert_eq!(maintenance_flag(&set), Some(true));
        assert_eq!(maintenance_flag(&[1; 9]), None);
    }

    #[test]
    fn test_confirmed_flow() {
        let mut payload = vec![0u8; 20];
        payload[9] = 1;
        let connector = enquiry_reply(payload);

        let report = enter_maintenance(&connector, &config(), EntryStrategy::AlreadyBooted).unwrap();
        assert!(report.success);
        assert!(report.maintenance_mode);
        assert_eq!(report.state, SessionState::MaintenanceConfirmed);
        assert_eq!(report.failure, None);
        assert_eq!(
            connector.commands(),
            vec![
                CommandId::StartIsp,
                CommandId::SetMaintenance,
                CommandId::StopIsp,
                CommandId::Reset,
                CommandId::StartIsp,
                CommandId::Enquiry,
                CommandId::StopIsp,
            ]
        );
        assert_eq!(connector.sessions(), 2);
        assert!(
            connector
                .pauses()
                .contains(&REBOOT_SETTLE)
        );
        assert!(!connector.is_port_open());
    }

    #[test]
    fn test_unconfirmed_flag_still_succeeds() {
        let connector = enquiry_reply(vec![0u8; 10]);

        let report = enter_maintenance(&connector, &config(), EntryStrategy::AlreadyBooted).unwrap();
        assert!(report.success);
        assert!(!report.maintenance_mode);
        assert_eq!(report.state, SessionState::MaintenancePending);
        assert_eq!(
            report.message,
            "Maintenance flag not confirmed, but MRAM write may still work."
        );
        assert!(
            report
                .steps
                .iter()
                .any(|s| s == "ENQUIRY: maintenance=0 (proceeding anyway)")
        );
    }

    #[test]
    fn test_short_enquiry_is_unknown() {
        let connector = enquiry_reply(vec![1u8; 5]);

        let report = enter_maintenance(&connector, &config(), EntryStrategy::AlreadyBooted).unwrap();
        assert!(report.success);
        assert!(!report.maintenance_mode);
        assert!(
            report
                .steps
                .iter()
                .any(|s| s.contains("maintenance=unknown"))
        );
    }

    #[test]
    fn test_unresponsive_se() {
        let connector = MockConnector::silent();

        let report = enter_maintenance(&connector, &config(), EntryStrategy::AlreadyBooted).unwrap();
        assert!(!report.success);
        assert_eq!(report.failure, Some(FailureKind::Unresponsive));
        assert_eq!(report.state, SessionState::Unresponsive);
        assert!(report.message.starts_with("SE did not respond."));
        assert_eq!(connector.commands(), vec![CommandId::StartIsp; 3]);
        assert!(!connector.is_port_open());
    }

    #[test]
    fn test_rejected_maintenance_flag_is_terminal() {
        let connector = MockConnector::new(|w| match w.command() {
            Some(CommandId::SetMaintenance) => Reply::Code(0x80),
            _ => Reply::Ack,
        });

        let report = enter_maintenance(&connector, &config(), EntryStrategy::AlreadyBooted).unwrap();
        assert!(!report.success);
        assert_eq!(report.failure, Some(FailureKind::Rejected));
        assert_eq!(report.state, SessionState::IspReady);
        assert!(
            !connector
                .commands()
                .contains(&CommandId::Reset)
        );
        assert!(!connector.is_port_open());
    }

    #[test]
    fn test_rejected_stop_before_reset_is_terminal() {
        let connector = MockConnector::new(|w| match w.command() {
            Some(CommandId::StopIsp) => Reply::Code(0x80),
            Some(CommandId::Enquiry) => Reply::Data(vec![0u8; 10]),
            _ => Reply::Ack,
        });

        let report = enter_maintenance(&connector, &config(), EntryStrategy::AlreadyBooted).unwrap();
        assert!(!report.success);
        assert_eq!(report.failure, Some(FailureKind::Rejected));
        assert_eq!(report.state, SessionState::IspReady);
        assert!(report.message.starts_with("STOP_ISP before reset rejected"));
        assert_eq!(
            connector.commands(),
            vec![CommandId::StartIsp, CommandId::SetMaintenance, CommandId::StopIsp]
        );
        assert_eq!(connector.sessions(), 1);
        assert!(!connector.is_port_open());
    }

    #[test]
    fn test_port_gone_after_reset() {
        let connector = MockConnector::acking().unplug_after(1);

        let report = enter_maintenance(&connector, &config(), EntryStrategy::AlreadyBooted).unwrap();
        assert!(!report.success);
        assert_eq!(report.failure, Some(FailureKind::PortUnavailable));
        assert_eq!(report.state, SessionState::MaintenancePending);
        assert_eq!(
            report.message,
            "SE not responding after reset. Try power cycling."
        );
        assert_eq!(connector.open_attempts(), 1 + REOPEN_RETRIES as usize);
    }

    #[test]
    fn test_port_never_opens() {
        let connector = MockConnector::acking().fail_opens(usize::MAX);

        let report = enter_maintenance(&connector, &config(), EntryStrategy::AlreadyBooted).unwrap();
        assert!(!report.success);
        assert_eq!(report.failure, Some(FailureKind::PortUnavailable));
        assert!(connector.writes().is_empty());
    }

    #[test]
    fn test_probe_reset_runs_first() {
        let connector = enquiry_reply(vec![0u8; 10]);
        let reset = FakeReset {
            ok: true,
            calls: Cell::new(0),
        };

        let report =
            enter_maintenance(&connector, &config(), EntryStrategy::ProbeReset(&reset)).unwrap();
        assert!(report.success);
        assert_eq!(reset.calls.get(), 1);
        assert_eq!(connector.pauses()[0], PROBE_RESET_SETTLE);
        assert_eq!(report.steps[1], "probe reset: OK");
    }

    #[test]
    fn test_failed_probe_reset_touches_nothing() {
        let connector = MockConnector::acking();
        let reset = FakeReset {
            ok: false,
            calls: Cell::new(0),
        };

        let report =
            enter_maintenance(&connector, &config(), EntryStrategy::ProbeReset(&reset)).unwrap();
        assert!(!report.success);
        assert_eq!(report.failure, Some(FailureKind::Tool));
        assert_eq!(connector.open_attempts(), 0);
    }

    #[test]
    fn test_replug_switches_port() {
        let connector = enquiry_reply(vec![0u8; 10]).with_port_lists(vec![
            vec![],
            vec![ftdi_port("/dev/cu.usbserial-NEW")],
        ]);

        let report = enter_maintenance(&connector, &config(), EntryStrategy::AwaitReplug).unwrap();
        assert!(report.success);
        assert_eq!(report.port, "/dev/cu.usbserial-NEW");
    }
}
