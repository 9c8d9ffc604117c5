//! Non-destructive SE liveness check.

use serde::Serialize;

use super::{link::IspLink, maintenance::maintenance_flag};
use crate::{
    error::{FailureKind, Result},
    port::{Connector, OPEN_RETRIES, OPEN_RETRY_DELAY, SerialConfig},
    protocol::isp::CommandId,
};

/// Outcome of [`probe`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    /// The SE answered START_ISP.
    pub success: bool,
    /// Endpoint probed.
    pub port: String,
    /// START_ISP attempts used.
    pub isp_attempts: u32,
    /// Maintenance flag from ENQUIRY, when the response was long enough.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintenance_mode: Option<bool>,
    /// Raw ENQUIRY payload as lowercase hex.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enquiry: Option<String>,
    /// Failure classification, `None` on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Summary or explanation.
    pub message: String,
}

fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Check whether the SE on `config.port_name` answers ISP, and read its
/// maintenance flag. Leaves ISP mode and closes the port afterwards.
pub fn probe<C: Connector>(connector: &C, config: &SerialConfig) -> Result<ProbeReport> {
    let mut report = ProbeReport {
        success: false,
        port: config.port_name.clone(),
        isp_attempts: 0,
        maintenance_mode: None,
        enquiry: None,
        failure: None,
        message: String::new(),
    };

    let mut link = match IspLink::open(connector, config, OPEN_RETRIES, OPEN_RETRY_DELAY) {
        Ok(link) => link,
        Err(e) => {
            report.failure = Some(FailureKind::PortUnavailable);
            report.message = format!("Failed to open {}: {e}", config.port_name);
            return Ok(report);
        },
    };

    let start = link.start_isp()?;
    report.isp_attempts = start.attempts;
    if !start.ok {
        report.failure = Some(FailureKind::Unresponsive);
        report.message = "SE did not respond to START_ISP. Board may need a power cycle.".to_string();
        return Ok(report);
    }

    let enquiry = link.command(CommandId::Enquiry)?;
    if enquiry.ok {
        report.maintenance_mode = maintenance_flag(enquiry.payload());
        if report
            .maintenance_mode
            .is_some()
        {
            report.enquiry = Some(to_hex(enquiry.payload()));
        }
    }
    link.command_quiet(CommandId::StopIsp)?;
    link.close();

    report.success = true;
    report.message = format!("SE responsive on {}", config.port_name);
    Ok(report)
}
