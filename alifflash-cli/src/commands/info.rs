//! Port listing and SE probe command implementations.

use {
    crate::{Cli, commands::finish, config::Config, isp_serial},
    alifflash::{DetectedPort, NativeConnector, ProbeReport, auto_detect_port, discover_ports, probe},
    anyhow::Result,
    console::style,
};

fn port_json(port: &DetectedPort) -> serde_json::Value {
    serde_json::json!({
        "name": port.name,
        "device": port.device.name(),
        "isp_candidate": port.is_isp_candidate(),
        "vid": port.vid,
        "pid": port.pid,
        "manufacturer": port.manufacturer,
        "product": port.product,
        "serial": port.serial,
    })
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(cli: &Cli) -> Result<()> {
    let detected = discover_ports();

    if cli.json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(port_json)
            .collect();
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    eprintln!(
        "{}",
        style("Serial ports")
            .bold()
            .underlined()
    );

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &detected {
        let device_type = if port.is_isp_candidate() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };

        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };

        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{}{}{}",
            style("•").green(),
            style(&port.name).cyan(),
            device_type,
            vid_pid,
            product
        );
    }

    // Show auto-detection result
    if let Ok(auto_port) = auto_detect_port() {
        eprintln!(
            "\n{} SE-UART: {}",
            style("→")
                .green()
                .bold(),
            style(&auto_port.name)
                .cyan()
                .bold()
        );
    }

    Ok(())
}

fn print_probe(report: &ProbeReport) {
    if !report.success {
        return;
    }
    eprintln!("  START_ISP attempts: {}", report.isp_attempts);
    let mode = match report.maintenance_mode {
        Some(true) => style("maintenance").yellow().to_string(),
        Some(false) => "normal".to_string(),
        None => style("unknown").dim().to_string(),
    };
    eprintln!("  Mode: {mode}");
    if let Some(enquiry) = &report.enquiry {
        eprintln!("  ENQUIRY: {}", style(enquiry).dim());
    }
}

/// Probe command implementation.
pub(crate) fn cmd_probe(cli: &Cli, config: &Config) -> Result<()> {
    let (serial, _) = isp_serial(cli, config)?;
    let report = probe(&NativeConnector, &serial)?;
    if cli.chatty() {
        print_probe(&report);
    }
    finish(cli, &report, report.success, &report.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alifflash::DeviceKind;

    #[test]
    fn test_port_json_fields() {
        let port = DetectedPort {
            name: "/dev/cu.usbserial-A50285BI".to_string(),
            device: DeviceKind::Ftdi,
            vid: Some(0x0403),
            pid: Some(0x6010),
            manufacturer: Some("FTDI".to_string()),
            product: Some("Dual RS232-HS".to_string()),
            serial: None,
        };
        let json = port_json(&port);
        assert_eq!(json["name"], "/dev/cu.usbserial-A50285BI");
        assert_eq!(json["device"], port.device.name());
        assert_eq!(json["isp_candidate"], true);
        assert_eq!(json["vid"], 0x0403);
        assert!(json["serial"].is_null());
    }
}
