//! Flash orchestration: maintenance entry, ATOC package, components, reset.

use std::time::{Duration, Instant};

use log::{info, warn};
use serde::Serialize;

use super::{
    link::IspLink,
    maintenance::{EntryStrategy, MaintenanceReport, enter_maintenance},
    writer::{ProgressFn, TransferReport, write_image},
};
use crate::{
    error::{FailureKind, Result},
    image::{ImageDescriptor, firmware_table::FirmwareTable},
    port::{Connector, OPEN_RETRIES, OPEN_RETRY_DELAY, SerialConfig},
    protocol::isp::CommandId,
    target::board::MramLayout,
};

/// Pause between leaving maintenance entry and the first image write.
pub const POST_MAINTENANCE_SETTLE: Duration = Duration::from_secs(1);

/// Outcome of [`flash_images`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlashReport {
    /// Every image was written.
    pub success: bool,
    /// Summary or explanation.
    pub message: String,
    /// Failure classification, `None` on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Name of the image whose write failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_image: Option<String>,
    /// Maintenance entry, when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintenance: Option<MaintenanceReport>,
    /// Per-image results, in write order.
    pub images: Vec<TransferReport>,
    /// Number of images in the plan.
    pub image_count: usize,
    /// Unpadded bytes across the plan.
    pub total_bytes: usize,
    /// Wall time of the image writes.
    pub total_seconds: f64,
    /// The final RESET_DEVICE frame went out.
    pub reset_sent: bool,
}

impl FlashReport {
    fn plan(images: &[ImageDescriptor]) -> Self {
        Self {
            success: false,
            message: String::new(),
            failure: None,
            failed_image: None,
            maintenance: None,
            images: Vec::with_capacity(images.len()),
            image_count: images.len(),
            total_bytes: images
                .iter()
                .map(ImageDescriptor::len)
                .sum(),
            total_seconds: 0.0,
            reset_sent: false,
        }
    }

    /// A plan that could not be built; nothing was sent to the device.
    pub fn config_failure(message: impl Into<String>) -> Self {
        let mut report = Self::plan(&[]);
        report.failure = Some(FailureKind::Config);
        report.message = message.into();
        report
    }

    fn fail(mut self, kind: FailureKind, message: impl Into<String>) -> Self {
        self.failure = Some(kind);
        self.message = message.into();
        warn!("{}", self.message);
        self
    }
}

/// Resolve `table` against `layout` and flash the result.
///
/// The table is resolved before any device I/O, so a missing binary or a
/// malformed entry never leaves a partially flashed board behind.
pub fn flash_images<C: Connector>(
    connector: &C,
    config: &SerialConfig,
    table: &FirmwareTable,
    layout: &MramLayout,
    maintenance: Option<EntryStrategy<'_>>,
    progress: &mut ProgressFn<'_>,
) -> Result<FlashReport> {
    let images = match table.resolve(layout) {
        Ok(images) => images,
        Err(e) => {
            warn!("{e}");
            return Ok(FlashReport::config_failure(e.to_string()));
        },
    };
    flash_resolved(connector, config, &images, maintenance, progress)
}

/// Flash an already-resolved image list in order.
pub fn flash_resolved<C: Connector>(
    connector: &C,
    config: &SerialConfig,
    images: &[ImageDescriptor],
    maintenance: Option<EntryStrategy<'_>>,
    progress: &mut ProgressFn<'_>,
) -> Result<FlashReport> {
    let mut report = FlashReport::plan(images);
    if images.is_empty() {
        return Ok(report.fail(FailureKind::Config, "No images found in config"));
    }

    let mut config = config.clone();
    if let Some(strategy) = maintenance {
        let entered = enter_maintenance(connector, &config, strategy)?;
        config = config.with_port_name(&entered.port);
        let failure = entered.failure;
        let ok = entered.success;
        report.maintenance = Some(entered);
        if !ok {
            return Ok(report.fail(
                failure.unwrap_or(FailureKind::Unresponsive),
                "Failed to enter maintenance mode",
            ));
        }
        connector.pause(POST_MAINTENANCE_SETTLE);
    }

    let started = Instant::now();
    for image in images {
        let written = write_image(connector, &config, image, progress)?;
        let failure = written.failure;
        let ok = written.success;
        report.images.push(written);
        if !ok {
            report.failed_image = Some(image.name().to_string());
            return Ok(report.fail(
                failure.unwrap_or(FailureKind::Rejected),
                format!("Failed writing {}", image.name()),
            ));
        }
    }
    report.total_seconds = (started
        .elapsed()
        .as_secs_f64()
        * 10.0)
        .round()
        / 10.0;

    report.reset_sent = final_reset(connector, &config);
    report.success = true;
    report.message = "All images written. Power cycle (unplug/replug PRG_USB) for A32 to boot.".to_string();
    info!(
        "Flashed {} images ({} bytes) in {:.1}s",
        report.image_count, report.total_bytes, report.total_seconds
    );
    Ok(report)
}

/// Leave ISP mode and fire RESET_DEVICE. Never affects the flash verdict.
fn final_reset<C: Connector>(connector: &C, config: &SerialConfig) -> bool {
    let attempt = || -> Result<bool> {
        let mut link = IspLink::open(connector, config, OPEN_RETRIES, OPEN_RETRY_DELAY)?;
        link.start_isp()?;
        link.command(CommandId::StopIsp)?;
        let sent = link.send_unacked(CommandId::Reset)?;
        link.close();
        Ok(sent)
    };
    match attempt() {
        Ok(sent) => sent,
        Err(e) => {
            warn!("Final reset skipped: {e}");
            false
        },
    }
}
