//! Segmented MRAM image writer.
//!
//! Images are written one BURN_MRAM window (segment) at a time. A chunk that
//! gets no answer at all is treated as a USB drop: the link is reopened and
//! the *same* segment is written again from chunk 0. A chunk answered with
//! an unexpected code is a rejection and ends the write.

use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Serialize, Serializer};

use super::link::{IspLink, RESPONSE_TIMEOUT};
use crate::{
    error::{FailureKind, Result},
    image::{ImageDescriptor, Segment, segments},
    port::{Connector, OPEN_RETRIES, OPEN_RETRY_DELAY, REOPEN_RETRIES, SerialConfig},
    protocol::isp::{CommandId, IspFrame},
};

/// Settle time between a chunk write and its response read.
pub const CHUNK_SETTLE: Duration = Duration::from_millis(20);

/// Response timeout per chunk.
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(1);

/// Wait after a USB drop before reopening.
pub const DROP_RECOVERY: Duration = Duration::from_secs(3);

/// Reconnect attempts after one drop.
pub const RECONNECT_ATTEMPTS: u32 = 2;

/// Times a single segment may be restarted after drops.
pub const MAX_SEGMENT_RETRIES: u32 = 3;

const PROGRESS_EVERY: usize = 100;

/// Progress callback: image name, bytes done, bytes total.
pub type ProgressFn<'p> = dyn FnMut(&str, usize, usize) + 'p;

fn serialize_hex<S: Serializer>(address: &u32, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("0x{address:08X}"))
}

/// Outcome of writing one image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferReport {
    /// Every segment was written and acknowledged.
    pub success: bool,
    /// Image name.
    pub file: String,
    /// Destination address.
    #[serde(serialize_with = "serialize_hex")]
    pub address: u32,
    /// Size before padding.
    pub original_bytes: usize,
    /// Size after padding.
    pub padded_bytes: usize,
    /// Number of BURN_MRAM windows.
    pub segments: usize,
    /// Chunks acknowledged in completed segments.
    pub chunks: usize,
    /// Bytes acknowledged in completed segments.
    pub bytes_written: usize,
    /// Reconnects after USB drops.
    pub reconnects: u32,
    /// Wall time in seconds.
    pub elapsed_seconds: f64,
    /// Average throughput.
    pub bytes_per_second: u64,
    /// Failure classification, `None` on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Empty on success.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl TransferReport {
    fn begin(image: &ImageDescriptor) -> Self {
        Self {
            success: false,
            file: image
                .name()
                .to_string(),
            address: image.address(),
            original_bytes: image.len(),
            padded_bytes: image.padded_len(),
            segments: image
                .padded_len()
                .div_ceil(crate::image::MAX_SEGMENT_SIZE),
            chunks: 0,
            bytes_written: 0,
            reconnects: 0,
            elapsed_seconds: 0.0,
            bytes_per_second: 0,
            failure: None,
            message: String::new(),
        }
    }

    fn fail(mut self, kind: FailureKind, message: impl Into<String>, started: Instant) -> Self {
        self.message = message.into();
        warn!("[{}] {}", self.file, self.message);
        self.failure = Some(kind);
        self.stamp(started);
        self
    }

    fn succeed(mut self, started: Instant) -> Self {
        self.success = true;
        self.stamp(started);
        self
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn stamp(&mut self, started: Instant) {
        let elapsed = started
            .elapsed()
            .as_secs_f64();
        self.elapsed_seconds = (elapsed * 10.0).round() / 10.0;
        self.bytes_per_second = if elapsed > 0.0 {
            (self.bytes_written as f64 / elapsed).round() as u64
        } else {
            0
        };
    }
}

enum SegmentOutcome {
    Written(usize),
    Dropped,
    Rejected(String),
}

fn write_segment<C: Connector>(
    link: &mut IspLink<'_, C>,
    segment: Segment<'_>,
    name: &str,
    label: &str,
    total_bytes: usize,
    progress: &mut ProgressFn<'_>,
) -> Result<SegmentOutcome> {
    info!("[{name}]{label} {} bytes -> 0x{:08X}", segment.size(), segment.address);

    let burn = link.send(
        &IspFrame::burn_mram(segment.address, segment.size()),
        RESPONSE_TIMEOUT,
        false,
    )?;
    if !burn.ok {
        return Ok(SegmentOutcome::Rejected(format!(
            "BURN_MRAM rejected at 0x{:08X}",
            segment.address
        )));
    }

    let total = segment.chunk_count();
    let started = Instant::now();
    let mut offset = 0;
    for (index, chunk) in segment
        .chunks()
        .enumerate()
    {
        let exchange = link.exchange(
            &IspFrame::download_data(chunk.sequence, chunk.data),
            CHUNK_SETTLE,
            CHUNK_TIMEOUT,
        )?;
        if !exchange.ok {
            let status = exchange.status();
            warn!("[{name}]{label} chunk {}/{total}: {status}", chunk.sequence);
            return Ok(match exchange.response {
                None => SegmentOutcome::Dropped,
                Some(_) => {
                    SegmentOutcome::Rejected(format!("Chunk {}/{total} failed: {status}", chunk.sequence))
                },
            });
        }

        offset += chunk.data.len();
        progress(name, segment.offset + offset, total_bytes);

        let done = index + 1;
        if done % PROGRESS_EVERY == 0 || done == total {
            info!(
                "[{name}]{label} {done}/{total} ({}%) [{:.1}s]",
                100 * offset / segment.data.len(),
                started
                    .elapsed()
                    .as_secs_f64()
            );
        }
    }

    // DONE is not always acknowledged; the segment still stands
    let done = link.command(CommandId::DownloadDone)?;
    if !done.ok {
        debug!("[{name}]{label} DOWNLOAD_DONE: {}", done.status());
    }
    Ok(SegmentOutcome::Written(total))
}

/// Close, wait for the SE to recover, reopen and redo the ISP handshake.
fn reconnect<C: Connector>(link: &mut IspLink<'_, C>) -> Result<bool> {
    for attempt in 1..=RECONNECT_ATTEMPTS {
        link.close();
        link.pause(DROP_RECOVERY);
        if let Err(e) = link.reopen(REOPEN_RETRIES, OPEN_RETRY_DELAY) {
            warn!("Reconnect {attempt}/{RECONNECT_ATTEMPTS} failed: {e}");
            continue;
        }
        if link.start_isp()?.ok {
            return Ok(true);
        }
        warn!("Reconnect {attempt}/{RECONNECT_ATTEMPTS}: SE not answering START_ISP");
    }
    link.close();
    Ok(false)
}

/// Write `image` over a link that is already in ISP mode.
///
/// The link may be reopened along the way. It is left open unless a
/// reconnect failed.
pub fn write_image_on<C: Connector>(
    link: &mut IspLink<'_, C>,
    image: &ImageDescriptor,
    progress: &mut ProgressFn<'_>,
) -> Result<TransferReport> {
    let started = Instant::now();
    let mut report = TransferReport::begin(image);
    let name = image.name();
    info!(
        "[{name}] {} bytes (padded to {}) -> 0x{:08X}",
        report.original_bytes, report.padded_bytes, report.address
    );

    let padded = image.padded();
    let parts: Vec<Segment<'_>> = segments(&padded, image.address()).collect();
    let mut index = 0;
    let mut retries = 0;

    while let Some(&segment) = parts.get(index) {
        let label = if parts.len() > 1 {
            format!(" seg {}/{}", segment.index + 1, parts.len())
        } else {
            String::new()
        };

        match write_segment(link, segment, name, &label, padded.len(), progress)? {
            SegmentOutcome::Written(chunks) => {
                report.chunks += chunks;
                report.bytes_written += segment.data.len();
                index += 1;
                retries = 0;
            },
            SegmentOutcome::Rejected(message) => {
                return Ok(report.fail(FailureKind::Rejected, message, started));
            },
            SegmentOutcome::Dropped => {
                retries += 1;
                if retries > MAX_SEGMENT_RETRIES {
                    let message = format!(
                        "USB dropped {retries} times on segment {}/{}",
                        index + 1,
                        parts.len()
                    );
                    return Ok(report.fail(FailureKind::Disconnected, message, started));
                }
                warn!("USB drop detected, reconnecting...");
                if !reconnect(link)? {
                    return Ok(report.fail(
                        FailureKind::Disconnected,
                        "Failed to reconnect after USB drop",
                        started,
                    ));
                }
                report.reconnects += 1;
                info!("Reconnected, retrying segment {}", index + 1);
            },
        }
    }

    debug!("[{name}] {} chunks in {} segments", report.chunks, parts.len());
    Ok(report.succeed(started))
}

/// Open `config.port_name`, enter ISP mode, write `image`, then leave ISP
/// mode and close, whatever the outcome.
pub fn write_image<C: Connector>(
    connector: &C,
    config: &SerialConfig,
    image: &ImageDescriptor,
    progress: &mut ProgressFn<'_>,
) -> Result<TransferReport> {
    let started = Instant::now();
    let mut link = match IspLink::open(connector, config, OPEN_RETRIES, OPEN_RETRY_DELAY) {
        Ok(link) => link,
        Err(e) => {
            let message = format!("Failed to open {}: {e}", config.port_name);
            return Ok(TransferReport::begin(image).fail(FailureKind::PortUnavailable, message, started));
        },
    };

    if !link.start_isp()?.ok {
        return Ok(TransferReport::begin(image).fail(
            FailureKind::Unresponsive,
            "START_ISP failed",
            started,
        ));
    }

    let report = write_image_on(&mut link, image, progress);
    if link.is_open() {
        if let Err(e) = link.command_quiet(CommandId::StopIsp) {
            debug!("STOP_ISP after write failed: {e}");
        }
    }
    link.close();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        image::MAX_SEGMENT_SIZE,
        port::{
            ISP_BAUD,
            mock::{MockConnector, Reply, Written},
        },
    };

    fn config() -> SerialConfig {
        SerialConfig::new("/dev/cu.usbserial-SE", ISP_BAUD)
    }

    fn image(len: usize, address: u32) -> ImageDescriptor {
        let data = (0..len)
            .map(|i| (i % 253) as u8)
            .collect();
        ImageDescriptor::new("xipImage", address, data).unwrap()
    }

    fn burn_windows(writes: &[Written]) -> Vec<(u32, u32)> {
        writes
            .iter()
            .filter(|w| w.command() == Some(CommandId::BurnMram))
            .map(|w| {
                (
                    u32::from_le_bytes(w.payload[0..4].try_into().unwrap()),
                    u32::from_le_bytes(w.payload[4..8].try_into().unwrap()),
                )
            })
            .collect()
    }

    fn no_progress() -> impl FnMut(&str, usize, usize) {
        |_, _, _| {}
    }

    fn init_logs() {
        let _ = env_logger::builder()
            .is_test(true)
            .try_init();
    }

    #[test]
    fn test_300k_image_uses_two_burn_windows() {
        let connector = MockConnector::acking();
        let image = image(300 * 1024, 0x8030_0000);

        let report = write_image(&connector, &config(), &image, &mut no_progress()).unwrap();
        assert!(report.success, "{report:?}");
        assert_eq!(report.segments, 2);
        assert_eq!(report.chunks, 1093 + 188);
        assert_eq!(report.bytes_written, 300 * 1024);
        assert_eq!(report.reconnects, 0);

        let writes = connector.writes();
        assert_eq!(
            burn_windows(&writes),
            vec![(0x8030_0000, 262_144), (0x8034_0000, 45_056)]
        );
        let done = writes
            .iter()
            .filter(|w| w.command() == Some(CommandId::DownloadDone))
            .count();
        assert_eq!(done, 2);
        assert_eq!(
            connector
                .commands()
                .last(),
            Some(&CommandId::StopIsp)
        );
        assert!(!connector.is_port_open());
    }

    #[test]
    fn test_download_done_without_ack_is_tolerated() {
        init_logs();
        let connector = MockConnector::new(|w| match w.command() {
            Some(CommandId::DownloadDone) => Reply::Code(0x80),
            _ => Reply::Ack,
        });
        let image = image(300 * 1024, 0x8030_0000);

        let report = write_image(&connector, &config(), &image, &mut no_progress()).unwrap();
        assert!(report.success, "{report:?}");
        assert_eq!(report.failure, None);
        assert_eq!(report.reconnects, 0);
        assert_eq!(report.bytes_written, 300 * 1024);
        assert_eq!(burn_windows(&connector.writes()).len(), 2);
    }

    #[test]
    fn test_usb_drop_resends_segment_from_chunk_zero() {
        init_logs();
        let mut burns = 0;
        let mut dropped = false;
        let connector = MockConnector::new(move |w| {
            if w.command() == Some(CommandId::BurnMram) {
                burns += 1;
            }
            if burns == 2 && w.sequence() == Some(5) && !dropped {
                dropped = true;
                return Reply::Silent;
            }
            Reply::Ack
        });
        let image = image(300 * 1024, 0x8030_0000);

        let report = write_image(&connector, &config(), &image, &mut no_progress()).unwrap();
        assert!(report.success, "{report:?}");
        assert_eq!(report.reconnects, 1);
        assert_eq!(report.chunks, 1093 + 188);

        let writes = connector.writes();
        assert_eq!(
            burn_windows(&writes),
            vec![
                (0x8030_0000, 262_144),
                (0x8034_0000, 45_056),
                (0x8034_0000, 45_056)
            ]
        );

        let second: Vec<&Written> = writes
            .iter()
            .filter(|w| w.session == 2)
            .collect();
        assert_eq!(second[0].command(), Some(CommandId::StartIsp));
        assert_eq!(second[1].command(), Some(CommandId::BurnMram));
        let resent: Vec<u16> = second
            .iter()
            .filter_map(|w| w.sequence())
            .collect();
        assert_eq!(resent.len(), 188);
        assert!(
            resent
                .iter()
                .enumerate()
                .all(|(i, &seq)| usize::from(seq) == i)
        );
        assert!(connector.pauses().contains(&DROP_RECOVERY));
    }

    #[test]
    fn test_rejected_chunk_is_not_retried() {
        let connector = MockConnector::new(|w| match w.sequence() {
            Some(3) => Reply::Code(0x81),
            _ => Reply::Ack,
        });
        let image = image(4096, 0x8000_0000);

        let report = write_image(&connector, &config(), &image, &mut no_progress()).unwrap();
        assert!(!report.success);
        assert_eq!(report.failure, Some(FailureKind::Rejected));
        assert_eq!(report.message, "Chunk 3/18 failed: 0x81");
        assert_eq!(connector.sessions(), 1);
        assert_eq!(
            connector
                .commands()
                .last(),
            Some(&CommandId::StopIsp)
        );
        assert!(!connector.is_port_open());
    }

    #[test]
    fn test_rejected_burn_window() {
        let connector = MockConnector::new(|w| match w.command() {
            Some(CommandId::BurnMram) => Reply::Code(0x82),
            _ => Reply::Ack,
        });
        let image = image(64, 0x8030_0000);

        let report = write_image(&connector, &config(), &image, &mut no_progress()).unwrap();
        assert!(!report.success);
        assert_eq!(report.failure, Some(FailureKind::Rejected));
        assert_eq!(report.message, "BURN_MRAM rejected at 0x80300000");
        assert!(
            !connector
                .commands()
                .contains(&CommandId::DownloadData)
        );
    }

    #[test]
    fn test_reconnect_failure_gives_up() {
        init_logs();
        let connector = MockConnector::new(|w| match w.sequence() {
            Some(0) => Reply::Silent,
            _ => Reply::Ack,
        })
        .unplug_after(1);
        let image = image(1024, 0x8000_0000);

        let report = write_image(&connector, &config(), &image, &mut no_progress()).unwrap();
        assert!(!report.success);
        assert_eq!(report.failure, Some(FailureKind::Disconnected));
        assert_eq!(report.message, "Failed to reconnect after USB drop");
        assert_eq!(
            connector.open_attempts(),
            1 + (RECONNECT_ATTEMPTS * REOPEN_RETRIES) as usize
        );
        assert!(!connector.is_port_open());
    }

    #[test]
    fn test_persistent_drops_are_bounded() {
        let connector = MockConnector::new(|w| match w.sequence() {
            Some(0) => Reply::Silent,
            _ => Reply::Ack,
        });
        let image = image(1024, 0x8000_0000);

        let report = write_image(&connector, &config(), &image, &mut no_progress()).unwrap();
        assert!(!report.success);
        assert_eq!(report.failure, Some(FailureKind::Disconnected));
        assert_eq!(report.reconnects, MAX_SEGMENT_RETRIES);
        assert_eq!(connector.sessions(), 1 + MAX_SEGMENT_RETRIES as usize);
    }

    #[test]
    fn test_unresponsive_se() {
        let connector = MockConnector::silent();
        let image = image(16, 0x8000_0000);

        let report = write_image(&connector, &config(), &image, &mut no_progress()).unwrap();
        assert!(!report.success);
        assert_eq!(report.failure, Some(FailureKind::Unresponsive));
        assert_eq!(report.message, "START_ISP failed");
        assert!(!connector.is_port_open());
    }

    #[test]
    fn test_padding_and_progress() {
        let connector = MockConnector::acking();
        let image = image(100, 0x8000_0000);
        let mut seen = Vec::new();

        let report = write_image(&connector, &config(), &image, &mut |name: &str, done, total| {
            seen.push((name.to_string(), done, total));
        })
        .unwrap();
        assert!(report.success);
        assert_eq!(report.padded_bytes, 112);
        assert_eq!(seen, vec![("xipImage".to_string(), 112, 112)]);

        let chunk = connector
            .writes()
            .into_iter()
            .find(|w| w.command() == Some(CommandId::DownloadData))
            .unwrap();
        assert_eq!(chunk.payload.len(), 2 + 112);
        assert!(chunk.payload[2 + 100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_report_serializes_hex_address() {
        let connector = MockConnector::acking();
        let image = image(MAX_SEGMENT_SIZE, 0x8002_0000);

        let report = write_image(&connector, &config(), &image, &mut no_progress()).unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["address"], "0x80020000");
        assert_eq!(json["segments"], 1);
        assert!(json.get("failure").is_none());
    }
}
