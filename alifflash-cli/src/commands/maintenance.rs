//! Maintenance-mode command implementation.

use alifflash::{EntryStrategy, JLinkReset, MaintenanceReport, NativeConnector, enter_maintenance};
use anyhow::Result;
use console::style;

use crate::commands::finish;
use crate::config::Config;
use crate::{Cli, ResetArgs, isp_serial};

/// Map the reset flags to an entry strategy. `jlink` must outlive the strategy.
pub(crate) fn entry_strategy(reset: ResetArgs, jlink: &JLinkReset) -> EntryStrategy<'_> {
    if reset.jlink_reset {
        EntryStrategy::ProbeReset(jlink)
    } else if reset.wait_replug {
        EntryStrategy::AwaitReplug
    } else {
        EntryStrategy::AlreadyBooted
    }
}

/// Print the step trail of a maintenance entry.
pub(crate) fn print_steps(report: &MaintenanceReport) {
    for step in &report.steps {
        eprintln!("  {} {}", style("•").dim(), step);
    }
}

/// Maintenance command implementation.
pub(crate) fn cmd_maintenance(cli: &Cli, config: &Config, reset: ResetArgs) -> Result<()> {
    let (serial, layout) = isp_serial(cli, config)?;
    let jlink = crate::jlink_reset(config, &layout);

    if cli.chatty() && reset.wait_replug {
        eprintln!(
            "{} Unplug PRG_USB, then plug it back in...",
            style("⏳").yellow()
        );
    }

    let report = enter_maintenance(&NativeConnector, &serial, entry_strategy(reset, &jlink))?;
    if cli.chatty() {
        print_steps(&report);
    }
    finish(cli, &report, report.success, &report.message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_strategy_mapping() {
        let jlink = JLinkReset::default();
        let none = ResetArgs::default();
        assert!(matches!(entry_strategy(none, &jlink), EntryStrategy::AlreadyBooted));

        let probe = ResetArgs {
            jlink_reset: true,
            wait_replug: false,
        };
        assert!(matches!(entry_strategy(probe, &jlink), EntryStrategy::ProbeReset(_)));

        let replug = ResetArgs {
            jlink_reset: false,
            wait_replug: true,
        };
        assert!(matches!(entry_strategy(replug, &jlink), EntryStrategy::AwaitReplug));
    }
}
