//! Command exchange over one SE-UART session.
//!
//! An [`IspLink`] owns at most one open port at a time and performs strict
//! request-then-response exchanges on it. It never decides whether a failed
//! exchange is fatal: callers get `ok`/not-ok plus whatever was decoded.

use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::{
    error::{Error, Result},
    port::{Connector, Port, SerialConfig, drain_stale, open_with_retry},
    protocol::isp::{CommandId, IspFrame, Response, decode},
};

/// Settle time between writing a command and reading its response.
pub const COMMAND_SETTLE: Duration = Duration::from_millis(50);

/// Response timeout for ordinary commands.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// START_ISP attempts before the SE is declared unresponsive.
pub const START_ISP_ATTEMPTS: u32 = 3;

/// Pause before each START_ISP attempt, letting a booting SE finish talking.
const START_ISP_PRE_PAUSE: Duration = Duration::from_millis(100);

/// Pause between failed START_ISP attempts.
const START_ISP_RETRY_PAUSE: Duration = Duration::from_millis(300);


/// Outcome of one command exchange.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Exchange {
    /// The device answered with ACK or DATA_RESP.
    pub ok: bool,
    /// Whatever frame came back, if any.
    pub response: Option<Response>,
}

impl Exchange {
    /// Payload of the response, empty when nothing was decoded.
    pub fn payload(&self) -> &[u8] {
        self.response
            .as_ref()
            .map_or(&[], |r| r.payload.as_slice())
    }

    /// Status in log form: "ACK", "DATA (n bytes)", "0xNN" or "no response".
    pub fn status(&self) -> String {
        self.response
            .as_ref()
            .map_or_else(|| "no response".to_string(), Response::status)
    }
}

/// Result of the START_ISP handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IspStart {
    /// The SE acknowledged.
    pub ok: bool,
    /// Attempts used, counting from 1.
    pub attempts: u32,
}

/// A reconnectable ISP session bound to one endpoint.
pub struct IspLink<'c, C: Connector> {
    connector: &'c C,
    config: SerialConfig,
    port: Option<C::Port>,
}

impl<'c, C: Connector> IspLink<'c, C> {
    /// Open `config.port_name` with `retries` attempts spaced by `retry_delay`.
    pub fn open(
        connector: &'c C,
        config: &SerialConfig,
        retries: u32,
        retry_delay: Duration,
    ) -> Result<Self> {
        let port = open_with_retry(connector, config, retries, retry_delay)?;
        debug!("Opened {} at {} baud", config.port_name, config.baud_rate);
        Ok(Self {
            connector,
            config: config.clone(),
            port: Some(port),
        })
    }

    /// Close the current session (if any) and open a fresh one.
    pub fn reopen(&mut self, retries: u32, retry_delay: Duration) -> Result<()> {
        self.close();
        let port = open_with_retry(self.connector, &self.config, retries, retry_delay)?;
        self.port = Some(port);
        debug!("Reopened {}", self.config.port_name);
        Ok(())
    }

    /// Release the port. Closing twice is harmless.
    pub fn close(&mut self) {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.close() {
                debug!("Closing {} failed: {e}", self.config.port_name);
            }
        }
    }

    /// Whether a session is currently open.
    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Endpoint this link talks to.
    pub fn endpoint(&self) -> &str {
        &self.config.port_name
    }

    /// Sleep through the connector.
    pub fn pause(&self, duration: Duration) {
        self.connector.pause(duration);
    }

    fn port_mut(&mut self) -> Result<&mut C::Port> {
        self.port
            .as_mut()
            .ok_or_else(|| Error::PortNotOpen(self.config.port_name.clone()))
    }

    /// Flush unread input and write one frame.
    ///
    /// Returns `false` when the write itself failed, which on USB serial
    /// usually means the device dropped off the bus.
    pub fn transmit(&mut self, frame: &IspFrame) -> Result<bool> {
        let bytes = frame.build()?;
        let port = self.port_mut()?;
        if let Err(e) = port.clear_input() {
            trace!("clear_input on {} failed: {e}", port.name());
        }
        trace!("-> {bytes:02X?}");
        match port.write_all_bytes(&bytes) {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!("{} write failed: {e}", frame.command());
                Ok(false)
            },
        }
    }

    /// Wait up to `timeout` for one frame.
    pub fn receive(&mut self, timeout: Duration) -> Result<Option<Response>> {
        Ok(decode(self.port_mut()?, timeout))
    }

    /// Write `frame`, wait `settle`, then decode one response within `timeout`.
    ///
    /// No logging and no retries; see [`IspLink::send`] for the logged form.
    pub fn exchange(
        &mut self,
        frame: &IspFrame,
        settle: Duration,
        timeout: Duration,
    ) -> Result<Exchange> {
        if !self.transmit(frame)? {
            return Ok(Exchange::default());
        }
        self.connector.pause(settle);
        let response = self.receive(timeout)?;
        Ok(Exchange {
            ok: response
                .as_ref()
                .is_some_and(Response::is_accepted),
            response,
        })
    }

    /// One logged request/response exchange.
    pub fn send(&mut self, frame: &IspFrame, timeout: Duration, quiet: bool) -> Result<Exchange> {
        let exchange = self.exchange(frame, COMMAND_SETTLE, timeout)?;
        if quiet {
            debug!("{}: {}", frame.command(), exchange.status());
        } else {
            info!("{}: {}", frame.command(), exchange.status());
        }
        Ok(exchange)
    }

    /// Send a payload-less command with the default timeout.
    pub fn command(&mut self, command: CommandId) -> Result<Exchange> {
        self.send(&IspFrame::new(command), RESPONSE_TIMEOUT, false)
    }

    /// Like [`IspLink::command`], logging at debug level only.
    pub fn command_quiet(&mut self, command: CommandId) -> Result<Exchange> {
        self.send(&IspFrame::new(command), RESPONSE_TIMEOUT, true)
    }

    /// Send a command the device never acknowledges (RESET_DEVICE).
    pub fn send_unacked(&mut self, command: CommandId) -> Result<bool> {
        let sent = self.transmit(&IspFrame::new(command))?;
        debug!("{command}: sent");
        Ok(sent)
    }

    /// Read and discard input until the line goes quiet.
    fn drain(&mut self) -> Result<()> {
        let connector = self.connector;
        if let Err(e) = drain_stale(connector, self.port_mut()?) {
            trace!("stale drain stopped: {e}");
        }
        Ok(())
    }

    /// Put the SE into ISP mode.
    ///
    /// A booting SE may miss the first probe or still be printing, so the
    /// handshake is retried up to [`START_ISP_ATTEMPTS`] times with stale
    /// input drained before each attempt. Only the last attempt logs at
    /// info level.
    pub fn start_isp(&mut self) -> Result<IspStart> {
        for attempt in 1..=START_ISP_ATTEMPTS {
            self.connector.pause(START_ISP_PRE_PAUSE);
            self.drain()?;

            let last = attempt == START_ISP_ATTEMPTS;
            let exchange = self.send(&IspFrame::new(CommandId::StartIsp), RESPONSE_TIMEOUT, !last)?;
            if exchange.ok {
                if attempt > 1 {
                    info!("START_ISP: ACK (attempt {attempt})");
                }
                return Ok(IspStart {
                    ok: true,
                    attempts: attempt,
                });
            }
            if !last {
                self.connector.pause(START_ISP_RETRY_PAUSE);
            }
        }

        warn!("{} did not answer START_ISP", self.config.port_name);
        Ok(IspStart {
            ok: false,
            attempts: START_ISP_ATTEMPTS,
        })
    }
}

impl<C: Connector> Drop for IspLink<'_, C> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{
        DRAIN_PAUSE, ISP_BAUD, OPEN_RETRY_DELAY,
        mock::{MockConnector, Reply},
    };

    fn config() -> SerialConfig {
        SerialConfig::new("/dev/cu.usbserial-TEST", ISP_BAUD)
    }

    #[test]
    fn test_start_isp_succeeds_on_second_attempt() {
        let mut calls = 0;
        let connector = MockConnector::new(move |w| {
            if w.command() == Some(CommandId::StartIsp) {
                calls += 1;
                if calls == 1 {
                    return Reply::Silent;
                }
            }
            Reply::Ack
        });

        let mut link = IspLink::open(&connector, &config(), 1, OPEN_RETRY_DELAY).unwrap();
        let start = link.start_isp().unwrap();

        assert_eq!(
            start,
            IspStart {
                ok: true,
                attempts: 2
            }
        );
        assert_eq!(
            connector.commands(),
            vec![CommandId::StartIsp, CommandId::StartIsp]
        );
        assert!(
            connector
                .pauses()
                .contains(&START_ISP_RETRY_PAUSE)
        );
    }

    #[test]
    fn test_start_isp_gives_up_after_three_attempts() {
        let connector = MockConnector::silent();
        let mut link = IspLink::open(&connector, &config(), 1, OPEN_RETRY_DELAY).unwrap();

        let start = link.start_isp().unwrap();
        assert!(!start.ok);
        assert_eq!(start.attempts, START_ISP_ATTEMPTS);
        assert_eq!(connector.commands().len(), 3);
    }

    #[test]
    fn test_send_classifies_responses() {
        let connector = MockConnector::new(|w| match w.command() {
            Some(CommandId::Enquiry) => Reply::Data(vec![7; 12]),
            Some(CommandId::BurnMram) => Reply::Code(0x42),
            Some(CommandId::StopIsp) => Reply::Silent,
            _ => Reply::Ack,
        });
        let mut link = IspLink::open(&connector, &config(), 1, OPEN_RETRY_DELAY).unwrap();

        let ack = link
            .command(CommandId::StartIsp)
            .unwrap();
        assert!(ack.ok);
        assert_eq!(ack.status(), "ACK");
        assert!(ack.payload().is_empty());

        let data = link
            .command(CommandId::Enquiry)
            .unwrap();
        assert!(data.ok);
        assert_eq!(data.status(), "DATA (12 bytes)");
        assert_eq!(data.payload(), &[7; 12]);

        let rejected = link
            .send(&IspFrame::burn_mram(0x8000_0000, 16), RESPONSE_TIMEOUT, false)
            .unwrap();
        assert!(!rejected.ok);
        assert_eq!(rejected.status(), "0x42");

        let silent = link
            .command_quiet(CommandId::StopIsp)
            .unwrap();
        assert!(!silent.ok);
        assert_eq!(silent.status(), "no response");
    }

    #[test]
    fn test_send_flushes_stale_input_first() {
        let connector = MockConnector::acking();
        let mut link = IspLink::open(&connector, &config(), 1, OPEN_RETRY_DELAY).unwrap();

        // A stale DATA frame must not be mistaken for the reply
        connector.inject(&[0x04, 0xFD, 0x01, 0xFE]);
        let exchange = link
            .command(CommandId::StopIsp)
            .unwrap();
        assert_eq!(exchange.status(), "ACK");
    }

    #[test]
    fn test_start_isp_drains_boot_chatter() {
        let connector = MockConnector::acking();
        let mut link = IspLink::open(&connector, &config(), 1, OPEN_RETRY_DELAY).unwrap();

        connector.inject(b"SE boot banner\r\n");
        let start = link.start_isp().unwrap();
        assert_eq!(
            start,
            IspStart {
                ok: true,
                attempts: 1
            }
        );
        assert!(
            connector
                .pauses()
                .contains(&DRAIN_PAUSE)
        );
    }

    #[test]
    fn test_closed_link_is_a_contract_violation() {
        let connector = MockConnector::acking();
        let mut link = IspLink::open(&connector, &config(), 1, OPEN_RETRY_DELAY).unwrap();
        link.close();
        link.close();

        assert!(!link.is_open());
        assert!(matches!(
            link.command(CommandId::StartIsp),
            Err(Error::PortNotOpen(_))
        ));
        assert!(!connector.is_port_open());
    }

    #[test]
    fn test_reopen_starts_new_session() {
        let connector = MockConnector::acking();
        let mut link = IspLink::open(&connector, &config(), 1, OPEN_RETRY_DELAY).unwrap();
        link.command(CommandId::StartIsp)
            .unwrap();
        link.reopen(5, OPEN_RETRY_DELAY)
            .unwrap();
        link.command(CommandId::StartIsp)
            .unwrap();

        let sessions: Vec<usize> = connector
            .writes()
            .iter()
            .map(|w| w.session)
            .collect();
        assert_eq!(sessions, vec![1, 2]);
        assert_eq!(link.endpoint(), "/dev/cu.usbserial-TEST");
    }

    #[test]
    fn test_drop_closes_port() {
        let connector = MockConnector::acking();
        {
            let _link = IspLink::open(&connector, &config(), 1, OPEN_RETRY_DELAY).unwrap();
            assert!(connector.is_port_open());
        }
        assert!(!connector.is_port_open());
    }
}
