//! Serial bus transport for Modbus RTU slaves.
//!
//! Owns the single serial connection. The bus is half-duplex, so exactly
//! one request may be outstanding; the `&mut self` receiver enforces that
//! for the single owner (the polling worker). Connection-level failures
//! drop the serial context and schedule reconnect attempts with bounded
//! exponential backoff; while an attempt is pending, reads fail fast.

use std::future::Future;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_modbus::client::{Context, Reader};
use tokio_modbus::prelude::*;
use tracing::{info, warn};

use crate::config::SerialConfig;

/// Delay before the first reconnect attempt.
const RECONNECT_INITIAL: Duration = Duration::from_millis(500);
/// Upper bound for the reconnect backoff.
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Error type for bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The slave did not answer within the request timeout. Per-device and
    /// non-fatal; the connection stays up.
    #[error("no response from unit {0}")]
    SlaveTimeout(u8),

    /// The slave answered with a Modbus exception or a malformed frame.
    /// Per-device and non-fatal.
    #[error("unit {unit} protocol error: {detail}")]
    SlaveProtocol { unit: u8, detail: String },

    /// The serial connection itself is broken. Reads on any unit will fail
    /// until the transport has reconnected.
    #[error("bus transport failure: {0}")]
    Transport(String),
}

impl BusError {
    /// True when the underlying connection is gone and reads on other
    /// units would fail as well.
    pub fn is_transport(&self) -> bool {
        matches!(self, BusError::Transport(_))
    }
}

/// A source of raw register values, one request at a time.
pub trait Transport: Send {
    /// Open the connection. Failure is non-fatal; reads retry through the
    /// backoff schedule.
    fn connect(&mut self) -> impl Future<Output = Result<(), BusError>> + Send;

    /// Read one holding register from a unit.
    fn read_register(
        &mut self,
        unit_id: u8,
        address: u16,
    ) -> impl Future<Output = Result<u16, BusError>> + Send;

    /// Release the connection.
    fn close(&mut self) -> impl Future<Output = ()> + Send;

    /// True while the connection is up.
    fn is_connected(&self) -> bool;
}

/// Modbus RTU transport over a serial port.
pub struct RtuTransport {
    serial: SerialConfig,
    request_timeout: Duration,
    ctx: Option<Context>,
    reconnect_delay: Duration,
    next_attempt: Option<Instant>,
}

impl RtuTransport {
    /// Create a transport for the given serial line. The port is opened on
    /// `connect` or lazily on the first read.
    pub fn new(serial: SerialConfig, request_timeout: Duration) -> Self {
        Self {
            serial,
            request_timeout,
            ctx: None,
            reconnect_delay: RECONNECT_INITIAL,
            next_attempt: None,
        }
    }

    fn open(&self) -> Result<Context, BusError> {
        let parity = match self.serial.parity.to_lowercase().as_str() {
            "even" => tokio_serial::Parity::Even,
            "odd" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        };

        let stop_bits = match self.serial.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let data_bits = match self.serial.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };

        let builder = tokio_serial::new(&self.serial.port, self.serial.baud_rate)
            .parity(parity)
            .stop_bits(stop_bits)
            .data_bits(data_bits);

        let stream = tokio_serial::SerialStream::open(&builder)
            .map_err(|e| BusError::Transport(format!("serial open failed: {}", e)))?;

        // The slave id is switched per request before each read.
        Ok(rtu::attach_slave(stream, Slave(1)))
    }

    /// Open the port if it is down and a reconnect attempt is due. Fails
    /// fast while the backoff delay has not elapsed.
    fn ensure_connected(&mut self) -> Result<(), BusError> {
        if self.ctx.is_some() {
            return Ok(());
        }

        if let Some(at) = self.next_attempt {
            if Instant::now() < at {
                return Err(BusError::Transport("reconnect pending".to_string()));
            }
        }

        match self.open() {
            Ok(ctx) => {
                info!(port = %self.serial.port, baud = self.serial.baud_rate, "serial connection established");
                self.ctx = Some(ctx);
                self.reconnect_delay = RECONNECT_INITIAL;
                self.next_attempt = None;
                Ok(())
            }
            Err(e) => {
                warn!(
                    port = %self.serial.port,
                    retry_in_ms = self.reconnect_delay.as_millis() as u64,
                    "serial open failed: {}",
                    e
                );
                self.next_attempt = Some(Instant::now() + self.reconnect_delay);
                self.reconnect_delay = (self.reconnect_delay * 2).min(RECONNECT_MAX);
                Err(e)
            }
        }
    }

    fn drop_connection(&mut self) {
        self.ctx = None;
        self.reconnect_delay = RECONNECT_INITIAL;
        self.next_attempt = Some(Instant::now() + self.reconnect_delay);
    }
}

impl Transport for RtuTransport {
    async fn connect(&mut self) -> Result<(), BusError> {
        self.ensure_connected()
    }

    async fn read_register(&mut self, unit_id: u8, address: u16) -> Result<u16, BusError> {
        self.ensure_connected()?;
        let ctx = self
            .ctx
            .as_mut()
            .ok_or_else(|| BusError::Transport("not connected".to_string()))?;

        ctx.set_slave(Slave(unit_id));

        match tokio::time::timeout(self.request_timeout, ctx.read_holding_registers(address, 1))
            .await
        {
            Err(_) => Err(BusError::SlaveTimeout(unit_id)),
            Ok(Err(e)) => {
                warn!(port = %self.serial.port, "serial connection lost: {}", e);
                self.drop_connection();
                Err(BusError::Transport(e.to_string()))
            }
            Ok(Ok(Err(exception))) => Err(BusError::SlaveProtocol {
                unit: unit_id,
                detail: format!("{:?}", exception),
            }),
            Ok(Ok(Ok(words))) => words.first().copied().ok_or(BusError::SlaveProtocol {
                unit: unit_id,
                detail: "empty response".to_string(),
            }),
        }
    }

    async fn close(&mut self) {
        if self.ctx.take().is_some() {
            info!(port = %self.serial.port, "serial connection closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_port() -> RtuTransport {
        let serial = SerialConfig {
            port: "/dev/does-not-exist-silo-test".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            parity: "even".to_string(),
            stop_bits: 1,
        };
        RtuTransport::new(serial, Duration::from_millis(100))
    }

    #[test]
    fn test_error_classification() {
        assert!(BusError::Transport("gone".to_string()).is_transport());
        assert!(!BusError::SlaveTimeout(7).is_transport());
        assert!(
            !BusError::SlaveProtocol {
                unit: 7,
                detail: "IllegalDataAddress".to_string()
            }
            .is_transport()
        );
    }

    #[tokio::test]
    async fn test_open_failure_schedules_backoff() {
        let mut transport = missing_port();
        assert!(!transport.is_connected());

        let err = transport.ensure_connected().unwrap_err();
        assert!(err.is_transport());
        assert!(transport.next_attempt.is_some());
        assert_eq!(transport.reconnect_delay, RECONNECT_INITIAL * 2);
    }

    #[tokio::test]
    async fn test_reads_fail_fast_while_backoff_pending() {
        let mut transport = missing_port();
        let _ = transport.ensure_connected();

        // Still inside the backoff window: no second open attempt, the
        // delay is untouched.
        let err = transport.read_register(1, 10).await.unwrap_err();
        assert!(err.to_string().contains("reconnect pending"));
        assert_eq!(transport.reconnect_delay, RECONNECT_INITIAL * 2);
    }

    #[tokio::test]
    async fn test_backoff_is_bounded() {
        let mut transport = missing_port();
        for _ in 0..16 {
            transport.next_attempt = None;
            let _ = transport.ensure_connected();
        }
        assert_eq!(transport.reconnect_delay, RECONNECT_MAX);
    }
}
