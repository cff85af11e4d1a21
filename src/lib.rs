//! Silo level monitoring over Modbus RTU.
//!
//! One polling worker owns the serial bus and reads a single holding
//! register per configured slave each cycle; the latest readings live in a
//! shared store and are served over HTTP with online/offline status
//! derived at request time:
//!
//! - [`config`] - JSON5 configuration loading and validation
//! - [`transport`] - serial RTU transport with reconnect backoff
//! - [`calibration`] - raw register values to fill percentages
//! - [`store`] - latest-reading table and status derivation
//! - [`poller`] - the poll cycle scheduler
//! - [`health`] - scheduler liveness behind the health endpoint
//! - [`http`] - JSON API exposition
//! - [`alerts`] - offline transition alerts

pub mod alerts;
pub mod calibration;
pub mod config;
pub mod health;
pub mod http;
pub mod poller;
pub mod store;
pub mod transport;

// Re-export commonly used types at the crate root
pub use calibration::{FillLevel, fill_percent};
pub use config::{ConfigError, MonitorConfig, PollingConfig, SiloConfig};
pub use health::{HealthSnapshot, MonitorHealth, SharedHealth};
pub use http::{ApiState, HttpServer, SiloSnapshot};
pub use poller::Poller;
pub use store::{Reading, ReadingStore, SharedStore, SiloStatus};
pub use transport::{BusError, RtuTransport, Transport};
