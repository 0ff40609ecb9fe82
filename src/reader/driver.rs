//! ReaderDriver trait for unified reader transports
//!
//! This module provides the common interface for all reader transports,
//! enabling real links (TCP, device file) and the virtual reader to be
//! driven by the same reconnect loop.

use crate::config::{EndpointConfig, ReaderConfig};
use crate::error::Result;
use std::time::Duration;

use super::device::DeviceDriver;
use super::tcp::TcpDriver;
use super::virtual_reader::VirtualDriver;

/// Outcome of a single read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverRead {
    /// Raw bytes from the reader
    Data(Vec<u8>),
    /// Nothing arrived within the timeout; the link is still up
    Idle,
    /// The peer closed the link
    Closed,
}

/// Common interface for reader transports
///
/// A driver is owned by one reader lane. `open` must fail with
/// [`crate::RfidError::Connection`] when the endpoint is unreachable.
/// `read` must return within roughly `timeout` so the lane can observe
/// shutdown and commands between reads.
pub trait ReaderDriver: Send {
    /// Establish the link
    fn open(&mut self) -> Result<()>;

    /// Read the next chunk, waiting at most `timeout`
    fn read(&mut self, timeout: Duration) -> Result<DriverRead>;

    /// Release the link and all its resources
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Human-readable endpoint for logs
    fn describe(&self) -> String;
}

/// Builds the driver for a reader; swapped out in tests
pub type DriverFactory = std::sync::Arc<dyn Fn(&ReaderConfig) -> Box<dyn ReaderDriver> + Send + Sync>;

/// Build the driver configured for a reader
pub fn driver_for(reader: &ReaderConfig) -> Box<dyn ReaderDriver> {
    match &reader.endpoint {
        EndpointConfig::Tcp {
            address,
            connect_timeout_ms,
        } => Box::new(TcpDriver::new(
            &reader.id,
            address.clone(),
            Duration::from_millis(*connect_timeout_ms),
        )),
        EndpointConfig::Device { path, grab } => {
            Box::new(DeviceDriver::new(&reader.id, path.clone()).with_grab(*grab))
        }
        EndpointConfig::Virtual {
            tags,
            interval_ms,
            antennas,
        } => Box::new(VirtualDriver::new(
            &reader.id,
            tags.clone(),
            Duration::from_millis(*interval_ms),
            *antennas,
        )),
    }
}

/// The default factory, dispatching on the configured endpoint
pub fn default_factory() -> DriverFactory {
    std::sync::Arc::new(driver_for)
}
