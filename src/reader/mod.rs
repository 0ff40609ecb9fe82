//! Reader links
//!
//! - [`driver`] - The [`ReaderDriver`] transport contract
//! - [`connection`] - Reconnect loop with backoff and the Faulted state
//! - [`tcp`], [`device`], [`virtual_reader`] - Shipped transports

pub mod connection;
pub mod device;
pub mod driver;
pub mod tcp;
pub mod virtual_reader;

pub use connection::{FrameHandler, ReaderCommand, ReaderConnection, ReaderEvent};
pub use device::DeviceDriver;
pub use driver::{default_factory, driver_for, DriverFactory, DriverRead, ReaderDriver};
pub use tcp::TcpDriver;
pub use virtual_reader::VirtualDriver;
