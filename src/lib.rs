//! # rfidreader: RFID tag-event ingestion pipeline
//!
//! Connects to one or more RFID readers, decodes their raw output into tag
//! reads, collapses repeated reads of the same tag into presence events and
//! delivers those events downstream with retry and backpressure.
//!
//! ## Architecture
//!
//! - **Reader**: Reconnecting link to a reader over a [`reader::ReaderDriver`]
//! - **Decoder**: Streaming frame decoders (line protocol, keyboard wedge)
//! - **Dedup**: Sharded per-reader window coalescing reads into [`PresenceEvent`]s
//! - **Delivery**: Bounded queue, worker threads, retry and dead-lettering
//! - **Pipeline**: The [`Coordinator`] wiring one lane per reader
//! - **Communication**: Crossbeam channels between every thread
//!
//! ## Example
//!
//! ```no_run
//! use rfidreader::{config::PipelineConfig, Coordinator};
//!
//! fn main() -> rfidreader::Result<()> {
//!     let config = PipelineConfig::load("rfidreader.toml")?;
//!     let mut coordinator = Coordinator::from_config(config)?;
//!     coordinator.start()?;
//!
//!     std::thread::sleep(std::time::Duration::from_secs(10));
//!     println!("{:?}", coordinator.status().queue);
//!
//!     let report = coordinator.stop()?;
//!     println!("{} events undelivered", report.undelivered.len());
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod config;
pub mod decoder;
pub mod dedup;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod presence;
pub mod reader;
pub mod shutdown;
pub mod types;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use dedup::{DedupWindow, PresenceEmitter};
pub use delivery::{DeliveryQueue, EventSink};
pub use error::{DecodeError, Result, RfidError};
pub use pipeline::{Coordinator, PipelineStatus, ShutdownReport};
pub use presence::{CurrentTag, PresenceTracker};
pub use reader::{ReaderDriver, ReaderEvent};
pub use types::{FlushReason, PresenceEvent, ReaderState, ReaderStatus, TagId, TagRead, Timestamp};
