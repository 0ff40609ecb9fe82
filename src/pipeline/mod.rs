//! Pipeline coordination
//!
//! - [`Coordinator`] - Start/stop/status/reset over every reader lane
//! - [`status`] - Health snapshots and the shutdown report
//!
//! # Data flow
//!
//! ```text
//! ReaderDriver -> FrameDecoder -> DedupWindow -> DeliveryQueue -> EventSink
//!   (lane thread, one per reader)                (delivery workers)
//! ```

pub mod coordinator;
mod lane;
pub mod status;

pub use coordinator::Coordinator;
pub use status::{LaneState, PipelineStatus, ReaderHealth, ShutdownReport};
