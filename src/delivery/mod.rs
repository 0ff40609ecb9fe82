//! Delivery of presence events to the downstream consumer
//!
//! - [`queue`] - Bounded queue with backpressure or drop-oldest overflow
//! - [`worker`] - Worker threads with retry and dead-lettering
//! - [`sink`] - The [`EventSink`] contract and the shipped sinks

pub mod queue;
pub mod sink;
pub mod worker;

pub use queue::{DeliveryQueue, QueueProducer, QueueSnapshot};
pub use sink::{build_dead_letter, build_sink, ChannelSink, EventSink, JsonLinesSink, LogSink};
pub use worker::{spawn_workers, DeliveryWorker};
