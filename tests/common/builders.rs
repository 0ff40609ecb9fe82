//! Test data builders for creating test objects

use rfidreader::config::{
    DecoderKind, EndpointConfig, OverflowPolicy, PipelineConfig, ReaderConfig, ReconnectSettings,
    WindowPolicy,
};

/// Reader with a fast reconnect policy; the endpoint is replaced by the
/// scripted driver factory in tests
pub fn fast_reader(id: &str) -> ReaderConfig {
    let mut reader = ReaderConfig::new(
        id,
        EndpointConfig::Virtual {
            tags: vec!["E200".to_string()],
            interval_ms: 1_000,
            antennas: 1,
        },
    );
    reader.reconnect = ReconnectSettings {
        initial_backoff_ms: 10,
        max_backoff_ms: 40,
        min_uptime_ms: 60_000,
        max_consecutive_failures: 5,
        read_timeout_ms: 10,
    };
    reader
}

/// Builder for pipeline configs tuned for fast tests
pub struct ConfigBuilder {
    config: PipelineConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        let mut config = PipelineConfig::default();
        config.shutdown_timeout_ms = 5_000;
        config.dedup.window_ms = 50;
        config.dedup.flush_tick_ms = 5;
        config.dedup.shards = 4;
        config.queue.capacity = 64;
        config.queue.stall_report_ms = 20;
        config.delivery.initial_backoff_ms = 1;
        config.delivery.max_backoff_ms = 5;
        Self { config }
    }

    pub fn reader(mut self, reader: ReaderConfig) -> Self {
        self.config.readers.push(reader);
        self
    }

    pub fn keyboard_reader(mut self, id: &str, id_length: usize) -> Self {
        let mut reader = fast_reader(id);
        reader.decoder = DecoderKind::Keyboard;
        reader.keyboard.id_length = id_length;
        self.config.readers.push(reader);
        self
    }

    pub fn window_ms(mut self, window_ms: u64) -> Self {
        self.config.dedup.window_ms = window_ms;
        self
    }

    pub fn policy(mut self, policy: WindowPolicy) -> Self {
        self.config.dedup.policy = policy;
        self
    }

    pub fn queue(mut self, capacity: usize, overflow: OverflowPolicy) -> Self {
        self.config.queue.capacity = capacity;
        self.config.queue.overflow = overflow;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.delivery.max_attempts = max_attempts;
        self
    }

    pub fn delivery_backoff_ms(mut self, initial: u64, max: u64) -> Self {
        self.config.delivery.initial_backoff_ms = initial;
        self.config.delivery.max_backoff_ms = max;
        self
    }

    pub fn shutdown_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.shutdown_timeout_ms = timeout_ms;
        self
    }

    pub fn build(self) -> PipelineConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder_is_valid() {
        let config = ConfigBuilder::new()
            .reader(fast_reader("dock"))
            .window_ms(100)
            .queue(4, OverflowPolicy::DropOldest)
            .build();

        assert!(config.validate().is_ok());
        assert_eq!(config.dedup.window_ms, 100);
        assert_eq!(config.queue.overflow, OverflowPolicy::DropOldest);
    }
}
