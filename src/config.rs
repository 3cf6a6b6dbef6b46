//! Configuration for the listener, observers and the live store.

use rand::Rng;
use std::time::Duration;

/// Randomized reconnect delay: a fixed base plus uniform jitter.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Minimum delay before reconnecting.
    pub base_delay: Duration,
    /// Upper bound of the random extra delay.
    pub jitter: Duration,
}

impl BackoffConfig {
    pub fn new(base_delay: Duration, jitter: Duration) -> Self {
        Self { base_delay, jitter }
    }

    /// Pick the next delay in `[base_delay, base_delay + jitter]`.
    pub fn next_delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.base_delay + Duration::from_millis(extra)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(250))
    }
}

/// Configuration for the change-feed listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Lag (log timestamp to receipt, or receipt to end of dispatch) above
    /// which a warning is logged.
    pub latency_threshold: Duration,
    /// Minimum time between two latency warnings of the same kind.
    pub warn_interval: Duration,
    /// Reconnect delay after a connection error.
    pub backoff: BackoffConfig,
    /// How often subscription counts are logged.
    pub tick_interval: Duration,
    /// Capacity of each listener event receiver.
    pub event_buffer: usize,
}

impl ListenerConfig {
    pub fn with_latency_threshold(mut self, threshold: Duration) -> Self {
        self.latency_threshold = threshold;
        self
    }

    pub fn with_warn_interval(mut self, interval: Duration) -> Self {
        self.warn_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size;
        self
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            latency_threshold: Duration::from_millis(1000),
            warn_interval: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
            tick_interval: Duration::from_secs(60),
            event_buffer: 256,
        }
    }
}

/// How `Cursor::observe` keeps a result set live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObserveMode {
    /// Use the change feed when the store has one, polling otherwise.
    #[default]
    Auto,
    /// Always re-run the query and diff snapshots.
    Polling,
}

/// Configuration for observers.
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    pub mode: ObserveMode,
    /// Re-query interval of polling observers, in addition to change pulses.
    pub poll_interval: Duration,
}

impl ObserverConfig {
    pub fn with_mode(mut self, mode: ObserveMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            mode: ObserveMode::Auto,
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Configuration for a [`LiveStore`](crate::LiveStore).
#[derive(Debug, Clone)]
pub struct LiveStoreConfig {
    /// Database part of every namespace handed out by the store.
    pub database: String,
    pub listener: ListenerConfig,
    pub observer: ObserverConfig,
}

impl LiveStoreConfig {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..Default::default()
        }
    }

    pub fn with_listener(mut self, listener: ListenerConfig) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_observer(mut self, observer: ObserverConfig) -> Self {
        self.observer = observer;
        self
    }
}

impl Default for LiveStoreConfig {
    fn default() -> Self {
        Self {
            database: "db".to_string(),
            listener: ListenerConfig::default(),
            observer: ObserverConfig::default(),
        }
    }
}
