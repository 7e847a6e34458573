//! # Console Statistics
//!
//! Counters the event loop updates as traffic flows, readable from any thread
//! through a [`ConsoleHandle`](crate::console::ConsoleHandle).
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: the event loop and every handle share one set of counters
//! - **RwLock**: many readers (status queries) or one writer (the loop)
//!
//! Only the event loop writes, so contention is limited to snapshot reads.

use std::sync::{Arc, RwLock};

/// Shared, cheaply cloneable statistics handle.
#[derive(Debug, Clone)]
pub struct ConsoleStats {
    counters: Arc<RwLock<StatsSnapshot>>,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// JSON envelopes written to the socket
    pub frames_sent: u64,
    /// Binary audio frames written to the socket
    pub audio_frames_sent: u64,
    /// Bytes of PCM written to the socket
    pub audio_bytes_sent: u64,
    /// `workspace_save` envelopes sent (autosave and manual)
    pub saves_sent: u64,
    /// Server messages that classified into a known shape
    pub messages_received: u64,
    /// Server messages dropped as unrecognized or malformed
    pub messages_dropped: u64,
    /// Reconnects performed after a lost connection
    pub reconnects: u64,
}

impl Default for ConsoleStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleStats {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(RwLock::new(StatsSnapshot::default())),
        }
    }

    /// Apply an update under the write lock. A poisoned lock is recovered.
    fn update(&self, f: impl FnOnce(&mut StatsSnapshot)) {
        let mut counters = match self.counters.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut *counters);
    }

    pub fn record_frame_sent(&self) {
        self.update(|c| c.frames_sent += 1);
    }

    pub fn record_audio_sent(&self, bytes: usize) {
        self.update(|c| {
            c.audio_frames_sent += 1;
            c.audio_bytes_sent += bytes as u64;
        });
    }

    pub fn record_save(&self) {
        self.update(|c| c.saves_sent += 1);
    }

    pub fn record_received(&self) {
        self.update(|c| c.messages_received += 1);
    }

    pub fn record_dropped(&self) {
        self.update(|c| c.messages_dropped += 1);
    }

    pub fn record_reconnect(&self) {
        self.update(|c| c.reconnects += 1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        match self.counters.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl StatsSnapshot {
    /// Share of server messages that were dropped, 0.0 to 1.0.
    pub fn drop_rate(&self) -> f64 {
        let total = self.messages_received + self.messages_dropped;
        if total > 0 {
            self.messages_dropped as f64 / total as f64
        } else {
            0.0
        }
    }
}
