//! Metrics collection using metrics-rs.
//!
//! These mirror the shared statistics block for exporters; the shared
//! counters remain the source the modem and tools read.

use metrics::{Counter, Gauge, Unit, counter, gauge};
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const MESSAGES_SENT: &str = "modem_ipc_messages_sent";
const MESSAGES_RECEIVED: &str = "modem_ipc_messages_received";
const BYTES_SENT: &str = "modem_ipc_bytes_sent";
const BYTES_RECEIVED: &str = "modem_ipc_bytes_received";
const ERRORS: &str = "modem_ipc_errors";
const RING_OCCUPANCY: &str = "modem_ipc_ring_occupancy";
const POOL_AVAILABLE: &str = "modem_ipc_pool_available";

/// Initialize metrics descriptions.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(MESSAGES_SENT, Unit::Count, "Messages sent to the modem");
    metrics::describe_counter!(
        MESSAGES_RECEIVED,
        Unit::Count,
        "Messages received from the modem"
    );
    metrics::describe_counter!(BYTES_SENT, Unit::Bytes, "Payload bytes sent");
    metrics::describe_counter!(BYTES_RECEIVED, Unit::Bytes, "Payload bytes received");
    metrics::describe_counter!(ERRORS, Unit::Count, "Failed channel operations by kind");
    metrics::describe_gauge!(
        RING_OCCUPANCY,
        Unit::Count,
        "Slots holding data in a channel's message ring"
    );
    metrics::describe_gauge!(POOL_AVAILABLE, Unit::Count, "Free elements in a buffer pool");
}

/// Record a failed operation not tied to a channel.
#[inline]
pub fn record_error(kind: &'static str) {
    counter!(ERRORS, "kind" => kind).increment(1);
}

/// Record free elements of a pool.
#[inline]
pub fn record_pool_available(class: &str, available: usize) {
    gauge!(POOL_AVAILABLE, "class" => class.to_string()).set(available as f64);
}

/// Metric handles for one channel, labelled by channel id.
#[derive(Clone)]
pub struct ChannelMetrics {
    channel: String,
    sent: Counter,
    received: Counter,
    bytes_sent: Counter,
    bytes_received: Counter,
    occupancy: Gauge,
}

impl ChannelMetrics {
    /// Register handles for channel `id`.
    pub fn new(id: u32) -> Self {
        let channel = id.to_string();
        Self {
            sent: counter!(MESSAGES_SENT, "channel" => channel.clone()),
            received: counter!(MESSAGES_RECEIVED, "channel" => channel.clone()),
            bytes_sent: counter!(BYTES_SENT, "channel" => channel.clone()),
            bytes_received: counter!(BYTES_RECEIVED, "channel" => channel.clone()),
            occupancy: gauge!(RING_OCCUPANCY, "channel" => channel.clone()),
            channel,
        }
    }

    /// Record a sent message and the ring occupancy after it.
    #[inline]
    pub fn record_sent(&self, bytes: usize, occupancy: u32) {
        self.sent.increment(1);
        self.bytes_sent.increment(bytes as u64);
        self.occupancy.set(f64::from(occupancy));
    }

    /// Record a received message and the ring occupancy after it.
    #[inline]
    pub fn record_received(&self, bytes: usize, occupancy: u32) {
        self.received.increment(1);
        self.bytes_received.increment(bytes as u64);
        self.occupancy.set(f64::from(occupancy));
    }

    /// Record a failed operation.
    #[inline]
    pub fn record_error(&self, kind: &'static str) {
        counter!(ERRORS, "channel" => self.channel.clone(), "kind" => kind).increment(1);
    }

    /// The channel label.
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl std::fmt::Debug for ChannelMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelMetrics")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        init_metrics();
        // Should be idempotent
        init_metrics();
    }

    #[test]
    fn test_channel_metrics() {
        // No recorder installed: handles are no-ops
        let metrics = ChannelMetrics::new(12);
        metrics.record_sent(100, 1);
        metrics.record_received(100, 0);
        metrics.record_error("channel_full");
        assert_eq!(metrics.channel(), "12");
    }

    #[test]
    fn test_global_recording_functions() {
        record_error("instance_invalid");
        record_pool_available("Msg2K", 16);
    }
}
