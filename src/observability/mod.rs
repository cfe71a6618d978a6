//! Observability: metrics and tracing.
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `modem_ipc_messages_sent` | Counter | Messages sent, per channel |
//! | `modem_ipc_messages_received` | Counter | Messages received, per channel |
//! | `modem_ipc_bytes_sent` | Counter | Payload bytes sent |
//! | `modem_ipc_bytes_received` | Counter | Payload bytes received |
//! | `modem_ipc_errors` | Counter | Failed operations, by channel and kind |
//! | `modem_ipc_ring_occupancy` | Gauge | Slots in use in a message ring |
//! | `modem_ipc_pool_available` | Gauge | Free elements per pool class |
//!
//! ## Tracing
//!
//! Every instance operation runs in an `ipc_instance` span. Configuration
//! and shutdown log at `info`, ring movements (`pi`/`ci`/`pc`/`cc`) at
//! `debug`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use modem_ipc::observability::init_metrics;
//!
//! init_metrics();
//! // install an exporter (prometheus, statsd, ...) to collect them
//! ```

mod metrics;
mod tracing_support;

pub use metrics::{ChannelMetrics, init_metrics, record_error, record_pool_available};
pub use tracing_support::{span_channel, span_instance, trace_configured, trace_error};
