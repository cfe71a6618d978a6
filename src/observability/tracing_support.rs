//! Tracing spans for instances and channels.

use tracing::{Level, Span, span};

/// Span wrapping every operation of one instance.
///
/// # Example
///
/// ```rust,ignore
/// use modem_ipc::observability::span_instance;
///
/// let span = span_instance(0);
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_instance(instance_id: u32) -> Span {
    span!(Level::INFO, "ipc_instance", id = instance_id)
}

/// Span for work on one channel, nested in the instance span.
#[inline]
pub fn span_channel(channel: u32) -> Span {
    span!(Level::DEBUG, "ipc_channel", channel = channel)
}

/// Log a channel coming up.
#[inline]
pub fn trace_configured(channel: u32, kind: &dyn std::fmt::Debug, depth: u32, msg_size: u32) {
    tracing::info!(
        channel = channel,
        kind = ?kind,
        depth = depth,
        msg_size = msg_size,
        "channel configured"
    );
}

/// Log a failed operation.
#[inline]
pub fn trace_error(channel: Option<u32>, error: &dyn std::error::Error) {
    tracing::debug!(channel = ?channel, error = %error, "channel operation failed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spans_nest() {
        let instance = span_instance(0);
        let _outer = instance.enter();
        let _inner = span_channel(3).entered();
        trace_configured(3, &"Message", 4, 2048);
        trace_error(Some(3), &std::io::Error::other("boom"));
    }
}
