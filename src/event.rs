//! Per-channel wake-up events.
//!
//! A channel configured with an event gets an eventfd that the driver
//! signals when the modem raises the channel's MSI. The consumer can block
//! on it (poll), await it (tokio), or hand the fd to its own event loop.

use crate::error::{Error, Result};
use rustix::event::{EventfdFlags, eventfd};
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::Duration;

/// A non-blocking eventfd bound to one channel.
#[derive(Debug)]
pub struct ChannelEvent {
    fd: OwnedFd,
}

impl ChannelEvent {
    /// Create an eventfd with counter 0.
    pub fn new() -> Result<Self> {
        let fd = eventfd(0, EventfdFlags::NONBLOCK | EventfdFlags::CLOEXEC)
            .map_err(|e| Error::EventFailure(format!("eventfd: {e}")))?;
        Ok(Self { fd })
    }

    /// Signal the event (what the driver does on MSI).
    pub fn notify(&self) -> Result<()> {
        rustix::io::write(&self.fd, &1u64.to_ne_bytes())
            .map_err(|e| Error::EventFailure(format!("eventfd write: {e}")))?;
        Ok(())
    }

    /// Consume a pending signal without blocking.
    ///
    /// Returns `true` if the event was signalled.
    pub fn try_wait(&self) -> Result<bool> {
        let mut buf = [0u8; 8];
        match rustix::io::read(&self.fd, &mut buf) {
            Ok(8) => Ok(true),
            Ok(_) => Ok(false),
            Err(rustix::io::Errno::WOULDBLOCK) => Ok(false),
            Err(e) => Err(Error::EventFailure(format!("eventfd read: {e}"))),
        }
    }

    /// Block up to `timeout` for a signal and consume it.
    ///
    /// Returns `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        // SAFETY: one valid pollfd on the stack.
        let ret = unsafe { libc::poll(&mut pfd, 1, millis) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(Error::Io(err));
        }
        if ret == 0 {
            return Ok(false);
        }
        self.try_wait()
    }

    /// Wait asynchronously for a signal and consume it.
    pub async fn wait_async(&self) -> Result<()> {
        use tokio::io::Interest;
        use tokio::io::unix::AsyncFd;

        let async_fd =
            AsyncFd::with_interest(self.fd.as_fd(), Interest::READABLE).map_err(Error::Io)?;

        loop {
            let mut guard = async_fd.readable().await.map_err(Error::Io)?;
            if self.try_wait()? {
                return Ok(());
            }
            guard.clear_ready();
        }
    }

    /// Raw descriptor, for external event loops.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for ChannelEvent {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_notify_then_try_wait() {
        let event = ChannelEvent::new().unwrap();
        assert!(!event.try_wait().unwrap());

        event.notify().unwrap();
        event.notify().unwrap();
        // eventfd folds signals into one counter
        assert!(event.try_wait().unwrap());
        assert!(!event.try_wait().unwrap());
    }

    #[test]
    fn test_wait_times_out() {
        let event = ChannelEvent::new().unwrap();
        assert!(!event.wait(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_wait_wakes_from_other_thread() {
        let event = Arc::new(ChannelEvent::new().unwrap());
        let signaller = Arc::clone(&event);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signaller.notify().unwrap();
        });

        assert!(event.wait(Duration::from_secs(5)).unwrap());
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_wait_async() {
        let event = ChannelEvent::new().unwrap();
        event.notify().unwrap();
        tokio::time::timeout(Duration::from_secs(1), event.wait_async())
            .await
            .unwrap()
            .unwrap();
    }
}
