//! Hybrid receive loop over several channels.
//!
//! Channels configured with an event are slept on with `poll(2)`; channels
//! without one are checked every [`IpcConfig::poll_interval`]. Readiness is
//! always decided by the ring itself, the event is only a wake-up hint.
//!
//! [`IpcConfig::poll_interval`]: crate::config::IpcConfig::poll_interval

use crate::channel::RingKind;
use crate::error::{Error, Result};
use crate::event::ChannelEvent;
use crate::instance::Instance;
use std::time::{Duration, Instant};

/// Waits for messages on a set of channels of one instance.
#[derive(Debug)]
pub struct ChannelPoller<'a> {
    instance: &'a Instance,
    channels: Vec<u32>,
}

impl<'a> ChannelPoller<'a> {
    /// Watch `channels`, which must all be configured.
    pub fn new(instance: &'a Instance, channels: impl IntoIterator<Item = u32>) -> Result<Self> {
        let channels: Vec<u32> = channels.into_iter().collect();
        for &id in &channels {
            if !instance.is_channel_configured(id) {
                return Err(Error::ChannelInvalid(format!("channel {id} not configured")));
            }
        }
        Ok(Self { instance, channels })
    }

    /// Watched channel ids.
    pub fn channels(&self) -> &[u32] {
        &self.channels
    }

    fn has_data(&self, id: u32) -> Result<bool> {
        Ok(!self.instance.ring_state(id, RingKind::Message)?.is_empty())
    }

    fn event(&self, id: u32) -> Option<&ChannelEvent> {
        self.instance.get_event_handle(id).ok().flatten()
    }

    /// Channels with at least one pending message, waiting up to `timeout`
    /// for one to appear. Empty on timeout.
    pub fn poll_ready(&self, timeout: Duration) -> Result<Vec<u32>> {
        let deadline = Instant::now() + timeout;
        let events: Vec<&ChannelEvent> =
            self.channels.iter().filter_map(|&id| self.event(id)).collect();
        let spin = events.len() < self.channels.len();

        loop {
            let mut ready = Vec::new();
            for &id in &self.channels {
                if self.has_data(id)? {
                    ready.push(id);
                }
            }
            if !ready.is_empty() {
                return Ok(ready);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(ready);
            }
            let mut slice = deadline - now;
            if spin {
                slice = slice.min(self.instance.config().poll_interval);
            }
            if events.is_empty() {
                std::thread::sleep(slice);
            } else {
                wait_any(&events, slice)?;
            }
        }
    }

    /// Receive from channel `id`, waiting up to `timeout` for a message.
    ///
    /// Fails with [`Error::ChannelEmpty`] on timeout.
    pub fn recv_blocking(&self, id: u32, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let event = self.event(id);
        loop {
            if self.has_data(id)? {
                return self.instance.recv(id, buf);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::ChannelEmpty(id));
            }
            let remaining = deadline - now;
            match event {
                Some(event) => {
                    event.wait(remaining)?;
                }
                None => std::thread::sleep(remaining.min(self.instance.config().poll_interval)),
            }
        }
    }
}

/// Block until one of `events` fires or `timeout` passes, consuming the
/// signals that fired.
fn wait_any(events: &[&ChannelEvent], timeout: Duration) -> Result<()> {
    let mut fds: Vec<libc::pollfd> = events
        .iter()
        .map(|event| libc::pollfd {
            fd: event.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let millis = timeout.as_millis().clamp(1, libc::c_int::MAX as u128) as libc::c_int;
    // SAFETY: `fds` is a live array of `fds.len()` pollfds.
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, millis) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Ok(());
        }
        return Err(Error::Io(err));
    }
    for (event, fd) in events.iter().zip(&fds) {
        if fd.revents & libc::POLLIN != 0 {
            event.try_wait()?;
        }
    }
    Ok(())
}
