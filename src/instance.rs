//! The host-side IPC instance.
//!
//! An [`Instance`] owns everything one host needs to talk to one modem
//! instance: the device handles, the mapped regions, the buffer pools and
//! the host's record of each configured channel. All channel state the modem
//! can see lives in shared memory; the local table only holds what the modem
//! never sees (events, pool buffers, metric handles).
//!
//! # Lifecycle
//!
//! ```text
//!   init ──> configure_channel (per channel, idempotent) ──> send / recv ...
//!                                                          └──> shutdown
//! ```
//!
//! Every failed operation is counted in the shared host statistics block
//! under its category before the error is returned.

use crate::channel::{
    ChannelKind, ChannelView, PendingMessage, PutBufError, RingKind, SharedBuffer, release,
};
use crate::config::{CFGMASK_WORDS, CHANNELS_MAX, IpcConfig, MAX_DEPTH, MAX_INSTANCES};
use crate::device::Devices;
use crate::error::{Error, Result};
use crate::event::ChannelEvent;
use crate::layout::{
    ChannelBlock, HostInterface, InstanceBlock, IpcMetadata, ReadyFlags,
};
use crate::memory::{
    BufferPool, BufferPools, DmaRegion, MappedRegion, PoolClass, RegionMap, Translator, VirtAddr,
};
use crate::observability::{self, ChannelMetrics, span_channel, span_instance};
use crate::ring::RingState;
use crate::role::{Operation, Side};
use crate::stats::{ChannelCounters, ErrorCategory, GlobalCounters};
use rustix::fd::AsFd;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{Span, error, info, warn};

/// Host bookkeeping for one configured channel.
#[derive(Debug)]
struct LocalChannel {
    kind: ChannelKind,
    depth: u32,
    msg_size: u32,
    event: Option<ChannelEvent>,
    msi: Option<u32>,
    buffers: Vec<(PoolClass, VirtAddr)>,
    metrics: ChannelMetrics,
}

/// A host-side IPC instance.
///
/// `Instance` is `Send + Sync`. Several threads may use it at once as long
/// as each ring end (a channel's producer or consumer side) is driven by one
/// thread at a time.
pub struct Instance {
    id: u32,
    config: IpcConfig,
    devices: Devices,
    regions: RegionMap,
    metadata_offset: usize,
    pools: BufferPools,
    dma: DmaRegion,
    channels: Box<[OnceLock<LocalChannel>]>,
    configure_lock: Mutex<()>,
    span: Span,
}

impl Instance {
    /// Open the devices named in `config` and initialise.
    pub fn init(config: &IpcConfig, pools: BufferPools, dma: DmaRegion) -> Result<Self> {
        let devices = Devices::open(config)?;
        Self::init_with(config, pools, dma, devices)
    }

    /// Initialise on already opened devices.
    ///
    /// Requests the system map, maps the control and data regions, and
    /// locates the metadata block the modem published.
    pub fn init_with(
        config: &IpcConfig,
        pools: BufferPools,
        dma: DmaRegion,
        devices: Devices,
    ) -> Result<Self> {
        let span = span_instance(config.instance_id);
        let _enter = span.enter();

        if config.instance_id >= MAX_INSTANCES {
            observability::record_error(ErrorCategory::InstanceInvalid.as_str());
            return Err(Error::InstanceInvalid(format!(
                "instance {} out of range (max {MAX_INSTANCES})",
                config.instance_id
            )));
        }

        let system = devices.control.system_map(dma.mem_range())?;
        let control = MappedRegion::new(system.control, devices.memory.map(&system.control)?)?;
        let data = MappedRegion::new(system.data, devices.memory.map(&system.data)?)?;
        let regions = RegionMap::new(system, control, data, &dma)?;

        let hif: &HostInterface = regions.control().locate(0)?;
        let metadata_offset = hif.ipc_regs.ipc_mdata_offset.load(Ordering::Acquire) as usize;
        let metadata_size = hif.ipc_regs.ipc_mdata_size.load(Ordering::Acquire) as usize;
        if metadata_size != IpcMetadata::SIZE {
            hif.host_stats
                .record_global(ErrorCategory::MetadataSizeMismatch);
            observability::record_error(ErrorCategory::MetadataSizeMismatch.as_str());
            warn!(
                expected = IpcMetadata::SIZE,
                reported = metadata_size,
                "IPC metadata size mismatch"
            );
            if config.strict_metadata_size {
                return Err(Error::InstanceInvalid(format!(
                    "modem metadata is {metadata_size} bytes, expected {}",
                    IpcMetadata::SIZE
                )));
            }
        }

        let metadata: &IpcMetadata = regions.data().locate(metadata_offset)?;
        let block = metadata
            .instance(config.instance_id)
            .ok_or_else(|| Error::InstanceInvalid(format!("no block for {}", config.instance_id)))?;
        if !block.is_initialized() {
            warn!("modem has not initialised this instance yet");
        }
        hif.set_host_ready(ReadyFlags::IPC_LIB);

        info!(
            metadata = %regions
                .translator()
                .coprocessor_offset_to_host_virtual(metadata_offset as u32),
            dma = ?dma,
            pools = ?pools,
            "IPC instance initialised"
        );

        let channels = (0..CHANNELS_MAX).map(|_| OnceLock::new()).collect();
        drop(_enter);

        Ok(Self {
            id: config.instance_id,
            config: config.clone(),
            devices,
            regions,
            metadata_offset,
            pools,
            dma,
            channels,
            configure_lock: Mutex::new(()),
            span,
        })
    }

    /// Instance id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Configuration this instance was built with.
    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    /// The DMA region backing the pools.
    pub fn dma(&self) -> &DmaRegion {
        &self.dma
    }

    /// Address translator for this instance's regions.
    pub fn translator(&self) -> &Translator {
        self.regions.translator()
    }

    /// The buffer pools.
    pub fn pools(&self) -> &BufferPools {
        &self.pools
    }

    // -------------------------------------------------------------------------
    // Shared structures
    // -------------------------------------------------------------------------

    fn hif(&self) -> Result<&HostInterface> {
        self.regions.control().locate(0)
    }

    /// The instance block, provided the modem initialised it.
    fn block(&self) -> Result<&InstanceBlock> {
        let metadata: &IpcMetadata = self.regions.data().locate(self.metadata_offset)?;
        match metadata.instance(self.id) {
            Some(block) if block.is_initialized() => Ok(block),
            _ => Err(Error::InstanceInvalid(format!(
                "instance {} not initialised by the modem",
                self.id
            ))),
        }
    }

    fn channel_block(&self, id: u32) -> Result<&ChannelBlock> {
        if id >= CHANNELS_MAX {
            return Err(Error::ChannelInvalid(format!(
                "channel {id} out of range (max {CHANNELS_MAX})"
            )));
        }
        let block = self.block()?;
        if !block.is_configured(id) {
            return Err(Error::ChannelInvalid(format!("channel {id} not configured")));
        }
        block
            .channel(id)
            .ok_or_else(|| Error::ChannelInvalid(format!("channel {id} out of range")))
    }

    /// Checked view of a configured channel for `op`.
    fn view(&self, id: u32, op: Operation, kind: Option<ChannelKind>) -> Result<ChannelView<'_>> {
        op.check(Side::Host)?;
        let block = self.channel_block(id)?;
        if let Some(kind) = kind {
            let actual = ChannelKind::from_wire(block.ch_type.load(Ordering::Acquire));
            if actual != Some(kind) {
                return Err(Error::ChannelInvalid(format!(
                    "channel {id} is {actual:?}, {op:?} needs {kind:?}"
                )));
            }
        }
        Ok(ChannelView {
            id,
            block,
            translator: self.regions.translator(),
        })
    }

    fn local(&self, id: u32) -> Option<&LocalChannel> {
        self.channels.get(id as usize).and_then(OnceLock::get)
    }

    /// Count `err` against `id` and hand it back.
    fn fail(&self, id: u32, err: Error) -> Error {
        observability::trace_error(Some(id), &err);
        let Some(category) = ErrorCategory::of(&err) else {
            return err;
        };
        let category = match category {
            ErrorCategory::ChannelInvalid if id >= CHANNELS_MAX => {
                ErrorCategory::ChannelOutOfRange
            }
            other => other,
        };

        if let Ok(hif) = self.hif() {
            hif.host_stats.record_global(category);
            if let Some(stats) = hif.host_stats.channel(id) {
                stats.record_error(category);
            }
        }
        match self.local(id) {
            Some(local) => local.metrics.record_error(category.as_str()),
            None => observability::record_error(category.as_str()),
        }
        err
    }

    fn record_sent(&self, ch: &ChannelView<'_>, bytes: usize) {
        if let Ok(hif) = self.hif() {
            if let Some(stats) = hif.host_stats.channel(ch.id) {
                stats.record_sent(bytes as u32);
            }
        }
        if let Some(local) = self.local(ch.id) {
            local.metrics.record_sent(bytes, ch.block.msg_ring.md.occupancy());
        }
    }

    fn record_received(&self, ch: &ChannelView<'_>, bytes: usize) {
        if let Ok(hif) = self.hif() {
            if let Some(stats) = hif.host_stats.channel(ch.id) {
                stats.record_received(bytes as u32);
            }
        }
        if let Some(local) = self.local(ch.id) {
            local
                .metrics
                .record_received(bytes, ch.block.msg_ring.md.occupancy());
        }
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    /// Configure channel `id`.
    ///
    /// Takes ring buffers from the pools (best-fitting message class for a
    /// message channel; `SharedDescriptor` and `Ptr128K` for a pointer
    /// channel) and, with `want_event`, registers an event the modem can
    /// raise. Configuring an already configured channel succeeds without
    /// touching it.
    pub fn configure_channel(
        &self,
        id: u32,
        depth: u32,
        kind: ChannelKind,
        msg_size: u32,
        want_event: bool,
    ) -> Result<()> {
        let _enter = self.span.enter();
        let _channel = span_channel(id).entered();
        let _guard = self
            .configure_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        self.configure_locked(id, depth, kind, msg_size, want_event)
            .map_err(|err| self.fail(id, err))
    }

    fn configure_locked(
        &self,
        id: u32,
        depth: u32,
        kind: ChannelKind,
        msg_size: u32,
        want_event: bool,
    ) -> Result<()> {
        Operation::Configure.check(Side::Host)?;
        if id >= CHANNELS_MAX {
            return Err(Error::ChannelInvalid(format!(
                "channel {id} out of range (max {CHANNELS_MAX})"
            )));
        }
        if depth == 0 || depth > MAX_DEPTH {
            return Err(Error::ChannelInvalid(format!(
                "depth {depth} outside 1..={MAX_DEPTH}"
            )));
        }
        let instance = self.block()?;
        let block = instance
            .channel(id)
            .ok_or_else(|| Error::ChannelInvalid(format!("channel {id} out of range")))?;

        if instance.is_configured(id) {
            warn!(channel = id, "channel already configured, not configuring again");
            self.adopt(id, block);
            return Ok(());
        }
        if msg_size == 0 {
            return Err(Error::InputInvalid(format!("channel {id}: zero message size")));
        }

        let view = ChannelView {
            id,
            block,
            translator: self.regions.translator(),
        };
        let buffers = self.stock(&view, kind, depth, msg_size)?;

        let (event, msi) = if want_event {
            match self.attach_event(id, block) {
                Ok((event, msi)) => (Some(event), Some(msi)),
                Err(err) => {
                    self.release_buffers(&buffers);
                    return Err(err);
                }
            }
        } else {
            block.msi_valid.store(0, Ordering::Release);
            (None, None)
        };

        let local = LocalChannel {
            kind,
            depth,
            msg_size,
            event,
            msi,
            buffers,
            metrics: ChannelMetrics::new(id),
        };
        // the local record must exist before other threads can see the bit
        if self.channels[id as usize].set(local).is_err() {
            warn!(channel = id, "local record already present");
        }
        instance.set_configured(id);
        observability::trace_configured(id, &kind, depth, msg_size);
        Ok(())
    }

    /// Take a local record for a channel configured elsewhere.
    fn adopt(&self, id: u32, block: &ChannelBlock) {
        let Some(slot) = self.channels.get(id as usize) else {
            return;
        };
        slot.get_or_init(|| {
            let md = block.msg_ring.md.snapshot();
            let kind = ChannelKind::from_wire(block.ch_type.load(Ordering::Acquire))
                .unwrap_or(ChannelKind::Message);
            let msi = (block.msi_valid.load(Ordering::Acquire) != 0)
                .then(|| block.msi_value.load(Ordering::Acquire));
            LocalChannel {
                kind,
                depth: md.ring_size,
                msg_size: match kind {
                    ChannelKind::Message => md.msg_size,
                    ChannelKind::Pointer => block.bl_ring.md.msg_size(),
                },
                event: None,
                msi,
                buffers: Vec::new(),
                metrics: ChannelMetrics::new(id),
            }
        });
    }

    fn pool(&self, class: PoolClass) -> Result<&Arc<dyn BufferPool>> {
        self.pools
            .get(class)
            .ok_or_else(|| Error::HostBufferAllocFail(format!("no {class:?} pool")))
    }

    fn stock(
        &self,
        view: &ChannelView<'_>,
        kind: ChannelKind,
        depth: u32,
        msg_size: u32,
    ) -> Result<Vec<(PoolClass, VirtAddr)>> {
        let tag = |class: PoolClass, addrs: Vec<VirtAddr>| {
            addrs.into_iter().map(move |va| (class, va))
        };
        let buffers: Vec<_> = match kind {
            ChannelKind::Message => {
                let (class, pool) = self.pools.best_fit(msg_size).ok_or_else(|| {
                    Error::InputInvalid(format!("no message pool holds {msg_size} bytes"))
                })?;
                tag(class, view.configure_message(pool.as_ref(), depth, msg_size)?).collect()
            }
            ChannelKind::Pointer => {
                let descriptors = self.pool(PoolClass::SharedDescriptor)?;
                let buffers = self.pool(PoolClass::Ptr128K)?;
                if msg_size > buffers.element_size() {
                    return Err(Error::InputInvalid(format!(
                        "message size {msg_size} exceeds {}-byte pointer buffers",
                        buffers.element_size()
                    )));
                }
                let (slots, free) =
                    view.configure_pointer(descriptors.as_ref(), buffers.as_ref(), depth, msg_size)?;
                tag(PoolClass::SharedDescriptor, slots)
                    .chain(tag(PoolClass::Ptr128K, free))
                    .collect()
            }
        };
        for class in PoolClass::ALL {
            if let Some(pool) = self.pools.get(class) {
                observability::record_pool_available(&format!("{class:?}"), pool.available());
            }
        }
        Ok(buffers)
    }

    fn release_buffers(&self, buffers: &[(PoolClass, VirtAddr)]) {
        for class in PoolClass::ALL {
            if let Some(pool) = self.pools.get(class) {
                let mine: Vec<_> = buffers
                    .iter()
                    .filter(|(c, _)| *c == class)
                    .map(|&(_, va)| va)
                    .collect();
                release(pool.as_ref(), &mine);
            }
        }
    }

    fn attach_event(&self, id: u32, block: &ChannelBlock) -> Result<(ChannelEvent, u32)> {
        let event = ChannelEvent::new().inspect_err(|err| {
            error!(channel = id, %err, "cannot create channel event");
        })?;
        let msi = self
            .devices
            .control
            .register_event(id, event.as_fd())
            .map_err(|err| {
                error!(channel = id, %err, "event registration failed");
                Error::EventFailure(format!("channel {id}: {err}"))
            })?;
        block.msi_value.store(msi, Ordering::Relaxed);
        block.msi_valid.store(1, Ordering::Release);
        info!(channel = id, msi, "channel event registered");
        Ok((event, msi))
    }

    // -------------------------------------------------------------------------
    // Data path
    // -------------------------------------------------------------------------

    /// Copy `payload` into the next slot of message channel `id`.
    ///
    /// Fails with [`Error::ChannelFull`] when every slot is in flight.
    pub fn send(&self, id: u32, payload: &[u8]) -> Result<()> {
        let _enter = self.span.enter();
        let ch = self
            .view(id, Operation::SendMsg, Some(ChannelKind::Message))
            .map_err(|err| self.fail(id, err))?;
        ch.send(payload).map_err(|err| self.fail(id, err))?;
        self.record_sent(&ch, payload.len());
        Ok(())
    }

    /// Copy the next message of channel `id` into `buf`; returns its length.
    ///
    /// Fails with [`Error::ChannelEmpty`] when nothing is pending.
    pub fn recv(&self, id: u32, buf: &mut [u8]) -> Result<usize> {
        let _enter = self.span.enter();
        let ch = self
            .view(id, Operation::RecvMsg, Some(ChannelKind::Message))
            .map_err(|err| self.fail(id, err))?;
        let len = ch.recv(buf).map_err(|err| self.fail(id, err))?;
        self.record_received(&ch, len);
        Ok(len)
    }

    /// Take the next buffer descriptor of pointer channel `id`.
    pub fn recv_ptr(&self, id: u32) -> Result<SharedBuffer> {
        let _enter = self.span.enter();
        let ch = self
            .view(id, Operation::RecvPtr, Some(ChannelKind::Pointer))
            .map_err(|err| self.fail(id, err))?;
        let buffer = ch.recv_ptr().map_err(|err| self.fail(id, err))?;
        self.record_received(&ch, buffer.len());
        Ok(buffer)
    }

    /// Locate the next message of channel `id` without copying or releasing
    /// it. Call [`mark_consumed`](Self::mark_consumed) when done with it.
    pub fn recv_ptr_noncopy(&self, id: u32) -> Result<PendingMessage> {
        let _enter = self.span.enter();
        let ch = self
            .view(id, Operation::RecvNonCopy, None)
            .map_err(|err| self.fail(id, err))?;
        ch.peek().map_err(|err| self.fail(id, err))
    }

    /// Release the message at the head of channel `id`.
    pub fn mark_consumed(&self, id: u32) -> Result<()> {
        let _enter = self.span.enter();
        let ch = self
            .view(id, Operation::MarkConsumed, None)
            .map_err(|err| self.fail(id, err))?;
        let len = ch.mark_consumed().map_err(|err| self.fail(id, err))?;
        self.record_received(&ch, len as usize);
        Ok(())
    }

    /// Borrow the payload of a pending message.
    ///
    /// The bytes stay valid until the message is marked consumed.
    pub fn message_bytes(&self, pending: &PendingMessage) -> Result<&[u8]> {
        self.regions.translator().bytes(pending.addr(), pending.len())
    }

    /// Borrow the payload of a received buffer.
    pub fn buffer_bytes(&self, buffer: &SharedBuffer) -> Result<&[u8]> {
        self.regions.translator().bytes(buffer.addr(), buffer.len())
    }

    /// Return a received buffer to the free list of pointer channel `id`.
    ///
    /// On failure the buffer comes back inside the error.
    pub fn put_buf(&self, id: u32, buffer: SharedBuffer) -> std::result::Result<(), PutBufError> {
        let _enter = self.span.enter();
        let ch = match self.view(id, Operation::PutBuf, Some(ChannelKind::Pointer)) {
            Ok(ch) => ch,
            Err(err) => {
                return Err(PutBufError {
                    error: self.fail(id, err),
                    buffer,
                });
            }
        };
        ch.put_buf(buffer).map_err(|PutBufError { error, buffer }| PutBufError {
            error: self.fail(id, error),
            buffer,
        })
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Is the configuration bit of `id` set?
    pub fn is_channel_configured(&self, id: u32) -> bool {
        self.block().is_ok_and(|block| block.is_configured(id))
    }

    /// Copy of the configuration bitmask.
    pub fn configured_channels(&self) -> Result<[u32; CFGMASK_WORDS]> {
        Ok(self.block()?.configured_mask())
    }

    /// The event bound to channel `id`, if it was configured with one.
    pub fn get_event_handle(&self, id: u32) -> Result<Option<&ChannelEvent>> {
        Operation::GetEventHandle.check(Side::Host)?;
        self.channel_block(id).map_err(|err| self.fail(id, err))?;
        Ok(self.local(id).and_then(|local| local.event.as_ref()))
    }

    /// MSI value assigned to channel `id`, if any.
    pub fn msi_value(&self, id: u32) -> Option<u32> {
        self.local(id).and_then(|local| local.msi)
    }

    /// Discipline, depth and message size of channel `id`.
    pub fn channel_info(&self, id: u32) -> Option<(ChannelKind, u32, u32)> {
        self.local(id)
            .map(|local| (local.kind, local.depth, local.msg_size))
    }

    /// Snapshot of one ring of channel `id`.
    pub fn ring_state(&self, id: u32, ring: RingKind) -> Result<RingState> {
        let block = self.channel_block(id)?;
        Ok(match ring {
            RingKind::Message => block.msg_ring.md.snapshot(),
            RingKind::BufferList => block.bl_ring.md.snapshot(),
        })
    }

    /// Host counters of channel `id`.
    pub fn counters(&self, id: u32) -> Result<ChannelCounters> {
        let hif = self.hif()?;
        hif.host_stats
            .channel(id)
            .map(|stats| stats.snapshot())
            .ok_or_else(|| Error::ChannelInvalid(format!("channel {id} out of range")))
    }

    /// Modem counters of channel `id`.
    pub fn peer_counters(&self, id: u32) -> Result<ChannelCounters> {
        let hif = self.hif()?;
        hif.modem_stats
            .channel(id)
            .map(|stats| stats.snapshot())
            .ok_or_else(|| Error::ChannelInvalid(format!("channel {id} out of range")))
    }

    /// Host instance-wide counters.
    pub fn global_counters(&self) -> Result<GlobalCounters> {
        Ok(self.hif()?.host_stats.global())
    }

    // -------------------------------------------------------------------------
    // Readiness handshake
    // -------------------------------------------------------------------------

    /// Tell the modem the application finished configuring.
    pub fn set_host_ready(&self) -> Result<()> {
        self.hif()?.set_host_ready(ReadyFlags::IPC_APP);
        info!(instance = self.id, "host ready");
        Ok(())
    }

    /// Has the modem application signalled ready?
    pub fn is_modem_ready(&self) -> Result<bool> {
        Ok(self.hif()?.modem_ready().contains(ReadyFlags::IPC_APP))
    }

    /// Poll [`is_modem_ready`](Self::is_modem_ready) until it holds or
    /// `timeout` passes.
    pub fn wait_modem_ready(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_modem_ready()? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    fn teardown(&mut self) {
        for (id, slot) in self.channels.iter_mut().enumerate() {
            let Some(local) = slot.get_mut() else {
                continue;
            };
            if let Some(event) = local.event.take() {
                if let Err(err) = self.devices.control.deregister_event(id as u32, event.as_fd()) {
                    warn!(channel = id, %err, "event deregistration failed");
                }
            }
        }
    }

    /// Deregister events, close the devices and unmap the regions.
    ///
    /// Ring state is left as is; pool buffers placed in rings stay there.
    pub fn shutdown(mut self) {
        let span = self.span.clone();
        let _enter = span.enter();
        self.teardown();
        info!(instance = self.id, "IPC instance shut down");
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("regions", &self.regions)
            .field("pools", &self.pools)
            .field(
                "configured",
                &self.channels.iter().filter(|c| c.get().is_some()).count(),
            )
            .finish()
    }
}
