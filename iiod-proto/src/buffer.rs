//! Buffer multiplexer.
//!
//! Arbitrates many concurrent clients over one kernel sample buffer.
//! A `(dev_idx, buf_idx)` key maps to a single [`BufferEntry`] that
//! every interested session *joins*: the kernel buffer carries the
//! union of all joined clients' channel masks, RX completions are
//! demultiplexed down to each block owner's requested channels, and all
//! clients' TX blocks are serialized into the one kernel stream by the
//! shared enqueue task (the writer mux). Only cyclic mode is exclusive.
//!
//! Invariants:
//! - the two workers are either both running or both stopped; a `Stop`
//!   sentinel flows through the enqueue queue and is forwarded to the
//!   dequeue queue, so stopping drains in-flight work in FIFO order
//! - the kernel side runs while at least one client is enabled; the
//!   record dies when the last client leaves
//! - the union mask only grows while the kernel side is idle (no
//!   blocks, no workers), so a block's frame layout never changes
//!   while it is in flight
//! - a kernel block is *moved* into a worker for the duration of a
//!   kernel call; a concurrent free marks the record and the worker
//!   drops the kernel object on the way out, so nothing kernel-owned is
//!   referenced after destroy
//! - cyclic blocks complete on enqueue and never reach the dequeue queue

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use iiod_core::backend::{IioBlock, IioBuffer, IioDevice};
use iiod_core::error::{IiodError, Result};
use iiod_core::mask::ChannelMask;
use iiod_core::pool::ThreadPool;

use crate::demux::{demux_samples, frame_size};
use crate::responder::{CommandData, IiodIo, Responder};

/// `(dev_idx, buf_idx)`: the global identity of a buffer.
pub type BufferKey = (u16, u16);

/// `(session, client_id)`: the identity of a block within a buffer.
/// Distinct sessions may reuse the same numeric `client_id`.
type BlockKey = (u64, u16);

enum Job {
    Block(Arc<BlockEntry>),
    Stop,
}

/// One client-visible transfer block.
pub struct BlockEntry {
    session: u64,
    client_id: u16,
    io: Arc<IiodIo>,
    /// Owner's requested channels, frozen at block creation (the union
    /// cannot change while blocks exist).
    client_mask: ChannelMask,
    demux: bool,
    state: Mutex<BlockState>,
}

struct BlockState {
    kblock: Option<Box<dyn IioBlock>>,
    capacity: usize,
    bytes_used: usize,
    cyclic: bool,
    /// Transfer accepted and not yet completed.
    queued: bool,
    /// Record freed; the kernel object dies at the next checkin.
    freed: bool,
}

impl BlockEntry {
    fn new(
        session: u64,
        client_id: u16,
        io: Arc<IiodIo>,
        kblock: Box<dyn IioBlock>,
        client_mask: ChannelMask,
        demux: bool,
    ) -> Arc<Self> {
        let capacity = kblock.capacity();
        Arc::new(Self {
            session,
            client_id,
            io,
            client_mask,
            demux,
            state: Mutex::new(BlockState {
                kblock: Some(kblock),
                capacity,
                bytes_used: 0,
                cyclic: false,
                queued: false,
                freed: false,
            }),
        })
    }

    /// Take the kernel block out for a kernel call. `None` when the
    /// record was freed or the block is already out.
    fn checkout(&self) -> Option<(Box<dyn IioBlock>, usize, bool)> {
        let mut st = self.state.lock();
        if st.freed {
            return None;
        }
        let kblock = st.kblock.take()?;
        Some((kblock, st.bytes_used, st.cyclic))
    }

    /// Re-attach the kernel block, or drop it if the record was freed in
    /// the meantime.
    fn checkin(&self, kblock: Box<dyn IioBlock>) {
        let mut st = self.state.lock();
        if !st.freed {
            st.kblock = Some(kblock);
        }
    }

    fn begin_transfer(&self, bytes_used: usize, cyclic: bool) -> Result<()> {
        let mut st = self.state.lock();
        if st.freed {
            return Err(IiodError::BadHandle);
        }
        if st.queued {
            return Err(IiodError::Busy);
        }
        if bytes_used > st.capacity {
            return Err(IiodError::InvalidArg);
        }
        st.bytes_used = bytes_used;
        st.cyclic = cyclic;
        st.queued = true;
        Ok(())
    }

    fn complete(&self) {
        self.state.lock().queued = false;
    }

    fn abort_transfer(&self) {
        self.state.lock().queued = false;
    }

    fn mark_freed(&self) {
        let mut st = self.state.lock();
        st.freed = true;
        // Drops the kernel block now if no worker holds it.
        st.kblock = None;
    }

    fn is_freed(&self) -> bool {
        self.state.lock().freed
    }
}

/// Per-session membership in a shared buffer.
struct ClientView {
    /// The channels this client asked for.
    mask: ChannelMask,
    /// Whether this client's RX payloads are re-sliced to `mask`.
    demux_active: bool,
    enabled: bool,
}

struct BufState {
    kbuf: Arc<dyn IioBuffer>,
    /// Union of every joined client's mask, kernel-reconciled.
    kernel_mask: ChannelMask,
    /// Bytes of one scan frame under `kernel_mask`.
    sample_size: usize,
    clients: HashMap<u64, ClientView>,
    blocks: HashMap<BlockKey, Arc<BlockEntry>>,
    running: bool,
    done_rx: Option<flume::Receiver<()>>,
    freed: bool,
}

/// What a departing client leaves behind.
enum Departure {
    Remaining(usize),
    Last,
}

/// One arbitration record: a kernel buffer plus its joined clients,
/// block list and the two task queues.
pub struct BufferEntry {
    key: BufferKey,
    device: Arc<dyn IioDevice>,
    cyclic: bool,
    is_output: bool,
    demux: bool,
    sample_sizes: Vec<usize>,
    enq_tx: flume::Sender<Job>,
    enq_rx: flume::Receiver<Job>,
    deq_tx: flume::Sender<Job>,
    deq_rx: flume::Receiver<Job>,
    state: Mutex<BufState>,
}

impl BufferEntry {
    /// Create the kernel buffer for the first client. The mask is
    /// kernel-reconciled; the returned bitmap is the one to answer the
    /// client with (its own mask when demuxing hides the reconciliation,
    /// the honored mask otherwise).
    fn create(
        key: BufferKey,
        session: u64,
        device: &Arc<dyn IioDevice>,
        raw_mask: &[u8],
        cyclic: bool,
        demux: bool,
    ) -> Result<(Arc<Self>, Bytes)> {
        let requested = ChannelMask::from_wire(raw_mask, device.nb_channels())?;
        if requested.is_empty() {
            return Err(IiodError::InvalidArg);
        }
        let mut kernel_mask = requested.clone();
        let kbuf = device.create_buffer(key.1, &mut kernel_mask)?;

        let sample_sizes = (0..device.nb_channels())
            .map(|chn| device.sample_size(chn))
            .collect::<Result<Vec<_>>>()?;
        let sample_size = frame_size(&kernel_mask, &sample_sizes);

        let demux_active =
            demux && requested != kernel_mask && requested.is_subset_of(&kernel_mask);
        let wire_mask = if demux_active {
            requested.to_wire()
        } else {
            kernel_mask.to_wire()
        };

        let mut clients = HashMap::new();
        clients.insert(
            session,
            ClientView {
                mask: requested,
                demux_active,
                enabled: false,
            },
        );

        let (enq_tx, enq_rx) = flume::unbounded();
        let (deq_tx, deq_rx) = flume::unbounded();
        let entry = Arc::new(Self {
            key,
            device: Arc::clone(device),
            cyclic,
            is_output: device.is_output(),
            demux,
            sample_sizes,
            enq_tx,
            enq_rx,
            deq_tx,
            deq_rx,
            state: Mutex::new(BufState {
                kbuf,
                kernel_mask,
                sample_size,
                clients,
                blocks: HashMap::new(),
                running: false,
                done_rx: None,
                freed: false,
            }),
        });
        debug!(dev = key.0, buf = key.1, cyclic, sample_size, "buffer created");
        Ok((entry, wire_mask))
    }

    /// Join an additional client onto an existing record, unioning its
    /// mask into the kernel scan.
    ///
    /// A mask inside the current union joins for free. A mask that needs
    /// more channels recreates the kernel buffer with the grown union,
    /// which is only legal while the kernel side is idle and with demux
    /// on (otherwise the earlier clients' frame layout would change
    /// underneath them); every joined client's demux view is recomputed
    /// against the new union.
    fn join(&self, session: u64, raw_mask: &[u8]) -> Result<Bytes> {
        let requested = ChannelMask::from_wire(raw_mask, self.device.nb_channels())?;
        if requested.is_empty() {
            return Err(IiodError::InvalidArg);
        }

        let mut st = self.state.lock();
        if st.freed {
            return Err(IiodError::Busy);
        }
        if st.clients.contains_key(&session) {
            return Err(IiodError::Busy);
        }

        if !requested.is_subset_of(&st.kernel_mask) {
            let idle = st.blocks.is_empty()
                && !st.running
                && !st.clients.values().any(|v| v.enabled);
            if !idle || !self.demux {
                return Err(IiodError::Busy);
            }
            let mut union = st.kernel_mask.clone();
            union.union_with(&requested);
            let kbuf = self.device.create_buffer(self.key.1, &mut union)?;
            let sample_size = frame_size(&union, &self.sample_sizes);
            // The old kernel buffer dies here; no blocks reference it.
            st.kbuf = kbuf;
            st.kernel_mask = union;
            st.sample_size = sample_size;

            let kernel_mask = st.kernel_mask.clone();
            for view in st.clients.values_mut() {
                view.demux_active = self.demux
                    && view.mask != kernel_mask
                    && view.mask.is_subset_of(&kernel_mask);
            }
            debug!(
                dev = self.key.0,
                buf = self.key.1,
                weight = st.kernel_mask.weight(),
                sample_size = st.sample_size,
                "scan mask unioned"
            );
        }

        let demux_active = self.demux
            && requested != st.kernel_mask
            && requested.is_subset_of(&st.kernel_mask);
        let wire_mask = if demux_active {
            requested.to_wire()
        } else {
            st.kernel_mask.to_wire()
        };
        st.clients.insert(
            session,
            ClientView {
                mask: requested,
                demux_active,
                enabled: false,
            },
        );
        debug!(dev = self.key.0, buf = self.key.1, session, "client joined");
        Ok(wire_mask)
    }

    /// Whether the buffer was created cyclic.
    #[must_use]
    pub fn is_cyclic(&self) -> bool {
        self.cyclic
    }

    /// Whether `session` has joined this buffer.
    #[must_use]
    pub fn is_member(&self, session: u64) -> bool {
        self.state.lock().clients.contains_key(&session)
    }

    /// Bytes of one scan frame under the current union mask.
    #[must_use]
    pub fn sample_size(&self) -> usize {
        self.state.lock().sample_size
    }

    /// Enable for one client. The workers and the kernel side start when
    /// the first client enables; the workers must be live before the
    /// kernel starts flowing.
    pub fn enable(self: &Arc<Self>, pool: &ThreadPool, session: u64) -> Result<()> {
        let kbuf = {
            let mut st = self.state.lock();
            if st.freed {
                return Err(IiodError::BadHandle);
            }
            let was_live = st.clients.values().any(|v| v.enabled);
            let view = st.clients.get_mut(&session).ok_or(IiodError::BadHandle)?;
            view.enabled = true;

            if !st.running {
                let (done_tx, done_rx) = flume::bounded(2);
                let enq = Arc::clone(self);
                let enq_done = done_tx.clone();
                pool.spawn(&format!("iio-enq-{}-{}", self.key.0, self.key.1), move |_stop| {
                    enq.run_enqueue(&enq_done);
                })?;
                let deq = Arc::clone(self);
                if let Err(e) = pool.spawn(
                    &format!("iio-deq-{}-{}", self.key.0, self.key.1),
                    move |_stop| {
                        deq.run_dequeue(&done_tx);
                    },
                ) {
                    // Recall the enqueue worker and poison the record: the
                    // queues are no longer coherent for a later enable.
                    let _ = self.enq_tx.send(Job::Stop);
                    st.freed = true;
                    return Err(e);
                }
                st.running = true;
                st.done_rx = Some(done_rx);
            }
            if was_live {
                return Ok(());
            }
            Arc::clone(&st.kbuf)
        };
        kbuf.enable()
    }

    /// Disable for one client. The kernel side stops, then the workers,
    /// once no client is enabled anymore; the kernel must be quiet
    /// before the workers go away.
    pub fn disable(&self, session: u64) -> Result<()> {
        let quiesce = {
            let mut st = self.state.lock();
            if st.freed {
                return Err(IiodError::BadHandle);
            }
            let view = st.clients.get_mut(&session).ok_or(IiodError::BadHandle)?;
            view.enabled = false;
            if st.clients.values().any(|v| v.enabled) {
                None
            } else {
                Some(Arc::clone(&st.kbuf))
            }
        };
        if let Some(kbuf) = quiesce {
            kbuf.disable()?;
            self.stop_tasks();
        }
        Ok(())
    }

    fn stop_tasks(&self) {
        let done_rx = {
            let mut st = self.state.lock();
            if !st.running {
                return;
            }
            st.running = false;
            st.done_rx.take()
        };
        let _ = self.enq_tx.send(Job::Stop);
        if let Some(done_rx) = done_rx {
            // One ack per worker; the Stop sentinel drains both queues in
            // FIFO order before the acks fire.
            let _ = done_rx.recv();
            let _ = done_rx.recv();
        }
        trace!(dev = self.key.0, buf = self.key.1, "buffer tasks stopped");
    }

    /// Allocate a block of `size` bytes for one client and register its
    /// response handle. The demux view is frozen into the block: the
    /// union cannot change while blocks exist.
    pub fn create_block(
        &self,
        responder: &Responder,
        session: u64,
        client_id: u16,
        size: usize,
    ) -> Result<()> {
        let mut st = self.state.lock();
        if st.freed {
            return Err(IiodError::BadHandle);
        }
        let (client_mask, demux_active) = {
            let view = st.clients.get(&session).ok_or(IiodError::BadHandle)?;
            (view.mask.clone(), view.demux_active)
        };
        let bkey = (session, client_id);
        if st.blocks.contains_key(&bkey) {
            return Err(IiodError::Busy);
        }
        let kblock = st.kbuf.create_block(size)?;
        let io = responder.create_io(client_id)?;
        st.blocks.insert(
            bkey,
            BlockEntry::new(session, client_id, io, kblock, client_mask, demux_active),
        );
        trace!(dev = self.key.0, buf = self.key.1, session, client_id, size, "block created");
        Ok(())
    }

    /// Accept a transfer: stage the payload (TX), then queue the block on
    /// the enqueue task. The completion travels on the block's own
    /// handle; this function only reports immediate validation errors.
    pub fn transfer(
        &self,
        session: u64,
        client_id: u16,
        bytes_used: u64,
        cyclic: bool,
        data: &mut CommandData<'_>,
    ) -> Result<()> {
        if bytes_used == 0 {
            return Err(IiodError::InvalidArg);
        }
        let bytes_used = bytes_used as usize;

        let block = {
            let st = self.state.lock();
            if st.freed {
                return Err(IiodError::BadHandle);
            }
            st.blocks.get(&(session, client_id)).cloned()
        };
        let Some(block) = block else {
            if self.is_output {
                // The payload is already on the wire; keep framing.
                data.discard(bytes_used)?;
            }
            return Err(IiodError::BadHandle);
        };

        if cyclic && !self.cyclic {
            if self.is_output {
                data.discard(bytes_used)?;
            }
            return Err(IiodError::InvalidArg);
        }

        if let Err(e) = block.begin_transfer(bytes_used, cyclic) {
            if self.is_output {
                data.discard(bytes_used)?;
            }
            return Err(e);
        }

        if self.is_output {
            // Pull the payload straight into the block's memory.
            let staged = (|| -> Result<()> {
                let Some((mut kblock, _, _)) = block.checkout() else {
                    return Err(IiodError::Busy);
                };
                let res = data.read_exact(&mut kblock.data()[..bytes_used]);
                block.checkin(kblock);
                res
            })();
            if let Err(e) = staged {
                block.abort_transfer();
                return Err(e);
            }
        }

        self.enq_tx
            .send(Job::Block(block))
            .map_err(|_| IiodError::BadHandle)
    }

    /// Remove a block: cancel its pending handle, then destroy the kernel
    /// object (deferred to the worker if the block is in flight).
    pub fn free_block(&self, responder: &Responder, session: u64, client_id: u16) -> Result<()> {
        let block = {
            let mut st = self.state.lock();
            st.blocks
                .remove(&(session, client_id))
                .ok_or(IiodError::BadHandle)?
        };
        block.mark_freed();
        block.io.cancel();
        responder.remove_io(&block.io);
        trace!(dev = self.key.0, buf = self.key.1, session, client_id, "block freed");
        Ok(())
    }

    /// Detach one client. A departing client's blocks are cancelled
    /// without disturbing the others; if it was the last enabled client
    /// the kernel side quiesces, and the last client overall reports
    /// [`Departure::Last`] so the registry can run the full teardown.
    fn detach_client(&self, session: u64, responder: &Responder) -> Result<Departure> {
        let (blocks, departure, quiesce) = {
            let mut st = self.state.lock();
            if st.clients.remove(&session).is_none() {
                return Err(IiodError::BadHandle);
            }
            if st.clients.is_empty() {
                // The whole record is going away; its blocks drain with
                // the workers in the full teardown.
                (Vec::new(), Departure::Last, None)
            } else {
                let keys: Vec<BlockKey> = st
                    .blocks
                    .keys()
                    .filter(|k| k.0 == session)
                    .copied()
                    .collect();
                let blocks: Vec<_> = keys.iter().filter_map(|k| st.blocks.remove(k)).collect();
                let quiesce = if st.running && !st.clients.values().any(|v| v.enabled) {
                    Some(Arc::clone(&st.kbuf))
                } else {
                    None
                };
                (blocks, Departure::Remaining(st.clients.len()), quiesce)
            }
        };

        for block in blocks {
            block.mark_freed();
            block.io.cancel();
            responder.remove_io(&block.io);
        }
        if let Some(kbuf) = quiesce {
            let _ = kbuf.disable();
            self.stop_tasks();
        }
        debug!(dev = self.key.0, buf = self.key.1, session, "client left");
        Ok(departure)
    }

    /// Full teardown once the last client is gone: unblock the kernel,
    /// drain the workers, cancel every block handle, then let the kernel
    /// buffer die with the record. The caller has already detached the
    /// record from the registry.
    fn free(&self, responder: &Responder) {
        let kbuf = {
            let mut st = self.state.lock();
            if st.freed {
                return;
            }
            st.freed = true;
            Arc::clone(&st.kbuf)
        };
        kbuf.cancel();
        self.stop_tasks();

        let blocks: Vec<_> = {
            let mut st = self.state.lock();
            st.blocks.drain().map(|(_, b)| b).collect()
        };
        for block in blocks {
            block.mark_freed();
            block.io.cancel();
            responder.remove_io(&block.io);
        }
        debug!(dev = self.key.0, buf = self.key.1, "buffer freed");
    }

    fn run_enqueue(&self, done: &flume::Sender<()>) {
        while let Ok(job) = self.enq_rx.recv() {
            match job {
                Job::Stop => {
                    let _ = self.deq_tx.send(Job::Stop);
                    break;
                }
                Job::Block(block) => {
                    let Some((mut kblock, bytes_used, cyclic)) = block.checkout() else {
                        continue;
                    };
                    trace!(
                        session = block.session,
                        client_id = block.client_id,
                        bytes_used,
                        cyclic,
                        "enqueue"
                    );
                    let res = kblock.enqueue(bytes_used, cyclic);
                    block.checkin(kblock);
                    match res {
                        Err(e) => {
                            block.complete();
                            if !block.is_freed() {
                                let _ = block.io.send_response_code(e.errno());
                            }
                        }
                        Ok(()) if cyclic => {
                            // Cyclic blocks are replayed by the kernel until
                            // destroy; nothing to dequeue.
                            block.complete();
                            if !block.is_freed() {
                                let _ = block.io.send_response_code(0);
                            }
                        }
                        Ok(()) => {
                            let _ = self.deq_tx.send(Job::Block(block));
                        }
                    }
                }
            }
        }
        let _ = done.send(());
    }

    fn run_dequeue(&self, done: &flume::Sender<()>) {
        while let Ok(job) = self.deq_rx.recv() {
            match job {
                Job::Stop => break,
                Job::Block(block) => {
                    let Some((mut kblock, _, _)) = block.checkout() else {
                        continue;
                    };
                    let res = kblock.dequeue();
                    block.complete();
                    match res {
                        Ok(n) => {
                            let n = n.min(kblock.capacity());
                            if block.is_freed() {
                                // Freed mid-flight; the handle is already
                                // cancelled, drop the data on the floor.
                            } else if self.is_output {
                                let _ = block.io.send_response_code(n as i32);
                            } else {
                                let data = &kblock.data()[..n];
                                let payload = if block.demux {
                                    let kernel_mask = self.state.lock().kernel_mask.clone();
                                    demux_samples(
                                        data,
                                        &kernel_mask,
                                        &block.client_mask,
                                        &self.sample_sizes,
                                    )
                                } else {
                                    Bytes::copy_from_slice(data)
                                };
                                let _ = block.io.send_response(payload.len() as i32, &[payload]);
                            }
                        }
                        Err(e) => {
                            if !block.is_freed() {
                                let _ = block.io.send_response_code(e.errno());
                            }
                        }
                    }
                    block.checkin(kblock);
                }
            }
        }
        let _ = done.send(());
    }
}

impl Drop for BufferEntry {
    fn drop(&mut self) {
        let st = self.state.lock();
        if !st.freed && st.running {
            warn!(dev = self.key.0, buf = self.key.1, "buffer dropped while running");
        }
    }
}

/// Global buffer registry. Lookup is lock-light (`get`); the
/// create/join/leave arbitration is serialized by a dedicated mutex so
/// two racing `CREATE_BUFFER`s can never allocate two kernel buffers
/// for one key.
#[derive(Default)]
pub struct BufferRegistry {
    map: DashMap<BufferKey, Arc<BufferEntry>>,
    arb: Mutex<()>,
}

impl BufferRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the record for `key`, or join the existing one with the
    /// client's mask unioned in. Only cyclic collides: creating cyclic
    /// on an occupied key, or joining an existing cyclic record, fails
    /// with `Busy`.
    pub fn create_or_join(
        &self,
        key: BufferKey,
        session: u64,
        device: &Arc<dyn IioDevice>,
        raw_mask: &[u8],
        cyclic: bool,
        demux: bool,
    ) -> Result<Bytes> {
        let _arb = self.arb.lock();
        if let Some(entry) = self.get(key) {
            if cyclic || entry.is_cyclic() {
                return Err(IiodError::Busy);
            }
            entry.join(session, raw_mask)
        } else {
            let (entry, wire_mask) =
                BufferEntry::create(key, session, device, raw_mask, cyclic, demux)?;
            self.map.insert(key, entry);
            Ok(wire_mask)
        }
    }

    /// Detach one client from `key`. The last departure removes the
    /// registry entry first, then tears the record down (registry
    /// detach always precedes the kernel teardown).
    pub fn leave(&self, key: BufferKey, session: u64, responder: &Responder) -> Result<()> {
        let _arb = self.arb.lock();
        let entry = self.get(key).ok_or(IiodError::BadHandle)?;
        match entry.detach_client(session, responder)? {
            Departure::Remaining(n) => {
                trace!(dev = key.0, buf = key.1, remaining = n, "buffer still shared");
            }
            Departure::Last => {
                self.map.remove(&key);
                entry.free(responder);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn get(&self, key: BufferKey) -> Option<Arc<BufferEntry>> {
        self.map.get(&key).map(|e| Arc::clone(&e))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
