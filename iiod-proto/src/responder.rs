//! Bidirectional command/response multiplexer.
//!
//! One responder rides one byte-stream. Many exchanges are in flight at
//! once, correlated by `client_id`; responses may be delivered in any
//! order relative to command arrival (no head-of-line blocking).
//!
//! Roles:
//! - The reader loop decodes inbound records and dispatches commands to
//!   the registered [`CommandHandler`]; command payloads are pulled from
//!   inside the dispatch callback through [`CommandData`].
//! - All outbound bytes go through one writer mutex, so a response header
//!   and its payload segments are contiguous on the wire.
//! - An [`IiodIo`] is a shared response handle for one `client_id`. Long
//!   lived handles (blocks, event streams, outgoing commands) are
//!   registered with the responder so shutdown can cancel them.
//!
//! The protocol is symmetric: an inbound record whose `client_id` matches
//! a registered outgoing-command waiter is parsed as a Response, anything
//! else as a Command. Each direction allocates its own ids, and this side
//! allocates so few (commands to the peer are rare) that the rule is
//! unambiguous in practice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use iiod_core::error::{IiodError, Result};
use iiod_core::io::{TransportReader, TransportWriter};
use iiod_core::pool::StopHandle;

use crate::wire::{Command, ResponseHeader, HDR_SIZE};

/// Receives decoded commands from the reader loop.
pub trait CommandHandler: Send + Sync {
    /// Handle one command. The payload, if the opcode has one, must be
    /// consumed from `data` before returning; handlers that enqueue
    /// background work send no response here, everyone else responds
    /// before returning.
    fn handle_command(&self, responder: &Responder, cmd: &Command, data: &mut CommandData<'_>);
}

/// Pull interface for a command's payload bytes.
///
/// Streams payload out of the reader loop without buffering it whole;
/// an EOF seen here terminates the reader loop after dispatch returns.
pub struct CommandData<'a> {
    reader: &'a mut TransportReader,
    eof: bool,
}

impl CommandData<'_> {
    /// Fill `buf` from the command payload.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.reader.read_full(buf) {
            Ok(0) => {
                self.eof = true;
                Err(IiodError::Closed)
            }
            Ok(_) => Ok(()),
            Err(e) => {
                self.eof = true;
                Err(e)
            }
        }
    }

    /// Read a little-endian `u64` length prefix.
    pub fn read_u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        self.read_exact(&mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    /// Consume and drop `n` payload bytes (keeps framing on error paths).
    pub fn discard(&mut self, n: usize) -> Result<()> {
        match self.reader.discard(n) {
            Ok(0) if n > 0 => {
                self.eof = true;
                Err(IiodError::Closed)
            }
            Ok(_) => Ok(()),
            Err(e) => {
                self.eof = true;
                Err(e)
            }
        }
    }
}

struct Inner {
    writer: Mutex<TransportWriter>,
    /// Long-lived local response handles, keyed by `client_id`.
    tracked: Mutex<HashMap<u16, Arc<IiodIo>>>,
    /// Outgoing commands awaiting a peer response.
    waiters: Mutex<HashMap<u16, Arc<IiodIo>>>,
    stop: StopHandle,
    closed: AtomicBool,
}

impl Inner {
    /// Write `parts` contiguously under the writer mutex. Any failure or
    /// EOF converts to transport-eof and raises the stop signal.
    fn write_record(&self, parts: &[&[u8]]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(IiodError::Closed);
        }
        let mut writer = self.writer.lock();
        for part in parts {
            match writer.write_full(part) {
                Ok(0) => {
                    drop(writer);
                    self.mark_closed();
                    return Err(IiodError::Closed);
                }
                Ok(_) => {}
                Err(e) => {
                    drop(writer);
                    self.mark_closed();
                    warn!("response write failed: {e}");
                    return Err(IiodError::Closed);
                }
            }
        }
        Ok(())
    }

    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stop.raise();
            for (_, io) in self.tracked.lock().drain() {
                io.cancel();
            }
            for (_, io) in self.waiters.lock().drain() {
                io.cancel();
            }
            debug!("responder closed");
        }
    }
}

/// Shared response handle for one `client_id`.
///
/// Reference counting (via `Arc`) lets the handle outlive the command
/// scope that created it: a block or event stream keeps its handle for
/// the lifetime of the record and completes it from a task worker.
pub struct IiodIo {
    client_id: u16,
    inner: Weak<Inner>,
    state: Mutex<IoState>,
    avail: Condvar,
}

struct IoState {
    answer: Option<(i32, Bytes)>,
    cancelled: bool,
}

impl IiodIo {
    fn new(client_id: u16, inner: &Arc<Inner>) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            inner: Arc::downgrade(inner),
            state: Mutex::new(IoState {
                answer: None,
                cancelled: false,
            }),
            avail: Condvar::new(),
        })
    }

    /// The correlation id this handle answers on.
    #[must_use]
    pub fn client_id(&self) -> u16 {
        self.client_id
    }

    /// Send a response whose payload is the concatenation of `bufs`
    /// (`nb_bufs` records the logical segmentation).
    pub fn send_response(&self, code: i32, bufs: &[Bytes]) -> Result<()> {
        let inner = self.inner.upgrade().ok_or(IiodError::Closed)?;
        let payload_size: usize = bufs.iter().map(Bytes::len).sum();
        let hdr = ResponseHeader {
            client_id: self.client_id,
            code,
            payload_size: payload_size as u32,
            nb_bufs: bufs.len() as u16,
        }
        .encode();

        let mut parts: Vec<&[u8]> = Vec::with_capacity(1 + bufs.len());
        parts.push(&hdr);
        for b in bufs {
            parts.push(b);
        }
        inner.write_record(&parts)
    }

    /// Send a payload-less response carrying only `code`.
    pub fn send_response_code(&self, code: i32) -> Result<()> {
        self.send_response(code, &[])
    }

    /// Block until the peer answers on this `client_id`, or the handle is
    /// cancelled.
    pub fn wait_response(&self) -> Result<(i32, Bytes)> {
        let mut st = self.state.lock();
        loop {
            if let Some(answer) = st.answer.take() {
                return Ok(answer);
            }
            if st.cancelled {
                return Err(IiodError::Cancelled);
            }
            self.avail.wait(&mut st);
        }
    }

    /// Mark cancelled and wake any waiter.
    pub fn cancel(&self) {
        let mut st = self.state.lock();
        st.cancelled = true;
        self.avail.notify_all();
    }

    /// Whether [`cancel`](Self::cancel) has run.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    fn complete(&self, code: i32, payload: Bytes) {
        let mut st = self.state.lock();
        st.answer = Some((code, payload));
        self.avail.notify_all();
    }
}

/// The per-session responder.
#[derive(Clone)]
pub struct Responder {
    inner: Arc<Inner>,
}

impl Responder {
    /// Build a responder over the writing half of a transport.
    #[must_use]
    pub fn new(writer: TransportWriter, stop: StopHandle) -> Self {
        Self {
            inner: Arc::new(Inner {
                writer: Mutex::new(writer),
                tracked: Mutex::new(HashMap::new()),
                waiters: Mutex::new(HashMap::new()),
                stop,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// A transient handle for answering one command inline. Not
    /// registered: the dispatcher responds and drops it within the
    /// command scope.
    #[must_use]
    pub fn transient_io(&self, client_id: u16) -> Arc<IiodIo> {
        IiodIo::new(client_id, &self.inner)
    }

    /// Register a long-lived handle for `client_id` (block or event
    /// stream). At most one may exist per id; a second registration
    /// fails with `Busy`.
    pub fn create_io(&self, client_id: u16) -> Result<Arc<IiodIo>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(IiodError::Closed);
        }
        let mut tracked = self.inner.tracked.lock();
        match tracked.entry(client_id) {
            Entry::Occupied(_) => Err(IiodError::Busy),
            Entry::Vacant(slot) => {
                let io = IiodIo::new(client_id, &self.inner);
                slot.insert(Arc::clone(&io));
                Ok(io)
            }
        }
    }

    /// Drop the registration of a long-lived handle.
    pub fn remove_io(&self, io: &IiodIo) {
        let mut tracked = self.inner.tracked.lock();
        if let Some(existing) = tracked.get(&io.client_id) {
            if std::ptr::eq(existing.as_ref(), io) {
                tracked.remove(&io.client_id);
            }
        }
    }

    /// Issue a command to the peer and wait for the correlated response.
    pub fn exec(&self, cmd: Command, payload: &[Bytes]) -> Result<(i32, Bytes)> {
        let io = {
            let mut waiters = self.inner.waiters.lock();
            match waiters.entry(cmd.client_id) {
                Entry::Occupied(_) => return Err(IiodError::Busy),
                Entry::Vacant(slot) => {
                    let io = IiodIo::new(cmd.client_id, &self.inner);
                    slot.insert(Arc::clone(&io));
                    io
                }
            }
        };

        let hdr = cmd.encode();
        let mut parts: Vec<&[u8]> = Vec::with_capacity(1 + payload.len());
        parts.push(&hdr);
        for b in payload {
            parts.push(b);
        }
        if let Err(e) = self.inner.write_record(&parts) {
            self.inner.waiters.lock().remove(&cmd.client_id);
            return Err(e);
        }

        let res = io.wait_response();
        self.inner.waiters.lock().remove(&cmd.client_id);
        res
    }

    /// Drive the inbound loop until EOF, an I/O error, or cancellation.
    /// Tears the responder down before returning.
    pub fn run_reader(&self, reader: &mut TransportReader, handler: &dyn CommandHandler) {
        loop {
            let mut hdr = [0u8; HDR_SIZE];
            match reader.read_full(&mut hdr) {
                Ok(0) => {
                    debug!("transport EOF");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("header read failed: {e}");
                    break;
                }
            }

            let client_id = u16::from_le_bytes([hdr[0], hdr[1]]);
            let waiter = self.inner.waiters.lock().remove(&client_id);
            if let Some(io) = waiter {
                // Response to one of our outgoing commands.
                let resp = ResponseHeader::decode(&hdr);
                let mut payload = vec![0u8; resp.payload_size as usize];
                if resp.payload_size > 0 {
                    match reader.read_full(&mut payload) {
                        Ok(0) => {
                            io.cancel();
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("response payload read failed: {e}");
                            io.cancel();
                            break;
                        }
                    }
                }
                io.complete(resp.code, Bytes::from(payload));
            } else {
                let cmd = Command::decode(&hdr);
                trace!(
                    client_id = cmd.client_id,
                    dev = cmd.dev_idx,
                    op = cmd.op,
                    code = cmd.code,
                    "command"
                );
                let mut data = CommandData { reader, eof: false };
                handler.handle_command(self, &cmd, &mut data);
                if data.eof {
                    debug!("EOF inside command payload");
                    break;
                }
            }
        }
        self.shutdown();
    }

    /// Close the responder: raise the stop signal and cancel every
    /// registered handle. Idempotent.
    pub fn shutdown(&self) {
        self.inner.mark_closed();
    }

    /// Whether the responder has been shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Opcode;
    use iiod_core::io::Transport;
    use iiod_core::pool::ThreadPool;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    struct EchoCode;

    impl CommandHandler for EchoCode {
        fn handle_command(&self, responder: &Responder, cmd: &Command, _data: &mut CommandData<'_>) {
            let io = responder.transient_io(cmd.client_id);
            let _ = io.send_response_code(cmd.code);
        }
    }

    fn harness() -> (Responder, TransportReader, UnixStream, ThreadPool) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let pool = ThreadPool::new().unwrap();
        let transport = Transport::from_unix(ours, "test").unwrap();
        let (reader, writer) = transport.split(&pool.stop_handle()).unwrap();
        (Responder::new(writer, pool.stop_handle()), reader, theirs, pool)
    }

    #[test]
    fn test_response_header_and_payload_are_contiguous() {
        let (responder, _reader, mut peer, _pool) = harness();
        let io = responder.transient_io(9);
        io.send_response(8, &[Bytes::from_static(b"abcd"), Bytes::from_static(b"efgh")])
            .unwrap();

        let mut raw = [0u8; HDR_SIZE + 8];
        peer.read_exact(&mut raw).unwrap();
        let hdr = ResponseHeader::decode(&raw[..HDR_SIZE].try_into().unwrap());
        assert_eq!(hdr.client_id, 9);
        assert_eq!(hdr.code, 8);
        assert_eq!(hdr.payload_size, 8);
        assert_eq!(hdr.nb_bufs, 2);
        assert_eq!(&raw[HDR_SIZE..], b"abcdefgh");
    }

    #[test]
    fn test_reader_dispatches_commands() {
        let (responder, mut reader, mut peer, _pool) = harness();

        let t = std::thread::spawn(move || {
            let cmd = Command::new(3, 0, Opcode::Timeout, 1500);
            peer.write_all(&cmd.encode()).unwrap();
            let mut raw = [0u8; HDR_SIZE];
            peer.read_exact(&mut raw).unwrap();
            let hdr = ResponseHeader::decode(&raw);
            assert_eq!(hdr.client_id, 3);
            assert_eq!(hdr.code, 1500);
            drop(peer); // EOF ends the reader loop
        });

        responder.run_reader(&mut reader, &EchoCode);
        assert!(responder.is_closed());
        t.join().unwrap();
    }

    #[test]
    fn test_create_io_enforces_single_outstanding() {
        let (responder, _reader, _peer, _pool) = harness();
        let io = responder.create_io(5).unwrap();
        assert!(matches!(responder.create_io(5), Err(IiodError::Busy)));
        responder.remove_io(&io);
        let _ = responder.create_io(5).unwrap();
    }

    #[test]
    fn test_shutdown_cancels_registered_handles() {
        let (responder, _reader, _peer, pool) = harness();
        let io = responder.create_io(2).unwrap();

        let waiter = {
            let io = Arc::clone(&io);
            std::thread::spawn(move || io.wait_response())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        responder.shutdown();
        assert!(matches!(waiter.join().unwrap(), Err(IiodError::Cancelled)));
        assert!(pool.is_stopped());
    }

    #[test]
    fn test_exec_correlates_peer_response() {
        let (responder, mut reader, mut peer, _pool) = harness();

        // Peer: read our command, answer it, then send a command of its
        // own so the reader loop has something to dispatch.
        let t = std::thread::spawn(move || {
            let mut raw = [0u8; HDR_SIZE];
            peer.read_exact(&mut raw).unwrap();
            let cmd = Command::decode(&raw);
            assert_eq!(cmd.client_id, 11);
            let resp = ResponseHeader {
                client_id: 11,
                code: 4,
                payload_size: 4,
                nb_bufs: 1,
            };
            peer.write_all(&resp.encode()).unwrap();
            peer.write_all(b"pong").unwrap();
            drop(peer);
        });

        let runner = {
            let responder = responder.clone();
            std::thread::spawn(move || responder.run_reader(&mut reader, &EchoCode))
        };

        let (code, payload) = responder
            .exec(Command::new(11, 0, Opcode::Print, 0), &[])
            .unwrap();
        assert_eq!(code, 4);
        assert_eq!(payload.as_ref(), b"pong");
        t.join().unwrap();
        runner.join().unwrap();
    }
}
