//! Per-client session lifecycle.
//!
//! A session is created when a transport carrier accepts a connection
//! and owns everything kernel-facing that the client creates: buffers
//! (with their blocks) and event streams. The global registries only
//! index those records; a registry entry is always detached before the
//! record it points to is torn down.
//!
//! Teardown order on disconnect:
//! 1. event streams: detach from the registry, stop the pump, drop
//! 2. buffers: leave each shared record; the last client out stops the
//!    tasks, frees the blocks (cancelling any pending response handle)
//!    and destroys the kernel buffer
//! 3. drain the responder and the session pool
//! 4. drop the context handle

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use iiod_core::backend::IioContext;
use iiod_core::error::Result;
use iiod_core::io::{Transport, TransportReader};
use iiod_core::pool::ThreadPool;

use crate::buffer::{BufferKey, BufferRegistry};
use crate::evstream::{EvStreamKey, EvStreamRegistry};
use crate::responder::Responder;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Registries shared by every session of one daemon instance. They
/// enforce cross-session exclusivity of `(dev, idx)` buffers and
/// `(dev, client)` event streams.
#[derive(Default)]
pub struct Registries {
    pub buffers: BufferRegistry,
    pub evstreams: EvStreamRegistry,
}

impl Registries {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Tunables a carrier passes down to each session.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    /// Re-slice RX payloads to each client's requested channels.
    pub demux: bool,
}

struct Owned {
    buffers: Vec<BufferKey>,
    evstreams: Vec<EvStreamKey>,
}

/// One connected client.
pub struct Session {
    id: u64,
    ctx: Arc<dyn IioContext>,
    registries: Arc<Registries>,
    pool: ThreadPool,
    responder: Responder,
    options: SessionOptions,
    owned: Mutex<Owned>,
    reader: Mutex<Option<TransportReader>>,
    torn_down: AtomicBool,
}

impl Session {
    /// Bind a session to an accepted transport.
    pub fn new(
        ctx: Arc<dyn IioContext>,
        registries: Arc<Registries>,
        transport: Transport,
        options: SessionOptions,
    ) -> Result<Arc<Self>> {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let pool = ThreadPool::new()?;
        let name = transport.name().to_string();
        let (reader, writer) = transport.split(&pool.stop_handle())?;
        let responder = Responder::new(writer, pool.stop_handle());
        info!(session = id, transport = %name, "session opened");

        Ok(Arc::new(Self {
            id,
            ctx,
            registries,
            pool,
            responder,
            options,
            owned: Mutex::new(Owned {
                buffers: Vec::new(),
                evstreams: Vec::new(),
            }),
            reader: Mutex::new(Some(reader)),
            torn_down: AtomicBool::new(false),
        }))
    }

    /// Session identity (ownership checks in the registries).
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The IIO context this session talks to.
    #[must_use]
    pub fn ctx(&self) -> &Arc<dyn IioContext> {
        &self.ctx
    }

    /// The session's responder.
    #[must_use]
    pub fn responder(&self) -> &Responder {
        &self.responder
    }

    /// The session's worker pool.
    #[must_use]
    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// Shared registries.
    #[must_use]
    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    /// Session tunables.
    #[must_use]
    pub fn options(&self) -> SessionOptions {
        self.options
    }

    /// Record ownership of a freshly created buffer.
    pub(crate) fn adopt_buffer(&self, key: BufferKey) {
        self.owned.lock().buffers.push(key);
    }

    /// Forget a buffer freed by the client.
    pub(crate) fn disown_buffer(&self, key: BufferKey) {
        self.owned.lock().buffers.retain(|k| *k != key);
    }

    /// Record ownership of a freshly created event stream.
    pub(crate) fn adopt_evstream(&self, key: EvStreamKey) {
        self.owned.lock().evstreams.push(key);
    }

    /// Forget an event stream freed by the client.
    pub(crate) fn disown_evstream(&self, key: EvStreamKey) {
        self.owned.lock().evstreams.retain(|k| *k != key);
    }

    /// Drive the session to completion: run the responder's reader loop
    /// on the calling thread, then tear everything down. The caller must
    /// not be a worker of this session's pool.
    pub fn run(self: &Arc<Self>) {
        let reader = self.reader.lock().take();
        if let Some(mut reader) = reader {
            self.responder.run_reader(&mut reader, &**self);
        }
        self.teardown();
    }

    /// Ordered teardown. Idempotent: a second caller returns while the
    /// first is still at work, so repeated transport closure leaves at
    /// most one teardown in progress.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(session = self.id, "teardown start");

        let (evstreams, buffers) = {
            let mut owned = self.owned.lock();
            (
                std::mem::take(&mut owned.evstreams),
                std::mem::take(&mut owned.buffers),
            )
        };

        for key in evstreams {
            if let Some(entry) = self.registries.evstreams.remove(key) {
                entry.free(&self.responder);
            }
        }

        for key in buffers {
            // Detaches this session from shared records; the last client
            // out runs the full teardown.
            let _ = self.registries.buffers.leave(key, self.id, &self.responder);
        }

        self.responder.shutdown();
        self.pool.stop_and_wait();
        info!(session = self.id, "session closed");
        // The context handle (an Arc clone) dies with the session.
    }
}
