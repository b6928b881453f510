//! Event stream forwarder.
//!
//! A device may produce asynchronous hardware events independently of
//! its sample buffer. Each stream record owns one lazy pump worker: a
//! `READ_EVENT` enqueues one job, the pump reads one event and completes
//! the record's [`IiodIo`]. Nonblocking reads bypass the pump entirely.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use smallvec::{smallvec, SmallVec};
use tracing::{debug, trace};

use iiod_core::backend::{IioDevice, IioEventStream};
use iiod_core::error::{IiodError, Result};
use iiod_core::pool::ThreadPool;

use crate::responder::{IiodIo, Responder};

/// `(dev_idx, client_id)`: the global identity of an event stream.
pub type EvStreamKey = (u16, u16);

enum EvJob {
    Read,
    Stop,
}

struct EvState {
    done_rx: Option<flume::Receiver<()>>,
    freed: bool,
}

/// One client's event stream on one device.
pub struct EvStreamEntry {
    key: EvStreamKey,
    owner: u64,
    stream: Arc<dyn IioEventStream>,
    io: Arc<IiodIo>,
    jobs_tx: flume::Sender<EvJob>,
    state: Mutex<EvState>,
}

impl EvStreamEntry {
    /// Open the kernel stream, register the response handle and start the
    /// pump worker.
    pub fn create(
        key: EvStreamKey,
        owner: u64,
        device: &Arc<dyn IioDevice>,
        responder: &Responder,
        pool: &ThreadPool,
    ) -> Result<Arc<Self>> {
        let stream = device.create_event_stream()?;
        let io = responder.create_io(key.1)?;
        let (jobs_tx, jobs_rx) = flume::unbounded();
        let (done_tx, done_rx) = flume::bounded(1);

        let entry = Arc::new(Self {
            key,
            owner,
            stream,
            io,
            jobs_tx,
            state: Mutex::new(EvState {
                done_rx: Some(done_rx),
                freed: false,
            }),
        });

        let pump = Arc::clone(&entry);
        if let Err(e) = pool.spawn(&format!("iio-ev-{}-{}", key.0, key.1), move |_stop| {
            pump.run_pump(&jobs_rx, &done_tx);
        }) {
            responder.remove_io(&entry.io);
            return Err(e);
        }
        debug!(dev = key.0, client_id = key.1, "event stream created");
        Ok(entry)
    }

    /// Session that created this stream.
    #[must_use]
    pub fn owner(&self) -> u64 {
        self.owner
    }

    /// Serve a `READ_EVENT`. Nonblocking reads run inline and respond
    /// immediately; blocking reads enqueue a pump job whose completion
    /// travels on the stream's handle.
    pub fn read_event(&self, nonblock: bool) -> Result<()> {
        {
            let st = self.state.lock();
            if st.freed {
                return Err(IiodError::BadHandle);
            }
        }
        if nonblock {
            match self.stream.read_event(true) {
                Ok(ev) => {
                    let payload: SmallVec<[Bytes; 1]> =
                        smallvec![Bytes::copy_from_slice(&ev.to_wire())];
                    self.io
                        .send_response(iiod_core::backend::IioEvent::WIRE_SIZE as i32, &payload)
                }
                Err(e) => self.io.send_response_code(e.errno()),
            }
        } else {
            self.jobs_tx
                .send(EvJob::Read)
                .map_err(|_| IiodError::BadHandle)
        }
    }

    /// Detached teardown: stop the pump, cancel the handle, drop the
    /// kernel stream. The caller has already removed the registry entry.
    pub fn free(&self, responder: &Responder) {
        {
            let mut st = self.state.lock();
            if st.freed {
                return;
            }
            st.freed = true;
        }
        self.stream.cancel();
        let done_rx = {
            let mut st = self.state.lock();
            st.done_rx.take()
        };
        let _ = self.jobs_tx.send(EvJob::Stop);
        if let Some(done_rx) = done_rx {
            let _ = done_rx.recv();
        }
        self.io.cancel();
        responder.remove_io(&self.io);
        debug!(dev = self.key.0, client_id = self.key.1, "event stream freed");
    }

    fn run_pump(&self, jobs: &flume::Receiver<EvJob>, done: &flume::Sender<()>) {
        while let Ok(job) = jobs.recv() {
            match job {
                EvJob::Stop => break,
                EvJob::Read => {
                    trace!(dev = self.key.0, client_id = self.key.1, "event read");
                    match self.stream.read_event(false) {
                        Ok(ev) => {
                            let payload: SmallVec<[Bytes; 1]> =
                                smallvec![Bytes::copy_from_slice(&ev.to_wire())];
                            let _ = self.io.send_response(
                                iiod_core::backend::IioEvent::WIRE_SIZE as i32,
                                &payload,
                            );
                        }
                        Err(IiodError::Cancelled) => {
                            // Stream freed underneath us; the handle is
                            // cancelled, nothing to send.
                        }
                        Err(e) => {
                            let _ = self.io.send_response_code(e.errno());
                        }
                    }
                }
            }
        }
        let _ = done.send(());
    }
}

/// Global event-stream registry, lookup only.
#[derive(Default)]
pub struct EvStreamRegistry {
    map: DashMap<EvStreamKey, Arc<EvStreamEntry>>,
}

impl EvStreamRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream; a duplicate `(dev, client)` fails with `Busy`.
    pub fn insert(&self, entry: Arc<EvStreamEntry>) -> Result<()> {
        match self.map.entry(entry.key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(IiodError::Busy),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn get(&self, key: EvStreamKey) -> Option<Arc<EvStreamEntry>> {
        self.map.get(&key).map(|e| Arc::clone(&e))
    }

    /// Detach a record so the caller can tear it down.
    pub fn remove(&self, key: EvStreamKey) -> Option<Arc<EvStreamEntry>> {
        self.map.remove(&key).map(|(_, e)| e)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
