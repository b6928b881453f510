//! Shared harness for session-level tests: a simulated context behind a
//! real session, driven through one half of a Unix socket pair exactly
//! like a transport carrier would.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use iiod_core::backend::IioContext;
use iiod_core::io::Transport;
use iiod_core::sim::SimContext;
use iiod_proto::prelude::*;

pub struct Harness {
    pub ctx: Arc<SimContext>,
    pub registries: Arc<Registries>,
}

impl Harness {
    pub fn new(ctx: Arc<SimContext>) -> Self {
        Self {
            ctx,
            registries: Registries::new(),
        }
    }

    /// Open one session; returns the client side of the wire, the session
    /// and the thread driving its reader loop.
    pub fn connect(&self, demux: bool) -> (Client, Arc<Session>, JoinHandle<()>) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let transport = Transport::from_unix(ours, "test").unwrap();
        let session = Session::new(
            Arc::clone(&self.ctx) as Arc<dyn IioContext>,
            Arc::clone(&self.registries),
            transport,
            SessionOptions { demux },
        )
        .unwrap();

        let runner = Arc::clone(&session);
        let handle = std::thread::spawn(move || runner.run());

        theirs
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        (Client { stream: theirs }, session, handle)
    }
}

pub struct Client {
    pub stream: UnixStream,
}

impl Client {
    pub fn send(&mut self, cmd: Command) {
        self.stream.write_all(&cmd.encode()).unwrap();
    }

    pub fn send_with(&mut self, cmd: Command, payload: &[u8]) {
        self.stream.write_all(&cmd.encode()).unwrap();
        self.stream.write_all(payload).unwrap();
    }

    /// Read one response record (header + declared payload).
    pub fn response(&mut self) -> (ResponseHeader, Vec<u8>) {
        let mut raw = [0u8; HDR_SIZE];
        self.stream.read_exact(&mut raw).unwrap();
        let hdr = ResponseHeader::decode(&raw);
        let mut payload = vec![0u8; hdr.payload_size as usize];
        self.stream.read_exact(&mut payload).unwrap();
        (hdr, payload)
    }

    /// Send a command and read one response, asserting the correlation id
    /// matches.
    pub fn round_trip(&mut self, cmd: Command) -> (i32, Vec<u8>) {
        let client_id = cmd.client_id;
        self.send(cmd);
        let (hdr, payload) = self.response();
        assert_eq!(hdr.client_id, client_id, "response correlation mismatch");
        (hdr.code, payload)
    }

    pub fn round_trip_with(&mut self, cmd: Command, payload: &[u8]) -> (i32, Vec<u8>) {
        let client_id = cmd.client_id;
        self.send_with(cmd, payload);
        let (hdr, resp) = self.response();
        assert_eq!(hdr.client_id, client_id, "response correlation mismatch");
        (hdr.code, resp)
    }
}

/// `u64` little-endian length prefix used by writes and transfers.
pub fn le64(value: u64) -> [u8; 8] {
    value.to_le_bytes()
}

/// A single-device context with forced channels, for mask reconciliation
/// and demux tests.
pub fn reconciling_context() -> Arc<SimContext> {
    use iiod_core::backend::AttrSource;
    use iiod_core::sim::SimDevice;

    let mut adc = SimDevice::new("iio:device0", 0, false);
    adc.add_channel("voltage0", 2)
        .add_channel("voltage1", 2)
        .add_channel("voltage2", 2)
        .add_attr(AttrSource::Device, "sampling_frequency", "1000");
    adc.force_channels(&[1]);

    SimContext::new(
        "sim-reconcile",
        bytes::Bytes::from_static(b"<iiod-context name=\"sim-reconcile\"/>"),
        vec![Arc::new(adc)],
    )
}
