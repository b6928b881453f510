//! End-to-end smoke test: a real TCP client against a live daemon
//! generation on an ephemeral port.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use iiod::daemon::{serve, Control, Outcome};
use iiod::{sim, IioContext, Registries, SessionOptions};
use iiod_proto::wire::{Command, Opcode, ResponseHeader, HDR_SIZE};

fn read_response(stream: &mut TcpStream) -> (ResponseHeader, Vec<u8>) {
    let mut raw = [0u8; HDR_SIZE];
    stream.read_exact(&mut raw).unwrap();
    let hdr = ResponseHeader::decode(&raw);
    let mut payload = vec![0u8; hdr.payload_size as usize];
    stream.read_exact(&mut payload).unwrap();
    (hdr, payload)
}

#[test]
fn tcp_client_round_trip_and_shutdown() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let control = Control::new().unwrap();
    let server = {
        let control = Arc::clone(&control);
        std::thread::spawn(move || {
            let ctx = sim::demo_context() as Arc<dyn IioContext>;
            serve(
                listener,
                ctx,
                Registries::new(),
                SessionOptions::default(),
                None,
                &control,
            )
            .unwrap()
        })
    };

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    // Attribute read on device 0.
    stream
        .write_all(&Command::new(1, 0, Opcode::ReadAttr, 0).encode())
        .unwrap();
    let (hdr, payload) = read_response(&mut stream);
    assert_eq!(hdr.client_id, 1);
    assert_eq!(hdr.code, 4);
    assert_eq!(payload, b"1000");

    // Unknown opcode still gets an answer on the same connection.
    let bogus = Command {
        client_id: 2,
        dev_idx: 0,
        op: 0x7f,
        arg_hi: 0,
        code: 0,
    };
    stream.write_all(&bogus.encode()).unwrap();
    let (hdr, _) = read_response(&mut stream);
    assert_eq!(hdr.client_id, 2);
    assert_eq!(hdr.code, -libc::EINVAL);

    drop(stream);
    control.trigger_shutdown();
    assert_eq!(server.join().unwrap(), Outcome::Shutdown);
}

#[test]
fn restart_request_ends_the_generation() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let control = Control::new().unwrap();

    let server = {
        let control = Arc::clone(&control);
        std::thread::spawn(move || {
            let ctx = sim::demo_context() as Arc<dyn IioContext>;
            serve(
                listener,
                ctx,
                Registries::new(),
                SessionOptions::default(),
                None,
                &control,
            )
            .unwrap()
        })
    };

    control.trigger_restart();
    assert_eq!(server.join().unwrap(), Outcome::Restart);
    control.clear_restart();
    assert!(!control.restart_requested());
}
