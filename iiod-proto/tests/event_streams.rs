//! Event stream forwarder: nonblocking reads, duplicate creation,
//! freeing, and teardown with a parked pump.

mod common;

use common::Harness;
use iiod_core::backend::IioEvent;
use iiod_core::sim::demo_context;
use iiod_proto::prelude::*;

#[test]
fn nonblocking_read_reports_eagain() {
    let ctx = demo_context();
    let harness = Harness::new(ctx.clone());
    let (mut client, _session, runner) = harness.connect(false);

    let (code, _) = client.round_trip(Command::new(4, 0, Opcode::CreateEvstream, 0));
    assert_eq!(code, 0);

    // nonblock flag set, no event queued.
    let (code, _) = client.round_trip(Command::new(4, 0, Opcode::ReadEvent, 1));
    assert_eq!(code, -libc::EAGAIN);

    // With an event queued the same read succeeds inline.
    ctx.sim_device(0).unwrap().push_event(IioEvent {
        id: 1,
        timestamp: 2,
    });
    let (code, payload) = client.round_trip(Command::new(4, 0, Opcode::ReadEvent, 1));
    assert_eq!(code, 16);
    assert_eq!(payload.len(), 16);

    drop(client);
    runner.join().unwrap();
}

#[test]
fn duplicate_stream_is_busy() {
    let harness = Harness::new(demo_context());
    let (mut client, _session, runner) = harness.connect(false);

    let (code, _) = client.round_trip(Command::new(4, 0, Opcode::CreateEvstream, 0));
    assert_eq!(code, 0);
    let (code, _) = client.round_trip(Command::new(4, 0, Opcode::CreateEvstream, 0));
    assert_eq!(code, -libc::EBUSY);

    drop(client);
    runner.join().unwrap();
}

#[test]
fn read_without_stream_is_bad_handle() {
    let harness = Harness::new(demo_context());
    let (mut client, _session, runner) = harness.connect(false);

    let (code, _) = client.round_trip(Command::new(4, 0, Opcode::ReadEvent, 1));
    assert_eq!(code, -libc::EBADF);
    let (code, _) = client.round_trip(Command::new(5, 0, Opcode::FreeEvstream, 4));
    assert_eq!(code, -libc::EBADF);

    drop(client);
    runner.join().unwrap();
}

#[test]
fn disconnect_with_parked_pump_tears_down() {
    // A blocking READ_EVENT parks the pump in the kernel stream; closing
    // the transport must still drain everything.
    let harness = Harness::new(demo_context());
    let (mut client, session, runner) = harness.connect(false);

    let (code, _) = client.round_trip(Command::new(4, 0, Opcode::CreateEvstream, 0));
    assert_eq!(code, 0);
    client.send(Command::new(4, 0, Opcode::ReadEvent, 0));
    std::thread::sleep(std::time::Duration::from_millis(30));

    drop(client);
    runner.join().unwrap();
    assert!(harness.registries.evstreams.is_empty());
    assert_eq!(session.pool().active_workers(), 0);
}

#[test]
fn stream_on_unknown_device_is_bad_handle() {
    let harness = Harness::new(demo_context());
    let (mut client, _session, runner) = harness.connect(false);

    let (code, _) = client.round_trip(Command::new(4, 99, Opcode::CreateEvstream, 0));
    assert_eq!(code, -libc::EBADF);

    drop(client);
    runner.join().unwrap();
}
