//! End-to-end protocol scenarios over a live session: attribute access,
//! the full RX block lifecycle, cyclic exclusivity, disconnect while a
//! transfer is in flight, event streams, and unknown opcodes.

mod common;

use common::{le64, Harness};
use iiod_core::backend::IioEvent;
use iiod_core::sim::demo_context;
use iiod_proto::prelude::*;

#[test]
fn attribute_read_returns_raw_bytes() {
    // READ_ATTR dev=0, attr_idx=2, ch_idx=0.
    let harness = Harness::new(demo_context());
    let (mut client, _session, runner) = harness.connect(false);

    let (code, payload) = client.round_trip(Command::new(1, 0, Opcode::ReadAttr, 0x0002_0000));
    assert_eq!(code, payload.len() as i32);
    assert_eq!(payload, b"auto");

    drop(client);
    runner.join().unwrap();
}

#[test]
fn rx_block_full_lifecycle() {
    // Full create, transfer, free cycle on an RX device.
    let harness = Harness::new(demo_context());
    let (mut client, _session, runner) = harness.connect(false);

    let (code, mask) =
        client.round_trip_with(Command::new(1, 0, Opcode::CreateBuffer, 0), &[0x03, 0, 0, 0]);
    assert_eq!(code, 4);
    assert_eq!(mask, [0x03, 0, 0, 0]);

    let (code, _) = client.round_trip_with(Command::new(2, 0, Opcode::CreateBlock, 0), &le64(4096));
    assert_eq!(code, 0);

    let (code, _) = client.round_trip(Command::new(3, 0, Opcode::EnableBuffer, 0));
    assert_eq!(code, 0);

    let (code, data) =
        client.round_trip_with(Command::new(2, 0, Opcode::TransferBlock, 0), &le64(4096));
    assert_eq!(code, 4096);
    assert_eq!(data.len(), 4096);
    // Deterministic ramp from the simulated kernel.
    assert!(data.iter().enumerate().all(|(i, b)| *b == (i & 0xff) as u8));

    for (id, op) in [
        (2, Opcode::FreeBlock),
        (4, Opcode::DisableBuffer),
        (5, Opcode::FreeBuffer),
    ] {
        let (code, _) = client.round_trip(Command::new(id, 0, op, 0));
        assert_eq!(code, 0, "{op:?} should succeed");
    }

    drop(client);
    runner.join().unwrap();
    assert!(harness.registries.buffers.is_empty());
}

#[test]
fn cyclic_buffer_conflict_is_busy() {
    // A second client colliding with a cyclic buffer gets -EBUSY
    // (non-cyclic records would let it join instead).
    let harness = Harness::new(demo_context());
    let (mut first, _s1, r1) = harness.connect(false);
    let (mut second, _s2, r2) = harness.connect(false);

    let mut create = Command::new(1, 0, Opcode::CreateBuffer, 0);
    create.arg_hi = 1; // cyclic
    let (code, _) = first.round_trip_with(create, &[0x01, 0, 0, 0]);
    assert_eq!(code, 4);

    let (code, _) =
        second.round_trip_with(Command::new(1, 0, Opcode::CreateBuffer, 0), &[0x0f, 0, 0, 0]);
    assert_eq!(code, -libc::EBUSY);

    drop(first);
    drop(second);
    r1.join().unwrap();
    r2.join().unwrap();
}

#[test]
fn disconnect_mid_transfer_tears_down() {
    // The client vanishes while a dequeue is pending; the session
    // must finish teardown and release everything.
    let ctx = demo_context();
    ctx.sim_device(0).unwrap().pace_rx(); // dequeues wait for credits
    let harness = Harness::new(ctx);
    let (mut client, session, runner) = harness.connect(false);

    let (code, _) =
        client.round_trip_with(Command::new(1, 0, Opcode::CreateBuffer, 0), &[0x01, 0, 0, 0]);
    assert_eq!(code, 4);
    let (code, _) = client.round_trip_with(Command::new(2, 0, Opcode::CreateBlock, 0), &le64(64));
    assert_eq!(code, 0);
    let (code, _) = client.round_trip(Command::new(3, 0, Opcode::EnableBuffer, 0));
    assert_eq!(code, 0);

    // No credits: this transfer parks inside the kernel dequeue.
    client.send_with(Command::new(2, 0, Opcode::TransferBlock, 0), &le64(64));
    std::thread::sleep(std::time::Duration::from_millis(50));

    drop(client); // close our write end
    runner.join().unwrap();

    assert!(harness.registries.buffers.is_empty());
    assert_eq!(session.pool().active_workers(), 0);
}

#[test]
fn event_stream_delivers_records() {
    // Create stream, blocking read, free.
    let ctx = demo_context();
    let harness = Harness::new(ctx.clone());
    let (mut client, _session, runner) = harness.connect(false);

    let (code, _) = client.round_trip(Command::new(5, 0, Opcode::CreateEvstream, 0));
    assert_eq!(code, 0);

    client.send(Command::new(5, 0, Opcode::ReadEvent, 0));
    let event = IioEvent {
        id: 0x1122,
        timestamp: 987_654_321,
    };
    ctx.sim_device(0).unwrap().push_event(event);

    let (hdr, payload) = client.response();
    assert_eq!(hdr.client_id, 5);
    assert_eq!(hdr.code, 16);
    assert_eq!(payload.len(), IioEvent::WIRE_SIZE);
    assert_eq!(IioEvent::from_wire(&payload.try_into().unwrap()), event);

    let (code, _) = client.round_trip(Command::new(6, 0, Opcode::FreeEvstream, 5));
    assert_eq!(code, 0);

    drop(client);
    runner.join().unwrap();
    assert!(harness.registries.evstreams.is_empty());
}

#[test]
fn unknown_opcode_is_invalid() {
    // Opcodes outside the table are refused, not ignored.
    let harness = Harness::new(demo_context());
    let (mut client, _session, runner) = harness.connect(false);

    let cmd = Command {
        client_id: 9,
        dev_idx: 0,
        op: 0xff,
        arg_hi: 0,
        code: 0,
    };
    let (code, payload) = {
        client.send(cmd);
        let (hdr, payload) = client.response();
        assert_eq!(hdr.client_id, 9);
        (hdr.code, payload)
    };
    assert_eq!(code, -libc::EINVAL);
    assert!(payload.is_empty());

    drop(client);
    runner.join().unwrap();
}

#[test]
fn responses_interleave_without_head_of_line_blocking() {
    // A parked transfer must not delay an unrelated attribute read.
    let ctx = demo_context();
    ctx.sim_device(0).unwrap().pace_rx();
    let harness = Harness::new(ctx.clone());
    let (mut client, _session, runner) = harness.connect(false);

    let (code, _) =
        client.round_trip_with(Command::new(1, 0, Opcode::CreateBuffer, 0), &[0x01, 0, 0, 0]);
    assert_eq!(code, 4);
    let (code, _) = client.round_trip_with(Command::new(2, 0, Opcode::CreateBlock, 0), &le64(32));
    assert_eq!(code, 0);
    let (code, _) = client.round_trip(Command::new(3, 0, Opcode::EnableBuffer, 0));
    assert_eq!(code, 0);

    // Transfer first (parks), then an attribute read on another id.
    client.send_with(Command::new(2, 0, Opcode::TransferBlock, 0), &le64(32));
    client.send(Command::new(7, 0, Opcode::ReadAttr, 0));

    let (hdr, payload) = client.response();
    assert_eq!(hdr.client_id, 7, "attr read must overtake the parked transfer");
    assert_eq!(payload, b"1000");

    // Unpark the transfer; its completion arrives on the block's id.
    ctx.sim_device(0).unwrap().feed(1);
    let (hdr, payload) = client.response();
    assert_eq!(hdr.client_id, 2);
    assert_eq!(hdr.code, 32);
    assert_eq!(payload.len(), 32);

    drop(client);
    runner.join().unwrap();
}
