//! Drives the packet pipeline against in-memory connections: framing,
//! dispatch, reassembly, dedupe and the built-in diagnosis handlers.

use std::sync::atomic::{AtomicUsize, Ordering};

use lattice::{
    BusinessCtx, CachePair, Config, HandlerRegistry, HandlerSpec, MemorySessionStore,
    PacketProcessor, ProcessCtx, ProcessOutput, ProcessResult, ProcessStatus, ReplyTarget,
    SecondaryMode, SessionStore, TransportRole, default_assemble_output, default_group_fragments,
};
use lattice_net::NetConnection;
use lattice_proto::{
    Body, CMD_HEARTBEAT_RESP, CMD_IDENTITY_REPORT_REQ, CMD_IDENTITY_REPORT_RESP, CodecKind,
    FrameHeader, HEADER_SIZE, RET_SUCCESS, build_packet, codec_for,
};
use lattice_timing::Micros;

const CMD_ECHO_REQ: u32 = 0x10;
const CMD_ECHO_RESP: u32 = 0x11;

fn echo_business(
    _ctx: &mut BusinessCtx<'_, '_>,
    _in_conn: &NetConnection,
    in_body: &Body,
    out_body: &mut Body,
    _reply: &mut ReplyTarget,
) -> u32 {
    out_body.append_payload(&in_body.payload());
    RET_SUCCESS
}

fn echo_handler() -> HandlerSpec {
    let mut spec = HandlerSpec::new(CMD_ECHO_REQ, CMD_ECHO_RESP, "echo");
    spec.filters_repeated_session = true;
    spec.has_multi_fragments = true;
    spec.group_fragments = Some(default_group_fragments);
    spec.business = Some(echo_business);
    spec.assemble_output = Some(default_assemble_output);
    spec
}

struct World {
    caches: CachePair,
    store: MemorySessionStore,
    config: Config,
}

impl World {
    fn new() -> Self {
        let mut config = Config::for_node("gate", "gate-1", "127.0.0.1", 0);
        config.server_types = [("gate".to_string(), 1), ("svc".to_string(), 2)].into();
        Self {
            caches: CachePair::new(SecondaryMode::Failover),
            store: MemorySessionStore::new(),
            config,
        }
    }
}

fn processor() -> PacketProcessor {
    PacketProcessor::new(
        HandlerRegistry::build(vec![echo_handler()]).unwrap(),
        CodecKind::Packed,
    )
}

fn conn(validated: bool) -> NetConnection {
    let mut c = NetConnection::offline("test-peer", 4096, 4096);
    c.is_validated = validated;
    c
}

/// Runs the processor once and advances the recv cursor like the main
/// loop does.
fn step(
    proc_: &mut PacketProcessor,
    conn: &mut NetConnection,
    world: &mut World,
    role: TransportRole,
    now: Micros,
) -> ProcessResult {
    let mut ctx = ProcessCtx {
        caches: &mut world.caches,
        session_store: &mut world.store,
        config: &world.config,
        role,
        now,
    };
    let result = proc_.process(conn, &mut ctx);
    if result.handled > 0 {
        conn.recv_buf.advance_read(result.handled);
    }
    result
}

fn pop_reply(conn: &mut NetConnection) -> (FrameHeader, Vec<u8>) {
    let bytes = conn.send_buf.read_slice().to_vec();
    assert!(bytes.len() >= HEADER_SIZE, "no reply in the send ring");
    let header = FrameHeader::parse(&bytes).unwrap();
    let packet = bytes[..header.length as usize].to_vec();
    conn.send_buf.advance_read(packet.len());
    (header, packet)
}

fn echo_request(sid: &str, payload: &[u8], packet_number: u16, is_final: bool) -> Vec<u8> {
    let codec = codec_for(CodecKind::Packed);
    let mut body = codec.empty();
    body.set_session_id(sid);
    body.append_payload(payload);
    build_packet(CMD_ECHO_REQ, 0, Some(&body), codec.as_ref(), 9, packet_number, is_final)
        .unwrap()
}

#[test]
fn heartbeat_roundtrip_updates_last_op_time() {
    let mut world = World::new();
    let mut proc_ = processor();
    // heartbeats pass even before validation
    let mut c = conn(false);
    c.last_op_time = Micros::from_secs(1);

    let hb = FrameHeader {
        length: HEADER_SIZE as u32,
        route_id: 7,
        command: 0x00,
        flags: lattice_proto::HeaderFlags::PACKET_END,
        packet_number: 1,
        error_code: 0,
    };
    c.recv_buf.push(&hb.to_bytes());

    let now = Micros::from_secs(100);
    let r = step(&mut proc_, &mut c, &mut world, TransportRole::Listener, now);
    assert_eq!(r.status, ProcessStatus::Handled);
    assert_eq!(r.handled, HEADER_SIZE);
    assert_eq!(c.last_op_time, now);

    let (resp, packet) = pop_reply(&mut c);
    assert_eq!(packet.len(), HEADER_SIZE);
    assert_eq!(resp.command, CMD_HEARTBEAT_RESP);
    assert_eq!(resp.route_id, 7);
    assert_eq!(resp.error_code, 0);
}

#[test]
fn rerunning_on_a_drained_buffer_is_a_noop() {
    let mut world = World::new();
    let mut proc_ = processor();
    let mut c = conn(true);

    // handle one packet fully, then run again on the drained state
    c.recv_buf.push(&echo_request("jjjjjjjjjjjjjjjjjjjjjjjjjjjjjjjj", b"once", 1, true));
    let r = step(&mut proc_, &mut c, &mut world, TransportRole::Listener, Micros::from_secs(1));
    assert_eq!(r.status, ProcessStatus::Handled);
    let _ = pop_reply(&mut c);

    let r = step(&mut proc_, &mut c, &mut world, TransportRole::Listener, Micros::from_secs(2));
    assert_eq!(r.status, ProcessStatus::NeedMore);
    assert_eq!(r.handled, 0);
    assert_eq!(r.output, ProcessOutput::None);
    assert!(c.send_buf.is_empty());
}

#[test]
fn identity_exchange_fills_the_cache() {
    let mut world = World::new();
    let mut proc_ = processor();
    let mut c = conn(false);
    c.peer_ip = "10.1.1.1".into();
    c.peer_port = 55_001;

    let codec = codec_for(CodecKind::Packed);
    let mut body = codec.empty();
    let sid = "aaaabbbbccccddddeeeeffff00001111";
    body.set_session_id(sid);
    body.set_server_type(2);
    body.set_server_name("nodeA");
    let pkt =
        build_packet(CMD_IDENTITY_REPORT_REQ, 0, Some(&body), codec.as_ref(), 0, 1, true).unwrap();
    c.recv_buf.push(&pkt);

    let r = step(&mut proc_, &mut c, &mut world, TransportRole::Listener, Micros::from_secs(1));
    assert_eq!(r.status, ProcessStatus::Handled);
    assert!(c.is_validated);
    assert_eq!(c.peer_name, "nodeA");
    assert_eq!(c.owner.as_deref(), Some("nodeA"));

    let entry = world.caches.primary.find("nodeA").expect("cache entry missing");
    assert!(!entry.is_server);
    assert!(entry.attrs.is_primary);
    assert_eq!(entry.server_type, "svc");
    assert_eq!(entry.peer_ip, "10.1.1.1");
    assert!(entry.is_alive());

    let (resp, packet) = pop_reply(&mut c);
    assert_eq!(resp.command, CMD_IDENTITY_REPORT_RESP);
    assert_eq!(resp.error_code, RET_SUCCESS);
    let resp_body = codec.parse(&packet[HEADER_SIZE..]).unwrap();
    assert_eq!(resp_body.session_id(), Some(sid));
}

#[test]
fn identity_with_a_live_duplicate_name_is_refused() {
    let mut world = World::new();
    let mut proc_ = processor();

    let codec = codec_for(CodecKind::Packed);
    let mut body = codec.empty();
    body.set_session_id("aaaabbbbccccddddeeeeffff00001111");
    body.set_server_type(2);
    body.set_server_name("nodeA");
    let pkt =
        build_packet(CMD_IDENTITY_REPORT_REQ, 0, Some(&body), codec.as_ref(), 0, 1, true).unwrap();

    let mut first = conn(false);
    first.recv_buf.push(&pkt);
    step(&mut proc_, &mut first, &mut world, TransportRole::Listener, Micros::from_secs(1));
    assert!(first.is_validated);

    let mut second = conn(false);
    second.recv_buf.push(&pkt);
    let r = step(&mut proc_, &mut second, &mut world, TransportRole::Listener, Micros::from_secs(2));
    assert_eq!(r.status, ProcessStatus::Handled);
    assert!(!second.is_validated, "duplicate name must be refused");

    let (resp, _) = pop_reply(&mut second);
    assert_eq!(resp.command, CMD_IDENTITY_REPORT_RESP);
    assert_ne!(resp.error_code, RET_SUCCESS);
}

#[test]
fn identity_response_validates_the_requester_side() {
    let mut world = World::new();
    let mut proc_ = processor();
    let mut c = conn(false);

    let codec = codec_for(CodecKind::Packed);
    let mut body = codec.empty();
    body.set_session_id("aaaabbbbccccddddeeeeffff00001111");
    let pkt = build_packet(CMD_IDENTITY_REPORT_RESP, RET_SUCCESS, Some(&body), codec.as_ref(), 0, 1, true)
        .unwrap();
    c.recv_buf.push(&pkt);

    let r = step(&mut proc_, &mut c, &mut world, TransportRole::Requester, Micros::from_secs(1));
    assert_eq!(r.status, ProcessStatus::Handled);
    assert!(c.is_validated);
    assert!(c.send_buf.is_empty(), "responses produce no counter-response");
}

#[test]
fn two_fragments_then_dedupe_replay() {
    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn counting_business(
        _ctx: &mut BusinessCtx<'_, '_>,
        _in_conn: &NetConnection,
        in_body: &Body,
        out_body: &mut Body,
        _reply: &mut ReplyTarget,
    ) -> u32 {
        CALLS.fetch_add(1, Ordering::SeqCst);
        out_body.append_payload(&in_body.payload());
        RET_SUCCESS
    }

    const CMD_REQ: u32 = 0x60;
    const CMD_RESP: u32 = 0x61;
    let mut spec = HandlerSpec::new(CMD_REQ, CMD_RESP, "counted echo");
    spec.filters_repeated_session = true;
    spec.has_multi_fragments = true;
    spec.group_fragments = Some(default_group_fragments);
    spec.business = Some(counting_business);
    spec.assemble_output = Some(default_assemble_output);

    let codec = codec_for(CodecKind::Packed);
    let request = |payload: &[u8], pn: u16, fin: bool| {
        let mut body = codec.empty();
        body.set_session_id("s2s2s2s2s2s2s2s2s2s2s2s2s2s2s2s2");
        body.append_payload(payload);
        build_packet(CMD_REQ, 0, Some(&body), codec.as_ref(), 9, pn, fin).unwrap()
    };

    let mut world = World::new();
    let mut proc_ =
        PacketProcessor::new(HandlerRegistry::build(vec![spec]).unwrap(), CodecKind::Packed);
    let mut c = conn(true);
    let sid = "s2s2s2s2s2s2s2s2s2s2s2s2s2s2s2s2";

    c.recv_buf.push(&request(b"first-half|", 1, false));
    let r = step(&mut proc_, &mut c, &mut world, TransportRole::Listener, Micros::from_secs(1));
    assert_eq!(r.status, ProcessStatus::Handled);
    assert_eq!(r.output, ProcessOutput::None, "no response before the end flag");
    assert_eq!(proc_.reassembly().len(), 1);
    assert_eq!(CALLS.load(Ordering::SeqCst), 0);

    c.recv_buf.push(&request(b"second-half", 2, true));
    let r = step(&mut proc_, &mut c, &mut world, TransportRole::Listener, Micros::from_secs(2));
    assert_eq!(r.status, ProcessStatus::Handled);
    assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(proc_.reassembly().len(), 0, "entry evicted after the end flag");

    let (resp, packet) = pop_reply(&mut c);
    assert_eq!(resp.command, CMD_RESP);
    assert_eq!(resp.error_code, RET_SUCCESS);
    let resp_body = codec.parse(&packet[HEADER_SIZE..]).unwrap();
    assert_eq!(resp_body.payload(), b"first-half|second-half");
    assert!(world.store.exists(sid), "response cached for dedupe");

    // an identical replay answers from the store without business
    c.recv_buf.push(&request(b"first-half|", 1, false));
    let r = step(&mut proc_, &mut c, &mut world, TransportRole::Listener, Micros::from_secs(3));
    assert_eq!(r.status, ProcessStatus::Handled);
    assert_eq!(CALLS.load(Ordering::SeqCst), 1, "business must not rerun");

    let (replay, replay_packet) = pop_reply(&mut c);
    assert_eq!(replay.command, CMD_RESP);
    assert_eq!(replay_packet, packet, "cached bytes replayed verbatim");
}

#[test]
fn single_fragment_with_end_flag_skips_the_cache() {
    let mut world = World::new();
    let mut proc_ = processor();
    let mut c = conn(true);

    c.recv_buf.push(&echo_request("zzzzyyyyxxxxwwwwvvvvuuuuttttssss", b"whole", 1, true));
    let r = step(&mut proc_, &mut c, &mut world, TransportRole::Listener, Micros::from_secs(1));
    assert_eq!(r.status, ProcessStatus::Handled);
    assert_eq!(proc_.reassembly().len(), 0, "no reassembly entry may be created");
    assert!(matches!(r.output, ProcessOutput::ToInput(_)));
}

#[test]
fn out_of_order_fragment_is_rejected() {
    let mut world = World::new();
    let mut proc_ = processor();
    let mut c = conn(true);

    c.recv_buf.push(&echo_request("qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqq", b"late", 2, false));
    let r = step(&mut proc_, &mut c, &mut world, TransportRole::Listener, Micros::from_secs(1));
    assert_eq!(r.status, ProcessStatus::OutOfOrderFragment);
    assert_eq!(proc_.reassembly().len(), 0);

    // packet number zero is reserved
    c.recv_buf.push(&echo_request("rrrrrrrrrrrrrrrrrrrrrrrrrrrrrrrr", b"zero", 0, false));
    let r = step(&mut proc_, &mut c, &mut world, TransportRole::Listener, Micros::from_secs(2));
    assert_eq!(r.status, ProcessStatus::OutOfOrderFragment);
}

#[test]
fn unknown_command_is_dropped_connection_survives() {
    let mut world = World::new();
    let mut proc_ = processor();
    let mut c = conn(true);

    let bogus = FrameHeader {
        length: HEADER_SIZE as u32,
        route_id: 1,
        command: 0xDEAD_BEEE,
        flags: lattice_proto::HeaderFlags::PACKET_END,
        packet_number: 1,
        error_code: 0,
    };
    c.recv_buf.push(&bogus.to_bytes());
    let r = step(&mut proc_, &mut c, &mut world, TransportRole::Listener, Micros::from_secs(1));
    assert_eq!(r.status, ProcessStatus::UnknownCommand);
    assert_eq!(r.handled, HEADER_SIZE);
    assert!(c.send_buf.is_empty(), "no response for unknown commands");

    // the next valid packet on the same connection processes normally
    c.recv_buf.push(&echo_request("nnnnnnnnnnnnnnnnnnnnnnnnnnnnnnnn", b"ok", 1, true));
    let r = step(&mut proc_, &mut c, &mut world, TransportRole::Listener, Micros::from_secs(2));
    assert_eq!(r.status, ProcessStatus::Handled);
}

#[test]
fn unvalidated_peers_only_speak_diagnosis() {
    let mut world = World::new();
    let mut proc_ = processor();
    let mut c = conn(false);

    c.recv_buf.push(&echo_request("mmmmmmmmmmmmmmmmmmmmmmmmmmmmmmmm", b"nope", 1, true));
    let r = step(&mut proc_, &mut c, &mut world, TransportRole::Listener, Micros::from_secs(1));
    assert_eq!(r.status, ProcessStatus::NotValidated);
    assert!(c.send_buf.is_empty());
}

#[test]
fn length_at_capacity_passes_one_past_resets() {
    let mut world = World::new();
    let pkt = echo_request("pppppppppppppppppppppppppppppppp", b"sized", 1, true);

    // ring sized exactly to the packet: accepted
    let mut proc_ = processor();
    let mut c = NetConnection::offline("cap-peer", 4096, pkt.len());
    c.is_validated = true;
    c.recv_buf.push(&pkt);
    let r = step(&mut proc_, &mut c, &mut world, TransportRole::Listener, Micros::from_secs(1));
    assert_eq!(r.status, ProcessStatus::Handled);

    // one byte short of the advertised length: too big, ring cleared
    let mut tight = NetConnection::offline("tight-peer", 4096, pkt.len() - 1);
    tight.is_validated = true;
    tight.recv_buf.push(&pkt);
    let r = step(&mut proc_, &mut tight, &mut world, TransportRole::Listener, Micros::from_secs(1));
    assert_eq!(r.status, ProcessStatus::LengthTooBig);
    assert!(tight.recv_buf.is_empty());
}

#[test]
fn incomplete_packet_times_out_after_five_seconds() {
    let mut world = World::new();
    let mut proc_ = processor();
    let mut c = conn(true);

    // 12 bytes of a packet that claims 100
    let mut partial = FrameHeader {
        length: 100,
        route_id: 0,
        command: CMD_ECHO_REQ,
        flags: lattice_proto::HeaderFlags::PACKET_END,
        packet_number: 1,
        error_code: 0,
    }
    .to_bytes()
    .to_vec();
    partial.truncate(12);
    c.recv_buf.push(&partial);

    let t0 = Micros::from_secs(1000);
    let r = step(&mut proc_, &mut c, &mut world, TransportRole::Listener, t0);
    assert_eq!(r.status, ProcessStatus::NeedMore);

    // still short just under the deadline
    let r = step(
        &mut proc_,
        &mut c,
        &mut world,
        TransportRole::Listener,
        t0 + Micros::from_secs(5) - Micros(1),
    );
    assert_eq!(r.status, ProcessStatus::NeedMore);
    assert!(!c.recv_buf.is_empty());

    let r = step(&mut proc_, &mut c, &mut world, TransportRole::Listener, t0 + Micros::from_secs(5));
    assert_eq!(r.status, ProcessStatus::Timeout);
    assert!(c.recv_buf.is_empty(), "recv ring reset after the timeout");

    // traffic afterwards processes normally
    c.recv_buf.push(&echo_request("oooooooooooooooooooooooooooooooo", b"later", 1, true));
    let r = step(&mut proc_, &mut c, &mut world, TransportRole::Listener, t0 + Micros::from_secs(6));
    assert_eq!(r.status, ProcessStatus::Handled);
}

#[test]
fn arbitrary_splits_equal_a_single_delivery() {
    let sid = "kkkkkkkkkkkkkkkkkkkkkkkkkkkkkkkk";
    let pkt = echo_request(sid, b"split-me-any-way", 1, true);

    // delivered whole
    let mut world_a = World::new();
    let mut proc_a = processor();
    let mut one = conn(true);
    one.recv_buf.push(&pkt);
    let r = step(&mut proc_a, &mut one, &mut world_a, TransportRole::Listener, Micros::from_secs(1));
    assert_eq!(r.status, ProcessStatus::Handled);
    let (h_one, p_one) = pop_reply(&mut one);

    // delivered in three odd chunks
    let mut world_b = World::new();
    let mut proc_b = processor();
    let mut many = conn(true);
    for (i, chunk) in [&pkt[..7], &pkt[7..29], &pkt[29..]].into_iter().enumerate() {
        many.recv_buf.push(chunk);
        let r = step(
            &mut proc_b,
            &mut many,
            &mut world_b,
            TransportRole::Listener,
            Micros::from_secs(1) + Micros(i as u64),
        );
        if i < 2 {
            assert_eq!(r.status, ProcessStatus::NeedMore);
        } else {
            assert_eq!(r.status, ProcessStatus::Handled);
        }
    }
    let (h_many, p_many) = pop_reply(&mut many);

    assert_eq!(h_one, h_many);
    assert_eq!(p_one, p_many);
}

#[test]
fn business_failure_still_answers_with_the_error_code() {
    fn failing_business(
        _ctx: &mut BusinessCtx<'_, '_>,
        _in_conn: &NetConnection,
        _in_body: &Body,
        out_body: &mut Body,
        _reply: &mut ReplyTarget,
    ) -> u32 {
        out_body.append_payload(b"sorry");
        77
    }

    let mut spec = HandlerSpec::new(0x30, 0x31, "always fails");
    spec.business = Some(failing_business);
    spec.assemble_output = Some(default_assemble_output);

    let mut world = World::new();
    let mut proc_ = PacketProcessor::new(
        HandlerRegistry::build(vec![spec]).unwrap(),
        CodecKind::Packed,
    );
    let mut c = conn(true);

    let codec = codec_for(CodecKind::Packed);
    let mut body = codec.empty();
    body.set_session_id("ffffffffffffffffffffffffffffffff");
    let pkt = build_packet(0x30, 0, Some(&body), codec.as_ref(), 0, 1, true).unwrap();
    c.recv_buf.push(&pkt);

    let r = step(&mut proc_, &mut c, &mut world, TransportRole::Listener, Micros::from_secs(1));
    assert_eq!(r.status, ProcessStatus::Handled);
    let (resp, _) = pop_reply(&mut c);
    assert_eq!(resp.command, 0x31);
    assert_eq!(resp.error_code, 77);
}

#[test]
fn redirected_request_leaves_a_route_record() {
    fn forwarding_business(
        _ctx: &mut BusinessCtx<'_, '_>,
        _in_conn: &NetConnection,
        in_body: &Body,
        out_body: &mut Body,
        reply: &mut ReplyTarget,
    ) -> u32 {
        out_body.append_payload(&in_body.payload());
        *reply = ReplyTarget::Peer("upstream-1".into());
        RET_SUCCESS
    }

    // the output command is even: a request relayed onwards, not a reply
    let mut spec = HandlerSpec::new(0x40, 0x42, "relays the request upstream");
    spec.time_consuming = true;
    spec.business = Some(forwarding_business);
    spec.assemble_output = Some(default_assemble_output);
    // the upstream's eventual reply has its own table entry
    let reply_spec = HandlerSpec::new(0x43, 0x43, "upstream reply");

    let mut world = World::new();
    let mut proc_ = PacketProcessor::new(
        HandlerRegistry::build(vec![spec, reply_spec]).unwrap(),
        CodecKind::Packed,
    );
    let mut c = conn(true);
    let sid = "gggggggggggggggggggggggggggggggg";

    let codec = codec_for(CodecKind::Packed);
    let mut body = codec.empty();
    body.set_session_id(sid);
    body.append_payload(b"pass-along");
    let pkt = build_packet(0x40, 0, Some(&body), codec.as_ref(), 3, 1, true).unwrap();
    c.recv_buf.push(&pkt);

    let r = step(&mut proc_, &mut c, &mut world, TransportRole::Listener, Micros::from_secs(1));
    assert_eq!(r.status, ProcessStatus::Handled);
    assert!(c.send_buf.is_empty(), "redirected replies bypass the input ring");

    let ProcessOutput::Forward { name, bytes } = r.output else {
        panic!("expected a forward, got {:?}", r.output);
    };
    assert_eq!(name, "upstream-1");
    let h = FrameHeader::parse(&bytes).unwrap();
    assert_eq!(h.command, 0x42);
    assert_eq!(h.route_id, 3, "route id copied from the request");

    // the in-flight request is now accounted against the upstream, which
    // is what keeps a stale heartbeat link alive
    assert_eq!(proc_.slow_outstanding_for("upstream-1"), 1);
    assert_eq!(proc_.slow_outstanding_for("upstream-2"), 0);

    // the upstream's reply for the same session clears the record
    let mut reply_body = codec.empty();
    reply_body.set_session_id(sid);
    let reply_pkt =
        build_packet(0x43, RET_SUCCESS, Some(&reply_body), codec.as_ref(), 3, 1, true).unwrap();
    let mut up = conn(true);
    up.recv_buf.push(&reply_pkt);
    let r = step(&mut proc_, &mut up, &mut world, TransportRole::Requester, Micros::from_secs(2));
    assert_eq!(r.status, ProcessStatus::Handled);
    assert_eq!(proc_.slow_outstanding_for("upstream-1"), 0);
    assert_eq!(proc_.reassembly().len(), 0);
}

#[test]
fn header_only_packet_is_accepted() {
    // length = 24, no body, routed through a single-fragment handler
    fn noop_business(
        _ctx: &mut BusinessCtx<'_, '_>,
        _in_conn: &NetConnection,
        _in_body: &Body,
        _out_body: &mut Body,
        _reply: &mut ReplyTarget,
    ) -> u32 {
        RET_SUCCESS
    }
    let mut spec = HandlerSpec::new(0x50, 0x51, "bare");
    spec.business = Some(noop_business);

    let mut world = World::new();
    let mut proc_ = PacketProcessor::new(
        HandlerRegistry::build(vec![spec]).unwrap(),
        CodecKind::Packed,
    );
    let mut c = conn(true);

    let h = FrameHeader {
        length: HEADER_SIZE as u32,
        route_id: 0,
        command: 0x50,
        flags: lattice_proto::HeaderFlags::PACKET_END,
        packet_number: 1,
        error_code: 0,
    };
    c.recv_buf.push(&h.to_bytes());
    let r = step(&mut proc_, &mut c, &mut world, TransportRole::Listener, Micros::from_secs(1));
    assert_eq!(r.status, ProcessStatus::Handled);
    assert_eq!(r.handled, HEADER_SIZE);
    assert!(c.send_buf.is_empty(), "no assemble fn, no response");
}
