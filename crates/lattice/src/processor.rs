use std::collections::HashMap;

use lattice_net::{NetConnection, tcp::send_from_connection};
use lattice_proto::{
    Body, BodyCodec, CMD_HEARTBEAT_REQ, CMD_HEARTBEAT_RESP, CMD_IDENTITY_REPORT_REQ,
    CMD_IDENTITY_REPORT_RESP, CodecKind, FrameHeader, HEADER_SIZE, RET_SUCCESS, RET_UNKNOWN,
    assemble_reply, codec_for, is_diagnosis, is_heartbeat, is_request,
};
use lattice_timing::Micros;
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    reassembly::{ReassemblyCache, ReassemblyEntry},
    registry::{HandlerRegistry, HandlerSpec},
    resources::CachePair,
    session::SessionStore,
};

/// How long a peer may sit on a half-delivered packet before its recv ring
/// is declared garbage and reset.
const INCOMPLETE_PACKET_TIMEOUT: Micros = Micros::from_secs(5);

/// Which transport fed the packet in. The identity exchange is one-way:
/// requests arrive on the listener, responses on the requester.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportRole {
    Listener,
    Requester,
}

/// Where the response goes. Business may redirect it to another cached
/// peer by name; the orchestrator resolves the name to a live socket.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum ReplyTarget {
    #[default]
    Input,
    Peer(String),
}

/// Per-packet outcome of the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Not enough bytes yet; retry after the next read.
    NeedMore,
    /// Advertised length exceeds the recv ring; ring was reset.
    LengthTooBig,
    /// Packet stayed incomplete past the deadline; ring was reset.
    Timeout,
    UnknownCommand,
    NotValidated,
    BodyParseError,
    OutOfOrderFragment,
    Handled,
}

impl ProcessStatus {
    /// Statuses after which the caller should stop draining this
    /// connection for the round.
    pub fn aborts_round(self) -> bool {
        matches!(self, Self::NeedMore | Self::LengthTooBig | Self::Timeout)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum ProcessOutput {
    #[default]
    None,
    /// Response bytes already sit in the input connection's send ring.
    ToInput(usize),
    /// Response bytes must be routed to the named cached peer.
    Forward { name: String, bytes: Vec<u8> },
}

#[derive(Debug, Default)]
pub struct ProcessResult {
    pub status: ProcessStatus,
    /// Bytes of the recv ring consumed by this call.
    pub handled: usize,
    pub output: ProcessOutput,
}

impl Default for ProcessStatus {
    fn default() -> Self {
        Self::NeedMore
    }
}

impl ProcessResult {
    fn new(status: ProcessStatus, handled: usize) -> Self {
        Self { status, handled, output: ProcessOutput::None }
    }
}

/// Everything the pipeline touches outside the connection itself.
pub struct ProcessCtx<'a> {
    pub caches: &'a mut CachePair,
    pub session_store: &'a mut dyn SessionStore,
    pub config: &'a Config,
    pub role: TransportRole,
    pub now: Micros,
}

/// What a business function gets to see.
pub struct BusinessCtx<'a, 'b> {
    pub caches: &'a mut CachePair,
    pub header: &'b FrameHeader,
    pub now: Micros,
}

/// The per-packet pipeline: header split, dispatch by command, optional
/// reassembly and session dedupe, business call, response emission. Owns
/// the reassembly cache and the incomplete-packet timers.
pub struct PacketProcessor {
    registry: HandlerRegistry,
    codec: Box<dyn BodyCodec>,
    reassembly: ReassemblyCache,
    incomplete_since: HashMap<String, Micros>,
}

impl PacketProcessor {
    pub fn new(registry: HandlerRegistry, codec_kind: CodecKind) -> Self {
        Self {
            registry,
            codec: codec_for(codec_kind),
            reassembly: ReassemblyCache::default(),
            incomplete_since: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn codec(&self) -> &dyn BodyCodec {
        self.codec.as_ref()
    }

    pub fn reassembly(&self) -> &ReassemblyCache {
        &self.reassembly
    }

    pub fn reassembly_mut(&mut self) -> &mut ReassemblyCache {
        &mut self.reassembly
    }

    /// Time-consuming messages currently in flight towards `peer_name`.
    pub fn slow_outstanding_for(&self, peer_name: &str) -> usize {
        self.reassembly.slow_outstanding_for(peer_name, |cmd| self.registry.is_time_consuming(cmd))
    }

    /// Sweep of the reassembly cache under the configured TTLs; commands
    /// flagged time-consuming get the wider one.
    pub fn clean_expired_messages(
        &mut self,
        now: Micros,
        default_timeout: Micros,
        max_timeout: Micros,
    ) -> usize {
        let Self { registry, reassembly, .. } = self;
        reassembly.clean_expired(now, default_timeout, max_timeout, |cmd| {
            registry.is_time_consuming(cmd)
        })
    }

    /// Drops per-peer incomplete-packet state, e.g. after a disconnect.
    pub fn forget_peer(&mut self, peer_name: &str) {
        self.incomplete_since.remove(peer_name);
    }

    /// Runs the pipeline against the next packet in `conn.recv_buf`.
    ///
    /// The caller advances the recv ring by `handled` afterwards. Replies
    /// aimed at the input connection are already in its send ring when this
    /// returns; redirected replies come back as [`ProcessOutput::Forward`].
    pub fn process(&mut self, conn: &mut NetConnection, ctx: &mut ProcessCtx<'_>) -> ProcessResult {
        let avail = conn.recv_buf.data_size();
        if avail == 0 {
            return ProcessResult::new(ProcessStatus::NeedMore, 0);
        }

        // Header sufficiency and length gates, with the incomplete timer.
        if avail < HEADER_SIZE {
            return self.handle_incomplete(conn, ctx.now, avail, None);
        }

        let header = match FrameHeader::parse(conn.recv_buf.read_slice()) {
            Ok(h) => h,
            Err(_) => return ProcessResult::new(ProcessStatus::NeedMore, 0),
        };
        let length = header.length as usize;

        if length > conn.recv_buf.capacity() {
            warn!(
                peer = %conn.peer_name,
                length,
                capacity = conn.recv_buf.capacity(),
                "advertised length exceeds the recv ring, resetting it"
            );
            conn.recv_buf.reset();
            self.incomplete_since.remove(&conn.peer_name);
            return ProcessResult::new(ProcessStatus::LengthTooBig, 0);
        }

        if avail < length {
            return self.handle_incomplete(conn, ctx.now, avail, Some(length));
        }

        // A whole packet is present; the peer is healthy again.
        self.incomplete_since.remove(&conn.peer_name);

        if length < HEADER_SIZE {
            error!(peer = %conn.peer_name, length, "absurd packet length, dropping the buffer");
            return ProcessResult::new(ProcessStatus::BodyParseError, avail);
        }

        let start = Micros::now();
        if !is_heartbeat(header.command) {
            info!(
                bytes = length,
                fd = conn.fd,
                peer = %conn.peer_name,
                address = %format!("{}:{}", conn.peer_ip, conn.peer_port),
                route_id = header.route_id,
                command = format_args!("{:#010X}", header.command),
                flag_bits = format_args!("{:#06X}", header.flags.bits()),
                packet_number = header.packet_number,
                error_code = header.error_code,
                "new packet"
            );
        }

        if is_diagnosis(header.command) {
            return self.diagnose_connection(conn, &header, ctx);
        }

        let Some(handler) = self.registry.find(header.command).copied() else {
            error!(
                command = format_args!("{:#010X}", header.command),
                fd = conn.fd,
                "unknown command code, packet discarded"
            );
            return ProcessResult::new(ProcessStatus::UnknownCommand, length);
        };

        if !conn.is_validated {
            error!(
                peer = %conn.peer_name,
                "connection not validated yet, only identity and heartbeat packets pass"
            );
            return ProcessResult::new(ProcessStatus::NotValidated, length);
        }

        if header.packet_number == 0 {
            let status = if handler.has_multi_fragments {
                ProcessStatus::OutOfOrderFragment
            } else {
                ProcessStatus::BodyParseError
            };
            error!(peer = %conn.peer_name, "packet number 0 is reserved");
            return ProcessResult::new(status, length);
        }

        let result = self.run_handler(conn, ctx, &header, &handler, length);
        let spent = Micros::now().elapsed_since(start);
        debug!(
            command = format_args!("{:#010X}", header.command),
            desc = handler.description,
            spent_us = spent.0,
            status = ?result.status,
            "pipeline done"
        );
        result
    }

    fn run_handler(
        &mut self,
        conn: &mut NetConnection,
        ctx: &mut ProcessCtx<'_>,
        header: &FrameHeader,
        handler: &HandlerSpec,
        length: usize,
    ) -> ProcessResult {
        // Parse the fragment body.
        let partial = match self.codec.parse(&conn.recv_buf.read_slice()[HEADER_SIZE..length]) {
            Ok(b) => b,
            Err(err) => {
                error!(?err, command = format_args!("{:#010X}", header.command), "body parse failed");
                return ProcessResult::new(ProcessStatus::BodyParseError, length);
            }
        };
        let sid = partial.session_id().unwrap_or_default().to_string();

        // A reply closes the route record of the forwarded request it
        // answers; the upstream is no longer owed anything for this session.
        if !is_request(header.command)
            && self.reassembly.find(&sid).is_some_and(|e| e.to_name.is_some())
        {
            debug!(sid = %sid, "reply for a forwarded request arrived, route record dropped");
            self.reassembly.remove(&sid);
        }

        // Session dedupe: an already-answered session replays the cached
        // response instead of re-running business.
        if handler.filters_repeated_session && ctx.session_store.exists(&sid) {
            if is_request(header.command) {
                info!(sid = %sid, "session already handled, fast reply from the session store");
                if let Some(cached) = ctx.session_store.fetch(&sid) {
                    let n = write_reply_to_input(conn, &cached);
                    let mut result = ProcessResult::new(ProcessStatus::Handled, length);
                    if n > 0 {
                        result.output = ProcessOutput::ToInput(n);
                    }
                    return result;
                }
            } else {
                info!(sid = %sid, "response of a finished session, discarded");
            }
            return ProcessResult::new(ProcessStatus::Handled, length);
        }

        // Group fragments. An end-flagged first fragment is effectively a
        // single-fragment message and never touches the cache.
        let groups = handler.has_multi_fragments && handler.group_fragments.is_some();
        let whole: Body;
        if groups && !(header.is_final() && header.packet_number == 1) {
            if !self.reassembly.contains(&sid) {
                if header.packet_number != 1 {
                    error!(
                        sid = %sid,
                        packet_number = header.packet_number,
                        "no cached message for this fragment"
                    );
                    return ProcessResult::new(ProcessStatus::OutOfOrderFragment, length);
                }
                let container =
                    handler.alloc_body.map_or_else(|| self.codec.empty(), |alloc| alloc());
                self.reassembly.insert(
                    &sid,
                    ReassemblyEntry {
                        cmd: header.command,
                        from: conn.id,
                        from_name: conn.peer_name.clone(),
                        to_name: None,
                        body: container,
                        last_op_time: ctx.now,
                    },
                );
            }

            let Some(entry) = self.reassembly.find_mut(&sid) else {
                return ProcessResult::new(ProcessStatus::OutOfOrderFragment, length);
            };
            let group = handler.group_fragments.unwrap_or(crate::registry::default_group_fragments);
            if let Err(err) = group(&partial, &mut entry.body) {
                error!(?err, sid = %sid, packet_number = header.packet_number, "fragment grouping failed");
                return ProcessResult::new(ProcessStatus::BodyParseError, length);
            }
            entry.last_op_time = ctx.now;

            if !header.is_final() {
                debug!(
                    sid = %sid,
                    packet_number = header.packet_number,
                    "fragment grouped, waiting for more"
                );
                return ProcessResult::new(ProcessStatus::Handled, length);
            }

            // End flag: the message is complete, evict the cache entry.
            match self.reassembly.remove(&sid) {
                Some(entry) => whole = entry.body,
                None => return ProcessResult::new(ProcessStatus::OutOfOrderFragment, length),
            }
        } else {
            whole = partial;
        }

        // Validation, business, post-business hooks.
        let mut retcode = RET_SUCCESS;
        if let Some(validate) = handler.validate {
            if let Err(rc) = validate(&whole) {
                error!(
                    command = format_args!("{:#010X}", header.command),
                    retcode = rc,
                    "input packet validation failed"
                );
                retcode = rc;
            }
        }

        let mut out_body = self.codec.empty();
        let mut reply = ReplyTarget::Input;
        let mut did_business = false;
        if retcode == RET_SUCCESS {
            if let Some(business) = handler.business {
                did_business = true;
                let mut bctx =
                    BusinessCtx { caches: &mut *ctx.caches, header, now: ctx.now };
                retcode = business(&mut bctx, conn, &whole, &mut out_body, &mut reply);
                if retcode != RET_SUCCESS {
                    error!(
                        command = format_args!("{:#010X}", header.command),
                        retcode, "business operation failed"
                    );
                }
            }
        }

        if did_business {
            if retcode == RET_SUCCESS {
                if let Some(commit) = handler.commit {
                    commit();
                }
            } else if let Some(rollback) = handler.rollback {
                rollback();
            }
        }

        // Assemble and emit the response, then feed the session store.
        let mut result = ProcessResult::new(ProcessStatus::Handled, length);
        if let Some(assemble) = handler.assemble_output {
            assemble(retcode, &whole, &mut out_body);
            if !out_body.is_empty() {
                let bytes = match assemble_reply(
                    handler.out_cmd,
                    retcode,
                    header,
                    &out_body,
                    self.codec.as_ref(),
                ) {
                    Ok(b) => b,
                    Err(err) => {
                        error!(?err, "response serialization failed, nothing sent");
                        return result;
                    }
                };

                match reply {
                    ReplyTarget::Input => {
                        let n = write_reply_to_input(conn, &bytes);
                        if n > 0 {
                            result.output = ProcessOutput::ToInput(n);
                        }
                    }
                    ReplyTarget::Peer(name) => {
                        // A request headed for an upstream leaves a route
                        // record behind so the heartbeat task knows a reply
                        // is still owed on this link.
                        if is_request(handler.out_cmd) && !sid.is_empty() {
                            self.reassembly.insert(
                                &sid,
                                ReassemblyEntry {
                                    cmd: header.command,
                                    from: conn.id,
                                    from_name: conn.peer_name.clone(),
                                    to_name: Some(name.clone()),
                                    body: self.codec.empty(),
                                    last_op_time: ctx.now,
                                },
                            );
                        }
                        result.output = ProcessOutput::Forward { name, bytes: bytes.clone() };
                    }
                }

                if handler.filters_repeated_session
                    && result.output != ProcessOutput::None
                    && !sid.is_empty()
                {
                    ctx.session_store.save(&sid, bytes, ctx.now);
                }
            }
        }

        result
    }

    /// Heartbeat and identity-report packets: the built-in path that works
    /// without a registry entry and keeps the connection metadata honest.
    fn diagnose_connection(
        &mut self,
        conn: &mut NetConnection,
        header: &FrameHeader,
        ctx: &mut ProcessCtx<'_>,
    ) -> ProcessResult {
        let length = header.length as usize;
        let body_bytes = conn.recv_buf.read_slice()[HEADER_SIZE..length].to_vec();
        let mut result = ProcessResult::new(ProcessStatus::Handled, length);

        match header.command {
            CMD_HEARTBEAT_REQ => {
                conn.touch(ctx.now);
                debug!(fd = conn.fd, peer = %conn.peer_name, "^~^~ heartbeat request");

                let mut resp = self.codec.empty();
                if !body_bytes.is_empty() {
                    if let Ok(req) = self.codec.parse(&body_bytes) {
                        if let Some(sid) = req.session_id() {
                            let sid = sid.to_string();
                            resp.set_session_id(&sid);
                        }
                    }
                }

                // heartbeat responses echo the request's error code
                let bytes = if resp.is_empty() {
                    header.reply(CMD_HEARTBEAT_RESP, 0, header.error_code).to_bytes().to_vec()
                } else {
                    match assemble_reply(
                        CMD_HEARTBEAT_RESP,
                        header.error_code,
                        header,
                        &resp,
                        self.codec.as_ref(),
                    ) {
                        Ok(b) => b,
                        Err(err) => {
                            error!(?err, "heartbeat response serialization failed");
                            return result;
                        }
                    }
                };
                let n = write_reply_to_input(conn, &bytes);
                if n > 0 {
                    result.output = ProcessOutput::ToInput(n);
                }
            }

            CMD_HEARTBEAT_RESP => {
                conn.touch(ctx.now);
                debug!(fd = conn.fd, peer = %conn.peer_name, "^~^~ heartbeat response");
            }

            CMD_IDENTITY_REPORT_REQ => {
                if ctx.role != TransportRole::Listener {
                    warn!(fd = conn.fd, "identity report from a peer that is not a client, ignored");
                    return result;
                }
                return self.handle_identity_request(conn, header, ctx, &body_bytes);
            }

            CMD_IDENTITY_REPORT_RESP => {
                if ctx.role != TransportRole::Requester {
                    warn!(fd = conn.fd, "identity response from a peer that is not a server, ignored");
                    return result;
                }
                conn.is_validated = true;
                info!(
                    fd = conn.fd,
                    peer = %conn.peer_name,
                    error_code = header.error_code,
                    "identity acknowledged, connection validated"
                );
            }

            _ => unreachable!("diagnosis path called for a non-diagnosis command"),
        }

        result
    }

    fn handle_identity_request(
        &mut self,
        conn: &mut NetConnection,
        header: &FrameHeader,
        ctx: &mut ProcessCtx<'_>,
        body_bytes: &[u8],
    ) -> ProcessResult {
        let length = header.length as usize;
        let mut result = ProcessResult::new(ProcessStatus::Handled, length);

        let req = match self.codec.parse(body_bytes) {
            Ok(b) => b,
            Err(err) => {
                error!(?err, "identity report body parse failed");
                return ProcessResult::new(ProcessStatus::BodyParseError, length);
            }
        };
        let sid = req.session_id().unwrap_or_default().to_string();
        let server_type = req.server_type().unwrap_or(0);
        let client_name = match req.server_name() {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => {
                error!("identity report without a server name");
                return ProcessResult::new(ProcessStatus::BodyParseError, length);
            }
        };

        info!(
            sid = %sid,
            server_type,
            server_name = %client_name,
            "identity report request"
        );

        conn.peer_name = client_name.clone();

        enum Known {
            New,
            ActiveDuplicate,
            Returning,
        }
        let known = match ctx.caches.primary.find(&client_name) {
            None => Known::New,
            Some(existing) if existing.is_alive() => Known::ActiveDuplicate,
            Some(_) => Known::Returning,
        };

        let mut retcode = RET_SUCCESS;
        match known {
            Known::New => {
                let type_name = ctx
                    .config
                    .type_name_for(server_type)
                    .map_or_else(|| format!("type-{server_type}"), str::to_string);
                let entry = lattice_net::ConnIndex {
                    server_type: type_name,
                    is_server: false,
                    alias: client_name.clone(),
                    peer_ip: conn.peer_ip.clone(),
                    peer_port: conn.peer_port,
                    attrs: lattice_net::ConnAttr { is_primary: true },
                    conn: Some(conn.id),
                };
                if let Err(err) = ctx.caches.primary.add(&client_name, entry) {
                    error!(?err, "could not add the client to the connection cache");
                    return result;
                }
                info!(name = %client_name, "new client added to the connection cache");
            }
            Known::ActiveDuplicate => {
                error!(
                    name = %client_name,
                    "an active client with this name already exists, request refused"
                );
                retcode = RET_UNKNOWN;
            }
            Known::Returning => {
                if let Some(existing) = ctx.caches.primary.find_mut(&client_name) {
                    existing.peer_ip = conn.peer_ip.clone();
                    existing.peer_port = conn.peer_port;
                    existing.conn = Some(conn.id);
                }
                info!(name = %client_name, "returning client, cache entry refreshed");
            }
        }

        if retcode == RET_SUCCESS {
            conn.owner = Some(client_name.clone());
            conn.is_validated = true;
            debug!(name = %client_name, "connection validated");
        }

        let mut resp = self.codec.empty();
        resp.set_session_id(&sid);
        match assemble_reply(CMD_IDENTITY_REPORT_RESP, retcode, header, &resp, self.codec.as_ref())
        {
            Ok(bytes) => {
                let n = write_reply_to_input(conn, &bytes);
                if n > 0 {
                    result.output = ProcessOutput::ToInput(n);
                }
            }
            Err(err) => error!(?err, "identity response serialization failed"),
        }

        result
    }

    fn handle_incomplete(
        &mut self,
        conn: &mut NetConnection,
        now: Micros,
        avail: usize,
        expected: Option<usize>,
    ) -> ProcessResult {
        warn!(
            fd = conn.fd,
            peer = %conn.peer_name,
            actual = avail,
            expected = expected.unwrap_or(HEADER_SIZE),
            "incomplete packet, waiting for more bytes"
        );

        let since = self.incomplete_since.entry(conn.peer_name.clone()).or_insert(now);
        if now.elapsed_since(*since) >= INCOMPLETE_PACKET_TIMEOUT {
            warn!(
                fd = conn.fd,
                peer = %conn.peer_name,
                "packet stayed incomplete for too long, recv ring may hold bad data, resetting it"
            );
            conn.recv_buf.reset();
            self.incomplete_since.remove(&conn.peer_name);
            return ProcessResult::new(ProcessStatus::Timeout, 0);
        }

        ProcessResult::new(ProcessStatus::NeedMore, 0)
    }
}

/// Puts a finished response into the input connection's send ring, flushing
/// the ring to the socket first when it is too full to take the packet.
/// Returns the bytes queued, zero when the response had to be discarded.
fn write_reply_to_input(conn: &mut NetConnection, bytes: &[u8]) -> usize {
    if conn.send_buf.free_space() < bytes.len() {
        warn!(
            fd = conn.fd,
            peer = %conn.peer_name,
            "send ring has little space left, flushing it"
        );
        let _ = send_from_connection(conn);
    }
    if conn.send_buf.free_space() < bytes.len() {
        error!(fd = conn.fd, "still no room for the response, discarding it");
        return 0;
    }
    conn.send_buf.push(bytes)
}
