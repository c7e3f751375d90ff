use std::{
    io,
    net::SocketAddr,
    sync::{Arc, atomic::AtomicBool},
};

use lattice_net::{
    ConnAttr, ConnId, ConnIndex,
    tcp::{RecvOutcome, TcpClient, TcpServer, Transport},
};
use lattice_timing::{Micros, Repeater, TimedTaskScheduler};
use tracing::{debug, error, info, warn};

use crate::{
    config::Config,
    customization::Customization,
    error::CoreError,
    logging,
    processor::{PacketProcessor, ProcessCtx, ProcessOutput, TransportRole},
    registry::HandlerRegistry,
    resources::{CachePair, Resources},
    session::{MemorySessionStore, SessionStore},
    tasks,
};

/// The assembled node: resources, scheduler and the application hooks.
/// `build` wires everything from the configuration; `run` is the blocking
/// main loop until a shutdown signal or the customization asks to exit.
pub struct App {
    resources: Resources,
    scheduler: TimedTaskScheduler<Resources>,
    customization: Box<dyn Customization>,
    profiler: Repeater,
}

impl App {
    /// Builds the node. Yields `None` when the customization's startup
    /// check handled everything (a print-and-quit option) and the process
    /// should exit cleanly without touching any resource.
    pub fn build(
        config: Config,
        mut customization: Box<dyn Customization>,
    ) -> Result<Option<Self>, CoreError> {
        if customization.check_cli_options(&config)? {
            info!("startup options fully handled, skipping node construction");
            return Ok(None);
        }

        let registry = HandlerRegistry::build(customization.handlers())?;
        registry.print_supported();
        let processor = PacketProcessor::new(registry, config.body_codec);

        let mut caches = CachePair::new(config.secondary_mode);
        for node in &config.upstreams {
            let entry = ConnIndex {
                server_type: node.server_type.clone(),
                is_server: true,
                alias: node.name.clone(),
                peer_ip: node.ip.clone(),
                peer_port: node.port,
                attrs: ConnAttr { is_primary: node.is_primary },
                conn: None,
            };
            let cache = if node.is_primary { &mut caches.primary } else { &mut caches.secondary };
            cache.add(&node.name, entry)?;
        }

        let server = if !config.accepts_clients {
            None
        } else {
            let addr: SocketAddr = format!("{}:{}", config.self_node.ip, config.self_node.port)
                .parse()
                .map_err(|e| CoreError::Config(format!("self-node address: {e}")))?;
            Some(
                TcpServer::bind(addr, &config.self_node.name)?
                    .with_socket_buf_size(config.buffer_settings.tcp_receive),
            )
        };
        let client = TcpClient::new(
            &config.self_node.name,
            config.timed_task_settings.timeouts.connect_trying.into(),
        )?;

        let mut resources = Resources {
            caches,
            server,
            client,
            processor,
            session_store: Box::new(MemorySessionStore::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            now: Micros::now(),
            config,
        };

        let mut scheduler = TimedTaskScheduler::default();
        tasks::register_builtin(&mut scheduler, &resources.config);
        for (name, task) in customization.timed_tasks() {
            scheduler.register(&name, task);
        }

        customization.init_business(&mut resources)?;

        Ok(Some(Self {
            resources,
            scheduler,
            customization,
            profiler: Repeater::every(Micros::from_mins(1)),
        }))
    }

    /// Swaps in an externally installed shutdown flag (the signal layer's).
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.resources.shutdown = flag;
        self
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut Resources {
        &mut self.resources
    }

    /// Blocks until shutdown. Finishes the current round, then tears the
    /// transports down.
    pub fn run(&mut self) -> Result<(), CoreError> {
        info!(
            name = %self.resources.config.self_node.name,
            pid = std::process::id(),
            "node started"
        );

        loop {
            if self.resources.shutdown_requested() {
                warn!("shutdown requested, leaving the main loop");
                break;
            }
            if self.run_once()? {
                info!("business asked to exit");
                break;
            }
        }

        self.teardown();
        Ok(())
    }

    /// One main-loop round: poll both transports, dispatch inbound bytes,
    /// route redirected replies, flush, tick the scheduler, run private
    /// business. Returns whether the loop should exit.
    pub fn run_once(&mut self) -> Result<bool, CoreError> {
        self.resources.now = Micros::now();
        let mut forwards = Vec::new();

        poll_and_process_server(&mut self.resources, &mut forwards);
        poll_and_process_client(&mut self.resources, &mut forwards);

        for (name, bytes) in forwards {
            if let Err(err) = self.resources.forward_to(&name, &bytes) {
                warn!(peer = %name, ?err, "could not route a redirected reply");
            }
        }

        flush_transports(&mut self.resources);

        let now = self.resources.now;
        self.scheduler.tick(now, &mut self.resources);

        if self.profiler.fired_at(now) {
            self.resources.caches.primary.profile();
            self.resources.caches.secondary.profile();
        }

        self.customization.run_private_business(&mut self.resources)
    }

    fn teardown(&mut self) {
        self.customization.finalize_business(&mut self.resources);
        if let Some(server) = self.resources.server.as_mut() {
            server.teardown();
        }
        self.resources.client.teardown();
        logging::flush();
        info!("resources released");
    }
}

fn poll_and_process_server(res: &mut Resources, forwards: &mut Vec<(String, Vec<u8>)>) {
    let timeout = res.config.timed_task_settings.timeouts.poll_waiting.into();
    let now = res.now;
    let Resources { config, caches, server, processor, session_store, .. } = res;
    let Some(server) = server.as_mut() else { return };

    let ready: Vec<ConnId> = server.poll(timeout).to_vec();
    let listener = server.listener_id();
    let (send_sz, recv_sz) = (config.buffer_settings.tcp_send, config.buffer_settings.tcp_receive);

    for id in ready {
        if id == listener {
            accept_all(server, send_sz, recv_sz);
            continue;
        }

        match Transport::recv_into(server, id) {
            RecvOutcome::Broken => {
                shut_bad_connection(server, caches, processor, id);
                continue;
            }
            RecvOutcome::Received(n) => {
                if n > 0 {
                    debug!(id = id.0, bytes = n, "received");
                }
            }
        }

        drain_connection(
            server,
            id,
            TransportRole::Listener,
            caches,
            session_store.as_mut(),
            processor,
            config,
            now,
            forwards,
        );
    }
}

fn poll_and_process_client(res: &mut Resources, forwards: &mut Vec<(String, Vec<u8>)>) {
    let timeout = res.config.timed_task_settings.timeouts.poll_waiting.into();
    let now = res.now;
    let Resources { config, caches, client, processor, session_store, .. } = res;

    let ready: Vec<ConnId> = client.poll(timeout).to_vec();
    for id in ready {
        match Transport::recv_into(client, id) {
            RecvOutcome::Broken => {
                shut_bad_connection(client, caches, processor, id);
                continue;
            }
            RecvOutcome::Received(n) => {
                if n > 0 {
                    debug!(id = id.0, bytes = n, "received");
                }
            }
        }

        drain_connection(
            client,
            id,
            TransportRole::Requester,
            caches,
            session_store.as_mut(),
            processor,
            config,
            now,
            forwards,
        );
    }
}

fn flush_transports(res: &mut Resources) {
    let Resources { caches, server, client, processor, .. } = res;
    if let Some(server) = server.as_mut() {
        for id in Transport::send_pending(server) {
            shut_bad_connection(server, caches, processor, id);
        }
    }
    for id in Transport::send_pending(client) {
        shut_bad_connection(client, caches, processor, id);
    }
}

fn accept_all(server: &mut TcpServer, send_sz: usize, recv_sz: usize) {
    loop {
        match server.accept_new_connection(send_sz, recv_sz) {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) => {
                error!(?err, "accept failed");
                break;
            }
        }
    }
}

/// Runs the processor over one connection's recv ring, at most the
/// configured number of packets per round.
#[allow(clippy::too_many_arguments)]
fn drain_connection<T: Transport>(
    transport: &mut T,
    id: ConnId,
    role: TransportRole,
    caches: &mut CachePair,
    session_store: &mut dyn SessionStore,
    processor: &mut PacketProcessor,
    config: &Config,
    now: Micros,
    forwards: &mut Vec<(String, Vec<u8>)>,
) {
    let limit = config.counters.message_processing_per_round;
    let mut handled_count = 0usize;

    while handled_count < limit {
        let Some(conn) = transport.find_peer_mut(id) else { break };
        if conn.recv_buf.is_empty() {
            break;
        }

        let mut ctx = ProcessCtx { caches, session_store, config, role, now };
        let result = processor.process(conn, &mut ctx);

        if result.handled > 0 {
            conn.recv_buf.advance_read(result.handled);
            conn.touch(now);
        }
        if let ProcessOutput::Forward { name, bytes } = result.output {
            forwards.push((name, bytes));
        }
        if result.status.aborts_round() {
            break;
        }
        handled_count += 1;
    }

    if handled_count > 0 {
        debug!(id = id.0, packets = handled_count, "round done");
    }
}

/// Releases a dead peer and clears its connection-cache back-pointer.
fn shut_bad_connection<T: Transport>(
    transport: &mut T,
    caches: &mut CachePair,
    processor: &mut PacketProcessor,
    id: ConnId,
) {
    let Some(conn) = transport.close_peer(id) else { return };
    warn!(
        fd = conn.fd,
        peer = %conn.peer_name,
        address = %format!("{}:{}", conn.peer_ip, conn.peer_port),
        "peer shut down"
    );
    processor.forget_peer(&conn.peer_name);
    if let Some(owner) = conn.owner {
        caches.clear_link(&owner);
        info!(name = %owner, "connection cache link cleared");
    }
}
