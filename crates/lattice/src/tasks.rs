use lattice_net::{ConnIndex, NetConnection, tcp::TcpClient};
use lattice_proto::{CMD_HEARTBEAT_REQ, CMD_IDENTITY_REPORT_REQ, build_packet, make_session_id};
use lattice_timing::{Micros, TaskConfig, TimedTaskScheduler};
use tracing::{debug, error, info, warn};

use crate::{config::Config, logging, processor::PacketProcessor, resources::Resources};

pub const TASK_MESSAGE_CLEAN: &str = "message-clean";
pub const TASK_SESSION_CLEAN: &str = "session-clean";
pub const TASK_HEARTBEAT: &str = "heartbeat";
pub const TASK_LOG_FLUSHING: &str = "log-flushing";

/// Registers the four built-in periodic tasks with intervals taken from
/// the configuration (scaled by the configured time unit).
pub fn register_builtin(sched: &mut TimedTaskScheduler<Resources>, config: &Config) {
    let unit = config.timed_task_settings.time_unit;
    let iv = &config.timed_task_settings.intervals;

    sched.register(
        TASK_MESSAGE_CLEAN,
        TaskConfig::periodic(unit.to_millis(iv.message_clean), message_clean_task),
    );
    sched.register(
        TASK_SESSION_CLEAN,
        TaskConfig::periodic(unit.to_millis(iv.session_clean), session_clean_task),
    );
    sched.register(
        TASK_HEARTBEAT,
        TaskConfig::periodic(unit.to_millis(iv.heartbeat), heartbeat_task),
    );
    sched.register(
        TASK_LOG_FLUSHING,
        TaskConfig::periodic(unit.to_millis(iv.log_flushing), log_flushing_task),
    );
}

/// Evicts reassembly entries whose end flag never arrived in time.
pub fn message_clean_task(res: &mut Resources) {
    let timeouts = &res.config.timed_task_settings.timeouts;
    let (default_t, max_t) =
        (timeouts.default_message_processing, timeouts.max_message_processing);
    res.processor.clean_expired_messages(res.now, default_t, max_t);
}

/// Evicts answered sessions past the keeping window.
pub fn session_clean_task(res: &mut Resources) {
    let keep = res.config.timed_task_settings.timeouts.session_keeping;
    let now = res.now;
    res.session_store.clean_expired(now, keep);
}

/// Flushes buffered log output.
pub fn log_flushing_task(_res: &mut Resources) {
    logging::flush();
}

/// Walks both connection caches and keeps every upstream link healthy:
/// fresh links get a heartbeat, stale ones are cut, dead ones are redialled
/// and re-identified.
pub fn heartbeat_task(res: &mut Resources) {
    let now = res.now;
    let Resources { config, caches, server, client, processor, .. } = res;

    for cache in [&mut caches.primary, &mut caches.secondary] {
        cache.for_each_mut(|name, entry| {
            if entry.is_server {
                update_server_link(name, entry, client, processor, config, now);
            } else if let Some(id) = entry.conn {
                // accepted clients only get a validation sanity check
                if let Some(conn) = server.as_ref().and_then(|s| s.find_peer(id)) {
                    if !conn.is_validated {
                        warn!(name, "client connection still not validated");
                    }
                }
            }
        });
    }
}

fn update_server_link(
    name: &str,
    entry: &mut ConnIndex,
    client: &mut TcpClient,
    processor: &PacketProcessor,
    config: &Config,
    now: Micros,
) {
    let timeouts = &config.timed_task_settings.timeouts;

    let live = entry.conn.and_then(|id| {
        client.find_peer(id).filter(|c| c.peer_ip == entry.peer_ip && c.peer_port == entry.peer_port).map(|_| id)
    });

    if let Some(id) = live {
        let Some(conn) = client.find_peer_mut(id) else { return };
        let silent_for = now.elapsed_since(conn.last_op_time);

        let keep_alive = if silent_for <= timeouts.default_waiting_for_peer_reply {
            true
        } else if silent_for > timeouts.longest_waiting_for_peer_reply {
            false
        } else {
            // between the two deadlines the link survives only while slow
            // requests are still outstanding towards this peer
            processor.slow_outstanding_for(name) > 0
        };

        if keep_alive {
            debug!(name, "^~^~ heartbeat request");
            send_control_packet(conn, processor, CMD_HEARTBEAT_REQ, false, config);
            return;
        }

        error!(name, silent_us = silent_for.0, "no heartbeat reply for too long, detaching");
        client.disconnect_server(id);
        entry.conn = None;
        return;
    }

    // Not connected (or the entry went inconsistent): redial.
    entry.conn = None;
    let (send_sz, recv_sz) =
        (config.buffer_settings.tcp_send, config.buffer_settings.tcp_receive);
    match client.connect_server(&entry.peer_ip, entry.peer_port, send_sz, recv_sz) {
        Ok(id) => {
            let Some(conn) = client.find_peer_mut(id) else { return };
            conn.peer_name = name.to_string();
            conn.owner = Some(name.to_string());
            conn.last_op_time = now;

            info!(
                name,
                address = %format!("{}:{}", entry.peer_ip, entry.peer_port),
                "~ ~ ~ ~ connected, reporting identity"
            );
            send_control_packet(conn, processor, CMD_IDENTITY_REPORT_REQ, true, config);
            send_control_packet(conn, processor, CMD_HEARTBEAT_REQ, false, config);
            entry.conn = Some(id);
        }
        Err(err) => {
            error!(
                name,
                address = %format!("{}:{}", entry.peer_ip, entry.peer_port),
                ?err,
                "! ! ! ! connection attempt failed"
            );
        }
    }
}

/// Builds a heartbeat or identity-report packet and queues it on `conn`.
fn send_control_packet(
    conn: &mut NetConnection,
    processor: &PacketProcessor,
    cmd: u32,
    with_identity_body: bool,
    config: &Config,
) {
    let codec = processor.codec();
    let body = if with_identity_body {
        let mut b = codec.empty();
        b.set_session_id(&make_session_id(0));
        b.set_server_type(config.self_type_value());
        b.set_server_name(&config.self_node.name);
        Some(b)
    } else {
        None
    };

    // request packets carry error code 0
    match build_packet(cmd, 0, body.as_ref(), codec, 0, 1, true) {
        Ok(bytes) => {
            if conn.send_buf.free_space() < bytes.len() {
                warn!(peer = %conn.peer_name, "send ring full, control packet skipped");
                return;
            }
            conn.send_buf.push(&bytes);
        }
        Err(err) => error!(?err, "control packet assembly failed"),
    }
}
