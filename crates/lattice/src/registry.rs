use std::collections::HashMap;

use lattice_net::NetConnection;
use lattice_proto::{Body, CMD_UNUSED, is_diagnosis};
use tracing::info;

use crate::{
    error::CoreError,
    processor::{BusinessCtx, ReplyTarget},
};

/// Appends a fragment to the partially assembled whole.
pub type GroupFn = fn(fragment: &Body, whole: &mut Body) -> Result<(), CoreError>;

/// Checks the parsed input; `Err` carries the retcode for the response.
pub type ValidateFn = fn(body: &Body) -> Result<(), u32>;

/// The handler's core operation. Fills `out_body`, may redirect the reply
/// to another peer, returns the retcode for the response header.
pub type BusinessFn = fn(
    ctx: &mut BusinessCtx<'_, '_>,
    in_conn: &NetConnection,
    in_body: &Body,
    out_body: &mut Body,
    reply: &mut ReplyTarget,
) -> u32;

/// Allocates the reassembly container for a multi-fragment message.
pub type AllocFn = fn() -> Body;

/// Shapes the response body after business ran.
pub type AssembleFn = fn(retcode: u32, in_body: &Body, out_body: &mut Body);

/// Post-business hook: commit on success, rollback otherwise.
pub type CommitFn = fn();

/// Default grouping: concatenate payloads, keep the first fragment's prefix.
pub fn default_group_fragments(fragment: &Body, whole: &mut Body) -> Result<(), CoreError> {
    if whole.session_id().is_none() {
        if let Some(sid) = fragment.session_id() {
            let sid = sid.to_string();
            whole.set_session_id(&sid);
        }
    }
    whole.append_payload(&fragment.payload());
    Ok(())
}

/// Default response shaping: echo the request's session id.
pub fn default_assemble_output(_retcode: u32, in_body: &Body, out_body: &mut Body) {
    if let Some(sid) = in_body.session_id() {
        let sid = sid.to_string();
        out_body.set_session_id(&sid);
    }
}

/// One row of the dispatch table: everything the processor needs to run a
/// command. Function slots left `None` select the documented defaults: no
/// group fn means single-fragment only, no assemble fn means no response,
/// no validate fn accepts everything, no business fn is a successful no-op.
#[derive(Clone, Copy)]
pub struct HandlerSpec {
    pub in_cmd: u32,
    pub out_cmd: u32,
    pub description: &'static str,
    pub filters_repeated_session: bool,
    pub has_multi_fragments: bool,
    /// Widens the reassembly TTL and keeps stale upstreams alive while
    /// requests of this command are outstanding.
    pub time_consuming: bool,
    pub group_fragments: Option<GroupFn>,
    pub validate: Option<ValidateFn>,
    pub business: Option<BusinessFn>,
    pub alloc_body: Option<AllocFn>,
    pub assemble_output: Option<AssembleFn>,
    pub commit: Option<CommitFn>,
    pub rollback: Option<CommitFn>,
}

impl HandlerSpec {
    pub fn new(in_cmd: u32, out_cmd: u32, description: &'static str) -> Self {
        Self {
            in_cmd,
            out_cmd,
            description,
            filters_repeated_session: false,
            has_multi_fragments: false,
            time_consuming: false,
            group_fragments: None,
            validate: None,
            business: None,
            alloc_body: None,
            assemble_output: None,
            commit: None,
            rollback: None,
        }
    }
}

/// Command -> handler table. Built once at startup, read-only afterwards.
pub struct HandlerRegistry {
    map: HashMap<u32, HandlerSpec>,
}

impl HandlerRegistry {
    /// Duplicate command codes and codes owned by the built-in diagnosis
    /// path are startup errors, not things to discover in production.
    pub fn build(specs: Vec<HandlerSpec>) -> Result<Self, CoreError> {
        let mut map = HashMap::with_capacity(specs.len());
        for spec in specs {
            if is_diagnosis(spec.in_cmd) || spec.in_cmd == CMD_UNUSED {
                return Err(CoreError::ReservedCommand(spec.in_cmd));
            }
            let cmd = spec.in_cmd;
            if map.insert(cmd, spec).is_some() {
                return Err(CoreError::DuplicateCommand(cmd));
            }
        }
        Ok(Self { map })
    }

    pub fn find(&self, cmd: u32) -> Option<&HandlerSpec> {
        self.map.get(&cmd)
    }

    pub fn is_time_consuming(&self, cmd: u32) -> bool {
        self.map.get(&cmd).is_some_and(|h| h.time_consuming)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn print_supported(&self) {
        let mut cmds: Vec<_> = self.map.keys().copied().collect();
        cmds.sort_unstable();
        for cmd in cmds {
            if let Some(h) = self.map.get(&cmd) {
                info!("{:#010X}\t{}", cmd, h.description);
            }
        }
    }
}
