//! A runnable sample node: parses the standard CLI surface, loads the
//! configuration, wires one demo command into the framework and runs the
//! main loop until a lifecycle signal arrives.

use std::path::PathBuf;

use clap::Parser;
use lattice::{
    App, BusinessCtx, Config, CoreError, Customization, HandlerSpec, ReplyTarget,
    default_assemble_output, default_group_fragments, logging, signals,
};
use lattice_net::NetConnection;
use lattice_proto::{Body, RET_SUCCESS};
use tracing::{error, info};

/// Demo command: echoes the request payload back, deduplicating repeated
/// sessions and accepting fragmented requests.
const CMD_ECHO_REQ: u32 = 0x0000_0010;
const CMD_ECHO_RESP: u32 = 0x0000_0011;

#[derive(Parser, Debug)]
#[command(name = "lattice-node", version, about = "Sample node on the lattice framework")]
struct Cli {
    /// Configuration file to load at startup.
    #[arg(short, long = "config-file")]
    config_file: Option<PathBuf>,

    /// Run as a daemon (detachment is delegated to the supervisor).
    #[arg(short, long)]
    daemon: bool,

    /// Keep startup output to a minimum.
    #[arg(short, long = "quiet-mode")]
    quiet_mode: bool,

    /// Print the supported command codes and exit.
    #[arg(long = "list-commands")]
    list_commands: bool,
}

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

struct EchoNode {
    list_commands: bool,
}

impl Customization for EchoNode {
    fn check_cli_options(&mut self, _config: &Config) -> Result<bool, CoreError> {
        if !self.list_commands {
            return Ok(false);
        }
        for spec in self.handlers() {
            println!("{:#010X}\t{}", spec.in_cmd, spec.description);
        }
        Ok(true)
    }

    fn handlers(&self) -> Vec<HandlerSpec> {
        let mut echo = HandlerSpec::new(CMD_ECHO_REQ, CMD_ECHO_RESP, "echo the request payload");
        echo.filters_repeated_session = true;
        echo.has_multi_fragments = true;
        echo.group_fragments = Some(default_group_fragments);
        echo.business = Some(echo_business);
        echo.assemble_output = Some(default_assemble_output);
        vec![echo]
    }
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();

    let mut config = match &cli.config_file {
        Some(path) => match Config::load(path) {
            Ok(c) => c,
            Err(err) => {
                eprintln!("failed to load configuration: {err}");
                return -1;
            }
        },
        None => Config::for_node("demo", "demo-node", "127.0.0.1", 20_000),
    };
    if cli.quiet_mode {
        config.log.level = "warn".into();
    }

    if let Err(err) = logging::init(&config.log) {
        eprintln!("failed to initialise logging: {err}");
        return -1;
    }

    let shutdown = match signals::install_shutdown_flag() {
        Ok(flag) => flag,
        Err(err) => {
            error!(?err, "failed to register lifecycle signals");
            return -1;
        }
    };
    if let Err(err) = signals::install_crash_hook() {
        error!(?err, "failed to register crash hooks");
        return -1;
    }

    if cli.daemon {
        info!("daemon mode requested; detachment is left to the process supervisor");
    }

    let node = EchoNode { list_commands: cli.list_commands };
    let mut app = match App::build(config, Box::new(node)) {
        Ok(Some(app)) => app.with_shutdown_flag(shutdown),
        Ok(None) => return 0,
        Err(err) => {
            error!(?err, "startup failed");
            return -1;
        }
    };

    match app.run() {
        Ok(()) => 0,
        Err(err) => {
            error!(?err, "main loop failed");
            -1
        }
    }
}
