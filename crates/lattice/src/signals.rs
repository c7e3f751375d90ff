//! Signal wiring: lifecycle signals flip one shared flag the main loop
//! polls; crash signals flush logs and fall back to the default
//! disposition so the OS still produces a core file.

use std::{
    io,
    sync::{Arc, atomic::AtomicBool},
};

use signal_hook::consts::signal::{SIGABRT, SIGBUS, SIGINT, SIGQUIT, SIGTERM};
use tracing::info;

use crate::logging;

/// Registers SIGINT and SIGTERM to set the returned flag. The handlers
/// touch nothing else; the main loop exits at its next safe point.
pub fn install_shutdown_flag() -> io::Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    for sig in [SIGINT, SIGTERM] {
        signal_hook::flag::register(sig, flag.clone())?;
    }
    info!("shutdown signals registered");
    Ok(flag)
}

/// Registers the catchable fatal signals to flush pending log output once
/// and then re-raise with the default disposition. SIGSEGV and friends are
/// not hookable from here and keep their default disposition throughout.
pub fn install_crash_hook() -> io::Result<()> {
    for sig in [SIGABRT, SIGBUS, SIGQUIT] {
        // Safety: the handler only flushes stdio and chains to the default
        // disposition, both async-signal-tolerable for a dying process.
        unsafe {
            signal_hook::low_level::register(sig, move || {
                logging::flush();
                let _ = signal_hook::low_level::emulate_default_handler(sig);
            })?;
        }
    }
    Ok(())
}
