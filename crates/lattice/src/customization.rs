use lattice_timing::TaskConfig;

use crate::{config::Config, error::CoreError, registry::HandlerSpec, resources::Resources};

/// The application's hooks into the framework lifecycle. Every method has
/// a do-nothing default, so a minimal node implements none of them.
pub trait Customization {
    /// Extra startup checks, run by `App::build` before any resource is
    /// created. Returning `Ok(true)` means "handled, exit cleanly now"
    /// (e.g. a print-and-quit option); `build` then yields no app.
    fn check_cli_options(&mut self, _config: &Config) -> Result<bool, CoreError> {
        Ok(false)
    }

    /// The application's command table, merged into the registry at build.
    fn handlers(&self) -> Vec<HandlerSpec> {
        Vec::new()
    }

    /// Application timed tasks, registered next to the built-in ones.
    /// Names colliding with built-ins keep the built-in entry.
    fn timed_tasks(&mut self) -> Vec<(String, TaskConfig<Resources>)> {
        Vec::new()
    }

    /// Business initialisation, after resources exist and before the loop.
    fn init_business(&mut self, _res: &mut Resources) -> Result<(), CoreError> {
        Ok(())
    }

    /// Runs once per main-loop round, after IO and the scheduler.
    /// Returning `Ok(true)` asks the loop to exit.
    fn run_private_business(&mut self, _res: &mut Resources) -> Result<bool, CoreError> {
        Ok(false)
    }

    /// Teardown counterpart of `init_business`.
    fn finalize_business(&mut self, _res: &mut Resources) {}
}

/// The empty customization: a pure relay/diagnostic node.
#[derive(Default)]
pub struct NoCustomization;

impl Customization for NoCustomization {}
