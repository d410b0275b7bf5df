//! Built-in modules.

use once_cell::sync::Lazy;
use std::sync::{Mutex, Once};

use crate::Error;

pub mod cache;
pub mod inputs;
pub mod outputs;

static REGISTER: Once = Once::new();
/// Stores any error that occurred during built-in registration.
static REGISTER_ERROR: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));

fn register_builtins() -> Result<(), Error> {
    inputs::register_builtins()?;
    outputs::register_builtins()?;
    cache::register_builtins()?;
    Ok(())
}

/// Register the built-in modules exactly once.
pub(crate) fn ensure_registered() -> Result<(), Error> {
    REGISTER.call_once(|| {
        if let Err(e) = register_builtins() {
            if let Ok(mut slot) = REGISTER_ERROR.lock() {
                *slot = Some(format!("{}", e));
            }
        }
    });

    if let Ok(slot) = REGISTER_ERROR.lock() {
        if let Some(e) = &*slot {
            return Err(Error::Startup(format!("module registration failed: {}", e)));
        }
    }
    Ok(())
}
