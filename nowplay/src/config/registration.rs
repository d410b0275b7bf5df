use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, error};

use super::{ModuleBody, ModuleDecl, ModuleType, OptSpec};
use crate::Error;

/// Constructor invoked when a `module` block closes.  Receives the collected
/// declaration (options are already checked against the module's option
/// table); performs cross-option validation and returns the module instance.
pub type Constructor = fn(&ModuleDecl) -> Result<ModuleBody, Error>;

/// Registered module: kind, option table, and constructor.
#[derive(Clone)]
pub(crate) struct RegisteredModule {
    pub kind: ModuleType,
    pub options: &'static [OptSpec],
    pub create: Constructor,
}

static REGISTRY: Lazy<RwLock<HashMap<String, RegisteredModule>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a module constructor under a config-file name.
///
/// The built-in modules are registered automatically the first time a
/// [`crate::Runtime`] is created; external modules register themselves before
/// that.  Names are global across module kinds: a `module <name>` directive
/// carries no kind of its own.
pub fn register_module(
    name: &str,
    kind: ModuleType,
    options: &'static [OptSpec],
    create: Constructor,
) -> Result<(), Error> {
    let item = RegisteredModule {
        kind,
        options,
        create,
    };

    match REGISTRY.write() {
        Ok(mut registry) => {
            if registry.insert(name.to_string(), item).is_some() {
                error!(name, "module is already registered");
                return Err(Error::DuplicateRegisteredName(name.to_string()));
            }
            debug!(name, kind = %kind, "module registered");
        }
        Err(_) => {
            error!(kind = "unable to secure write lock", "InternalServerError");
            return Err(Error::UnableToSecureLock);
        }
    }

    Ok(())
}

pub(crate) fn lookup(name: &str) -> Result<Option<RegisteredModule>, Error> {
    match REGISTRY.read() {
        Ok(registry) => Ok(registry.get(name).cloned()),
        Err(_) => {
            error!(kind = "unable to secure read lock", "InternalServerError");
            Err(Error::UnableToSecureLock)
        }
    }
}
