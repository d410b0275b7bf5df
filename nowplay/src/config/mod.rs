//! Configuration loader and module registration primitives.
//!
//! The daemon reads a line-oriented configuration: one directive per line,
//! `#` starts a comment, whitespace is trimmed.  A `module <name> [arg...]`
//! directive instantiates a module from the registry and switches the parser
//! to it; every following directive configures that module until the next
//! `module` line.  Directives before the first `module` line configure the
//! core.
//!
//! ```text
//! loglevel 12
//! logfile /var/log/nowplayd.log
//!
//! module mpd
//! host localhost
//! port 6600
//!
//! module http
//! name scrobbler
//! url http://example.com/submit
//! username joe
//! password secret
//! ```

use std::fmt;
use tracing::info;

use super::{Cache, Error, Input, Output};

mod registration;
pub use registration::register_module;
pub(crate) use registration::lookup;

/// Module kind.  The taxonomy is fixed; the dispatcher core is not a
/// registrable module.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ModuleType {
    /// [`crate::Input`] trait enum variant
    Input,
    /// [`crate::Output`] trait enum variant
    Output,
    /// [`crate::Cache`] trait enum variant
    Cache,
}

impl fmt::Display for ModuleType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ModuleType::Input => "input",
            ModuleType::Output => "output",
            ModuleType::Cache => "cache",
        };
        write!(f, "{}", msg)
    }
}

/// Enum holding the implementation of the module trait to be driven by the
/// runtime.
pub enum ModuleBody {
    /// [`crate::Input`] trait enum variant
    Input(Box<dyn Input + Send>),
    /// [`crate::Output`] trait enum variant
    Output(Box<dyn Output + Send>),
    /// [`crate::Cache`] trait enum variant
    Cache(Box<dyn Cache + Send>),
}

impl ModuleBody {
    pub(crate) fn kind(&self) -> ModuleType {
        match self {
            ModuleBody::Input(_) => ModuleType::Input,
            ModuleBody::Output(_) => ModuleType::Output,
            ModuleBody::Cache(_) => ModuleType::Cache,
        }
    }
}

/// What kind of argument an option takes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ArgKind {
    /// No argument.
    None,
    /// A non-empty string argument.
    Str,
    /// A valid integer.
    Int,
}

/// A single entry of a module's option table.
#[derive(Clone, Copy, Debug)]
pub struct OptSpec {
    /// Option keyword to recognise.
    pub key: &'static str,
    /// What kind of argument the option takes.
    pub arg: ArgKind,
}

impl OptSpec {
    /// Shorthand for building tables in module registrations.
    pub const fn new(key: &'static str, arg: ArgKind) -> Self {
        OptSpec { key, arg }
    }
}

/// Look an option up in `table` and validate its argument.
///
/// Returns the canonical key on success.  Unknown keys, a missing or
/// unexpected argument, and unparseable integers are all fatal configuration
/// errors.
pub fn check_option(
    table: &[OptSpec],
    key: &str,
    arg: Option<&str>,
) -> Result<&'static str, Error> {
    let spec = table
        .iter()
        .find(|spec| spec.key == key)
        .ok_or_else(|| Error::Config(format!("{}: unknown option", key)))?;

    match spec.arg {
        ArgKind::None => {
            if arg.is_some() {
                return Err(Error::Config(format!("{}: unexpected argument", key)));
            }
        }
        ArgKind::Str => {
            if arg.map_or(true, str::is_empty) {
                return Err(Error::Config(format!("{}: argument expected", key)));
            }
        }
        ArgKind::Int => {
            let arg = arg.ok_or_else(|| Error::Config(format!("{}: argument expected", key)))?;
            if arg.parse::<i64>().is_err() {
                return Err(Error::Config(format!("{}: {}: integer expected", key, arg)));
            }
        }
    }

    Ok(spec.key)
}

/// Core-section directives (everything before the first `module` line).
const CORE_OPTIONS: &[OptSpec] = &[
    OptSpec::new("logfile", ArgKind::Str),
    OptSpec::new("loglevel", ArgKind::Int),
    OptSpec::new("requirecache", ArgKind::None),
];

/// Core configuration gathered from the config file.
#[derive(Clone, Debug)]
pub struct CoreSettings {
    /// Redirect the log stream (stderr) to this file.
    pub logfile: Option<String>,
    /// Maximum level to emit: 0 fatal, 4 error, 8 warning, 12 notice,
    /// 16 debug.  Levels in between round down.
    pub loglevel: u32,
    /// Abort startup unless a cache module starts.
    pub require_cache: bool,
}

impl Default for CoreSettings {
    fn default() -> Self {
        CoreSettings {
            logfile: None,
            loglevel: 12,
            require_cache: false,
        }
    }
}

/// A module declaration collected from the config file: registry name,
/// display name, the optional `module` directive argument, and the option
/// lines addressed to it, already checked against the module's option table.
#[derive(Clone, Debug)]
pub struct ModuleDecl {
    module: String,
    /// User-visible name, settable with the `name` directive.
    pub name: String,
    /// Remainder of the `module` directive after the module name.
    pub arg: Option<String>,
    options: Vec<(String, Option<String>)>,
}

impl ModuleDecl {
    /// Name the module was registered under.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Last value given for a string option.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    /// Last value given for an integer option.  The parser has already
    /// validated parseability against the option table.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Whether a no-argument option was given.
    pub fn flag(&self, key: &str) -> bool {
        self.options.iter().any(|(k, _)| k == key)
    }

    #[cfg(test)]
    pub(crate) fn for_test(module: &str, options: &[(&str, Option<&str>)]) -> Self {
        ModuleDecl {
            module: module.into(),
            name: module.into(),
            arg: None,
            options: options
                .iter()
                .map(|(k, v)| ((*k).into(), v.map(String::from)))
                .collect(),
        }
    }
}

/// Parsed configuration: core settings plus module declarations in the order
/// they appeared.
#[derive(Default, Debug)]
pub struct Config {
    /// Core-section settings.
    pub settings: CoreSettings,
    /// Declared modules, in declaration order.
    pub modules: Vec<ModuleDecl>,
}

impl Config {
    /// Empty configuration with default settings.
    pub fn new() -> Self {
        Config::default()
    }

    /// Parse one configuration file's text into this config.  Each file
    /// starts back in the core section; module declarations accumulate
    /// across calls.
    pub fn parse_str(&mut self, text: &str) -> Result<(), Error> {
        crate::modules::ensure_registered()?;
        let mut current: Option<(ModuleDecl, registration::RegisteredModule)> = None;

        for raw in text.lines() {
            let line = match raw.find('#') {
                Some(pos) => &raw[..pos],
                None => raw,
            }
            .trim();
            if line.is_empty() {
                continue;
            }

            let (key, rest) = match line.split_once(char::is_whitespace) {
                Some((key, rest)) => (key, rest.trim()),
                None => (line, ""),
            };
            let arg = (!rest.is_empty()).then_some(rest);

            match key {
                "name" => match (&mut current, arg) {
                    (None, _) => {
                        return Err(Error::Config("name: unknown option".into()));
                    }
                    (Some(_), None) => {
                        return Err(Error::Config("name: argument expected".into()));
                    }
                    (Some((decl, _)), Some(arg)) => decl.name = arg.to_string(),
                },

                "module" => {
                    if let Some((decl, _)) = current.take() {
                        self.modules.push(decl);
                    }

                    let arg =
                        arg.ok_or_else(|| Error::Config("module: argument expected".into()))?;
                    let (module, module_arg) = match arg.split_once(char::is_whitespace) {
                        Some((module, rest)) => (module, Some(rest.trim().to_string())),
                        None => (arg, None),
                    };

                    let registered = lookup(module)?
                        .ok_or_else(|| Error::UnknownModule(module.to_string()))?;
                    info!(module, kind = %registered.kind, "loading module");

                    current = Some((
                        ModuleDecl {
                            module: module.to_string(),
                            name: module.to_string(),
                            arg: module_arg,
                            options: Vec::new(),
                        },
                        registered,
                    ));
                }

                _ => match &mut current {
                    Some((decl, registered)) => {
                        let canonical =
                            check_option(registered.options, key, arg).map_err(|e| match e {
                                Error::Config(msg) => {
                                    Error::Config(format!("{}: {}", decl.name, msg))
                                }
                                other => other,
                            })?;
                        decl.options
                            .push((canonical.to_string(), arg.map(String::from)));
                    }
                    None => match check_option(CORE_OPTIONS, key, arg)? {
                        "logfile" => {
                            self.settings.logfile = arg.map(String::from);
                        }
                        "loglevel" => {
                            let level: i64 = arg.and_then(|a| a.parse().ok()).unwrap_or(0);
                            self.settings.loglevel = level.clamp(0, u32::MAX as i64) as u32;
                        }
                        "requirecache" => self.settings.require_cache = true,
                        _ => unreachable!("core option table is closed"),
                    },
                },
            }
        }

        if let Some((decl, _)) = current.take() {
            self.modules.push(decl);
        }

        Ok(())
    }
}
