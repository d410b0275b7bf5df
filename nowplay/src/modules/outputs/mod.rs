//! Output modules: batch submitters with per-song failure reporting.

use crate::Error;

pub mod http;

pub(crate) fn register_builtins() -> Result<(), Error> {
    http::register_http()
}
