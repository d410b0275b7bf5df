//! Input modules: long-running producers of song records.

use crate::Error;

pub mod mpd;
pub mod ticker;

pub(crate) fn register_builtins() -> Result<(), Error> {
    mpd::register_mpd()?;
    ticker::register_ticker()?;
    Ok(())
}
