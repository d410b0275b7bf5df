//! Now-playing submission daemon
//!
//! Collects currently-playing songs from configured inputs and submits them
//! to configured outputs, caching what could not be delivered.
use nowplay::Error;

fn main() -> Result<(), Error> {
    nowplay_cmd::run()
}
