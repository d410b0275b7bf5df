//! "Now-playing" submission daemon
//!
//! Collects song-start events from input modules (an MPD poller being the
//! canonical one), serializes them through a central dispatcher, submits them
//! in batches to output modules, and re-queues songs that an output failed to
//! accept into an optional cache module for later replay.
use async_trait::async_trait;
use thiserror::Error as ThisError;
use tracing::{debug, info};

/// Contains the configuration loader and module registration primitives for
/// module development
pub mod config;
pub mod modules;
pub use runtime::Runtime;
pub use shutdown::{Shutdown, Sleep};
mod runtime;
mod shutdown;

/// Largest number of songs handed to an output in a single [`Output::send`]
/// call.  Coupled to the width of the per-output failure bitmask kept by the
/// dispatcher; keep the two in sync.
pub const BATCH_LIMIT: usize = 32;

/// Songs shorter than this many seconds are dropped at the ingress filter.
pub const MIN_SONG_SECONDS: u32 = 30;

/// A song reported by an input module.
///
/// All string fields are optional on the wire; the ingress filter in
/// [`Publisher::publish`] guarantees that anything reaching an output has a
/// non-empty title and a length of at least [`MIN_SONG_SECONDS`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Song {
    /// Song's title.
    pub title: Option<String>,
    /// Song's performer.
    pub artist: Option<String>,
    /// Song's album.
    pub album: Option<String>,
    /// Song's genre.
    pub genre: Option<String>,
    /// Unix time the song started playing.
    pub started_at: i64,
    /// Unix time the song ended or will end.
    pub ends_at: i64,
    /// Song's length in seconds.
    pub length: u32,
}

/// Identity of an output module within one process lifetime.
///
/// Handed out by the runtime when the module chain starts; caches use it to
/// remember which outputs still have to see a song.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutputId(pub(crate) usize);

/// Result of offering a batch of songs to an output module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// The output attempted a submission.  `failed` holds the indices (into
    /// the batch) of songs the output failed to submit; an empty vector means
    /// every song was accepted.  Songs a server rejected permanently are
    /// *not* failures — resubmitting them will not make them be accepted.
    Sent {
        /// Batch indices of songs that failed to be submitted.
        failed: Vec<usize>,
    },
    /// Nothing could be done at all, e.g. the output is inside a backoff
    /// window and no network attempt was made.  Every song in the batch is
    /// treated as failed.
    AllFailed,
}

impl SendOutcome {
    /// Outcome reporting every song submitted.
    pub fn ok() -> Self {
        SendOutcome::Sent { failed: Vec::new() }
    }
}

/// Handle used by input modules to push songs into the dispatcher queue.
///
/// Publishing filters songs first: anything without a title or shorter than
/// [`MIN_SONG_SECONDS`] is logged and dropped before it reaches the queue.
#[derive(Clone)]
pub struct Publisher {
    tx: flume::Sender<Song>,
}

impl Publisher {
    pub(crate) fn new(tx: flume::Sender<Song>) -> Self {
        Publisher { tx }
    }

    /// Filter and enqueue a song for submission.
    pub fn publish(&self, song: Song) {
        let rejected = if song.title.as_deref().map_or(true, str::is_empty) {
            Some("no title")
        } else if song.length < MIN_SONG_SECONDS {
            Some("song too short")
        } else {
            None
        };

        if let Some(reason) = rejected {
            info!(
                title = song.title.as_deref().unwrap_or("(none)"),
                artist = song.artist.as_deref().unwrap_or("(none)"),
                length = song.length,
                reason,
                "ignoring song"
            );
            return;
        }

        debug!(
            title = song.title.as_deref().unwrap_or("(none)"),
            artist = song.artist.as_deref().unwrap_or("(none)"),
            length = song.length,
            "got song"
        );

        if self.tx.send(song).is_err() {
            debug!("dispatcher queue closed, dropping song");
        }
    }
}

/// Common lifecycle shared by every module kind.
///
/// `start` runs once before the module takes part in the pipeline and must
/// not fail silently; `close` runs once during shutdown, must be prompt, and
/// must tolerate being called after a failed or skipped start.
#[async_trait]
pub trait Lifecycle {
    /// Acquire whatever resources the module needs to operate.
    async fn start(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Release resources prior to shutdown of the pipeline.
    async fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Input module trait: a long-running producer of [`Song`] records.
///
/// The runtime spawns `run` as its own task after `start` succeeds.  The
/// worker must return promptly once `shutdown` reports the daemon is
/// terminating — sleeping through [`Shutdown::sleep`] gives that for free.
#[async_trait]
pub trait Input: Lifecycle {
    /// Watch the source and publish songs until shutdown.
    async fn run(&mut self, songs: Publisher, shutdown: Shutdown) -> Result<(), Error>;
}

/// Output module trait: submits batches of songs somewhere and reports,
/// per song, whether the submission failed.
#[async_trait]
pub trait Output: Lifecycle {
    /// Try to submit every song in `songs` (at most [`BATCH_LIMIT`] of them)
    /// and report which ones failed.
    async fn send(&mut self, songs: &[Song]) -> SendOutcome;
}

/// An output an idle cache may replay pending songs to.
pub struct RetryTarget<'a> {
    /// Identity the cache filed pending songs under.
    pub id: OutputId,
    /// Display name, for logging.
    pub name: &'a str,
    /// The output itself.
    pub output: &'a mut (dyn Output + Send),
}

/// Cache module trait: a keyed store of songs together with the set of
/// outputs that still have to accept them.
#[async_trait]
pub trait Cache: Lifecycle {
    /// Remember that `song` must still be delivered to every output in
    /// `failed`.  The call must not silently discard the song.
    async fn store(&mut self, song: &Song, failed: &[OutputId]) -> Result<(), Error>;

    /// Replay pending songs to outputs that have become healthy again.  The
    /// cache calls [`Output::send`] on each target itself; songs an output
    /// accepts are forgotten for that output, songs that fail again stay
    /// pending.
    async fn retry_for(&mut self, targets: &mut [RetryTarget<'_>]) -> Result<(), Error>;
}

/// Enum to capture errors occurring through the daemon.
///
/// Uses `thiserror` for ergonomic error handling.  Transient output errors
/// never show up here — they are folded into [`SendOutcome`] and per-output
/// backoff instead.
#[derive(Debug, ThisError)]
pub enum Error {
    /// A configuration directive was malformed or violated a module's
    /// constraints.  Fatal; aborts startup.
    #[error("config: {0}")]
    Config(String),

    /// A `module` directive named a module no one registered.
    #[error("unknown module: {0}")]
    UnknownModule(String),

    /// A module of the same name has already been registered.
    #[error("duplicate registered name: {0}")]
    DuplicateRegisteredName(String),

    /// Unable to secure the registry lock.
    #[error("internal error: unable to secure lock")]
    UnableToSecureLock,

    /// The chain contains no output modules.
    #[error("no output modules")]
    NoOutputs,

    /// `requirecache` was set but no cache module started.
    #[error("no cache module started")]
    NoCacheStarted,

    /// A module failed to start; everything already started has been rolled
    /// back.
    #[error("startup: {0}")]
    Startup(String),

    /// Failure talking to an input source or submission endpoint.
    #[error("connection: {0}")]
    Connection(String),

    /// Underlying I/O failure.
    #[error("I/O error")]
    Io(
        #[from]
        #[source]
        std::io::Error,
    ),
}
