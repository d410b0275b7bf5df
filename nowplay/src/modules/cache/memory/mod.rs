//! In-memory cache module: keeps songs that outputs failed to accept and
//! replays them when the dispatcher reports an output healthy again.
//!
//! # Configuration
//!
//! ```text
//! module memory
//! capacity 1024       # songs held at most (default 1024)
//! ```

use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::config::{register_module, ArgKind, ModuleBody, ModuleDecl, ModuleType, OptSpec};
use crate::{Cache, Error, Lifecycle, OutputId, RetryTarget, SendOutcome, Song, BATCH_LIMIT};

const DEFAULT_CAPACITY: usize = 1024;

/// One pending song and the outputs that still have to accept it.
struct Pending {
    song: Song,
    waiting: HashSet<OutputId>,
}

/// Key a song is filed under: identical sightings merge their failure sets.
#[derive(Clone, PartialEq, Eq, Hash)]
struct SongKey {
    title: Option<String>,
    artist: Option<String>,
    album: Option<String>,
    started_at: i64,
}

impl SongKey {
    fn of(song: &Song) -> Self {
        SongKey {
            title: song.title.clone(),
            artist: song.artist.clone(),
            album: song.album.clone(),
            started_at: song.started_at,
        }
    }
}

/// Insertion-ordered in-memory store of `(song, failed outputs)` pairs.
pub struct MemoryCache {
    capacity: usize,
    entries: IndexMap<SongKey, Pending>,
}

impl MemoryCache {
    /// Build a cache holding at most `capacity` songs.
    pub fn new(capacity: usize) -> Self {
        MemoryCache {
            capacity,
            entries: IndexMap::new(),
        }
    }

    /// Number of pending songs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no pending songs.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replay everything pending for one target, oldest first.
    async fn replay(&mut self, target: &mut RetryTarget<'_>) {
        let keys: Vec<SongKey> = self
            .entries
            .iter()
            .filter(|(_, pending)| pending.waiting.contains(&target.id))
            .map(|(key, _)| key.clone())
            .collect();
        if keys.is_empty() {
            return;
        }
        info!(
            output = target.name,
            pending = keys.len(),
            "resubmitting cached songs"
        );

        for batch_keys in keys.chunks(BATCH_LIMIT) {
            let batch: Vec<Song> = batch_keys
                .iter()
                .filter_map(|key| self.entries.get(key).map(|p| p.song.clone()))
                .collect();

            let failed: HashSet<usize> = match target.output.send(&batch).await {
                SendOutcome::AllFailed => {
                    debug!(output = target.name, "output failed again, keeping songs");
                    return;
                }
                SendOutcome::Sent { failed } => failed.into_iter().collect(),
            };

            for (pos, key) in batch_keys.iter().enumerate() {
                if failed.contains(&pos) {
                    continue;
                }
                if let Some(pending) = self.entries.get_mut(key) {
                    pending.waiting.remove(&target.id);
                    if pending.waiting.is_empty() {
                        self.entries.shift_remove(key);
                    }
                }
            }

            if !failed.is_empty() {
                // The output is struggling again; stop hammering it.
                debug!(
                    output = target.name,
                    failures = failed.len(),
                    "stopping replay after failures"
                );
                return;
            }
        }
    }
}

#[async_trait]
impl Lifecycle for MemoryCache {}

#[async_trait]
impl Cache for MemoryCache {
    async fn store(&mut self, song: &Song, failed: &[OutputId]) -> Result<(), Error> {
        let key = SongKey::of(song);
        let pending = self.entries.entry(key).or_insert_with(|| Pending {
            song: song.clone(),
            waiting: HashSet::new(),
        });
        pending.waiting.extend(failed.iter().copied());

        while self.entries.len() > self.capacity {
            if let Some((_, evicted)) = self.entries.shift_remove_index(0) {
                warn!(
                    title = evicted.song.title.as_deref().unwrap_or("(none)"),
                    "cache full, dropping oldest pending song"
                );
            }
        }
        Ok(())
    }

    async fn retry_for(&mut self, targets: &mut [RetryTarget<'_>]) -> Result<(), Error> {
        for target in targets {
            self.replay(target).await;
        }
        Ok(())
    }
}

const OPTIONS: &[OptSpec] = &[OptSpec::new("capacity", ArgKind::Int)];

fn create_memory(decl: &ModuleDecl) -> Result<ModuleBody, Error> {
    let capacity = match decl.get_int("capacity") {
        Some(capacity) if capacity > 0 => capacity as usize,
        Some(capacity) => {
            return Err(Error::Config(format!(
                "capacity: {}: must be positive",
                capacity
            )));
        }
        None => DEFAULT_CAPACITY,
    };
    Ok(ModuleBody::Cache(Box::new(MemoryCache::new(capacity))))
}

pub(crate) fn register_memory() -> Result<(), Error> {
    register_module("memory", ModuleType::Cache, OPTIONS, create_memory)
}
