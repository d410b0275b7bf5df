//! Song dispatcher: drains the queue, fans batches out to outputs, and
//! routes per-song failures into the cache.

use flume::Receiver;
use tracing::{debug, error, info};

use crate::{Cache, Output, OutputId, RetryTarget, SendOutcome, Shutdown, Song, BATCH_LIMIT};

/// An output module as the dispatcher drives it.
pub(crate) struct OutputSlot {
    pub(crate) id: OutputId,
    pub(crate) name: String,
    pub(crate) output: Box<dyn Output + Send>,
    /// Set while the output's last batch had failures; a clean batch after
    /// that triggers a cache replay.
    failing: bool,
}

impl OutputSlot {
    pub(crate) fn new(id: OutputId, name: String, output: Box<dyn Output + Send>) -> Self {
        OutputSlot {
            id,
            name,
            output,
            failing: false,
        }
    }
}

pub(crate) struct CacheSlot {
    pub(crate) name: String,
    pub(crate) cache: Box<dyn Cache + Send>,
}

/// Single consumer of the song queue.  Runs as its own task; hands its
/// modules back on exit so the runtime can close them in chain order.
pub(crate) struct Dispatcher {
    queue: Receiver<Song>,
    outputs: Vec<OutputSlot>,
    cache: Option<CacheSlot>,
    shutdown: Shutdown,
}

impl Dispatcher {
    pub(crate) fn new(
        queue: Receiver<Song>,
        outputs: Vec<OutputSlot>,
        cache: Option<CacheSlot>,
        shutdown: Shutdown,
    ) -> Self {
        Dispatcher {
            queue,
            outputs,
            cache,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) -> (Vec<OutputSlot>, Option<CacheSlot>) {
        debug!("dispatcher started");

        loop {
            let first = tokio::select! {
                biased;
                _ = self.shutdown.woken() => break,
                song = self.queue.recv_async() => match song {
                    Ok(song) => song,
                    Err(_) => break,
                },
            };

            // Take the whole queue in one go; submission happens with the
            // queue free for producers.
            let mut drained = vec![first];
            while let Ok(song) = self.queue.try_recv() {
                drained.push(song);
            }

            if !self.shutdown.is_running() {
                break;
            }

            for batch in drained.chunks(BATCH_LIMIT) {
                self.submit(batch).await;
            }
        }

        debug!("dispatcher exiting");
        (self.outputs, self.cache)
    }

    /// Offer one batch to every output in declaration order, then hand each
    /// song with failures to the cache together with the set of outputs that
    /// failed it.
    ///
    /// The failure matrix is one bitmask per output: bit `j` set means the
    /// output failed song `j` of this batch.  An `AllFailed` outcome, or a
    /// failure count covering the whole batch, sets every bit.
    async fn submit(&mut self, songs: &[Song]) {
        debug_assert!(songs.len() <= BATCH_LIMIT);

        let mut flags: Vec<u32> = Vec::with_capacity(self.outputs.len());
        for slot in self.outputs.iter_mut() {
            let mask = match slot.output.send(songs).await {
                SendOutcome::AllFailed => u32::MAX,
                SendOutcome::Sent { failed } if failed.len() >= songs.len() => u32::MAX,
                SendOutcome::Sent { failed } => failed
                    .iter()
                    .filter(|&&pos| pos < songs.len())
                    .fold(0u32, |mask, &pos| mask | 1 << pos),
            };
            flags.push(mask);
        }

        let Some(cache) = self.cache.as_mut() else {
            // Without a cache there is nothing to do with failure
            // information.
            return;
        };

        for (pos, song) in songs.iter().enumerate() {
            let bit = 1u32 << pos;
            let failed: Vec<OutputId> = self
                .outputs
                .iter()
                .zip(&flags)
                .filter(|(_, &mask)| mask & bit != 0)
                .map(|(slot, _)| slot.id)
                .collect();
            if failed.is_empty() {
                continue;
            }
            if let Err(e) = cache.cache.store(song, &failed).await {
                error!(cache = %cache.name, error = %e, "failed to cache song");
            }
        }

        // An output going from failing to clean is the moment to replay what
        // the cache holds for it.
        for (slot, &mask) in self.outputs.iter_mut().zip(&flags) {
            if mask != 0 {
                slot.failing = true;
                continue;
            }
            if !slot.failing {
                continue;
            }
            slot.failing = false;
            info!(output = %slot.name, "output healthy again, replaying cached songs");
            let mut targets = [RetryTarget {
                id: slot.id,
                name: &slot.name,
                output: slot.output.as_mut(),
            }];
            if let Err(e) = cache.cache.retry_for(&mut targets).await {
                error!(cache = %cache.name, error = %e, "cache replay failed");
            }
        }
    }
}
