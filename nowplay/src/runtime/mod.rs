//! Module host: builds the module chain from configuration, starts it in
//! kind order, runs the dispatcher, and tears everything down again.

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{lookup, Config, CoreSettings, ModuleBody};
use crate::{Cache, Error, Input, Output, OutputId, Publisher, Shutdown};

mod dispatch;
use dispatch::{CacheSlot, Dispatcher, OutputSlot};

struct ChainModule {
    name: String,
    body: ModuleBody,
}

/// A configured module chain ready to run.
///
/// ```no_run
/// use nowplay::{Runtime, Shutdown};
///
/// let conf = "module ticker\n\
///             module http\n\
///             url http://example.com/submit\n";
/// # tokio_test::block_on(async {
/// let runtime = Runtime::from_config(conf).unwrap();
/// let shutdown = Shutdown::new();
/// runtime.run(shutdown).await.unwrap();
/// # })
/// ```
pub struct Runtime {
    settings: CoreSettings,
    chain: Vec<ChainModule>,
}

impl Runtime {
    /// Parse a configuration string and instantiate the declared modules.
    /// Built-in modules are registered on first use.
    pub fn from_config(text: &str) -> Result<Self, Error> {
        crate::modules::ensure_registered()?;
        let mut config = Config::new();
        config.parse_str(text)?;
        Self::new(config)
    }

    /// Instantiate the modules a parsed [`Config`] declares.
    pub fn new(config: Config) -> Result<Self, Error> {
        crate::modules::ensure_registered()?;

        let mut chain = Vec::with_capacity(config.modules.len());
        for decl in &config.modules {
            let registered = lookup(decl.module())?
                .ok_or_else(|| Error::UnknownModule(decl.module().to_string()))?;
            let body = (registered.create)(decl)?;
            chain.push(ChainModule {
                name: decl.name.clone(),
                body,
            });
        }

        Ok(Runtime {
            settings: config.settings,
            chain,
        })
    }

    /// Core settings gathered from the configuration.
    pub fn settings(&self) -> &CoreSettings {
        &self.settings
    }

    /// Run the chain until `shutdown` fires.
    ///
    /// Startup order is cache, then outputs, then inputs, stable within each
    /// kind.  At most one cache survives startup; extra caches and caches
    /// that fail to start are discarded.  Any output or input failing to
    /// start rolls back what already started and returns an error.  A
    /// shutdown arriving during startup tears down cleanly and returns `Ok`.
    pub async fn run(self, shutdown: Shutdown) -> Result<(), Error> {
        let Runtime { settings, chain } = self;

        // Stable bucket sort on module kind; declaration order survives
        // within each bucket.
        let mut cache_candidates: Vec<(String, Box<dyn Cache + Send>)> = Vec::new();
        let mut outputs: Vec<(String, Box<dyn Output + Send>)> = Vec::new();
        let mut inputs: Vec<(String, Box<dyn Input + Send>)> = Vec::new();
        for module in chain {
            match module.body {
                ModuleBody::Cache(cache) => cache_candidates.push((module.name, cache)),
                ModuleBody::Output(output) => outputs.push((module.name, output)),
                ModuleBody::Input(input) => inputs.push((module.name, input)),
            }
        }

        if outputs.is_empty() {
            error!("no output modules");
            return Err(Error::NoOutputs);
        }

        // The chain permits one active cache: the first that starts wins,
        // failed and surplus candidates are dropped.
        let mut cache: Option<CacheSlot> = None;
        let mut candidates = cache_candidates.into_iter();
        for (name, mut candidate) in candidates.by_ref() {
            if !shutdown.is_running() {
                return Ok(());
            }
            info!(module = %name, "starting cache");
            match candidate.start().await {
                Ok(()) => {
                    debug!(module = %name, "this will be our cache");
                    cache = Some(CacheSlot {
                        name,
                        cache: candidate,
                    });
                    break;
                }
                Err(e) => error!(module = %name, error = %e, "error starting cache module"),
            }
        }
        for (name, _) in candidates {
            debug!(module = %name, "discarding surplus cache module");
        }

        if cache.is_none() && settings.require_cache {
            error!("no cache module started");
            return Err(Error::NoCacheStarted);
        }

        // Outputs next; a single failure unwinds everything started so far.
        let mut slots: Vec<OutputSlot> = Vec::with_capacity(outputs.len());
        let mut startup_error: Option<Error> = None;
        for (index, (name, mut output)) in outputs.into_iter().enumerate() {
            if !shutdown.is_running() {
                break;
            }
            info!(module = %name, "starting output");
            match output.start().await {
                Ok(()) => slots.push(OutputSlot::new(OutputId(index), name, output)),
                Err(e) => {
                    error!(module = %name, error = %e, "error starting module");
                    startup_error = Some(Error::Startup(format!("{}: {}", name, e)));
                    break;
                }
            }
        }
        if startup_error.is_some() || !shutdown.is_running() {
            for slot in slots.iter_mut().rev() {
                info!(module = %slot.name, "stopping");
                if let Err(e) = slot.output.close().await {
                    warn!(module = %slot.name, error = %e, "error closing output");
                }
            }
            if let Some(slot) = cache.as_mut() {
                info!(module = %slot.name, "stopping");
                if let Err(e) = slot.cache.close().await {
                    warn!(module = %slot.name, error = %e, "error closing cache");
                }
            }
            return match startup_error {
                Some(e) => Err(e),
                None => Ok(()),
            };
        }

        // The dispatcher owns the outputs and the cache from here on.
        let (tx, rx) = flume::unbounded();
        let publisher = Publisher::new(tx);
        let dispatcher_task =
            tokio::spawn(Dispatcher::new(rx, slots, cache, shutdown.clone()).run());

        // Inputs last; each gets its own worker task.
        let mut workers: Vec<(String, JoinHandle<()>)> = Vec::new();
        for (name, mut input) in inputs {
            if !shutdown.is_running() {
                break;
            }
            info!(module = %name, "starting input");
            if let Err(e) = input.start().await {
                error!(module = %name, error = %e, "error starting module");
                startup_error = Some(Error::Startup(format!("{}: {}", name, e)));
                break;
            }
            let songs = publisher.clone();
            let worker_shutdown = shutdown.clone();
            let worker_name = name.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = input.run(songs, worker_shutdown).await {
                    error!(module = %worker_name, error = %e, "input worker failed");
                }
                if let Err(e) = input.close().await {
                    warn!(module = %worker_name, error = %e, "error closing input");
                }
            });
            workers.push((name, handle));
        }
        drop(publisher);

        if startup_error.is_none() && shutdown.is_running() {
            info!("daemon running");
            shutdown.woken().await;
            info!("got shutdown signal; exiting");
        }

        // Stop in chain order: dispatcher, cache, outputs, inputs.
        shutdown.trigger();
        let (mut slots, cache) = match dispatcher_task.await {
            Ok(parts) => parts,
            Err(e) => {
                error!(error = %e, "dispatcher task failed");
                (Vec::new(), None)
            }
        };
        if let Some(mut slot) = cache {
            info!(module = %slot.name, "stopping");
            if let Err(e) = slot.cache.close().await {
                warn!(module = %slot.name, error = %e, "error closing cache");
            }
        }
        for slot in slots.iter_mut() {
            info!(module = %slot.name, "stopping");
            if let Err(e) = slot.output.close().await {
                warn!(module = %slot.name, error = %e, "error closing output");
            }
        }
        for (name, handle) in workers {
            debug!(module = %name, "joining input worker");
            if handle.await.is_err() {
                error!(module = %name, "input worker panicked");
            }
        }

        info!("terminated");
        match startup_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
