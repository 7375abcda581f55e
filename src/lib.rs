use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinSet;

pub mod chain;
pub mod config;
pub mod counter;
pub mod frontier;
pub mod generator;
pub mod response;
pub mod template;
pub mod transform;

pub use config::{FilterBank, FuzzConfig};
pub use counter::Counter;
pub use frontier::Frontier;
pub use generator::{Job, JobGenerator, count_jobs};
pub use response::Response;
pub use template::RequestTemplate;
pub use transform::TransformRegistry;

/// Back-pressure bound on the job channel: the generator stalls once this
/// many tuples are waiting for a worker.
pub const JOB_CHANNEL_CAPACITY: usize = 1000;

/// Everything the engine reports while running. The binary renders these;
/// tests assert on them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FuzzEvent {
    /// A new recursion iteration started on the given prefix.
    RecursionJob { prefix: String },
    /// A queued prefix exceeded the recursion depth and was skipped.
    DepthSkipped { prefix: String },
    /// A response passed the match filters; the payload is the formatted
    /// result line.
    Match(String),
    /// A chain failed for good, or an internal step could not proceed.
    Error(String),
    Progress { done: u64, errors: u64, rate: u64 },
    Finished,
}

/// State shared by every worker for the duration of a run.
pub(crate) struct EngineShared {
    pub(crate) config: FuzzConfig,
    pub(crate) client: reqwest::Client,
    pub(crate) templates: Vec<RequestTemplate>,
    pub(crate) registry: TransformRegistry,
    pub(crate) counter: Counter,
    pub(crate) frontier: Frontier,
    /// Readers: workers while a request is on the wire. Writer: the trigger
    /// command, which pauses all sends until it completes.
    pub(crate) req_lock: RwLock<()>,
    pub(crate) events: mpsc::Sender<FuzzEvent>,
}

/// Per-iteration view of the frontier head. Stable while workers are in
/// flight because the queue is append-only until the iteration drains.
pub(crate) struct IterationContext {
    pub(crate) head: Vec<String>,
    pub(crate) prefix: String,
}

/// The fuzzing engine: owns the frontier loop, the worker pool and the
/// shared counters. Construct with a finalized `FuzzConfig`, a client and
/// the request templates, then `run` to completion.
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    pub fn new(
        config: FuzzConfig,
        client: reqwest::Client,
        templates: Vec<RequestTemplate>,
        events: mpsc::Sender<FuzzEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                config,
                client,
                templates,
                registry: TransformRegistry::with_builtins(),
                counter: Counter::new(),
                frontier: Frontier::new(),
                req_lock: RwLock::new(()),
                events,
            }),
        }
    }

    pub fn counter(&self) -> &Counter {
        &self.shared.counter
    }

    /// Runs the whole fuzzing job: one recursion iteration per frontier
    /// entry, a fresh worker pool per iteration, until the frontier drains.
    pub async fn run(&self) -> Result<()> {
        let sampler = tokio::spawn(progress_loop(self.shared.clone()));
        let result = self.run_iterations().await;
        sampler.abort();
        let _ = sampler.await;
        let _ = self.shared.events.send(FuzzEvent::Finished).await;
        result
    }

    async fn run_iterations(&self) -> Result<()> {
        let shared = &self.shared;
        let generator = JobGenerator::new(&shared.config.wordlists, shared.config.request.rate);
        let mut iteration = 0usize;

        while let Some(head) = shared.frontier.head() {
            let depth = shared.config.recursion.depth;
            let prefix: String = head.concat();

            if depth > 0 && head.len() > depth {
                if depth > 1 {
                    let _ = shared
                        .events
                        .send(FuzzEvent::DepthSkipped { prefix })
                        .await;
                }
            } else {
                if iteration > 0 {
                    let _ = shared
                        .events
                        .send(FuzzEvent::RecursionJob {
                            prefix: prefix.clone(),
                        })
                        .await;
                    shared.counter.reset();
                }

                let iter_ctx = Arc::new(IterationContext { head, prefix });
                let (tx, rx) = mpsc::channel::<Job>(JOB_CHANNEL_CAPACITY);
                let rx = Arc::new(Mutex::new(rx));

                let mut workers = JoinSet::new();
                for _ in 0..shared.config.general.threads.max(1) {
                    let shared = Arc::clone(shared);
                    let iter_ctx = Arc::clone(&iter_ctx);
                    let rx = Arc::clone(&rx);
                    workers.spawn(worker_loop(shared, iter_ctx, rx));
                }

                let generated: Result<()> = if shared.config.general.dos {
                    // repeat the wordlists until killed
                    loop {
                        if let Err(err) = generator.run(&tx).await {
                            break Err(err);
                        }
                    }
                } else {
                    generator.run(&tx).await
                };

                // closing the channel is what terminates the workers
                drop(tx);
                while workers.join_next().await.is_some() {}
                generated?;
            }

            shared.frontier.pop();
            iteration += 1;
        }
        Ok(())
    }
}

/// One worker: drain jobs until the channel closes, one whole chain per
/// job. A failed chain never takes the worker down with it.
async fn worker_loop(
    shared: Arc<EngineShared>,
    iter: Arc<IterationContext>,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
) {
    loop {
        let job = { rx.lock().await.recv().await };
        match job {
            Some(job) => chain::run_chain(&shared, &iter, &job).await,
            None => break,
        }
    }
}

/// Samples the counter once per second and pushes a progress event.
async fn progress_loop(shared: Arc<EngineShared>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        shared.counter.sample();
        let event = FuzzEvent::Progress {
            done: shared.counter.total(),
            errors: shared.counter.errors(),
            rate: shared.counter.rate(),
        };
        if shared.events.send(event).await.is_err() {
            break;
        }
    }
}
