//! Execution engine
//!
//! The Engine holds the local-action registry and external callbacks. It
//! is stateless config, so one engine can run many test cases. A
//! [`Session`] carries everything one run needs: the run context, the
//! connection pool and the stream correlator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::actions::{self, BoxedAction, ExternalFn};
use crate::correlator::Correlator;
use crate::error::ScriptError;
use crate::scheduler::{ExecutionQueue, QueueEntry, TaskStatus};
use crate::symbols::RunContext;
use crate::transport::ConnectionPool;

/// The execution engine: action and callback registries
pub struct Engine {
    /// Registered local actions
    pub actions: HashMap<String, BoxedAction>,
    /// Callbacks reachable through `external_func`
    pub externals: HashMap<String, ExternalFn>,
}

impl Engine {
    /// Create an engine with the default actions
    pub fn new() -> Self {
        Self {
            actions: actions::default_actions(),
            externals: HashMap::new(),
        }
    }

    /// Register a custom action
    pub fn register_action(&mut self, name: impl Into<String>, action: BoxedAction) {
        self.actions.insert(name.into(), action);
    }

    /// Register a callback for `external_func!name!...`
    pub fn register_external<F>(&mut self, name: impl Into<String>, func: F)
    where
        F: Fn(&RunContext, &[String]) -> Result<String, ScriptError> + Send + Sync + 'static,
    {
        self.externals.insert(name.into(), Arc::new(func));
    }

    pub fn is_action(&self, name: &str) -> bool {
        self.actions.contains_key(&name.to_ascii_lowercase())
    }

    /// `(name, args, summary)` for every action, sorted by name
    pub fn action_help(&self) -> Vec<(String, String, String)> {
        let mut help: Vec<(String, String, String)> = self
            .actions
            .iter()
            .map(|(name, a)| {
                let u = a.usage();
                (name.clone(), u.args, u.summary)
            })
            .collect();
        help.sort_by(|a, b| a.0.cmp(&b.0));
        help
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// Execution knobs of one run
#[derive(Debug, Clone)]
pub struct ExecSettings {
    /// Default receive timeout; the `socktimeout` variable overrides it
    pub socket_timeout: Duration,
    pub connect_timeout: Duration,
    /// Ping a host before the first non-parallel command to it
    pub probe: bool,
    pub interactive: bool,
    /// Association-status poll
    pub connect_retries: usize,
    pub retry_backoff: Duration,
}

impl Default for ExecSettings {
    fn default() -> Self {
        Self {
            socket_timeout: Duration::from_secs(240),
            connect_timeout: Duration::from_secs(10),
            probe: true,
            interactive: false,
            connect_retries: 10,
            retry_backoff: Duration::from_secs(3),
        }
    }
}

/// State of one test-case run
pub struct Session<'e> {
    pub(crate) engine: &'e Engine,
    pub(crate) ctx: Arc<RunContext>,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) correlator: Correlator,
    pub(crate) settings: ExecSettings,
}

impl<'e> Session<'e> {
    pub fn new(engine: &'e Engine, ctx: Arc<RunContext>, settings: ExecSettings) -> Self {
        let pool = Arc::new(ConnectionPool::new(settings.connect_timeout));
        let correlator = Correlator::new(Arc::clone(&pool));
        Self {
            engine,
            ctx,
            pool,
            correlator,
            settings,
        }
    }

    pub fn ctx(&self) -> &RunContext {
        &self.ctx
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Drain the main queue on the calling thread. Forks run one worker
    /// per sub-queue and are joined before the next entry.
    pub fn drain(&self, mut queue: ExecutionQueue) {
        while let Some(entry) = queue.pop() {
            if self.ctx.stopped() {
                let remaining = queue.len() + 1;
                tracing::info!(remaining, "run stopped, skipping remaining entries");
                break;
            }
            match entry {
                QueueEntry::Task(task) => {
                    if self.execute(&task) == TaskStatus::Fail && !self.ctx.stopped() {
                        self.ctx.request_stop(format!("{} failed", task), true);
                    }
                }
                QueueEntry::Fork(subs) => {
                    if !self.run_fork(subs) && !self.ctx.stopped() {
                        self.ctx.request_stop("parallel worker failed", true);
                    }
                }
            }
        }
    }

    /// Run sub-queues concurrently. Returns false if any worker failed.
    fn run_fork(&self, subs: Vec<ExecutionQueue>) -> bool {
        tracing::debug!(workers = subs.len(), "fork");
        let ok = std::thread::scope(|scope| {
            let handles: Vec<_> = subs
                .into_iter()
                .map(|queue| scope.spawn(move || self.drain_sub(queue)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or(false))
                .fold(true, |acc, ok| acc && ok)
        });
        tracing::debug!(ok, "join");
        ok
    }

    /// Worker loop for one sub-queue. A failing task ends this queue only;
    /// siblings keep going.
    fn drain_sub(&self, mut queue: ExecutionQueue) -> bool {
        let name = queue.affinity.clone().unwrap_or_default();
        while let Some(entry) = queue.pop() {
            let ok = match entry {
                QueueEntry::Task(task) => self.execute(&task) != TaskStatus::Fail,
                QueueEntry::Fork(subs) => self.run_fork(subs),
            };
            if !ok {
                tracing::warn!(queue = %name, "worker stopped after a failed task");
                return false;
            }
        }
        true
    }

    /// Stop the correlator of the last phase.
    pub fn finish(&self) {
        self.correlator.end_phase();
    }
}
