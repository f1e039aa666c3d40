//! Test-case runner
//!
//! Compiles one script, builds its execution queue, drains it against the
//! testbed and reports the verdict. Every run gets a fresh
//! [`RunContext`], so nothing carries over between test cases.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::command_list::CommandList;
use crate::correlator::{StreamInfo, StreamResult};
use crate::devices::Testbed;
use crate::engine::{Engine, ExecSettings, Session};
use crate::error::ScriptError;
use crate::parser::{self, ParseOptions};
use crate::program::ProgramRegistry;
use crate::scheduler::{ExecutionQueue, Scheduler};
use crate::symbols::{DeviceInfo, RunContext, Verdict};

/// Configuration for a run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Test-case script
    pub script: PathBuf,
    /// Searched for included files after the including file's directory
    pub include_dirs: Vec<PathBuf>,
    /// Certification program; selects the substitution strategy
    pub program: String,
    /// Default receive timeout, overridden by the `socktimeout` variable
    pub socket_timeout: Duration,
    pub connect_timeout: Duration,
    /// Ping agents before sending
    pub probe: bool,
    /// File name compiled as a feature-info file
    pub feature_file: Option<String>,
    /// `pause` waits for the operator
    pub interactive: bool,
    /// Variables bound before compilation
    pub variables: Vec<(String, String)>,
    /// Access points active in this test case; falls back to `$ActiveAPs`
    pub active_aps: Vec<String>,
    pub connect_retries: usize,
    pub retry_backoff: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        let exec = ExecSettings::default();
        Self {
            script: PathBuf::from("test.txt"),
            include_dirs: Vec::new(),
            program: String::new(),
            socket_timeout: exec.socket_timeout,
            connect_timeout: exec.connect_timeout,
            probe: exec.probe,
            feature_file: None,
            interactive: exec.interactive,
            variables: Vec::new(),
            active_aps: Vec::new(),
            connect_retries: exec.connect_retries,
            retry_backoff: exec.retry_backoff,
        }
    }
}

impl RunConfig {
    fn exec_settings(&self) -> ExecSettings {
        ExecSettings {
            socket_timeout: self.socket_timeout,
            connect_timeout: self.connect_timeout,
            probe: self.probe,
            interactive: self.interactive,
            connect_retries: self.connect_retries,
            retry_backoff: self.retry_backoff,
        }
    }

    fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            include_dirs: self.include_dirs.clone(),
            feature_file: self.feature_file.clone(),
        }
    }
}

/// Streams seen during a run
#[derive(Debug, Clone, Default)]
pub struct StreamReport {
    pub infos: Vec<StreamInfo>,
    pub sent: Vec<StreamResult>,
    pub received: Vec<StreamResult>,
}

/// Outcome of one run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub verdict: Verdict,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub stopped_early: bool,
    pub stop_reason: Option<String>,
    pub streams: StreamReport,
    /// Script-variable table at the end of the run
    pub variables: Vec<(String, String)>,
    /// Bound protocol returns at the end of the run
    pub returns: Vec<(String, String)>,
    pub validation: Vec<DeviceInfo>,
    /// Execution log
    pub log: String,
    pub duration: Duration,
}

impl RunReport {
    fn from_session(session: &Session<'_>, duration: Duration) -> Self {
        let ctx = session.ctx();
        let tally = ctx.tally();
        let stop = ctx.stop_reason();
        let table = session.correlator().table();
        Self {
            verdict: tally.verdict(),
            total: tally.total(),
            passed: tally.passed,
            failed: tally.failed,
            stopped_early: stop.is_some(),
            stop_reason: stop.map(|s| s.message),
            streams: StreamReport {
                infos: table.infos(),
                sent: table.sent(),
                received: table.received(),
            },
            variables: ctx.variables(),
            returns: ctx.returns(),
            validation: ctx.device_infos(),
            log: ctx.log(),
            duration,
        }
    }

    /// `PASS total=N pass=P fail=F`
    pub fn summary(&self) -> String {
        format!(
            "{} total={} pass={} fail={}",
            self.verdict, self.total, self.passed, self.failed
        )
    }

    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }
}

/// Compiled form of a script, for inspection without a testbed
pub struct CompiledScript {
    pub list: CommandList,
    pub queue: ExecutionQueue,
}

impl fmt::Display for CompiledScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "# command list")?;
        write!(f, "{}", self.list)?;
        writeln!(f, "# execution queue")?;
        write!(f, "{}", self.queue)
    }
}

/// The test-case runner
pub struct Runner {
    engine: Engine,
    config: RunConfig,
    programs: ProgramRegistry,
}

impl Runner {
    pub fn new(config: RunConfig) -> Self {
        Self::with_engine(Engine::new(), config)
    }

    pub fn with_engine(engine: Engine, config: RunConfig) -> Self {
        Self {
            engine,
            config,
            programs: ProgramRegistry::new(),
        }
    }

    /// Mutable access to the engine, for registering actions and callbacks
    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    pub fn programs_mut(&mut self) -> &mut ProgramRegistry {
        &mut self.programs
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    fn new_context(&self) -> RunContext {
        let ctx = RunContext::with_program(self.programs.get(&self.config.program));
        for (key, value) in &self.config.variables {
            ctx.set_var(key, value.clone());
        }
        ctx
    }

    fn testbed(&self, ctx: &RunContext, list: &CommandList) -> Testbed {
        let mut testbed = Testbed::new();
        testbed.load_definitions(list);
        if !self.config.active_aps.is_empty() {
            testbed.set_active_aps(self.config.active_aps.iter().cloned());
        } else if let Some(aps) = ctx.var("ActiveAPs") {
            testbed.set_active_aps(aps.split(',').map(|s| s.trim().to_string()));
        }
        testbed
    }

    fn prepare(&self, ctx: &RunContext) -> Result<CompiledScript, ScriptError> {
        let list = parser::compile(&self.config.script, ctx, &self.config.parse_options())?;
        tracing::debug!(nodes = list.len(), groups = list.groups().len(), "compiled");
        let testbed = self.testbed(ctx, &list);
        let is_action = |name: &str| self.engine.is_action(name);
        let queue = Scheduler::new(&testbed, &is_action).build(&list)?;
        Ok(CompiledScript { list, queue })
    }

    /// Compile and schedule without touching the network.
    pub fn compile_only(&self) -> Result<CompiledScript, ScriptError> {
        let ctx = self.new_context();
        self.prepare(&ctx)
    }

    /// Run the test case.
    pub fn run(&self) -> Result<RunReport, ScriptError> {
        let start = Instant::now();
        let ctx = Arc::new(self.new_context());
        let compiled = self.prepare(&ctx)?;
        tracing::info!(
            script = %self.config.script.display(),
            tasks = compiled.queue.tasks().len(),
            "running"
        );

        let session = Session::new(&self.engine, Arc::clone(&ctx), self.config.exec_settings());
        session.drain(compiled.queue);
        session.finish();

        let report = RunReport::from_session(&session, start.elapsed());
        tracing::info!(verdict = %report.verdict, total = report.total, "finished");
        Ok(report)
    }
}

/// Builder API for convenient runner construction
pub struct RunnerBuilder {
    config: RunConfig,
    engine: Option<Engine>,
}

impl RunnerBuilder {
    /// Start building a runner for the given script
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            config: RunConfig {
                script: script.into(),
                ..Default::default()
            },
            engine: None,
        }
    }

    pub fn include_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.include_dirs.push(dir.into());
        self
    }

    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.config.program = program.into();
        self
    }

    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.config.socket_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn probe(mut self, probe: bool) -> Self {
        self.config.probe = probe;
        self
    }

    pub fn feature_file(mut self, name: impl Into<String>) -> Self {
        self.config.feature_file = Some(name.into());
        self
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.config.interactive = interactive;
        self
    }

    pub fn var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.variables.push((key.into(), value.into()));
        self
    }

    pub fn active_aps<I, S>(mut self, aps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.active_aps = aps.into_iter().map(Into::into).collect();
        self
    }

    pub fn retry(mut self, retries: usize, backoff: Duration) -> Self {
        self.config.connect_retries = retries;
        self.config.retry_backoff = backoff;
        self
    }

    /// Use a custom engine
    pub fn engine(mut self, engine: Engine) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn build(self) -> Runner {
        match self.engine {
            Some(engine) => Runner::with_engine(engine, self.config),
            None => Runner::new(self.config),
        }
    }
}

/// Parse `KEY=VALUE`.
pub fn parse_assignment(s: &str) -> Result<(String, String), ScriptError> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(ScriptError::config(format!("expected KEY=VALUE, got '{}'", s))),
    }
}
