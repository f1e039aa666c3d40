//! Per-run symbol tables
//!
//! `RunContext` holds everything one test-case run mutates: the
//! script-variable table, the protocol-return table, the result tally,
//! the runtime conditional stack, and the run log. One context is built
//! per run and dropped at teardown, so nothing leaks between runs.
//!
//! The context is shared by the driver, the parallel workers and the
//! stream correlator, so every table sits behind its own lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use regex::Regex;

use crate::ordered::OrderedMap;
use crate::program::{BaseProgram, ProgramConfig};

/// Terminal verdict of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Fail => write!(f, "FAIL"),
        }
    }
}

/// "N of M must pass" rule installed by `conditional_pass`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConditionalPass {
    pub required: usize,
    pub of: usize,
}

/// Pass/fail counters
#[derive(Debug, Clone, Default)]
pub struct ResultTally {
    pub passed: usize,
    pub failed: usize,
    /// Set by a protocol failure; fails the run regardless of the rule.
    pub forced_fail: bool,
    pub conditional: Option<ConditionalPass>,
}

impl ResultTally {
    pub fn record(&mut self, pass: bool) {
        if pass {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
    }

    pub fn total(&self) -> usize {
        self.passed + self.failed
    }

    /// Switch to the aggregate rule. Counters restart from zero.
    pub fn set_conditional(&mut self, rule: ConditionalPass) {
        self.passed = 0;
        self.failed = 0;
        self.conditional = Some(rule);
    }

    pub fn verdict(&self) -> Verdict {
        if self.forced_fail {
            return Verdict::Fail;
        }
        match self.conditional {
            Some(rule) if self.passed >= rule.required => Verdict::Pass,
            Some(_) => Verdict::Fail,
            None if self.failed == 0 => Verdict::Pass,
            None => Verdict::Fail,
        }
    }
}

/// Version/identity record captured from `ca_get_version` style responses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device: String,
    pub vendor: String,
    pub model: String,
    pub version: String,
}

/// Why the run stopped early
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReason {
    pub message: String,
    pub failed: bool,
}

/// Mutable state for a single test-case run
pub struct RunContext {
    vars: RwLock<OrderedMap<String>>,
    /// `None` marks a placeholder registered before its producing command ran.
    returns: RwLock<OrderedMap<Option<String>>>,
    tally: Mutex<ResultTally>,
    cond: Mutex<Vec<bool>>,
    stop: Mutex<Option<StopReason>>,
    log: Mutex<String>,
    validation: Mutex<Vec<DeviceInfo>>,
    display_names: Mutex<OrderedMap<String>>,
    phase: AtomicUsize,
    program: Arc<dyn ProgramConfig>,
    var_ref: Regex,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl RunContext {
    /// Create a context with the base program configuration
    pub fn new() -> Self {
        Self::with_program(Arc::new(BaseProgram))
    }

    /// Create a context whose substitutions go through `program`
    pub fn with_program(program: Arc<dyn ProgramConfig>) -> Self {
        let ctx = Self {
            vars: RwLock::new(OrderedMap::new()),
            returns: RwLock::new(OrderedMap::new()),
            tally: Mutex::new(ResultTally::default()),
            cond: Mutex::new(Vec::new()),
            stop: Mutex::new(None),
            log: Mutex::new(String::new()),
            validation: Mutex::new(Vec::new()),
            display_names: Mutex::new(OrderedMap::new()),
            phase: AtomicUsize::new(0),
            program,
            var_ref: Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").expect("static pattern"),
        };
        for (key, value) in ctx.program.defaults() {
            ctx.set_var(key, value);
        }
        ctx
    }

    pub fn program(&self) -> &dyn ProgramConfig {
        self.program.as_ref()
    }

    // ── script-variable table ───────────────────────────────

    /// Insert or update a script variable. A leading `$` is ignored.
    pub fn set_var(&self, name: impl AsRef<str>, value: impl Into<String>) {
        let name = strip_sigil(name.as_ref()).to_string();
        write(&self.vars).insert(name, value.into());
    }

    pub fn var(&self, name: &str) -> Option<String> {
        read(&self.vars).get(strip_sigil(name)).cloned()
    }

    /// Script variable interpreted as a flag (`1`, `true`, `yes`, `on`).
    pub fn flag(&self, name: &str) -> bool {
        self.var(name)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    }

    // ── protocol-return table ───────────────────────────────

    /// Register `name` as produced by a later device response, unless it is
    /// already known in either table.
    pub fn register_placeholder(&self, name: &str) {
        let name = strip_sigil(name);
        if read(&self.vars).contains_key(name) {
            return;
        }
        let mut returns = write(&self.returns);
        if !returns.contains_key(name) {
            returns.insert(name, None);
        }
    }

    pub fn bind_return(&self, name: &str, value: impl Into<String>) {
        write(&self.returns).insert(strip_sigil(name), Some(value.into()));
    }

    /// True if `name` is a protocol-return placeholder with no value yet.
    pub fn is_placeholder(&self, name: &str) -> bool {
        matches!(read(&self.returns).get(strip_sigil(name)), Some(None))
    }

    /// Resolve a reference: a bound protocol return wins, the script
    /// variable table is the fallback.
    pub fn resolve(&self, name: &str) -> Option<String> {
        let name = strip_sigil(name);
        if let Some(Some(value)) = read(&self.returns).get(name) {
            return Some(value.clone());
        }
        self.var(name)
    }

    /// Replace every `$name` whose value is known. Values that themselves
    /// contain references get one more pass. Unknown references are kept.
    pub fn substitute(&self, text: &str) -> String {
        self.substitute_except(text, &|_| false)
    }

    /// Like [`substitute`](Self::substitute), but references for which
    /// `keep` returns true stay as written.
    pub fn substitute_except(&self, text: &str, keep: &dyn Fn(&str) -> bool) -> String {
        let once = self.substitute_pass(text, keep);
        if once.contains('$') && once != text {
            self.substitute_pass(&once, keep)
        } else {
            once
        }
    }

    fn substitute_pass(&self, text: &str, keep: &dyn Fn(&str) -> bool) -> String {
        self.var_ref
            .replace_all(text, |caps: &regex::Captures| {
                let name = &caps[1];
                if keep(name) {
                    return caps[0].to_string();
                }
                match self.resolve(name) {
                    Some(value) => self
                        .program
                        .decorate(name, &value)
                        .unwrap_or(value),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    /// First `$name` still present in `text`, if any.
    pub fn first_unresolved(&self, text: &str) -> Option<String> {
        self.var_ref.captures(text).map(|c| c[1].to_string())
    }

    // ── result tally ────────────────────────────────────────

    pub fn record_result(&self, pass: bool) {
        lock(&self.tally).record(pass);
    }

    pub fn set_conditional_pass(&self, rule: ConditionalPass) {
        lock(&self.tally).set_conditional(rule);
    }

    /// Drop everything scored so far (the `separator` node).
    pub fn reset_tally(&self) {
        let mut tally = lock(&self.tally);
        tally.passed = 0;
        tally.failed = 0;
    }

    pub fn tally(&self) -> ResultTally {
        lock(&self.tally).clone()
    }

    // ── runtime conditional stack ───────────────────────────

    /// Whether non-control tasks should run right now.
    pub fn cond_active(&self) -> bool {
        lock(&self.cond).last().copied().unwrap_or(true)
    }

    pub fn push_cond(&self, value: bool) {
        let mut cond = lock(&self.cond);
        let parent = cond.last().copied().unwrap_or(true);
        cond.push(parent && value);
    }

    /// Flip the innermost branch. Returns false on an unbalanced `else`.
    pub fn flip_cond(&self) -> bool {
        let mut cond = lock(&self.cond);
        let depth = cond.len();
        if depth == 0 {
            return false;
        }
        let parent = if depth >= 2 { cond[depth - 2] } else { true };
        cond[depth - 1] = parent && !cond[depth - 1];
        true
    }

    pub fn pop_cond(&self) -> bool {
        lock(&self.cond).pop().is_some()
    }

    // ── stop flag ───────────────────────────────────────────

    /// Request a STOP. The first reason wins; failures also force a FAIL verdict.
    pub fn request_stop(&self, message: impl Into<String>, failed: bool) {
        let mut stop = lock(&self.stop);
        if stop.is_none() {
            let message = message.into();
            tracing::warn!(reason = %message, failed, "stop requested");
            *stop = Some(StopReason { message, failed });
        }
        if failed {
            lock(&self.tally).forced_fail = true;
        }
    }

    pub fn stopped(&self) -> bool {
        lock(&self.stop).is_some()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        lock(&self.stop).clone()
    }

    // ── phase ───────────────────────────────────────────────

    pub fn phase(&self) -> usize {
        self.phase.load(Ordering::SeqCst)
    }

    pub fn next_phase(&self) -> usize {
        self.phase.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ── log and records ─────────────────────────────────────

    /// Append to the run log
    pub fn logf(&self, msg: &str) {
        let mut log = lock(&self.log);
        log.push_str(msg);
        if !msg.ends_with('\n') {
            log.push('\n');
        }
    }

    pub fn log(&self) -> String {
        lock(&self.log).clone()
    }

    pub fn add_device_info(&self, info: DeviceInfo) {
        lock(&self.validation).push(info);
    }

    pub fn device_infos(&self) -> Vec<DeviceInfo> {
        lock(&self.validation).clone()
    }

    pub fn set_display_name(&self, device: &str, label: &str) {
        lock(&self.display_names).insert(device, label.to_string());
    }

    /// Label registered for a device, or the device name itself.
    pub fn display_name(&self, device: &str) -> String {
        lock(&self.display_names)
            .get(device)
            .cloned()
            .unwrap_or_else(|| device.to_string())
    }

    // ── read-only snapshots ─────────────────────────────────

    pub fn variables(&self) -> Vec<(String, String)> {
        read(&self.vars).to_vec()
    }

    /// Bound protocol returns; placeholders are omitted.
    pub fn returns(&self) -> Vec<(String, String)> {
        read(&self.returns)
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), v.clone())))
            .collect()
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn strip_sigil(name: &str) -> &str {
    name.strip_prefix('$').unwrap_or(name)
}
