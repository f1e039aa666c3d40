//! Local actions
//!
//! UCC-ACTION nodes never reach a device. They are dispatched by name
//! through a table built once per [`Engine`](crate::engine::Engine);
//! unknown names are rejected when the queue is built.

mod flow;
mod info;
pub mod text;

use std::collections::HashMap;
use std::sync::Arc;

use crate::correlator::Correlator;
use crate::error::ScriptError;
use crate::symbols::RunContext;

/// Outcome of a local action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult {
    /// Completed, carry on
    Ok,
    /// Completed, the run should stop (without failing)
    Stop(String),
}

/// Usage information for an action
pub struct ActionUsage {
    /// One-line summary
    pub summary: String,
    /// Argument syntax
    pub args: String,
}

/// One invocation, with operands already substituted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionCall {
    pub name: String,
    /// Destination variable (`$name`) for actions that bind one
    pub dest: Option<String>,
    pub args: Vec<String>,
}

impl ActionCall {
    pub fn dest(&self) -> Result<&str, ScriptError> {
        self.dest
            .as_deref()
            .ok_or_else(|| ScriptError::usage(&self.name, "$dest!..."))
    }
}

/// Callback behind `external_func!name!args`
pub type ExternalFn = Arc<dyn Fn(&RunContext, &[String]) -> Result<String, ScriptError> + Send + Sync>;

/// What an action may touch while it runs
pub struct ActionEnv<'a> {
    pub ctx: &'a RunContext,
    pub streams: &'a Correlator,
    pub externals: &'a HashMap<String, ExternalFn>,
    /// `pause` waits for a line on stdin
    pub interactive: bool,
}

/// A local action that can be executed in a script
pub trait Action: Send + Sync {
    fn run(&self, env: &ActionEnv<'_>, call: &ActionCall) -> Result<ActionResult, ScriptError>;

    fn usage(&self) -> ActionUsage;
}

/// A boxed action
pub type BoxedAction = Box<dyn Action>;

/// The default set of local actions
pub fn default_actions() -> HashMap<String, BoxedAction> {
    let mut actions: HashMap<String, BoxedAction> = HashMap::new();
    for op in text::TextOp::ALL {
        actions.insert(op.name().into(), Box::new(text::TextAction(op)));
    }
    actions.insert("define".into(), Box::new(text::DefineAction));
    actions.insert("generate_randnum".into(), Box::new(flow::RandNumAction));
    actions.insert("sleep".into(), Box::new(flow::SleepAction));
    actions.insert("pause".into(), Box::new(flow::PauseAction));
    actions.insert("phase".into(), Box::new(flow::PhaseAction));
    actions.insert("echo".into(), Box::new(info::EchoAction));
    actions.insert("info".into(), Box::new(info::InfoAction));
    actions.insert("display_name".into(), Box::new(info::DisplayNameAction));
    actions.insert("external_func".into(), Box::new(info::ExternalFuncAction));
    actions
}

/// Actions that only report; they never close a parallel window.
pub fn is_informational(name: &str) -> bool {
    matches!(name, "echo" | "info" | "display_name")
}
