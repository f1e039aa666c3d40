//! Reporting actions: echo, info, display_name, external_func

use super::{Action, ActionCall, ActionEnv, ActionResult, ActionUsage};
use crate::error::ScriptError;

pub(super) struct EchoAction;

impl Action for EchoAction {
    fn run(&self, env: &ActionEnv<'_>, call: &ActionCall) -> Result<ActionResult, ScriptError> {
        let text = call.args.join(" ");
        env.ctx.logf(&text);
        tracing::info!(target: "ucc::echo", "{}", text);
        Ok(ActionResult::Ok)
    }

    fn usage(&self) -> ActionUsage {
        ActionUsage {
            summary: "Write text to the run log".into(),
            args: "text...".into(),
        }
    }
}

// ──────────────────────────────────────────────────────────
// info: version and identity notes for the validation record
// ──────────────────────────────────────────────────────────

pub(super) struct InfoAction;

impl Action for InfoAction {
    fn run(&self, env: &ActionEnv<'_>, call: &ActionCall) -> Result<ActionResult, ScriptError> {
        let text = call.args.join(" ");
        env.ctx.logf(&format!("INFO: {}", text));
        tracing::info!(info = %text, "info");
        Ok(ActionResult::Ok)
    }

    fn usage(&self) -> ActionUsage {
        ActionUsage {
            summary: "Record an informational note".into(),
            args: "text...".into(),
        }
    }
}

pub(super) struct DisplayNameAction;

impl Action for DisplayNameAction {
    fn run(&self, env: &ActionEnv<'_>, call: &ActionCall) -> Result<ActionResult, ScriptError> {
        if call.args.len() != 2 {
            return Err(ScriptError::usage("display_name", "device!label"));
        }
        let (device, label) = (call.args[0].trim(), call.args[1].trim());
        env.ctx.set_display_name(device, label);
        Ok(ActionResult::Ok)
    }

    fn usage(&self) -> ActionUsage {
        ActionUsage {
            summary: "Register a display label for a device".into(),
            args: "device!label".into(),
        }
    }
}

// ──────────────────────────────────────────────────────────
// external_func: call out to a registered validator
// ──────────────────────────────────────────────────────────

pub(super) struct ExternalFuncAction;

impl Action for ExternalFuncAction {
    fn run(&self, env: &ActionEnv<'_>, call: &ActionCall) -> Result<ActionResult, ScriptError> {
        let (name, args) = call
            .args
            .split_first()
            .ok_or_else(|| ScriptError::usage("external_func", "name[!args...]"))?;
        let func = match env.externals.get(name.trim()) {
            Some(f) => f,
            None => {
                tracing::warn!(name = %name, "external function not registered, skipped");
                env.ctx.logf(&format!("external_func {}: not registered", name));
                return Ok(ActionResult::Ok);
            }
        };
        let output = func(env.ctx, args).map_err(|e| e.with_command(format!("external_func {}", name)))?;
        env.ctx.logf(&format!("external_func {}: {}", name, output));
        Ok(ActionResult::Ok)
    }

    fn usage(&self) -> ActionUsage {
        ActionUsage {
            summary: "Invoke a registered external validator".into(),
            args: "name[!args...]".into(),
        }
    }
}
