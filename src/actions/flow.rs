//! Flow actions: generate_randnum, sleep, pause, phase

use std::io::BufRead;
use std::time::Duration;

use super::{Action, ActionCall, ActionEnv, ActionResult, ActionUsage};
use crate::error::ScriptError;

// ──────────────────────────────────────────────────────────
// generate_randnum: random integer in [low, high]
// ──────────────────────────────────────────────────────────

pub(super) struct RandNumAction;

impl Action for RandNumAction {
    fn run(&self, env: &ActionEnv<'_>, call: &ActionCall) -> Result<ActionResult, ScriptError> {
        let dest = call.dest()?;
        if call.args.len() != 2 {
            return Err(ScriptError::usage("generate_randnum", "$dest!low!high"));
        }
        let bound = |s: &str| {
            s.trim().parse::<i64>().map_err(|_| {
                ScriptError::syntax(format!("generate_randnum: '{}' is not an integer", s))
            })
        };
        let (low, high) = (bound(&call.args[0])?, bound(&call.args[1])?);
        if low > high {
            return Err(ScriptError::syntax(format!(
                "generate_randnum: empty range {}..{}",
                low, high
            )));
        }
        let value = fastrand::i64(low..=high);
        env.ctx.set_var(dest, value.to_string());
        Ok(ActionResult::Ok)
    }

    fn usage(&self) -> ActionUsage {
        ActionUsage {
            summary: "Bind a random integer".into(),
            args: "$dest!low!high".into(),
        }
    }
}

// ──────────────────────────────────────────────────────────
// sleep: pause the calling queue
// ──────────────────────────────────────────────────────────

pub(super) struct SleepAction;

impl Action for SleepAction {
    fn run(&self, env: &ActionEnv<'_>, call: &ActionCall) -> Result<ActionResult, ScriptError> {
        if call.args.len() != 1 {
            return Err(ScriptError::usage("sleep", "seconds"));
        }
        let secs: f64 = call.args[0]
            .trim()
            .parse()
            .ok()
            .filter(|s: &f64| s.is_finite() && *s >= 0.0)
            .ok_or_else(|| ScriptError::syntax(format!("sleep: bad duration '{}'", call.args[0])))?;
        env.ctx.logf(&format!("sleep {}s", call.args[0].trim()));
        std::thread::sleep(Duration::from_secs_f64(secs));
        Ok(ActionResult::Ok)
    }

    fn usage(&self) -> ActionUsage {
        ActionUsage {
            summary: "Sleep for a number of seconds".into(),
            args: "seconds".into(),
        }
    }
}

// ──────────────────────────────────────────────────────────
// pause: wait for the operator
// ──────────────────────────────────────────────────────────

pub(super) struct PauseAction;

impl Action for PauseAction {
    fn run(&self, env: &ActionEnv<'_>, call: &ActionCall) -> Result<ActionResult, ScriptError> {
        let prompt = if call.args.is_empty() {
            "press enter to continue".to_string()
        } else {
            call.args.join(" ")
        };
        env.ctx.logf(&format!("pause: {}", prompt));
        if !env.interactive {
            tracing::info!(prompt = %prompt, "pause skipped (not interactive)");
            return Ok(ActionResult::Ok);
        }

        eprintln!("{} [enter to continue, q to stop]", prompt);
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        if line.trim().eq_ignore_ascii_case("q") {
            return Ok(ActionResult::Stop("stopped by operator".into()));
        }
        Ok(ActionResult::Ok)
    }

    fn usage(&self) -> ActionUsage {
        ActionUsage {
            summary: "Wait for operator input".into(),
            args: "[prompt]".into(),
        }
    }
}

// ──────────────────────────────────────────────────────────
// phase: start a new traffic phase
// ──────────────────────────────────────────────────────────

pub(super) struct PhaseAction;

impl Action for PhaseAction {
    fn run(&self, env: &ActionEnv<'_>, _call: &ActionCall) -> Result<ActionResult, ScriptError> {
        // The correlator of the closing phase stops before the counter moves.
        env.streams.end_phase();
        let phase = env.ctx.next_phase();
        env.ctx.logf(&format!("phase {}", phase));
        tracing::info!(phase, "phase transition");
        Ok(ActionResult::Ok)
    }

    fn usage(&self) -> ActionUsage {
        ActionUsage {
            summary: "Start a new traffic phase".into(),
            args: "".into(),
        }
    }
}
