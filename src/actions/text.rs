//! String and arithmetic helpers: math, mexpr, cat, search, append, define
//!
//! The same `compute` runs at compile time when every operand is known and
//! at run time for deferred UCC-ACTION nodes.

use super::{Action, ActionCall, ActionEnv, ActionResult, ActionUsage};
use crate::error::{ErrorKind, ScriptError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextOp {
    Math,
    Mexpr,
    Cat,
    Search,
    Append,
}

impl TextOp {
    pub const ALL: [TextOp; 5] = [
        TextOp::Math,
        TextOp::Mexpr,
        TextOp::Cat,
        TextOp::Search,
        TextOp::Append,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|op| op.name().eq_ignore_ascii_case(name))
    }

    pub fn name(&self) -> &'static str {
        match self {
            TextOp::Math => "math",
            TextOp::Mexpr => "mexpr",
            TextOp::Cat => "cat",
            TextOp::Search => "search",
            TextOp::Append => "append",
        }
    }

    pub fn usage(&self) -> &'static str {
        match self {
            TextOp::Math => "$dest![a!]op!b",
            TextOp::Mexpr => "$dest!op!a!b[!c...]",
            TextOp::Cat => "$dest!a,b,...[!sep]",
            TextOp::Search => "$dest!haystack!needle",
            TextOp::Append => "$dest!value[!sep]",
        }
    }

    fn summary(&self) -> &'static str {
        match self {
            TextOp::Math => "Integer or decimal arithmetic",
            TextOp::Mexpr => "Fold an operator over several operands",
            TextOp::Cat => "Join a comma list with a separator",
            TextOp::Search => "Set 1 if the needle occurs in the haystack, else 0",
            TextOp::Append => "Append a value to a variable",
        }
    }

    /// Check the operand count (destination excluded).
    pub fn check_arity(&self, n: usize) -> Result<(), ScriptError> {
        let ok = match self {
            TextOp::Math => n == 2 || n == 3,
            TextOp::Mexpr => n >= 3,
            TextOp::Cat => n == 1 || n == 2,
            TextOp::Search => n == 2,
            TextOp::Append => n == 1 || n == 2,
        };
        if ok {
            Ok(())
        } else {
            Err(ScriptError::usage(self.name(), self.usage()))
        }
    }

    /// The in-place forms read the destination's current value.
    pub fn needs_current(&self, n: usize) -> bool {
        *self == TextOp::Math && n == 2
    }
}

/// Evaluate `op` over already-substituted operands.
pub fn compute(op: TextOp, current: Option<&str>, args: &[String]) -> Result<String, ScriptError> {
    op.check_arity(args.len())?;
    match op {
        TextOp::Math => {
            let (lhs, sym, rhs) = if args.len() == 3 {
                (args[0].as_str(), args[1].as_str(), args[2].as_str())
            } else {
                let cur = current.ok_or_else(|| ScriptError::undefined("math destination"))?;
                (cur, args[0].as_str(), args[1].as_str())
            };
            let value = arith(number(lhs)?, sym, number(rhs)?)?;
            Ok(format_number(value))
        }
        TextOp::Mexpr => {
            let sym = args[0].as_str();
            let mut acc = number(&args[1])?;
            for operand in &args[2..] {
                acc = arith(acc, sym, number(operand)?)?;
            }
            Ok(format_number(acc))
        }
        TextOp::Cat => {
            let sep = args.get(1).map(String::as_str).unwrap_or("");
            let parts: Vec<&str> = args[0].split(',').map(str::trim).collect();
            Ok(parts.join(sep))
        }
        TextOp::Search => Ok(if args[0].contains(args[1].as_str()) { "1" } else { "0" }.to_string()),
        TextOp::Append => {
            let sep = args.get(1).map(String::as_str).unwrap_or(" ");
            Ok(match current {
                Some(cur) if !cur.is_empty() => format!("{}{}{}", cur, sep, args[0]),
                _ => args[0].clone(),
            })
        }
    }
}

fn number(s: &str) -> Result<f64, ScriptError> {
    s.trim()
        .parse::<f64>()
        .map_err(|_| ScriptError::syntax(format!("'{}' is not a number", s)))
}

fn arith(a: f64, sym: &str, b: f64) -> Result<f64, ScriptError> {
    Ok(match sym.trim() {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        "/" | "%" if b == 0.0 => {
            return Err(ScriptError::new(ErrorKind::Other, "division by zero"));
        }
        "/" => a / b,
        "%" => a % b,
        other => {
            return Err(ScriptError::syntax(format!("unknown arithmetic operator '{}'", other)));
        }
    })
}

/// Integral results print without a fraction.
pub fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

fn check_resolved(env: &ActionEnv<'_>, call: &ActionCall) -> Result<(), ScriptError> {
    for arg in &call.args {
        if let Some(name) = env.ctx.first_unresolved(arg) {
            return Err(ScriptError::undefined(&format!("${}", name)).with_command(&call.name));
        }
    }
    Ok(())
}

// ──────────────────────────────────────────────────────────
// math / mexpr / cat / search / append at run time
// ──────────────────────────────────────────────────────────

pub(super) struct TextAction(pub TextOp);

impl Action for TextAction {
    fn run(&self, env: &ActionEnv<'_>, call: &ActionCall) -> Result<ActionResult, ScriptError> {
        let dest = call.dest()?;
        check_resolved(env, call)?;
        let current = env.ctx.resolve(dest);
        let value = compute(self.0, current.as_deref(), &call.args)?;
        tracing::debug!(action = self.0.name(), dest, value = %value, "computed");
        env.ctx.set_var(dest, value);
        Ok(ActionResult::Ok)
    }

    fn usage(&self) -> ActionUsage {
        ActionUsage {
            summary: self.0.summary().into(),
            args: self.0.usage().into(),
        }
    }
}

// ──────────────────────────────────────────────────────────
// define: deferred binding inside a run-time branch
// ──────────────────────────────────────────────────────────

pub(super) struct DefineAction;

impl Action for DefineAction {
    fn run(&self, env: &ActionEnv<'_>, call: &ActionCall) -> Result<ActionResult, ScriptError> {
        let dest = call.dest()?;
        let value = call.args.join("!");
        env.ctx.set_var(dest, value);
        Ok(ActionResult::Ok)
    }

    fn usage(&self) -> ActionUsage {
        ActionUsage {
            summary: "Bind a script variable".into(),
            args: "$name!value".into(),
        }
    }
}
