//! Conditional expressions
//!
//! `if!lhs!op!rhs![and|or!lhs!op!rhs]...`
//!
//! Operands compare numerically when both sides parse as numbers and
//! lexicographically otherwise. Combinators fold left to right with no
//! precedence; the right-hand comparison is not evaluated when the
//! accumulated value already decides the result.

use std::cmp::Ordering;
use std::fmt;

use crate::error::ScriptError;
use crate::symbols::strip_sigil;

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "=" | "==" => CompareOp::Eq,
            "<>" | "!=" => CompareOp::Ne,
            "<" => CompareOp::Lt,
            "<=" => CompareOp::Le,
            ">" => CompareOp::Gt,
            ">=" => CompareOp::Ge,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }

    fn holds(&self, ord: Ordering) -> bool {
        match self {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
        }
    }

    /// Numeric comparison, as used by the throughput check.
    pub fn compare_f64(&self, lhs: f64, rhs: f64) -> bool {
        match lhs.partial_cmp(&rhs) {
            Some(ord) => self.holds(ord),
            None => false,
        }
    }
}

/// Compare two operand values: numeric if both are numbers, else by text.
pub fn compare_values(lhs: &str, op: CompareOp, rhs: &str) -> bool {
    let (l, r) = (lhs.trim(), rhs.trim());
    match (l.parse::<f64>(), r.parse::<f64>()) {
        (Ok(a), Ok(b)) => op.compare_f64(a, b),
        _ => op.holds(l.cmp(r)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combinator {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub lhs: String,
    pub op: CompareOp,
    pub rhs: String,
}

impl Comparison {
    fn eval(&self, resolve: &dyn Fn(&str) -> Option<String>) -> Result<bool, ScriptError> {
        let lhs = operand(&self.lhs, resolve)?;
        let rhs = operand(&self.rhs, resolve)?;
        Ok(compare_values(&lhs, self.op, &rhs))
    }
}

fn operand(raw: &str, resolve: &dyn Fn(&str) -> Option<String>) -> Result<String, ScriptError> {
    if raw.starts_with('$') {
        resolve(raw).ok_or_else(|| ScriptError::undefined(raw))
    } else {
        Ok(raw.to_string())
    }
}

/// A parsed `if` expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub first: Comparison,
    pub rest: Vec<(Combinator, Comparison)>,
}

impl Condition {
    /// Parse the operands that follow `if`.
    pub fn parse(parts: &[String]) -> Result<Self, ScriptError> {
        if parts.len() < 3 || (parts.len() - 3) % 4 != 0 {
            return Err(ScriptError::syntax(format!(
                "if: expected lhs!op!rhs[!and|or!lhs!op!rhs...], got {} operands",
                parts.len()
            )));
        }
        let first = comparison(&parts[0..3])?;
        let mut rest = Vec::new();
        for chunk in parts[3..].chunks(4) {
            let comb = match chunk[0].to_ascii_lowercase().as_str() {
                "and" => Combinator::And,
                "or" => Combinator::Or,
                other => {
                    return Err(ScriptError::syntax(format!(
                        "if: expected 'and' or 'or', got '{}'",
                        other
                    )))
                }
            };
            rest.push((comb, comparison(&chunk[1..4])?));
        }
        Ok(Self { first, rest })
    }

    /// Parse the `!`-joined text stored in an IF-COND node.
    pub fn parse_text(text: &str) -> Result<Self, ScriptError> {
        let parts: Vec<String> = text.split('!').map(|s| s.trim().to_string()).collect();
        Self::parse(&parts)
    }

    /// Variable names referenced by any operand
    pub fn references(&self) -> Vec<String> {
        std::iter::once(&self.first)
            .chain(self.rest.iter().map(|(_, c)| c))
            .flat_map(|c| [&c.lhs, &c.rhs])
            .filter(|o| o.starts_with('$'))
            .map(|o| strip_sigil(o).to_string())
            .collect()
    }

    /// Evaluate, resolving `$` operands through `resolve`.
    pub fn eval(&self, resolve: &dyn Fn(&str) -> Option<String>) -> Result<bool, ScriptError> {
        let mut acc = self.first.eval(resolve)?;
        for (comb, cmp) in &self.rest {
            acc = match comb {
                Combinator::And if !acc => false,
                Combinator::Or if acc => true,
                _ => cmp.eval(resolve)?,
            };
        }
        Ok(acc)
    }
}

fn comparison(parts: &[String]) -> Result<Comparison, ScriptError> {
    let op = CompareOp::parse(parts[1].trim()).ok_or_else(|| {
        ScriptError::syntax(format!("if: unknown comparison operator '{}'", parts[1]))
    })?;
    Ok(Comparison {
        lhs: parts[0].trim().to_string(),
        op,
        rhs: parts[2].trim().to_string(),
    })
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}!{}", self.first.lhs, self.first.op.as_str(), self.first.rhs)?;
        for (comb, c) in &self.rest {
            let word = match comb {
                Combinator::And => "and",
                Combinator::Or => "or",
            };
            write!(f, "!{}!{}!{}!{}", word, c.lhs, c.op.as_str(), c.rhs)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(s: &str) -> Vec<String> {
        s.split('!').map(str::to_string).collect()
    }

    fn none(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_numeric_vs_lexicographic() {
        assert!(compare_values("10", CompareOp::Gt, "9"));
        assert!(!compare_values("10", CompareOp::Gt, "9x"));
        assert!(compare_values("10.0", CompareOp::Eq, "10"));
        assert!(compare_values("abc", CompareOp::Lt, "abd"));
    }

    #[test]
    fn test_boundaries() {
        assert!(CompareOp::Ge.compare_f64(0.1, 0.1));
        assert!(!CompareOp::Gt.compare_f64(0.1, 0.1));
        assert!(CompareOp::Le.compare_f64(0.1, 0.1));
    }

    #[test]
    fn test_and_short_circuits() {
        // The unresolved right side is never looked at once the left is false.
        let cond = Condition::parse(&parts("1!=!2!and!$missing!=!3")).unwrap();
        assert_eq!(cond.eval(&none).unwrap(), false);

        let cond = Condition::parse(&parts("1!=!1!or!$missing!=!3")).unwrap();
        assert_eq!(cond.eval(&none).unwrap(), true);

        let cond = Condition::parse(&parts("1!=!1!and!$missing!=!3")).unwrap();
        assert!(cond.eval(&none).is_err());
    }

    #[test]
    fn test_left_to_right_fold() {
        let cond = Condition::parse(&parts("1!=!2!and!1!=!1!or!a!=!a")).unwrap();
        assert!(cond.eval(&none).unwrap());
    }

    #[test]
    fn test_text_round_trip_and_references() {
        let cond = Condition::parse(&parts("$A!>=!10!or!$B!<>!x")).unwrap();
        let text = cond.to_string();
        assert_eq!(text, "$A!>=!10!or!$B!<>!x");
        assert_eq!(Condition::parse_text(&text).unwrap(), cond);
        assert_eq!(cond.references(), vec!["A", "B"]);
    }

    #[test]
    fn test_bad_operand_count() {
        assert!(Condition::parse(&parts("$A!=")).is_err());
        assert!(Condition::parse(&parts("$A!=!1!and!$B")).is_err());
        assert!(Condition::parse(&parts("$A!~!1")).is_err());
    }
}
