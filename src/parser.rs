//! Script compiler
//!
//! Consumes the lexer's token stream record by record and appends nodes
//! to a [`CommandList`], binding script variables as it goes.
//!
//! - `#` lines and blank lines never reach the parser (the lexer drops them)
//! - The first token of a record selects the rule
//! - Conditions whose operands are all known are decided here; the false
//!   branch is skipped token by token. Conditions that depend on a device
//!   response are emitted as IF-COND / ELSE / ENDIF for the executor
//! - Inside such a deferred branch every binding is deferred too, so the
//!   untaken branch can never change a variable. References there are
//!   still substituted when the parser knows their value, except names
//!   that only get bound at run time
//! - `wfa_test_commands[_init]` recursively compiles another file into the
//!   same list, after a cycle check

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::actions::text::{self, TextOp};
use crate::command_list::{CommandList, Tag};
use crate::conditions::Condition;
use crate::devices;
use crate::error::ScriptError;
use crate::lexer::{self, Lexer, Token, TokenKind};
use crate::symbols::{strip_sigil, RunContext};

/// Local actions that always run at execution time
const RUNTIME_ACTIONS: &[&str] = &[
    "sleep",
    "echo",
    "pause",
    "phase",
    "display_name",
    "info",
    "external_func",
];

const MAX_INCLUDE_DEPTH: usize = 32;

/// Compiler settings
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    /// Searched after the including file's own directory
    pub include_dirs: Vec<PathBuf>,
    /// File name compiled as a feature-info file
    pub feature_file: Option<String>,
}

/// Parent → child inclusion edges
#[derive(Debug, Default)]
pub struct CallTable {
    edges: HashSet<(String, String)>,
}

impl CallTable {
    /// Record `parent` including `child`. Rejected when the reverse edge
    /// already exists or the file would include itself.
    pub fn add(&mut self, parent: &str, child: &str) -> bool {
        if parent == child || self.edges.contains(&(child.to_string(), parent.to_string())) {
            return false;
        }
        self.edges.insert((parent.to_string(), child.to_string()));
        true
    }
}

/// State shared by the top-level parse and every nested include
struct CompileState<'c> {
    ctx: &'c RunContext,
    options: &'c ParseOptions,
    list: CommandList,
    calls: CallTable,
    stack: Vec<String>,
    /// Names bound by run-time nodes: return bindings, deferred defines
    /// and text operations left for the executor
    late_bound: HashSet<String>,
}

#[derive(Debug, Clone, Copy)]
struct IfFrame {
    deferred: bool,
    in_else: bool,
    line: usize,
}

/// Where a skipped branch stopped
enum SkipEnd {
    Else,
    EndIf,
}

/// Compile a script file.
pub fn compile(path: &Path, ctx: &RunContext, options: &ParseOptions) -> Result<CommandList, ScriptError> {
    let mut state = CompileState {
        ctx,
        options,
        list: CommandList::new(),
        calls: CallTable::default(),
        stack: Vec::new(),
        late_bound: HashSet::new(),
    };
    compile_file(&mut state, path, false)?;
    Ok(state.list)
}

/// Compile script text that does not live on disk. Includes resolve
/// against `options.include_dirs`.
pub fn compile_str(
    name: &str,
    text: &str,
    ctx: &RunContext,
    options: &ParseOptions,
) -> Result<CommandList, ScriptError> {
    let mut state = CompileState {
        ctx,
        options,
        list: CommandList::new(),
        calls: CallTable::default(),
        stack: vec![name.to_string()],
        late_bound: HashSet::new(),
    };
    let lexer = Lexer::new(name, text, ctx, false);
    Parser::new(&mut state, lexer, None, false).run()?;
    Ok(state.list)
}

fn compile_file(state: &mut CompileState<'_>, path: &Path, deferred: bool) -> Result<(), ScriptError> {
    let ctx = state.ctx;
    let feature_info = match (&state.options.feature_file, path.file_name()) {
        (Some(feature), Some(name)) => name.to_string_lossy().eq_ignore_ascii_case(feature),
        _ => false,
    };
    let lexer = Lexer::from_path(path, ctx, feature_info)?;
    state.stack.push(path.to_string_lossy().to_string());
    let dir = path.parent().map(Path::to_path_buf);
    let result = Parser::new(state, lexer, dir, deferred).run();
    state.stack.pop();
    result
}

struct Parser<'s, 'c> {
    state: &'s mut CompileState<'c>,
    lexer: Lexer<'c>,
    dir: Option<PathBuf>,
    frames: Vec<IfFrame>,
    /// The whole file sits inside a deferred branch of its includer
    inherited_deferred: bool,
}

impl<'s, 'c> Parser<'s, 'c> {
    fn new(
        state: &'s mut CompileState<'c>,
        lexer: Lexer<'c>,
        dir: Option<PathBuf>,
        inherited_deferred: bool,
    ) -> Self {
        Self {
            state,
            lexer,
            dir,
            frames: Vec::new(),
            inherited_deferred,
        }
    }

    fn ctx(&self) -> &'c RunContext {
        self.state.ctx
    }

    fn file(&self) -> String {
        self.lexer.file().to_string()
    }

    fn deferred(&self) -> bool {
        self.inherited_deferred || self.frames.iter().any(|f| f.deferred)
    }

    /// Substitute `text` for a node. Inside a deferred branch, names bound
    /// at run time are left for the executor.
    fn substitute(&self, text: &str) -> String {
        if !self.deferred() {
            return self.ctx().substitute(text);
        }
        let late = &self.state.late_bound;
        self.ctx()
            .substitute_except(text, &|name: &str| late.contains(name))
    }

    fn bound_late(&mut self, name: &str) {
        self.state.late_bound.insert(strip_sigil(name).to_string());
    }

    fn run(mut self) -> Result<(), ScriptError> {
        loop {
            let first = self.lexer.next_token()?;
            match first.kind {
                TokenKind::Eof => break,
                TokenKind::Eol => continue,
                _ => {}
            }
            let rest = self.lexer.rest_of_line()?;
            self.record(&first, &rest)
                .map_err(|e| self.locate(e, &first))?;
            let file = self.file();
            self.state.list.end_group(&file, first.line);
        }
        if let Some(frame) = self.frames.last() {
            return Err(ScriptError::syntax("if without matching endif")
                .with_location(self.file(), frame.line));
        }
        Ok(())
    }

    /// Attach position information unless the error already has it.
    fn locate(&self, err: ScriptError, tok: &Token) -> ScriptError {
        if err.line.is_some() {
            return err;
        }
        err.with_location(self.file(), tok.line)
            .with_context(self.lexer.current_line().to_string(), tok.column)
    }

    fn push(&mut self, tag: Tag, data: Vec<(&str, String)>, line: usize) {
        let file = self.file();
        self.state.list.push(tag, data, &file, line);
    }

    fn record(&mut self, first: &Token, rest: &[Token]) -> Result<(), ScriptError> {
        match first.kind {
            TokenKind::Keyword => self.keyword(first, rest),
            TokenKind::Device => self.device_record(first, rest),
            TokenKind::Capi => self.capi_record(None, first, rest),
            TokenKind::Feature => self.feature(first, rest),
            TokenKind::Variable => Err(ScriptError::undefined(&first.raw)),
            _ => Err(ScriptError::syntax(format!("unknown statement '{}'", first.raw))),
        }
    }

    fn keyword(&mut self, first: &Token, rest: &[Token]) -> Result<(), ScriptError> {
        let word = first.text.to_ascii_lowercase();
        match word.as_str() {
            "define" => self.define(first, rest),
            "if" => self.if_statement(first, rest),
            "else" => self.else_statement(first),
            "endif" => self.endif_statement(first),
            "math" | "mexpr" | "cat" | "search" | "append" => self.text_op(first, rest),
            "result" => self.result_check(first, rest),
            "checkthroughput" => self.throughput_check(first, rest),
            "conditional_pass" => self.conditional_pass(first, rest),
            "separator" => {
                self.push(Tag::Separator, Vec::new(), first.line);
                Ok(())
            }
            "wfa_test_commands" | "wfa_test_commands_init" => self.include(first, rest),
            "generate_randnum" => {
                let (dest, args) = match rest.split_first() {
                    Some((d, a)) if d.raw.starts_with('$') && a.len() == 2 => (d, a),
                    _ => return Err(ScriptError::usage("generate_randnum", "$dest!low!high")),
                };
                let args = self.args_text(args);
                self.bound_late(&dest.raw);
                self.push(
                    Tag::UccAction,
                    vec![("action", word.clone()), ("dest", dest.raw.clone()), ("args", args)],
                    first.line,
                );
                Ok(())
            }
            w if RUNTIME_ACTIONS.contains(&w) => {
                let args = self.args_text(rest);
                self.push(
                    Tag::UccAction,
                    vec![("action", word.clone()), ("dest", String::new()), ("args", args)],
                    first.line,
                );
                Ok(())
            }
            other => Err(ScriptError::syntax(format!("'{}' cannot start a statement", other))),
        }
    }

    /// Arguments joined back with `!`. The executor substitutes whatever
    /// is still unresolved.
    fn args_text(&self, rest: &[Token]) -> String {
        let joined = rest.iter().map(|t| t.raw.as_str()).collect::<Vec<_>>().join("!");
        self.substitute(&joined)
    }

    // ── define / feature ────────────────────────────────────

    fn define(&mut self, first: &Token, rest: &[Token]) -> Result<(), ScriptError> {
        if rest.len() != 2 {
            return Err(ScriptError::usage("define", "$name!value"));
        }
        let name = rest[0].raw.trim_start_matches('$').to_string();
        if name.is_empty() {
            return Err(ScriptError::syntax("define: empty variable name"));
        }
        self.bind(first.line, &name, &rest[1].raw);
        Ok(())
    }

    fn feature(&mut self, first: &Token, rest: &[Token]) -> Result<(), ScriptError> {
        let value = rest.first().map(|t| t.raw.as_str()).unwrap_or("1");
        self.bind(first.line, &first.raw, value);
        Ok(())
    }

    fn bind(&mut self, line: usize, name: &str, value: &str) {
        if self.deferred() {
            let value = self.substitute(value);
            self.bound_late(name);
            self.push(
                Tag::UccAction,
                vec![
                    ("action", "define".to_string()),
                    ("dest", format!("${}", name)),
                    ("args", value),
                ],
                line,
            );
        } else {
            let value = self.ctx().substitute(value);
            tracing::trace!(name, value = %value, "define");
            self.ctx().set_var(name, value);
        }
    }

    // ── conditionals ────────────────────────────────────────

    fn if_statement(&mut self, first: &Token, rest: &[Token]) -> Result<(), ScriptError> {
        let parts: Vec<String> = rest.iter().map(|t| t.raw.clone()).collect();
        let cond = Condition::parse(&parts)?;

        let ctx = self.ctx();
        let unresolved: Vec<String> = cond
            .references()
            .into_iter()
            .filter(|name| ctx.resolve(name).is_none())
            .collect();

        if self.deferred() || !unresolved.is_empty() {
            for name in &unresolved {
                ctx.register_placeholder(name);
            }
            let late = &self.state.late_bound;
            let expr = ctx.substitute_except(&cond.to_string(), &|name: &str| {
                late.contains(name) || ctx.is_placeholder(name)
            });
            self.push(Tag::IfCond, vec![("expr", expr)], first.line);
            self.frames.push(IfFrame {
                deferred: true,
                in_else: false,
                line: first.line,
            });
            return Ok(());
        }

        if cond.eval(&|name: &str| ctx.resolve(name))? {
            self.frames.push(IfFrame {
                deferred: false,
                in_else: false,
                line: first.line,
            });
            return Ok(());
        }

        match self.skip_branch(first.line, true)? {
            SkipEnd::Else => self.frames.push(IfFrame {
                deferred: false,
                in_else: true,
                line: first.line,
            }),
            SkipEnd::EndIf => {}
        }
        Ok(())
    }

    fn else_statement(&mut self, first: &Token) -> Result<(), ScriptError> {
        let frame = match self.frames.last_mut() {
            Some(f) => f,
            None => return Err(ScriptError::syntax("else without if")),
        };
        if frame.in_else {
            return Err(ScriptError::syntax(format!(
                "second else for the if on line {}",
                frame.line
            )));
        }
        frame.in_else = true;
        if frame.deferred {
            self.push(Tag::Else, Vec::new(), first.line);
            return Ok(());
        }
        // The if-branch was taken: drop everything up to the matching endif.
        match self.skip_branch(first.line, false)? {
            SkipEnd::EndIf => {
                self.frames.pop();
                Ok(())
            }
            SkipEnd::Else => Err(ScriptError::syntax("unbalanced else while skipping")),
        }
    }

    fn endif_statement(&mut self, first: &Token) -> Result<(), ScriptError> {
        match self.frames.pop() {
            Some(frame) if frame.deferred => {
                self.push(Tag::EndIf, Vec::new(), first.line);
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(ScriptError::syntax("endif without if")),
        }
    }

    /// Skip records until the `else` (if `stop_at_else`) or `endif` that
    /// matches the current nesting level.
    fn skip_branch(&mut self, from_line: usize, stop_at_else: bool) -> Result<SkipEnd, ScriptError> {
        let mut depth = 0usize;
        loop {
            let tok = self.lexer.next_token()?;
            match tok.kind {
                TokenKind::Eof => {
                    return Err(ScriptError::syntax(format!(
                        "if on line {} has no matching endif",
                        from_line
                    )))
                }
                TokenKind::Eol => continue,
                _ => {}
            }
            // Only the first token of a record matters.
            let _ = self.lexer.rest_of_line()?;
            if tok.is_keyword("if") {
                depth += 1;
            } else if tok.is_keyword("endif") {
                if depth == 0 {
                    return Ok(SkipEnd::EndIf);
                }
                depth -= 1;
            } else if tok.is_keyword("else") && depth == 0 {
                if stop_at_else {
                    return Ok(SkipEnd::Else);
                }
                return Err(ScriptError::syntax(format!(
                    "unbalanced else on line {} while skipping to endif",
                    tok.line
                )));
            }
        }
    }

    // ── string and arithmetic helpers ───────────────────────

    fn text_op(&mut self, first: &Token, rest: &[Token]) -> Result<(), ScriptError> {
        let op = TextOp::from_name(&first.text)
            .ok_or_else(|| ScriptError::unknown_command(&first.text))?;
        let (dest, args) = match rest.split_first() {
            Some((d, a)) if d.raw.starts_with('$') => (d, a),
            _ => return Err(ScriptError::usage(op.name(), op.usage())),
        };
        let raw_args: Vec<String> = args.iter().map(|t| t.raw.clone()).collect();
        op.check_arity(raw_args.len())?;

        if !self.deferred() {
            let ctx = self.ctx();
            let resolved: Vec<String> = raw_args.iter().map(|a| ctx.substitute(a)).collect();
            let current = ctx.resolve(&dest.raw);
            let ready = resolved.iter().all(|a| ctx.first_unresolved(a).is_none())
                && !ctx.is_placeholder(&dest.raw)
                && (!op.needs_current(resolved.len()) || current.is_some());
            if ready {
                let value = text::compute(op, current.as_deref(), &resolved)?;
                ctx.set_var(&dest.raw, value);
                return Ok(());
            }
        }

        let args: Vec<String> = raw_args.iter().map(|a| self.substitute(a)).collect();
        self.bound_late(&dest.raw);
        self.push(
            Tag::UccAction,
            vec![
                ("action", op.name().to_string()),
                ("dest", dest.raw.clone()),
                ("args", args.join("!")),
            ],
            first.line,
        );
        Ok(())
    }

    // ── result checks ───────────────────────────────────────

    fn result_check(&mut self, first: &Token, rest: &[Token]) -> Result<(), ScriptError> {
        if rest.is_empty() || rest.len() > 2 {
            return Err(ScriptError::usage("result", "PASS|FAIL[!message]"));
        }
        let message = rest.get(1).map(|t| t.raw.clone()).unwrap_or_default();
        self.push(
            Tag::ResultCheck,
            vec![
                ("check", "result".to_string()),
                ("value", rest[0].raw.clone()),
                ("message", message),
            ],
            first.line,
        );
        Ok(())
    }

    fn throughput_check(&mut self, first: &Token, rest: &[Token]) -> Result<(), ScriptError> {
        const USAGE: &str = "stream!duration!>=|>|<=!expected!pass!fail";
        if rest.len() != 6 {
            return Err(ScriptError::usage("checkthroughput", USAGE));
        }
        let cmp = rest[2].raw.as_str();
        if !matches!(cmp, ">=" | ">" | "<=") {
            return Err(ScriptError::syntax(format!(
                "checkthroughput: comparator must be >=, > or <=, got '{}'",
                cmp
            )));
        }
        let keys = ["stream", "duration", "cmp", "expected", "pass", "fail"];
        let mut data = vec![("check", "throughput".to_string())];
        for (key, tok) in keys.iter().zip(rest) {
            data.push((key, tok.raw.clone()));
        }
        self.push(Tag::ResultCheck, data, first.line);
        Ok(())
    }

    fn conditional_pass(&mut self, first: &Token, rest: &[Token]) -> Result<(), ScriptError> {
        if rest.len() != 2 {
            return Err(ScriptError::usage("conditional_pass", "required!of"));
        }
        let ctx = self.ctx();
        let required = ctx.substitute(&rest[0].raw);
        let of = ctx.substitute(&rest[1].raw);
        let (n, m) = match (required.parse::<usize>(), of.parse::<usize>()) {
            (Ok(n), Ok(m)) if n <= m => (n, m),
            _ => {
                return Err(ScriptError::syntax(format!(
                    "conditional_pass: need 0 <= N <= M, got {}!{}",
                    required, of
                )))
            }
        };
        self.push(
            Tag::ResultCheck,
            vec![
                ("check", "conditional_pass".to_string()),
                ("required", n.to_string()),
                ("of", m.to_string()),
            ],
            first.line,
        );
        Ok(())
    }

    // ── device records ──────────────────────────────────────

    fn device_record(&mut self, first: &Token, rest: &[Token]) -> Result<(), ScriptError> {
        let second = rest.first().ok_or_else(|| {
            ScriptError::syntax(format!("device '{}' without a command", first.text))
        })?;
        match second.kind {
            TokenKind::Capi => self.capi_record(Some(first), second, &rest[1..]),
            _ if second.raw.to_ascii_lowercase().contains("ipaddr=") => {
                let body = self.ctx().substitute(&second.raw);
                let (host, port) = devices::parse_definition(&body).ok_or_else(|| {
                    ScriptError::syntax(format!(
                        "device definition needs ipaddr=...,port=..., got '{}'",
                        body
                    ))
                })?;
                self.push(
                    Tag::TestbedDevice,
                    vec![("name", first.text.clone()), ("host", host), ("port", port)],
                    first.line,
                );
                Ok(())
            }
            _ => Err(ScriptError::syntax(format!(
                "'{}' is not a protocol command",
                second.raw
            ))),
        }
    }

    fn capi_record(&mut self, device: Option<&Token>, capi: &Token, rest: &[Token]) -> Result<(), ScriptError> {
        if rest.len() > 1 {
            return Err(ScriptError::syntax(format!(
                "unexpected segment '{}' after return binding",
                rest[1].raw
            )));
        }
        let text = self.substitute(&capi.raw);
        let (name, params) = match text.split_once(',') {
            Some((n, p)) => (n.trim().to_string(), p.trim().to_string()),
            None => (text.trim().to_string(), String::new()),
        };

        if let Some(dev) = device {
            self.push(Tag::DeviceRef, vec![("name", dev.text.clone())], capi.line);
        }
        self.push(
            Tag::CapiCommand,
            vec![("name", name), ("params", params)],
            capi.line,
        );
        if let Some(ret) = rest.first() {
            if !ret.raw.eq_ignore_ascii_case("DEFAULT") {
                for name in lexer::return_variables(&ret.raw) {
                    self.bound_late(&name);
                }
                self.push(Tag::Return, vec![("binding", ret.raw.clone())], capi.line);
            }
        }
        Ok(())
    }

    // ── includes ────────────────────────────────────────────

    fn include(&mut self, first: &Token, rest: &[Token]) -> Result<(), ScriptError> {
        let target = rest
            .first()
            .map(|t| self.ctx().substitute(&t.raw))
            .ok_or_else(|| ScriptError::usage(&first.text, "file"))?;
        let path = self.find_include(&target)?;
        let parent = self
            .state
            .stack
            .last()
            .cloned()
            .unwrap_or_else(|| self.file());
        let child = path.to_string_lossy().to_string();

        if self.state.stack.iter().any(|f| f == &child)
            || !self.state.calls.add(&parent, &child)
        {
            return Err(ScriptError::syntax(format!(
                "recursive inclusion of {} from {}",
                child, parent
            )));
        }
        if self.state.stack.len() >= MAX_INCLUDE_DEPTH {
            return Err(ScriptError::syntax("include nesting too deep"));
        }
        tracing::debug!(parent = %parent, child = %child, "include");
        let deferred = self.deferred();
        compile_file(&mut *self.state, &path, deferred)
    }

    fn find_include(&self, name: &str) -> Result<PathBuf, ScriptError> {
        let direct = PathBuf::from(name);
        if direct.is_absolute() && direct.is_file() {
            return Ok(direct);
        }
        let candidates = self
            .dir
            .iter()
            .chain(self.state.options.include_dirs.iter())
            .map(|d| d.join(name));
        for candidate in candidates {
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(ScriptError::config(format!("include file not found: {}", name)))
    }
}
