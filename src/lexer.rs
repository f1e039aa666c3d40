//! Script scanner
//!
//! Splits each record of a script into `!`-delimited segments and
//! classifies them into tokens. Comment (`#`) and blank lines are dropped
//! before segmentation. Every record ends with an `Eol` token and the file
//! ends with a single `Eof`.
//!
//! Classification order for an untyped segment:
//! special symbol, reserved keyword, protocol command, device name
//! (not in feature-info files), feature keyword (only in feature-info
//! files), protocol return value (final segment of a protocol-command
//! record), then string literal.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::devices;
use crate::error::ScriptError;
use crate::symbols::RunContext;

/// Token category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Reserved first-field keyword (`define`, `if`, `math`, ...)
    Keyword,
    /// Protocol (CAPI) command with its parameters, e.g. `sta_reset_default,interface,wlan0`
    Capi,
    /// Return binding at the end of a protocol-command record
    ReturnValue,
    /// `$name` reference that is not bound to a device
    Variable,
    /// Testbed device name, possibly reached through a variable
    Device,
    /// Anything else
    Str,
    /// Key of a feature-info file
    Feature,
    /// Comparison or arithmetic operator
    Special,
    Eol,
    Eof,
}

/// A classified segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Classified text; for a device reached through a variable, the device name
    pub text: String,
    /// Segment exactly as written
    pub raw: String,
    /// 1-based line number in the source file
    pub line: usize,
    /// 1-based column of the segment start
    pub column: usize,
}

impl Token {
    pub fn is(&self, kind: TokenKind) -> bool {
        self.kind == kind
    }

    /// Keyword comparison, case-insensitive
    pub fn is_keyword(&self, word: &str) -> bool {
        self.kind == TokenKind::Keyword && self.text.eq_ignore_ascii_case(word)
    }
}

pub const KEYWORDS: &[&str] = &[
    "define",
    "if",
    "else",
    "endif",
    "and",
    "or",
    "math",
    "mexpr",
    "cat",
    "search",
    "append",
    "generate_randnum",
    "sleep",
    "echo",
    "pause",
    "phase",
    "display_name",
    "info",
    "external_func",
    "result",
    "checkthroughput",
    "conditional_pass",
    "separator",
    "wfa_test_commands",
    "wfa_test_commands_init",
];

const SPECIALS: &[&str] = &["=", "<>", "<", "<=", ">", ">=", "+", "-", "*", "/", "%"];

const FEATURE_KEYS: &[&str] = &[
    "DUTType",
    "DUTBand",
    "DUT_Category",
    "DUTEAPMethod",
    "ProgramName",
    "WMM",
    "PMF",
    "TDLS",
    "Ext_Roaming",
    "MFP_Capable",
    "TWT",
    "OFDMA",
    "OWE",
    "SAE",
];

struct Tables {
    commands: Vec<Regex>,
    reference: Regex,
}

fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let commands = [
            r"^sta_[a-z0-9_]+$",
            r"^ap_[a-z0-9_]+$",
            r"^dev_[a-z0-9_]+$",
            r"^ca_[a-z0-9_]+$",
            r"^device_[a-z0-9_]+$",
            r"^traffic_[a-z0-9_]+$",
            r"^sniffer_[a-z0-9_]+$",
            r"^server_[a-z0-9_]+$",
            r"^power_switch_[a-z0-9_]+$",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect();
        Tables {
            commands,
            reference: Regex::new(r"^\$[A-Za-z_][A-Za-z0-9_]*$").expect("static pattern"),
        }
    })
}

/// True if the first comma field of `segment` is a known protocol command.
pub fn is_protocol_command(segment: &str) -> bool {
    let name = segment.split(',').next().unwrap_or("").trim();
    tables().commands.iter().any(|re| re.is_match(name))
}

pub fn is_keyword(segment: &str) -> bool {
    KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(segment))
}

struct Segment {
    column: usize,
    text: String,
}

struct Record {
    line: usize,
    raw: String,
    segments: Vec<Segment>,
}

/// Lazy token stream over one script file. Records are split one line
/// at a time as the parser asks for tokens.
pub struct Lexer<'a> {
    file: String,
    text: String,
    /// Byte offset of the first line not yet read
    offset: usize,
    /// Source lines read so far
    lines_read: usize,
    /// Record the last token came from
    current: Option<Record>,
    /// `current` has handed out its `Eol`
    current_done: bool,
    segment: usize,
    ctx: &'a RunContext,
    feature_info: bool,
    record_has_capi: bool,
    done: bool,
}

impl<'a> Lexer<'a> {
    /// Scan `text`, reporting positions against `file`.
    pub fn new(file: impl Into<String>, text: &str, ctx: &'a RunContext, feature_info: bool) -> Self {
        Self {
            file: file.into(),
            text: text.to_string(),
            offset: 0,
            lines_read: 0,
            current: None,
            current_done: true,
            segment: 0,
            ctx,
            feature_info,
            record_has_capi: false,
            done: false,
        }
    }

    /// Open and scan a script file.
    pub fn from_path(path: &Path, ctx: &'a RunContext, feature_info: bool) -> Result<Self, ScriptError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ScriptError::config(format!("cannot read script {}: {}", path.display(), e))
        })?;
        Ok(Self::new(path.to_string_lossy(), &text, ctx, feature_info))
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    /// Raw text of the record the last token came from
    pub fn current_line(&self) -> &str {
        self.current.as_ref().map(|r| r.raw.as_str()).unwrap_or("")
    }

    /// Split the next non-blank, non-comment line.
    fn next_record(&mut self) -> Option<Record> {
        while self.offset < self.text.len() {
            let rest = &self.text[self.offset..];
            let (line, advance) = match rest.find('\n') {
                Some(end) => (&rest[..end], end + 1),
                None => (rest, rest.len()),
            };
            let line = line.strip_suffix('\r').unwrap_or(line);
            self.lines_read += 1;
            let record = split_record(self.lines_read, line);
            self.offset += advance;
            if record.is_some() {
                return record;
            }
        }
        None
    }

    fn eof(&self) -> Token {
        let line = self.current.as_ref().map(|r| r.line + 1).unwrap_or(1);
        Token {
            kind: TokenKind::Eof,
            text: String::new(),
            raw: String::new(),
            line,
            column: 1,
        }
    }

    /// Fetch the next token.
    pub fn next_token(&mut self) -> Result<Token, ScriptError> {
        if self.done {
            return Ok(self.eof());
        }
        if self.current_done {
            match self.next_record() {
                Some(record) => {
                    self.current = Some(record);
                    self.current_done = false;
                    self.segment = 0;
                    self.record_has_capi = false;
                }
                None => {
                    self.done = true;
                    return Ok(self.eof());
                }
            }
        }

        let Some(record) = self.current.as_ref() else {
            self.done = true;
            return Ok(self.eof());
        };
        if self.segment >= record.segments.len() {
            let token = Token {
                kind: TokenKind::Eol,
                text: String::new(),
                raw: String::new(),
                line: record.line,
                column: record.raw.len() + 1,
            };
            self.current_done = true;
            return Ok(token);
        }

        let seg = &record.segments[self.segment];
        let is_last = self.segment + 1 == record.segments.len();
        let kind = self.classify(&seg.text, is_last).map_err(|e| {
            e.with_location(self.file.clone(), record.line)
                .with_context(record.raw.clone(), seg.column)
        })?;
        let mut text = seg.text.clone();
        if kind == TokenKind::Device && text.starts_with('$') {
            // Device aliased through a variable: hand out the device name.
            text = self.ctx.resolve(&text).unwrap_or(text);
        }
        if kind == TokenKind::ReturnValue {
            for name in return_variables(&text) {
                self.ctx.register_placeholder(&name);
            }
        }
        let token = Token {
            kind,
            text,
            raw: seg.text.clone(),
            line: record.line,
            column: seg.column,
        };
        if kind == TokenKind::Capi {
            self.record_has_capi = true;
        }
        self.segment += 1;
        Ok(token)
    }

    /// Drain the rest of the current record, returning its tokens (Eol excluded).
    pub fn rest_of_line(&mut self) -> Result<Vec<Token>, ScriptError> {
        let mut out = Vec::new();
        loop {
            let tok = self.next_token()?;
            match tok.kind {
                TokenKind::Eol | TokenKind::Eof => return Ok(out),
                _ => out.push(tok),
            }
        }
    }

    fn classify(&self, text: &str, is_last: bool) -> Result<TokenKind, ScriptError> {
        if text.chars().any(|c| c.is_control() && c != '\t') {
            return Err(ScriptError::lexical("control character in segment"));
        }

        if self.record_has_capi && is_last {
            return Ok(TokenKind::ReturnValue);
        }

        if let Some(rest) = text.strip_prefix('$') {
            if !tables().reference.is_match(text) {
                return Err(ScriptError::lexical(format!(
                    "malformed variable reference '${}'",
                    rest
                )));
            }
            if !self.feature_info {
                if let Some(value) = self.ctx.resolve(text) {
                    if devices::classify_name(&value).is_some() {
                        return Ok(TokenKind::Device);
                    }
                }
            }
            return Ok(TokenKind::Variable);
        }

        if SPECIALS.contains(&text) {
            return Ok(TokenKind::Special);
        }
        if is_keyword(text) {
            return Ok(TokenKind::Keyword);
        }
        if is_protocol_command(text) {
            return Ok(TokenKind::Capi);
        }
        if !self.feature_info && devices::classify_name(text).is_some() {
            return Ok(TokenKind::Device);
        }
        if self.feature_info && FEATURE_KEYS.iter().any(|k| k.eq_ignore_ascii_case(text)) {
            return Ok(TokenKind::Feature);
        }
        Ok(TokenKind::Str)
    }
}

fn split_record(line: usize, raw: &str) -> Option<Record> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let offset = raw.len() - raw.trim_start().len();
    let mut segments = Vec::new();
    let mut column = offset + 1;
    for part in trimmed.split('!') {
        segments.push(Segment {
            column,
            text: part.trim().to_string(),
        });
        column += part.len() + 1;
    }
    while segments.last().map(|s| s.text.is_empty()).unwrap_or(false) {
        segments.pop();
    }
    if segments.is_empty() {
        return None;
    }
    Some(Record {
        line,
        raw: raw.trim_end().to_string(),
        segments,
    })
}

/// Variable names bound by a return spec such as `mac,$DUT_MAC` or `$stream`.
pub fn return_variables(spec: &str) -> Vec<String> {
    spec.split(',')
        .map(str::trim)
        .filter_map(|f| f.strip_prefix('$'))
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str, ctx: &RunContext) -> Vec<(TokenKind, String)> {
        let mut lexer = Lexer::new("t.txt", text, ctx, false);
        let mut out = Vec::new();
        loop {
            let tok = lexer.next_token().unwrap();
            let eof = tok.kind == TokenKind::Eof;
            out.push((tok.kind, tok.text));
            if eof {
                return out;
            }
        }
    }

    #[test]
    fn test_comments_and_blank_lines_skipped() {
        let ctx = RunContext::new();
        let toks = kinds("# header\n\n   \necho!hello!\n", &ctx);
        assert_eq!(
            toks,
            vec![
                (TokenKind::Keyword, "echo".into()),
                (TokenKind::Str, "hello".into()),
                (TokenKind::Eol, "".into()),
                (TokenKind::Eof, "".into()),
            ]
        );
    }

    #[test]
    fn test_device_command_record() {
        let ctx = RunContext::new();
        let toks = kinds(
            "wfa_control_agent_dut!sta_get_mac_address,interface,wlan0!mac,$DUT_MAC!",
            &ctx,
        );
        assert_eq!(toks[0].0, TokenKind::Device);
        assert_eq!(toks[1].0, TokenKind::Capi);
        assert_eq!(toks[2], (TokenKind::ReturnValue, "mac,$DUT_MAC".into()));
        assert!(ctx.is_placeholder("DUT_MAC"));
    }

    #[test]
    fn test_variable_aliasing_device() {
        let ctx = RunContext::new();
        ctx.set_var("DUT_Name", "wfa_control_agent_dut");
        ctx.set_var("Count", "3");
        let toks = kinds("$DUT_Name!sta_reset_default!DEFAULT!\necho!$Count!", &ctx);
        assert_eq!(toks[0], (TokenKind::Device, "wfa_control_agent_dut".into()));
        assert_eq!(toks[5], (TokenKind::Variable, "$Count".into()));
    }

    #[test]
    fn test_specials_and_keywords() {
        let ctx = RunContext::new();
        let toks = kinds("if!$A!>=!10!and!$B!<>!x!", &ctx);
        let k: Vec<TokenKind> = toks.iter().map(|t| t.0).collect();
        assert_eq!(
            k,
            vec![
                TokenKind::Keyword,
                TokenKind::Variable,
                TokenKind::Special,
                TokenKind::Str,
                TokenKind::Keyword,
                TokenKind::Variable,
                TokenKind::Special,
                TokenKind::Str,
                TokenKind::Eol,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_feature_info_file() {
        let ctx = RunContext::new();
        let mut lexer = Lexer::new("DUTInfo.txt", "DUTType!STA!\nwfa_sniffer!x!", &ctx, true);
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Feature);
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Str);
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Eol);
        // Device patterns are not consulted in feature-info files.
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Str);
    }

    #[test]
    fn test_malformed_reference_has_caret() {
        let ctx = RunContext::new();
        let mut lexer = Lexer::new("bad.txt", "define!$9x!5!", &ctx, false);
        lexer.next_token().unwrap();
        let err = lexer.next_token().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::LexicalError);
        assert_eq!(err.line, Some(1));
        assert_eq!(err.column, Some(8));
    }

    #[test]
    fn test_records_split_on_demand() {
        let ctx = RunContext::new();
        let mut lexer = Lexer::new("t.txt", "echo!one!\r\n# note\r\n\r\necho!two!", &ctx, false);
        assert_eq!(lexer.current_line(), "");
        assert_eq!(lexer.next_token().unwrap().text, "echo");
        assert_eq!(lexer.current_line(), "echo!one!");
        assert!(lexer.offset < lexer.text.len(), "only the first line is read");
        lexer.rest_of_line().unwrap();
        let tok = lexer.next_token().unwrap();
        assert_eq!((tok.text.as_str(), tok.line), ("echo", 4));
        assert_eq!(lexer.current_line(), "echo!two!");
        lexer.rest_of_line().unwrap();
        let eof = lexer.next_token().unwrap();
        assert_eq!((eof.kind, eof.line), (TokenKind::Eof, 5));
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Eof);
    }

    #[test]
    fn test_return_variables() {
        assert_eq!(return_variables("mac,$M,ip,$IP"), vec!["M", "IP"]);
        assert!(return_variables("DEFAULT").is_empty());
    }
}
