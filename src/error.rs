//! Script errors

use std::fmt;

/// The kind of script error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed script structure (unmatched conditional, bad operand count)
    SyntaxError,
    /// A segment the scanner could not classify
    LexicalError,
    /// A structurally required symbol is missing
    UndefinedError,
    /// Missing configuration file, unresolved device
    ConfigError,
    /// Device answered FAIL/ERROR/INVALID or is unreachable
    ProtocolFailure,
    /// No response within the socket deadline
    Timeout,
    /// Name not present in the action dispatch table
    UnknownCommand,
    /// IO error
    Io,
    /// Other error
    Other,
}

/// A script error with file/line context
#[derive(Debug, Clone)]
pub struct ScriptError {
    pub kind: ErrorKind,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<usize>,
    /// 1-based column of the offending segment, when known
    pub column: Option<usize>,
    /// Source text of the offending line, used for the caret diagnostic
    pub source_line: Option<String>,
    pub command: Option<String>,
}

impl ScriptError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            file: None,
            line: None,
            column: None,
            source_line: None,
            command: None,
        }
    }

    pub fn with_location(mut self, file: impl Into<String>, line: usize) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }

    /// Attach the column and the raw line so `Display` can point at the segment.
    pub fn with_context(mut self, source_line: impl Into<String>, column: usize) -> Self {
        self.source_line = Some(source_line.into());
        self.column = Some(column);
        self
    }

    pub fn with_command(mut self, cmd: impl Into<String>) -> Self {
        self.command = Some(cmd.into());
        self
    }

    pub fn syntax(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::SyntaxError, msg)
    }

    pub fn lexical(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::LexicalError, msg)
    }

    pub fn undefined(name: &str) -> Self {
        Self::new(ErrorKind::UndefinedError, format!("undefined symbol: {}", name))
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigError, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolFailure, msg)
    }

    pub fn unknown_command(name: &str) -> Self {
        Self::new(ErrorKind::UnknownCommand, format!("unknown command: {}", name))
    }

    pub fn usage(cmd: &str, expected: &str) -> Self {
        Self::new(ErrorKind::SyntaxError, format!("usage: {}!{}", cmd, expected))
    }

}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref file) = self.file {
            write!(f, "{}:", file)?;
        }
        if let Some(line) = self.line {
            write!(f, "{}:", line)?;
        }
        if let Some(ref cmd) = self.command {
            write!(f, " {}: ", cmd)?;
        } else if self.file.is_some() || self.line.is_some() {
            write!(f, " ")?;
        }
        write!(f, "{}", self.message)?;
        if let (Some(src), Some(col)) = (&self.source_line, self.column) {
            write!(f, "\n    {}\n    {}^", src, " ".repeat(col.saturating_sub(1)))?;
        }
        Ok(())
    }
}

impl std::error::Error for ScriptError {}

impl From<std::io::Error> for ScriptError {
    fn from(e: std::io::Error) -> Self {
        if matches!(
            e.kind(),
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
        ) {
            return Self::new(ErrorKind::Timeout, e.to_string());
        }
        Self::new(ErrorKind::Io, e.to_string())
    }
}
