// File: src/errors.rs
//
// Error taxonomy and diagnostics for the Slate virtual machine.
// Every runtime failure is a SlateError record carrying its kind, source
// location, and message; Display renders the caret diagnostic shown to
// users in Script and Interactive contexts.

use colored::Colorize;
use std::fmt;
use std::rc::Rc;

/// Longest message a SlateError will carry; excess is truncated.
pub const MAX_MESSAGE_LEN: usize = 256;

/// The failure categories a running program can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    OutOfMemory,
    Syntax,
    Type,
    Reference,
    Range,
    Io,
    Internal,
    Arithmetic,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::OutOfMemory => write!(f, "OutOfMemoryError"),
            ErrorKind::Syntax => write!(f, "SyntaxError"),
            ErrorKind::Type => write!(f, "TypeError"),
            ErrorKind::Reference => write!(f, "ReferenceError"),
            ErrorKind::Range => write!(f, "RangeError"),
            ErrorKind::Io => write!(f, "IOError"),
            ErrorKind::Internal => write!(f, "InternalError"),
            ErrorKind::Arithmetic => write!(f, "ArithmeticError"),
        }
    }
}

/// A source position plus the text of the line it points into.
///
/// The line text is shared with the chunk's debug table, so producing a
/// location never copies program source.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugLocation {
    pub line: usize,
    pub column: usize,
    pub source_line: Rc<str>,
}

impl DebugLocation {
    pub fn new(line: usize, column: usize, source_line: Rc<str>) -> Self {
        Self { line, column, source_line }
    }
}

/// A runtime error record: kind, origin, and a bounded message.
#[derive(Debug, Clone, PartialEq)]
pub struct SlateError {
    pub kind: ErrorKind,
    pub file: Option<String>,
    pub line: usize,
    pub column: usize,
    pub message: String,
    pub source_line: Option<Rc<str>>,
}

impl SlateError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > MAX_MESSAGE_LEN {
            message.truncate(MAX_MESSAGE_LEN);
        }
        Self { kind, file: None, line: 0, column: 0, message, source_line: None }
    }

    pub fn with_location(mut self, location: &DebugLocation) -> Self {
        self.line = location.line;
        self.column = location.column;
        self.source_line = Some(Rc::clone(&location.source_line));
        self
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn reference_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Reference, message)
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Range, message)
    }

    pub fn arithmetic_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Arithmetic, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn syntax_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Syntax, message)
    }
}

impl fmt::Display for SlateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = format!("{}", self.kind);
        writeln!(f, "{}: {}", kind.red().bold(), self.message.bold())?;

        if self.line > 0 {
            match &self.file {
                Some(file) => {
                    writeln!(f, "    at {}, line {}, column {}:", file, self.line, self.column)?
                }
                None => writeln!(f, "    at line {}, column {}:", self.line, self.column)?,
            }
            if let Some(ref source) = self.source_line {
                writeln!(f, "    {}", source)?;
                writeln!(
                    f,
                    "    {}{}",
                    " ".repeat(self.column.saturating_sub(1)),
                    "^".red().bold()
                )?;
            }
        }

        Ok(())
    }
}

impl std::error::Error for SlateError {}
