//! Error Types
//!
//! The runtime has two error channels and never mixes them:
//!
//! - [`Error`] covers embedder-facing failures outside script execution:
//!   bad configuration, filesystem problems while loading modules,
//!   malformed bytecode.
//! - Script-level failures travel through the thread context's pending
//!   exception slot. Fallible runtime operations return
//!   `Result<T, Raised>`, where [`Raised`] is a marker saying "an
//!   exception is pending on the context"; the value itself is fetched
//!   with `Context::get_exception`.

use thiserror::Error;
use vela_bytecode::BytecodeError;

/// Embedder-facing error for instance setup and module loading.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("module source I/O failed for {path}: {source}")]
    ModuleIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bytecode rejected: {0}")]
    Bytecode(#[from] BytecodeError),

    #[error("no compiler installed on this instance")]
    NoCompiler,
}

/// Marker for an error signalled through the context's pending
/// exception. Carries no payload: the exception value lives in the
/// context's exception slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("exception pending on context")]
pub struct Raised;

/// Exception kind tags.
///
/// Kinds are string tags carried inside the exception value; raising
/// helpers format them as `"<Kind>: <message>"` and
/// `Context::exception_kind` parses them back out. `throw` of an
/// arbitrary value carries the value untouched and has no kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcKind {
    TypeError,
    OutOfRange,
    ReadOnly,
    NotFound,
    DivisionByZero,
    OutOfMemory,
    InvalidValue,
    InvalidSize,
    ImportCycle,
    ModuleNotFound,
    ModuleInitFailed,
    /// Internal marker raised when a finished generator is resumed or
    /// returns; the iteration machinery consumes it.
    GeneratorEnd,
}

impl ExcKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExcKind::TypeError => "TypeError",
            ExcKind::OutOfRange => "OutOfRange",
            ExcKind::ReadOnly => "ReadOnly",
            ExcKind::NotFound => "NotFound",
            ExcKind::DivisionByZero => "DivisionByZero",
            ExcKind::OutOfMemory => "OutOfMemory",
            ExcKind::InvalidValue => "InvalidValue",
            ExcKind::InvalidSize => "InvalidSize",
            ExcKind::ImportCycle => "ImportCycle",
            ExcKind::ModuleNotFound => "ModuleNotFound",
            ExcKind::ModuleInitFailed => "ModuleInitFailed",
            ExcKind::GeneratorEnd => "GeneratorEnd",
        }
    }

    /// Recover a kind from the leading tag of a formatted exception
    /// message.
    pub fn from_message(message: &str) -> Option<ExcKind> {
        let tag = message.split(':').next()?;
        const ALL: &[ExcKind] = &[
            ExcKind::TypeError,
            ExcKind::OutOfRange,
            ExcKind::ReadOnly,
            ExcKind::NotFound,
            ExcKind::DivisionByZero,
            ExcKind::OutOfMemory,
            ExcKind::InvalidValue,
            ExcKind::InvalidSize,
            ExcKind::ImportCycle,
            ExcKind::ModuleNotFound,
            ExcKind::ModuleInitFailed,
            ExcKind::GeneratorEnd,
        ];
        ALL.iter().copied().find(|kind| kind.as_str() == tag)
    }
}

impl std::fmt::Display for ExcKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        assert_eq!(ExcKind::from_message("ReadOnly: array is read-only"), Some(ExcKind::ReadOnly));
        assert_eq!(ExcKind::from_message("TypeError: bad operand"), Some(ExcKind::TypeError));
        assert_eq!(ExcKind::from_message("something else"), None);
        assert_eq!(ExcKind::from_message(""), None);
    }
}
