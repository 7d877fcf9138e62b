//! Structured error capture for parse, emit, and run time.
//!
//! Every fallible path threads a `Result` back to the nearest protected
//! frame; no unwinding primitive is involved. The [`Raiser`] owns the
//! frame stack and the last recorded error, so re-entrant calls (a
//! foreign function calling back into the interpreter) nest cleanly.

use std::fmt;

use strum::{Display, EnumString, IntoStaticStr};

use crate::symtab::ClassId;

/// Result type for parse- and emit-time operations.
pub(crate) type ParseResult<T> = Result<T, Raise>;

/// Result type for operations inside the VM.
pub(crate) type RunResult<T> = Result<T, RunError>;

/// The closed set of error classes the core can raise on its own.
///
/// Uses strum derives so the rendered name matches the variant exactly
/// (e.g. `OutOfRange` -> "OutOfRange"). User-raised exceptions are not in
/// this set; they carry their class through [`RunError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr)]
pub enum ErrorClass {
    /// Allocation failure. Kept for parity with the embedding ABI; Rust-side
    /// allocation failure aborts, but foreign code may still report it.
    NoMemory,
    /// Parse- or emit-time rejection of the source.
    Syntax,
    /// A package or file could not be imported.
    Import,
    /// Input was not valid UTF-8.
    Encoding,
    /// A nil value was read.
    NoValue,
    DivideByZero,
    OutOfRange,
    /// An `Any` typecast did not match the contained value.
    BadCast,
    /// A method with a return type fell off the end of its code.
    ReturnExpected,
    /// A value was structurally valid but unusable (bad for-loop step).
    BadValue,
    /// A hash read with a key that is not present.
    Key,
    /// A malformed format operation.
    Format,
    IOError,
    /// The native call depth limit was exceeded.
    Recursion,
}

/// A parse- or emit-time error on its way to the protected frame.
///
/// `line` is the adjusted line: merging ASTs across newlines reports the
/// line the expression started on, not the line the lexer is sitting on.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Raise {
    pub class: ErrorClass,
    pub message: String,
    pub line: u16,
}

impl Raise {
    pub fn new(class: ErrorClass, message: impl Into<String>, line: u16) -> Self {
        Self {
            class,
            message: message.into(),
            line,
        }
    }
}

/// A runtime error, either core-raised or user-raised.
///
/// The class is a symtab class id so user-defined exception classes flow
/// through the same channel as the builtin set. The traceback is filled in
/// by the VM as frames unwind.
#[derive(Debug, Clone)]
pub(crate) struct RunError {
    pub class: ClassId,
    pub message: String,
    /// The heap value of a user-raised exception instance, if one exists.
    /// Core raises build an instance lazily only when a handler binds one.
    pub instance: Option<crate::heap::HeapId>,
    pub traceback: Vec<String>,
}

impl RunError {
    pub fn new(class: ClassId, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            instance: None,
            traceback: Vec::new(),
        }
    }
}

/// One frame of protection around a parse or exec entry point.
///
/// The embedding API pushes one of these per call; nested entries (foreign
/// code re-entering the interpreter) stack.
#[derive(Debug, Clone, Copy)]
struct ProtectedFrame {
    /// Frame count of the VM call stack when this frame was entered, so an
    /// inner error can unwind the VM exactly back to the entry point.
    vm_depth: usize,
}

/// Where an error was detected, for user-visible rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorLocation {
    /// Parse/emit error: file label and line.
    Where { file: String, line: u16 },
    /// Runtime error: traceback lines, innermost last.
    Traceback(Vec<String>),
}

/// The assembled, user-visible error. Produced by [`Raiser::error`] after an
/// entry point returns failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LilyError {
    /// The error class name, e.g. `Syntax` or `ValueError`.
    pub class_name: String,
    pub message: String,
    pub location: ErrorLocation,
}

impl fmt::Display for LilyError {
    /// Renders `ErrorClass: message` followed by the `Where:` line for
    /// static errors or the `Traceback:` block for runtime errors.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class_name, self.message)?;
        match &self.location {
            ErrorLocation::Where { file, line } => {
                write!(f, "\nWhere: File \"{file}\" at line {line}")
            }
            ErrorLocation::Traceback(lines) => {
                write!(f, "\nTraceback:")?;
                for line in lines {
                    write!(f, "\n    {line}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for LilyError {}

/// Error capture shared by every stage of the interpreter.
#[derive(Debug, Default)]
pub(crate) struct Raiser {
    frames: Vec<ProtectedFrame>,
    error: Option<LilyError>,
}

impl Raiser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters a protected frame. Every public parse/exec call wraps itself
    /// in one so no error escapes an unguarded boundary.
    pub fn push_frame(&mut self, vm_depth: usize) {
        self.frames.push(ProtectedFrame { vm_depth });
    }

    /// Leaves the innermost protected frame, returning the VM depth it
    /// recorded at entry.
    pub fn pop_frame(&mut self) -> usize {
        self.frames
            .pop()
            .expect("Raiser::pop_frame: no protected frame")
            .vm_depth
    }

    /// Records a parse/emit error against the current input label.
    pub fn set_static(&mut self, raise: &Raise, file: &str) {
        self.error = Some(LilyError {
            class_name: raise.class.to_string(),
            message: raise.message.clone(),
            location: ErrorLocation::Where {
                file: file.to_string(),
                line: raise.line,
            },
        });
    }

    /// Records a runtime error with its assembled traceback.
    pub fn set_runtime(&mut self, class_name: &str, err: &RunError) {
        self.error = Some(LilyError {
            class_name: class_name.to_string(),
            message: err.message.clone(),
            location: ErrorLocation::Traceback(err.traceback.clone()),
        });
    }

    /// The last error recorded, if any. Cleared by the next successful call.
    pub fn error(&self) -> Option<&LilyError> {
        self.error.as_ref()
    }

    pub fn clear(&mut self) {
        self.error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_class_names_render_bare() {
        assert_eq!(ErrorClass::OutOfRange.to_string(), "OutOfRange");
        assert_eq!(ErrorClass::DivideByZero.to_string(), "DivideByZero");
    }

    #[test]
    fn static_error_renders_where_line() {
        let err = LilyError {
            class_name: "Syntax".to_string(),
            message: "Expected a value, not ')'.".to_string(),
            location: ErrorLocation::Where {
                file: "t.lily".to_string(),
                line: 3,
            },
        };
        assert_eq!(
            err.to_string(),
            "Syntax: Expected a value, not ')'.\nWhere: File \"t.lily\" at line 3"
        );
    }

    #[test]
    fn runtime_error_renders_traceback_block() {
        let err = LilyError {
            class_name: "DivideByZero".to_string(),
            message: "Attempt to divide by zero.".to_string(),
            location: ErrorLocation::Traceback(vec![
                "Function __main__ at line 1".to_string(),
                "Function f at line 2".to_string(),
            ]),
        };
        let rendered = err.to_string();
        assert!(rendered.starts_with("DivideByZero: Attempt to divide by zero.\nTraceback:"));
        assert!(rendered.contains("Function f at line 2"));
    }
}
