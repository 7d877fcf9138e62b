//! A reusable text buffer for error messages, `show` output, and tracebacks.
//!
//! Formatting an error message often interleaves plain text with rendered
//! types. Rather than allocating a fresh `String` per fragment, callers
//! borrow the interpreter's message buffer, build the text in place, and
//! flush it into the raise. [`MsgBuf::add_sig`] is the type-aware
//! directive, rendering a signature through the symbol table.

use std::fmt::Write;

use crate::{sig::SigId, symtab::Symtab};

#[derive(Debug, Default)]
pub(crate) struct MsgBuf {
    text: String,
}

impl MsgBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, text: &str) -> &mut Self {
        self.text.push_str(text);
        self
    }

    pub fn add_char(&mut self, ch: char) -> &mut Self {
        self.text.push(ch);
        self
    }

    pub fn add_int(&mut self, value: i64) -> &mut Self {
        // write! to a String cannot fail.
        let _ = write!(self.text, "{value}");
        self
    }

    /// Renders a signature the way the user wrote it: `List[Integer]`,
    /// `Function(Integer => String)`, a bare class name, or a template
    /// letter.
    pub fn add_sig(&mut self, symtab: &Symtab, sig: SigId) -> &mut Self {
        symtab.write_sig_name(&mut self.text, sig);
        self
    }

    /// Takes the accumulated text, leaving the buffer empty for reuse.
    pub fn flush(&mut self) -> String {
        std::mem::take(&mut self.text)
    }

    pub fn reset(&mut self) {
        self.text.clear();
    }
}
