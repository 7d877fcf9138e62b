//! UTF-8-validated tokenization.
//!
//! The lexer reads one line at a time from a file, a string, or an
//! embedder-supplied callback, validates it as UTF-8, and advances one
//! token per call. Identifiers accept any byte in `0x80..=0xBF` as a
//! continuation (the line read already validated the sequence), so any
//! valid UTF-8 identifier is legal.
//!
//! In tag mode, bytes outside `<@lily ... @>` are accumulated and surfaced
//! as [`Token::HtmlBlock`] chunks for the embedder's html sender; string
//! scanning never treats tag sequences specially.

use std::{
    fs::File,
    io::{BufRead, BufReader},
};

use strum::{Display, EnumString, IntoStaticStr};

use crate::raiser::{ErrorClass, ParseResult, Raise};

/// Keywords, ordered to match the shorthash table below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum Keyword {
    If,
    Do,
    Use,
    Var,
    For,
    Try,
    Case,
    Else,
    True,
    Elif,
    SelfKw,
    Enum,
    While,
    Raise,
    False,
    Match,
    Break,
    Class,
    Define,
    Return,
    Except,
    Import,
    Private,
    DunderFile,
    DunderLine,
    Protected,
    Continue,
    DunderFunction,
}

/// Keyword names keyed by the 64-bit shorthash of their first eight bytes.
/// Only names of eight bytes or fewer can be keywords, so the hash is the
/// name itself and lookup is a single comparison per candidate.
const KEYWORDS: &[(&str, u64, Keyword)] = &[
    ("if", shorthash(b"if"), Keyword::If),
    ("do", shorthash(b"do"), Keyword::Do),
    ("use", shorthash(b"use"), Keyword::Use),
    ("var", shorthash(b"var"), Keyword::Var),
    ("for", shorthash(b"for"), Keyword::For),
    ("try", shorthash(b"try"), Keyword::Try),
    ("case", shorthash(b"case"), Keyword::Case),
    ("else", shorthash(b"else"), Keyword::Else),
    ("true", shorthash(b"true"), Keyword::True),
    ("elif", shorthash(b"elif"), Keyword::Elif),
    ("self", shorthash(b"self"), Keyword::SelfKw),
    ("enum", shorthash(b"enum"), Keyword::Enum),
    ("while", shorthash(b"while"), Keyword::While),
    ("raise", shorthash(b"raise"), Keyword::Raise),
    ("false", shorthash(b"false"), Keyword::False),
    ("match", shorthash(b"match"), Keyword::Match),
    ("break", shorthash(b"break"), Keyword::Break),
    ("class", shorthash(b"class"), Keyword::Class),
    ("define", shorthash(b"define"), Keyword::Define),
    ("return", shorthash(b"return"), Keyword::Return),
    ("except", shorthash(b"except"), Keyword::Except),
    ("import", shorthash(b"import"), Keyword::Import),
    ("private", shorthash(b"private"), Keyword::Private),
    ("__file__", shorthash(b"__file__"), Keyword::DunderFile),
    ("__line__", shorthash(b"__line__"), Keyword::DunderLine),
    ("protected", 0, Keyword::Protected),
    ("continue", shorthash(b"continue"), Keyword::Continue),
    ("__function__", 0, Keyword::DunderFunction),
];

/// The 64-bit shorthash of a name's first eight bytes, little-endian.
const fn shorthash(name: &[u8]) -> u64 {
    let mut hash = 0u64;
    let mut i = 0;
    while i < name.len() && i < 8 {
        hash |= (name[i] as u64) << (i * 8);
        i += 1;
    }
    hash
}

/// Looks a word up in the keyword table. Names longer than eight bytes
/// fall back to direct comparison.
pub(crate) fn keyword_for(word: &str) -> Option<Keyword> {
    if word.len() <= 8 {
        let hash = shorthash(word.as_bytes());
        for &(name, table_hash, keyword) in KEYWORDS {
            if name.len() <= 8 && table_hash == hash && name == word {
                return Some(keyword);
            }
        }
        None
    } else {
        KEYWORDS
            .iter()
            .find(|&&(name, _, _)| name == word)
            .map(|&(_, _, keyword)| keyword)
    }
}

/// One token. Payload-free variants cover punctuation and operators;
/// literal variants carry their scanned value.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    RightParen,
    Comma,
    LeftCurly,
    RightCurly,
    LeftBracket,
    RightBracket,
    Colon,
    Tilde,
    Caret,
    CaretEq,
    Not,
    NotEq,
    Percent,
    PercentEq,
    Multiply,
    MultiplyEq,
    Divide,
    DivideEq,
    Plus,
    PlusEq,
    Minus,
    MinusEq,
    Lt,
    LtEq,
    LeftShift,
    LeftShiftEq,
    Gt,
    GtEq,
    RightShift,
    RightShiftEq,
    Equal,
    EqEq,
    LeftParen,
    TupleOpen,
    TupleClose,
    Arrow,
    Word(String),
    /// `@name`: a class property inside a class body.
    PropWord(String),
    StringLit(String),
    ByteStringLit(Vec<u8>),
    ByteLit(u8),
    IntegerLit(i64),
    DoubleLit(f64),
    Docblock(String),
    Dot,
    BitAnd,
    BitAndEq,
    LogicalAnd,
    BitOr,
    BitOrEq,
    LogicalOr,
    /// `@(`: opens a typecast.
    TypecastParen,
    /// `...`: the inclusive range in for loops and vararg markers.
    ThreeDots,
    /// Raw page text collected while in tag mode; the parser hands it to
    /// the html sender so delivery stays in program order.
    HtmlBlock(String),
    /// `@>` or `?>`: leaves code mode when scanning a page.
    EndTag,
    Invalid(char),
    EndOfFile,
}

impl Token {
    /// Names for error messages, phrased the way the messages read:
    /// "Expected a value, not 'a string'."
    pub fn name(&self) -> &'static str {
        match self {
            Self::RightParen => ")",
            Self::Comma => ",",
            Self::LeftCurly => "{",
            Self::RightCurly => "}",
            Self::LeftBracket => "[",
            Self::RightBracket => "]",
            Self::Colon => ":",
            Self::Tilde => "~",
            Self::Caret => "^",
            Self::CaretEq => "^=",
            Self::Not => "!",
            Self::NotEq => "!=",
            Self::Percent => "%",
            Self::PercentEq => "%=",
            Self::Multiply => "*",
            Self::MultiplyEq => "*=",
            Self::Divide => "/",
            Self::DivideEq => "/=",
            Self::Plus => "+",
            Self::PlusEq => "+=",
            Self::Minus => "-",
            Self::MinusEq => "-=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::LeftShift => "<<",
            Self::LeftShiftEq => "<<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::RightShift => ">>",
            Self::RightShiftEq => ">>=",
            Self::Equal => "=",
            Self::EqEq => "==",
            Self::LeftParen => "(",
            Self::TupleOpen => "<[",
            Self::TupleClose => "]>",
            Self::Arrow => "=>",
            Self::Word(_) => "a label",
            Self::PropWord(_) => "a property name",
            Self::StringLit(_) => "a string",
            Self::ByteStringLit(_) => "a bytestring",
            Self::ByteLit(_) => "a byte",
            Self::IntegerLit(_) => "an integer",
            Self::DoubleLit(_) => "a double",
            Self::Docblock(_) => "a docblock",
            Self::Dot => ".",
            Self::BitAnd => "&",
            Self::BitAndEq => "&=",
            Self::LogicalAnd => "&&",
            Self::BitOr => "|",
            Self::BitOrEq => "|=",
            Self::LogicalOr => "||",
            Self::TypecastParen => "@(",
            Self::ThreeDots => "...",
            Self::HtmlBlock(_) => "page text",
            Self::EndTag => "?>",
            Self::Invalid(_) => "invalid token",
            Self::EndOfFile => "end of file",
        }
    }
}

/// Where the lexer pulls lines from.
pub(crate) enum Source {
    File(BufReader<File>),
    /// Owned text split lazily; already valid UTF-8 by construction.
    Text { text: String, offset: usize },
    /// Embedding callback: each call yields the next chunk, or `None` at
    /// the end of input.
    Callback(Box<dyn FnMut() -> Option<String>>),
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(_) => write!(f, "Source::File"),
            Self::Text { offset, .. } => write!(f, "Source::Text at {offset}"),
            Self::Callback(_) => write!(f, "Source::Callback"),
        }
    }
}

/// Whether the input is plain code or an HTML page with embedded code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    #[default]
    NoTags,
    Tags,
}

const OPEN_TAG: &[u8] = b"<@lily";

#[derive(Debug)]
pub(crate) struct Lexer {
    source: Source,
    /// Current line bytes, including the trailing newline when present.
    line: Vec<u8>,
    pos: usize,
    line_num: u16,
    /// True while scanning page text rather than code (tag mode only).
    in_page: bool,
    mode: ParseMode,
    /// Whether the previous token could end an expression. Decides if a
    /// `-digit` sequence is a negative literal or a binary minus.
    last_was_value: bool,
}

impl Lexer {
    pub fn new(source: Source, mode: ParseMode) -> Self {
        Self {
            source,
            line: Vec::new(),
            pos: 0,
            line_num: 0,
            in_page: mode == ParseMode::Tags,
            mode,
            last_was_value: false,
        }
    }

    pub fn line_num(&self) -> u16 {
        self.line_num
    }

    fn raise(&self, message: impl Into<String>) -> Raise {
        Raise::new(ErrorClass::Syntax, message, self.line_num)
    }

    /// Pulls the next line into the line buffer, validating UTF-8 for file
    /// and callback input. Returns false at end of input.
    fn read_line(&mut self) -> ParseResult<bool> {
        self.line.clear();
        self.pos = 0;
        let got = match &mut self.source {
            Source::File(reader) => {
                let mut bytes = Vec::new();
                let n = reader
                    .read_until(b'\n', &mut bytes)
                    .map_err(|e| Raise::new(ErrorClass::IOError, e.to_string(), self.line_num))?;
                if n == 0 {
                    false
                } else {
                    if std::str::from_utf8(&bytes).is_err() {
                        return Err(Raise::new(
                            ErrorClass::Encoding,
                            "Input is not valid UTF-8.",
                            self.line_num + 1,
                        ));
                    }
                    self.line = bytes;
                    true
                }
            }
            Source::Text { text, offset } => {
                if *offset >= text.len() {
                    false
                } else {
                    let rest = &text[*offset..];
                    let end = rest.find('\n').map_or(rest.len(), |i| i + 1);
                    self.line.extend_from_slice(rest[..end].as_bytes());
                    *offset += end;
                    true
                }
            }
            Source::Callback(next) => match next() {
                None => false,
                Some(chunk) => {
                    self.line.extend_from_slice(chunk.as_bytes());
                    true
                }
            },
        };
        if got {
            self.line_num += 1;
        }
        Ok(got)
    }

    fn peek(&self) -> u8 {
        self.line.get(self.pos).copied().unwrap_or(b'\n')
    }

    fn peek_at(&self, offset: usize) -> u8 {
        self.line.get(self.pos + offset).copied().unwrap_or(b'\n')
    }

    /// Scans page text until the opening code tag or end of input.
    fn scan_page(&mut self) -> ParseResult<Token> {
        let mut chunk: Vec<u8> = Vec::new();
        let finish = |bytes: Vec<u8>| {
            // Line reads validated UTF-8 already.
            String::from_utf8(bytes).expect("page bytes validated on line read")
        };
        loop {
            if self.pos >= self.line.len() && !self.read_line()? {
                self.in_page = false;
                return if chunk.is_empty() {
                    Ok(Token::EndOfFile)
                } else {
                    Ok(Token::HtmlBlock(finish(chunk)))
                };
            }
            while self.pos < self.line.len() {
                if self.peek() == b'<' && self.line[self.pos..].starts_with(OPEN_TAG) {
                    self.pos += OPEN_TAG.len();
                    self.in_page = false;
                    return if chunk.is_empty() {
                        self.next_token()
                    } else {
                        Ok(Token::HtmlBlock(finish(chunk)))
                    };
                }
                chunk.push(self.line[self.pos]);
                self.pos += 1;
            }
        }
    }

    /// Advances one token.
    pub fn next_token(&mut self) -> ParseResult<Token> {
        if self.in_page {
            return self.scan_page();
        }
        let token = self.scan_token()?;
        self.last_was_value = matches!(
            token,
            Token::Word(_)
                | Token::PropWord(_)
                | Token::IntegerLit(_)
                | Token::DoubleLit(_)
                | Token::StringLit(_)
                | Token::ByteStringLit(_)
                | Token::ByteLit(_)
                | Token::RightParen
                | Token::RightBracket
                | Token::TupleClose
        );
        Ok(token)
    }

    fn scan_token(&mut self) -> ParseResult<Token> {
        loop {
            let ch = self.peek();
            match ch {
                b'\n' | b'\r' => {
                    if !self.read_line()? {
                        return Ok(Token::EndOfFile);
                    }
                }
                // Semicolons are optional statement separators.
                b' ' | b'\t' | b';' => self.pos += 1,
                b'#' => {
                    if self.peek_at(1) == b'[' {
                        self.skip_block_comment()?;
                    } else if self.peek_at(1) == b'#' && self.peek_at(2) == b'#' {
                        return self.scan_docblock();
                    } else {
                        // Line comment: discard the rest of the line.
                        self.pos = self.line.len();
                    }
                }
                _ => break,
            }
        }

        let ch = self.peek();
        let token = match ch {
            b'(' => self.simple(1, Token::LeftParen),
            b')' => self.simple(1, Token::RightParen),
            b',' => self.simple(1, Token::Comma),
            b'{' => self.simple(1, Token::LeftCurly),
            b'}' => self.simple(1, Token::RightCurly),
            b'[' => self.simple(1, Token::LeftBracket),
            b']' => {
                if self.peek_at(1) == b'>' {
                    self.simple(2, Token::TupleClose)
                } else {
                    self.simple(1, Token::RightBracket)
                }
            }
            b':' => self.simple(1, Token::Colon),
            b'~' => self.simple(1, Token::Tilde),
            b'.' => {
                if self.peek_at(1) == b'.' && self.peek_at(2) == b'.' {
                    self.simple(3, Token::ThreeDots)
                } else {
                    self.simple(1, Token::Dot)
                }
            }
            b'^' => self.with_eq(Token::Caret, Token::CaretEq),
            b'!' => self.with_eq(Token::Not, Token::NotEq),
            b'%' => self.with_eq(Token::Percent, Token::PercentEq),
            b'*' => self.with_eq(Token::Multiply, Token::MultiplyEq),
            b'/' => self.with_eq(Token::Divide, Token::DivideEq),
            b'+' => self.with_eq(Token::Plus, Token::PlusEq),
            b'-' => {
                if self.peek_at(1).is_ascii_digit() && !self.last_was_value {
                    return self.scan_number();
                }
                self.with_eq(Token::Minus, Token::MinusEq)
            }
            b'<' => match self.peek_at(1) {
                b'=' => self.simple(2, Token::LtEq),
                b'[' => self.simple(2, Token::TupleOpen),
                b'<' => {
                    if self.peek_at(2) == b'=' {
                        self.simple(3, Token::LeftShiftEq)
                    } else {
                        self.simple(2, Token::LeftShift)
                    }
                }
                _ => self.simple(1, Token::Lt),
            },
            b'>' => match self.peek_at(1) {
                b'=' => self.simple(2, Token::GtEq),
                b'>' => {
                    if self.peek_at(2) == b'=' {
                        self.simple(3, Token::RightShiftEq)
                    } else {
                        self.simple(2, Token::RightShift)
                    }
                }
                _ => self.simple(1, Token::Gt),
            },
            b'=' => match self.peek_at(1) {
                b'=' => self.simple(2, Token::EqEq),
                b'>' => self.simple(2, Token::Arrow),
                _ => self.simple(1, Token::Equal),
            },
            b'&' => match self.peek_at(1) {
                b'&' => self.simple(2, Token::LogicalAnd),
                b'=' => self.simple(2, Token::BitAndEq),
                _ => self.simple(1, Token::BitAnd),
            },
            b'|' => match self.peek_at(1) {
                b'|' => self.simple(2, Token::LogicalOr),
                b'=' => self.simple(2, Token::BitOrEq),
                _ => self.simple(1, Token::BitOr),
            },
            b'@' => match self.peek_at(1) {
                b'(' => self.simple(2, Token::TypecastParen),
                b'>' => {
                    self.pos += 2;
                    if self.mode == ParseMode::Tags {
                        self.in_page = true;
                    }
                    Token::EndTag
                }
                b if is_ident_start(b) => {
                    self.pos += 1;
                    let word = self.scan_word();
                    Token::PropWord(word)
                }
                _ => self.simple(1, Token::Invalid('@')),
            },
            b'?' => {
                if self.peek_at(1) == b'>' {
                    self.pos += 2;
                    if self.mode == ParseMode::Tags {
                        self.in_page = true;
                    }
                    Token::EndTag
                } else {
                    self.simple(1, Token::Invalid('?'))
                }
            }
            b'"' => return self.scan_string(),
            b'\'' => return self.scan_byte(),
            b'B' if self.peek_at(1) == b'"' => {
                self.pos += 1;
                let Token::StringLit(text) = self.scan_string()? else {
                    unreachable!("scan_string yields a string token");
                };
                return Ok(Token::ByteStringLit(text.into_bytes()));
            }
            b'0'..=b'9' => return self.scan_number(),
            b if is_ident_start(b) => {
                let word = self.scan_word();
                Token::Word(word)
            }
            other => self.simple(1, Token::Invalid(other as char)),
        };
        Ok(token)
    }

    fn simple(&mut self, width: usize, token: Token) -> Token {
        self.pos += width;
        token
    }

    fn with_eq(&mut self, plain: Token, with_eq: Token) -> Token {
        if self.peek_at(1) == b'=' {
            self.simple(2, with_eq)
        } else {
            self.simple(1, plain)
        }
    }

    fn scan_word(&mut self) -> String {
        let start = self.pos;
        while self.pos < self.line.len() && is_ident_ch(self.line[self.pos]) {
            self.pos += 1;
        }
        // The line was validated as UTF-8 when read.
        String::from_utf8(self.line[start..self.pos].to_vec())
            .expect("identifier bytes validated on line read")
    }

    fn skip_block_comment(&mut self) -> ParseResult<()> {
        let start_line = self.line_num;
        self.pos += 2;
        loop {
            while self.pos < self.line.len() {
                if self.peek() == b']' && self.peek_at(1) == b'#' {
                    self.pos += 2;
                    return Ok(());
                }
                self.pos += 1;
            }
            if !self.read_line()? {
                return Err(Raise::new(
                    ErrorClass::Syntax,
                    "Unterminated block comment (started at line ".to_string()
                        + &start_line.to_string()
                        + ").",
                    start_line,
                ));
            }
        }
    }

    fn scan_docblock(&mut self) -> ParseResult<Token> {
        self.pos += 3;
        let start = self.pos;
        while self.pos < self.line.len() && self.peek() != b'\n' {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.line[start..self.pos])
            .expect("docblock bytes validated on line read");
        Ok(Token::Docblock(text.trim().to_string()))
    }

    /// Scans `"..."` and `"""..."""` strings with escape processing.
    fn scan_string(&mut self) -> ParseResult<Token> {
        let multiline = self.peek_at(1) == b'"' && self.peek_at(2) == b'"';
        let start_line = self.line_num;
        self.pos += if multiline { 3 } else { 1 };
        let mut bytes: Vec<u8> = Vec::new();
        let finish = |bytes: Vec<u8>| {
            String::from_utf8(bytes).expect("string bytes validated on line read")
        };
        loop {
            if self.pos >= self.line.len() || (self.peek() == b'\n' && !multiline) {
                if !multiline {
                    return Err(self.raise("Newline in single-line string."));
                }
                // The line's own newline byte was already accumulated.
                if !self.read_line()? {
                    return Err(Raise::new(
                        ErrorClass::Syntax,
                        format!("Unterminated multi-line string (started at line {start_line})."),
                        start_line,
                    ));
                }
                continue;
            }
            let ch = self.peek();
            if ch == b'"' {
                if multiline {
                    if self.peek_at(1) == b'"' && self.peek_at(2) == b'"' {
                        self.pos += 3;
                        return Ok(Token::StringLit(finish(bytes)));
                    }
                    bytes.push(b'"');
                    self.pos += 1;
                } else {
                    self.pos += 1;
                    return Ok(Token::StringLit(finish(bytes)));
                }
            } else if ch == b'\\' {
                let escaped = self.scan_escape()?;
                bytes.push(escaped);
            } else {
                bytes.push(ch);
                self.pos += 1;
            }
        }
    }

    fn scan_escape(&mut self) -> ParseResult<u8> {
        let ch = self.peek_at(1);
        let value = match ch {
            b'n' => b'\n',
            b'r' => b'\r',
            b't' => b'\t',
            b'\'' => b'\'',
            b'"' => b'"',
            b'\\' => b'\\',
            b'b' => 0x8,
            b'a' => 0x7,
            other => {
                return Err(self.raise(format!("Invalid escape sequence '\\{}'.", other as char)));
            }
        };
        self.pos += 2;
        Ok(value)
    }

    /// Scans `'c'` and `'\n'` byte literals.
    fn scan_byte(&mut self) -> ParseResult<Token> {
        self.pos += 1;
        let value = if self.peek() == b'\\' {
            self.scan_escape()?
        } else {
            let b = self.peek();
            if b == b'\n' || b == b'\'' {
                return Err(self.raise("Expected a byte before the closing quote."));
            }
            self.pos += 1;
            b
        };
        if self.peek() != b'\'' {
            return Err(self.raise("Expected \"'\" to close the byte literal."));
        }
        self.pos += 1;
        Ok(Token::ByteLit(value))
    }

    /// Scans integer and double literals: `0b`/`0c`/`0x` radix prefixes,
    /// decimal with optional fraction and exponent. Rejects overflow,
    /// allowing exactly one extra magnitude step for `i64::MIN`.
    fn scan_number(&mut self) -> ParseResult<Token> {
        let negative = self.peek() == b'-';
        if negative {
            self.pos += 1;
        }

        if self.peek() == b'0' {
            let radix = match self.peek_at(1) {
                b'b' => Some(2),
                b'c' => Some(8),
                b'x' => Some(16),
                _ => None,
            };
            if let Some(radix) = radix {
                self.pos += 2;
                return self.scan_radix_integer(radix, negative);
            }
        }

        let digit_start = self.pos;
        while self.peek().is_ascii_digit() {
            self.pos += 1;
        }
        let is_double =
            (self.peek() == b'.' && self.peek_at(1).is_ascii_digit()) || self.peek() == b'e';
        if !is_double {
            let mut magnitude = 0u64;
            for i in digit_start..self.pos {
                let digit = u64::from(self.line[i] - b'0');
                magnitude = magnitude
                    .checked_mul(10)
                    .and_then(|m| m.checked_add(digit))
                    .ok_or_else(|| self.raise("Integer value is too large."))?;
            }
            return int_token(magnitude, negative)
                .ok_or_else(|| self.raise("Integer value is too large."));
        }

        // Double: fraction digits, then an optional exponent.
        if self.peek() == b'.' {
            self.pos += 1;
            while self.peek().is_ascii_digit() {
                self.pos += 1;
            }
        }
        if self.peek() == b'e' {
            self.pos += 1;
            if self.peek() == b'+' || self.peek() == b'-' {
                self.pos += 1;
            }
            let exp_start = self.pos;
            while self.peek().is_ascii_digit() {
                self.pos += 1;
            }
            if self.pos == exp_start {
                return Err(self.raise("Expected exponent digits after 'e'."));
            }
            if self.pos - exp_start > 3 {
                return Err(self.raise("Exponent is too large."));
            }
        }

        let text = std::str::from_utf8(&self.line[digit_start..self.pos])
            .expect("numeric bytes are ASCII");
        let value: f64 = text
            .parse()
            .map_err(|_| self.raise("Invalid double literal."))?;
        Ok(Token::DoubleLit(if negative { -value } else { value }))
    }

    fn scan_radix_integer(&mut self, radix: u64, negative: bool) -> ParseResult<Token> {
        let start = self.pos;
        let mut magnitude = 0u64;
        while let Some(digit) = digit_value(self.peek(), radix) {
            magnitude = magnitude
                .checked_mul(radix)
                .and_then(|m| m.checked_add(digit))
                .ok_or_else(|| self.raise("Integer value is too large."))?;
            self.pos += 1;
        }
        if self.pos == start {
            return Err(self.raise("Expected digits after the radix prefix."));
        }
        int_token(magnitude, negative).ok_or_else(|| self.raise("Integer value is too large."))
    }
}

/// Builds an integer token from a magnitude, honoring the asymmetric i64
/// range: `i64::MIN` has one more step of magnitude than `i64::MAX`.
fn int_token(magnitude: u64, negative: bool) -> Option<Token> {
    if negative {
        if magnitude > i64::MAX as u64 + 1 {
            return None;
        }
        Some(Token::IntegerLit((magnitude as i64).wrapping_neg()))
    } else {
        i64::try_from(magnitude).ok().map(Token::IntegerLit)
    }
}

fn digit_value(ch: u8, radix: u64) -> Option<u64> {
    let v = match ch {
        b'0'..=b'9' => u64::from(ch - b'0'),
        b'a'..=b'f' => u64::from(ch - b'a') + 10,
        b'A'..=b'F' => u64::from(ch - b'A') + 10,
        _ => return None,
    };
    (v < radix).then_some(v)
}

fn is_ident_start(ch: u8) -> bool {
    ch.is_ascii_alphabetic() || ch == b'_' || ch >= 0x80
}

/// Identifier continuation: ASCII alphanumerics, underscore, and any byte
/// in the UTF-8 continuation range.
fn is_ident_ch(ch: u8) -> bool {
    ch.is_ascii_alphanumeric() || ch == b'_' || ch >= 0x80
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(text: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(
            Source::Text {
                text: text.to_string(),
                offset: 0,
            },
            ParseMode::NoTags,
        );
        let mut out = Vec::new();
        loop {
            let token = lexer.next_token().expect("lex failure");
            let done = token == Token::EndOfFile;
            out.push(token);
            if done {
                return out;
            }
        }
    }

    fn lex_err(text: &str) -> Raise {
        let mut lexer = Lexer::new(
            Source::Text {
                text: text.to_string(),
                offset: 0,
            },
            ParseMode::NoTags,
        );
        loop {
            match lexer.next_token() {
                Ok(Token::EndOfFile) => panic!("expected a lex error for {text:?}"),
                Ok(_) => {}
                Err(raise) => return raise,
            }
        }
    }

    #[test]
    fn keywords_resolve_through_shorthash() {
        assert_eq!(keyword_for("if"), Some(Keyword::If));
        assert_eq!(keyword_for("define"), Some(Keyword::Define));
        assert_eq!(keyword_for("__function__"), Some(Keyword::DunderFunction));
        assert_eq!(keyword_for("iff"), None);
        assert_eq!(keyword_for("classy"), None);
    }

    #[test]
    fn two_char_operators_disambiguate() {
        let tokens = lex_all("= == => < <= << <[ ! !=");
        assert_eq!(
            tokens,
            vec![
                Token::Equal,
                Token::EqEq,
                Token::Arrow,
                Token::Lt,
                Token::LtEq,
                Token::LeftShift,
                Token::TupleOpen,
                Token::Not,
                Token::NotEq,
                Token::EndOfFile,
            ]
        );
    }

    #[test]
    fn numeric_radix_literals() {
        let tokens = lex_all("0b101 0c17 0xff 10 1.5 1e3");
        assert_eq!(
            tokens,
            vec![
                Token::IntegerLit(5),
                Token::IntegerLit(15),
                Token::IntegerLit(255),
                Token::IntegerLit(10),
                Token::DoubleLit(1.5),
                Token::DoubleLit(1000.0),
                Token::EndOfFile,
            ]
        );
    }

    #[test]
    fn i64_min_parses_but_one_less_does_not() {
        let tokens = lex_all("var a = -9223372036854775808");
        assert!(tokens.contains(&Token::IntegerLit(i64::MIN)));
        let err = lex_err("var a = -9223372036854775809");
        assert_eq!(err.class, ErrorClass::Syntax);
    }

    #[test]
    fn i64_max_overflow_rejected() {
        let tokens = lex_all("9223372036854775807");
        assert_eq!(tokens[0], Token::IntegerLit(i64::MAX));
        let err = lex_err("9223372036854775808");
        assert_eq!(err.class, ErrorClass::Syntax);
    }

    #[test]
    fn minus_after_value_is_an_operator() {
        let tokens = lex_all("a -2");
        assert_eq!(
            tokens,
            vec![
                Token::Word("a".to_string()),
                Token::Minus,
                Token::IntegerLit(2),
                Token::EndOfFile,
            ]
        );
    }

    #[test]
    fn empty_exponent_rejected() {
        let err = lex_err("1.5e");
        assert_eq!(err.class, ErrorClass::Syntax);
    }

    #[test]
    fn wide_exponent_rejected() {
        let err = lex_err("1e1234");
        assert_eq!(err.class, ErrorClass::Syntax);
    }

    #[test]
    fn string_escapes() {
        let tokens = lex_all(r#""a\tb\n\"q\"""#);
        assert_eq!(tokens[0], Token::StringLit("a\tb\n\"q\"".to_string()));
    }

    #[test]
    fn multiline_string_reports_start_line() {
        let err = lex_err("var a = \"\"\"abc\ndef");
        assert_eq!(err.line, 1);
    }

    #[test]
    fn utf8_identifiers_are_words() {
        let tokens = lex_all("varname café");
        assert_eq!(tokens[0], Token::Word("varname".to_string()));
        assert_eq!(tokens[1], Token::Word("café".to_string()));
    }

    #[test]
    fn comments_are_skipped() {
        let tokens = lex_all("1 # trailing\n#[ block\nstill block ]# 2");
        assert_eq!(
            tokens,
            vec![Token::IntegerLit(1), Token::IntegerLit(2), Token::EndOfFile]
        );
    }

    #[test]
    fn tag_mode_splits_page_and_code() {
        let mut lexer = Lexer::new(
            Source::Text {
                text: "<html><@lily var a = 1 @><p>".to_string(),
                offset: 0,
            },
            ParseMode::Tags,
        );
        assert_eq!(
            lexer.next_token().unwrap(),
            Token::HtmlBlock("<html>".to_string())
        );
        assert_eq!(lexer.next_token().unwrap(), Token::Word("var".to_string()));
        assert_eq!(lexer.next_token().unwrap(), Token::Word("a".to_string()));
        assert_eq!(lexer.next_token().unwrap(), Token::Equal);
        assert_eq!(lexer.next_token().unwrap(), Token::IntegerLit(1));
        assert_eq!(lexer.next_token().unwrap(), Token::EndTag);
        assert_eq!(
            lexer.next_token().unwrap(),
            Token::HtmlBlock("<p>".to_string())
        );
        assert_eq!(lexer.next_token().unwrap(), Token::EndOfFile);
    }

    #[test]
    fn byte_literals() {
        let tokens = lex_all("'a' '\\n'");
        assert_eq!(tokens[0], Token::ByteLit(b'a'));
        assert_eq!(tokens[1], Token::ByteLit(b'\n'));
    }
}
