//! The recursive-descent, keyword-dispatched statement parser.
//!
//! The parser owns the lexer and the AST pool, and drives the emitter: an
//! expression is built into the pool (a pure operation), then evaluated
//! into bytecode when the statement's shape is known. Lambda bodies are
//! the one place compilation recurses: the pool's expression state is
//! frozen, the body compiles as its own method, and the state thaws with
//! the finished lambda pushed as a value.

use crate::{
    ast::{AstPool, ExprOp, TreeKind},
    emit::{BlockKind, Emitter},
    lexer::{Keyword, Lexer, Token, keyword_for},
    raiser::{ErrorClass, ParseResult, Raise},
    sig::SigId,
    symtab::{
        CLS_FUNCTION, CLS_HASH, CLS_LIST, CLS_TUPLE, ClassId, ClassKind, ClassMember, LitValue,
        Symtab, VarKind, VariantDef, Visibility,
    },
};

pub(crate) struct Parser<'a> {
    lexer: Lexer,
    token: Token,
    pool: AstPool,
    emit: &'a mut Emitter,
    symtab: &'a mut Symtab,
    /// Receives page text chunks, in program order.
    html: &'a mut dyn FnMut(&str),
    file_label: String,
    /// Template letters in scope, one frame per nested `define`.
    templates: Vec<Vec<char>>,
}

impl<'a> Parser<'a> {
    pub fn new(
        lexer: Lexer,
        emit: &'a mut Emitter,
        symtab: &'a mut Symtab,
        html: &'a mut dyn FnMut(&str),
        file_label: &str,
    ) -> Self {
        Self {
            lexer,
            token: Token::EndOfFile,
            pool: AstPool::new(),
            emit,
            symtab,
            html,
            file_label: file_label.to_string(),
            templates: Vec::new(),
        }
    }

    fn line(&self) -> u16 {
        self.lexer.line_num()
    }

    fn raise(&self, message: impl Into<String>) -> Raise {
        Raise::new(ErrorClass::Syntax, message, self.line())
    }

    fn advance(&mut self) -> ParseResult<()> {
        loop {
            self.token = self.lexer.next_token()?;
            // Docblocks attach to nothing yet; skip them.
            if !matches!(self.token, Token::Docblock(_)) {
                return Ok(());
            }
        }
    }

    fn expect(&mut self, want: &Token) -> ParseResult<()> {
        if &self.token == want {
            self.advance()
        } else {
            Err(self.raise(format!(
                "Expected '{}', not '{}'.",
                want.name(),
                self.token.name()
            )))
        }
    }

    fn expect_word(&mut self) -> ParseResult<String> {
        match &self.token {
            Token::Word(w) => {
                let word = w.clone();
                self.advance()?;
                Ok(word)
            }
            other => Err(self.raise(format!("Expected a label, not '{}'.", other.name()))),
        }
    }

    fn at_word(&self, want: &str) -> bool {
        matches!(&self.token, Token::Word(w) if w == want)
    }

    fn at_keyword(&self, want: Keyword) -> bool {
        matches!(&self.token, Token::Word(w) if keyword_for(w) == Some(want))
    }

    /// Drives the whole compilation unit.
    pub fn parse(&mut self) -> ParseResult<()> {
        self.advance()?;
        loop {
            match &self.token {
                Token::EndOfFile => return Ok(()),
                Token::HtmlBlock(text) => {
                    let chunk = text.clone();
                    (self.html)(&chunk);
                    self.advance()?;
                }
                Token::EndTag => self.advance()?,
                _ => self.statement()?,
            }
        }
    }

    // -- statements --------------------------------------------------------

    fn statement(&mut self) -> ParseResult<()> {
        if let Token::Word(w) = &self.token {
            if let Some(keyword) = keyword_for(w) {
                return self.keyword_statement(keyword);
            }
            if w == "show" && self.symtab.find_var("show").is_none() {
                let line = self.line();
                self.advance()?;
                self.expression()?;
                return self.emit.emit_show(&mut self.pool, self.symtab, line);
            }
        }
        self.expression_statement()
    }

    fn expression_statement(&mut self) -> ParseResult<()> {
        self.expression()?;
        self.emit.eval_expression(&mut self.pool, self.symtab, None)?;
        Ok(())
    }

    fn keyword_statement(&mut self, keyword: Keyword) -> ParseResult<()> {
        match keyword {
            Keyword::Var => self.parse_var(Visibility::Public),
            Keyword::If => self.parse_if(),
            Keyword::While => self.parse_while(),
            Keyword::Do => self.parse_do(),
            Keyword::For => self.parse_for(),
            Keyword::Try => self.parse_try(),
            Keyword::Raise => {
                self.advance()?;
                self.expression()?;
                self.emit.emit_raise(&mut self.pool, self.symtab)
            }
            Keyword::Match => self.parse_match(),
            Keyword::Break => {
                self.advance()?;
                self.emit.emit_break()
            }
            Keyword::Continue => {
                self.advance()?;
                self.emit.emit_continue()
            }
            Keyword::Return => self.parse_return(),
            Keyword::Define => self.parse_define(None),
            Keyword::Class => self.parse_class(),
            Keyword::Enum => self.parse_enum(),
            Keyword::Import | Keyword::Use => self.parse_import(),
            Keyword::Private => self.parse_visibility(Visibility::Private),
            Keyword::Protected => self.parse_visibility(Visibility::Protected),
            // Value keywords start an expression statement.
            Keyword::True
            | Keyword::False
            | Keyword::SelfKw
            | Keyword::DunderLine
            | Keyword::DunderFile
            | Keyword::DunderFunction => self.expression_statement(),
            Keyword::Elif | Keyword::Else | Keyword::Except | Keyword::Case => Err(self.raise(
                format!("'{keyword}' is not valid outside of its block."),
            )),
        }
    }

    fn parse_var(&mut self, visibility: Visibility) -> ParseResult<()> {
        let line = self.line();
        self.advance()?;
        if let Token::PropWord(name) = self.token.clone() {
            self.advance()?;
            let declared = self.optional_type_annotation()?;
            self.expect(&Token::Equal)?;
            self.expression()?;
            return self.emit.emit_property_decl(
                &mut self.pool,
                self.symtab,
                &name,
                declared,
                visibility,
                line,
            );
        }
        if visibility != Visibility::Public {
            return Err(self.raise("Only class properties can be private or protected."));
        }
        let name = self.expect_word()?;
        if self.symtab.find_var(&name).is_some() {
            // Shadowing within one scope reads as a redeclaration.
            let existing = self.symtab.var(self.symtab.find_var(&name).expect("checked"));
            if existing.depth == self.emit.function_depth() {
                return Err(self.raise(format!("{name} has already been declared.")));
            }
        }
        let declared = self.optional_type_annotation()?;
        self.expect(&Token::Equal)?;
        self.expression()?;
        self.emit
            .emit_var_decl(&mut self.pool, self.symtab, &name, declared, line)
    }

    fn parse_visibility(&mut self, visibility: Visibility) -> ParseResult<()> {
        self.advance()?;
        if self.at_keyword(Keyword::Var) {
            self.parse_var(visibility)
        } else {
            Err(self.raise("Expected 'var' after the visibility modifier."))
        }
    }

    fn optional_type_annotation(&mut self) -> ParseResult<Option<SigId>> {
        if self.token == Token::Colon {
            self.advance()?;
            Ok(Some(self.parse_type()?))
        } else {
            Ok(None)
        }
    }

    /// A brace body or exactly one statement.
    fn block_body(&mut self) -> ParseResult<()> {
        if self.token == Token::LeftCurly {
            self.advance()?;
            while self.token != Token::RightCurly {
                if self.token == Token::EndOfFile {
                    return Err(self.raise("Unexpected end of input inside a block."));
                }
                self.statement()?;
            }
            self.advance()
        } else {
            self.statement()
        }
    }

    fn parse_if(&mut self) -> ParseResult<()> {
        self.advance()?;
        self.expression()?;
        self.emit.enter_if(&mut self.pool, self.symtab)?;
        self.expect(&Token::Colon)?;

        if self.token == Token::LeftCurly {
            self.advance()?;
            loop {
                if self.token == Token::RightCurly {
                    self.advance()?;
                    return self.emit.leave_block(self.symtab);
                }
                if self.at_keyword(Keyword::Elif) {
                    self.advance()?;
                    self.expression()?;
                    self.emit.enter_elif(&mut self.pool, self.symtab)?;
                    self.expect(&Token::Colon)?;
                } else if self.at_keyword(Keyword::Else) {
                    self.advance()?;
                    self.expect(&Token::Colon)?;
                    self.emit.enter_else(self.symtab)?;
                } else if self.token == Token::EndOfFile {
                    return Err(self.raise("Unexpected end of input inside an if block."));
                } else {
                    self.statement()?;
                }
            }
        }

        self.statement()?;
        loop {
            if self.at_keyword(Keyword::Elif) {
                self.advance()?;
                self.expression()?;
                self.emit.enter_elif(&mut self.pool, self.symtab)?;
                self.expect(&Token::Colon)?;
                self.statement()?;
            } else if self.at_keyword(Keyword::Else) {
                self.advance()?;
                self.expect(&Token::Colon)?;
                self.emit.enter_else(self.symtab)?;
                self.statement()?;
            } else {
                break;
            }
        }
        self.emit.leave_block(self.symtab)
    }

    fn parse_while(&mut self) -> ParseResult<()> {
        self.advance()?;
        self.expression()?;
        self.emit.enter_while(&mut self.pool, self.symtab)?;
        self.expect(&Token::Colon)?;
        self.block_body()?;
        self.emit.leave_block(self.symtab)
    }

    fn parse_do(&mut self) -> ParseResult<()> {
        self.advance()?;
        self.expect(&Token::Colon)?;
        self.emit.enter_do_while(self.symtab);
        self.block_body()?;
        if !self.at_keyword(Keyword::While) {
            return Err(self.raise("Expected 'while' after a do block."));
        }
        self.advance()?;
        self.expression()?;
        self.emit.finish_do_while(&mut self.pool, self.symtab)
    }

    fn parse_for(&mut self) -> ParseResult<()> {
        let line = self.line();
        self.advance()?;
        let name = self.expect_word()?;
        if !self.at_word("in") {
            return Err(self.raise("Expected 'in' after the for loop variable."));
        }
        self.advance()?;
        self.emit.enter_for_block(self.symtab);
        self.expression()?;
        let start = self.emit.eval_loop_part(&mut self.pool, self.symtab)?;
        self.expect(&Token::ThreeDots)?;
        self.expression()?;
        let end = self.emit.eval_loop_part(&mut self.pool, self.symtab)?;
        let step = if self.at_word("by") {
            self.advance()?;
            self.expression()?;
            Some(self.emit.eval_loop_part(&mut self.pool, self.symtab)?)
        } else {
            None
        };
        self.expect(&Token::Colon)?;
        self.emit
            .finish_for_header(self.symtab, &name, start, end, step, line)?;
        self.block_body()?;
        self.emit.leave_block(self.symtab)
    }

    fn parse_try(&mut self) -> ParseResult<()> {
        self.advance()?;
        self.emit.enter_try(self.symtab);
        self.expect(&Token::Colon)?;

        if self.token == Token::LeftCurly {
            self.advance()?;
            loop {
                if self.token == Token::RightCurly {
                    self.advance()?;
                    return self.emit.leave_block(self.symtab);
                }
                if self.at_keyword(Keyword::Except) {
                    self.parse_except_clause()?;
                } else if self.token == Token::EndOfFile {
                    return Err(self.raise("Unexpected end of input inside a try block."));
                } else {
                    self.statement()?;
                }
            }
        }

        self.statement()?;
        while self.at_keyword(Keyword::Except) {
            self.parse_except_clause()?;
            self.statement()?;
        }
        self.emit.leave_block(self.symtab)
    }

    fn parse_except_clause(&mut self) -> ParseResult<()> {
        let line = self.line();
        self.advance()?;
        let class_name = self.expect_word()?;
        let class = self
            .symtab
            .class_by_name(&class_name)
            .ok_or_else(|| self.raise(format!("{class_name} is not a declared class.")))?;
        let as_name = if self.at_word("as") {
            self.advance()?;
            Some(self.expect_word()?)
        } else {
            None
        };
        self.expect(&Token::Colon)?;
        self.emit
            .enter_except(self.symtab, class, as_name.as_deref(), line)
    }

    fn parse_match(&mut self) -> ParseResult<()> {
        let line = self.line();
        self.advance()?;
        self.expression()?;
        self.emit.enter_match(&mut self.pool, self.symtab, line)?;
        self.expect(&Token::Colon)?;
        self.expect(&Token::LeftCurly)?;
        let mut seen_case = false;
        loop {
            if self.token == Token::RightCurly {
                self.advance()?;
                return self.emit.leave_block(self.symtab);
            }
            if self.at_keyword(Keyword::Case) {
                let case_line = self.line();
                self.advance()?;
                let variant = self.expect_word()?;
                let mut binds = Vec::new();
                if self.token == Token::LeftParen {
                    self.advance()?;
                    while self.token != Token::RightParen {
                        binds.push(self.expect_word()?);
                        if self.token == Token::Comma {
                            self.advance()?;
                        }
                    }
                    self.advance()?;
                }
                self.expect(&Token::Colon)?;
                self.emit
                    .enter_match_case(self.symtab, &variant, &binds, case_line)?;
                seen_case = true;
            } else if self.token == Token::EndOfFile {
                return Err(self.raise("Unexpected end of input inside a match block."));
            } else {
                if !seen_case {
                    return Err(self.raise("match blocks must start with 'case'."));
                }
                self.statement()?;
            }
        }
    }

    fn parse_return(&mut self) -> ParseResult<()> {
        let line = self.line();
        self.advance()?;
        if self.token_starts_expression() {
            self.expression()?;
            self.emit
                .emit_return(&mut self.pool, self.symtab, true, line)
        } else {
            self.emit
                .emit_return(&mut self.pool, self.symtab, false, line)
        }
    }

    fn token_starts_expression(&self) -> bool {
        match &self.token {
            Token::Word(w) => match keyword_for(w) {
                None
                | Some(
                    Keyword::True
                    | Keyword::False
                    | Keyword::SelfKw
                    | Keyword::DunderLine
                    | Keyword::DunderFile
                    | Keyword::DunderFunction,
                ) => true,
                Some(_) => false,
            },
            Token::PropWord(_)
            | Token::IntegerLit(_)
            | Token::DoubleLit(_)
            | Token::StringLit(_)
            | Token::ByteStringLit(_)
            | Token::ByteLit(_)
            | Token::LeftParen
            | Token::LeftBracket
            | Token::TupleOpen
            | Token::Minus
            | Token::Not
            | Token::BitOr
            | Token::LogicalOr => true,
            _ => false,
        }
    }

    // -- methods, classes, enums -------------------------------------------

    fn parse_define(&mut self, self_class: Option<ClassId>) -> ParseResult<()> {
        let line = self.line();
        self.advance()?;
        let name = self.expect_word()?;

        // Template letters: define f[A, B](...).
        let mut template_frame = Vec::new();
        if self.token == Token::LeftBracket {
            self.advance()?;
            while self.token != Token::RightBracket {
                let word = self.expect_word()?;
                let mut chars = word.chars();
                let letter = chars.next().filter(|c| c.is_ascii_uppercase());
                if letter.is_none() || chars.next().is_some() {
                    return Err(self.raise("Template parameters are single letters (A..Z)."));
                }
                template_frame.push(letter.expect("checked above"));
                if self.token == Token::Comma {
                    self.advance()?;
                }
            }
            self.advance()?;
        }
        self.templates.push(template_frame);

        let mut params: Vec<(String, SigId)> = Vec::new();
        if let Some(class) = self_class {
            let self_sig = self.symtab.sig_for_class(class);
            params.push(("self".to_string(), self_sig));
        }
        let mut is_varargs = false;
        if self.token == Token::LeftParen {
            self.advance()?;
            while self.token != Token::RightParen {
                if is_varargs {
                    return Err(self.raise("The vararg parameter must be last."));
                }
                let param_name = self.expect_word()?;
                self.expect(&Token::Colon)?;
                let sig = self.parse_type()?;
                if self.token == Token::ThreeDots {
                    let class = self.symtab.sigs.get(sig).class;
                    if class != CLS_LIST {
                        return Err(self.raise("Vararg parameters must be List types."));
                    }
                    is_varargs = true;
                    self.advance()?;
                }
                params.push((param_name, sig));
                if self.token == Token::Comma {
                    self.advance()?;
                }
            }
            self.advance()?;
        }
        let ret = self.optional_type_annotation()?;

        let trace_name = match self_class {
            Some(class) => format!("{}.{}", self.symtab.class(class).name, name),
            None => name.clone(),
        };
        self.emit.enter_define(
            self.symtab,
            BlockKind::Define,
            &name,
            trace_name,
            &params,
            ret,
            is_varargs,
            self_class,
            line,
        )?;

        self.expect(&Token::LeftCurly)?;
        while self.token != Token::RightCurly {
            if self.token == Token::EndOfFile {
                return Err(self.raise("Unexpected end of input inside a method body."));
            }
            self.statement()?;
        }
        self.advance()?;
        self.emit.leave_block(self.symtab)?;
        self.templates.pop();
        Ok(())
    }

    fn parse_class(&mut self) -> ParseResult<()> {
        let line = self.line();
        self.advance()?;
        let name = self.expect_word()?;
        self.templates.push(Vec::new());

        let mut params: Vec<(String, SigId)> = Vec::new();
        if self.token == Token::LeftParen {
            self.advance()?;
            while self.token != Token::RightParen {
                let param_name = self.expect_word()?;
                self.expect(&Token::Colon)?;
                let sig = self.parse_type()?;
                params.push((param_name, sig));
                if self.token == Token::Comma {
                    self.advance()?;
                }
            }
            self.advance()?;
        }

        let parent = if self.token == Token::Lt {
            self.advance()?;
            let parent_name = self.expect_word()?;
            let parent = self
                .symtab
                .class_by_name(&parent_name)
                .ok_or_else(|| self.raise(format!("{parent_name} is not a declared class.")))?;
            Some(parent)
        } else {
            None
        };

        let class_id = self
            .emit
            .enter_class(self.symtab, &name, &params, parent, line)?;

        // Parent constructor arguments evaluate inside the initializer,
        // so they can use the child's parameters.
        if let Some(parent) = parent {
            let mut args = Vec::new();
            if self.token == Token::LeftParen {
                self.advance()?;
                while self.token != Token::RightParen {
                    self.expression()?;
                    args.push(self.emit.eval_anchored(&mut self.pool, self.symtab)?);
                    if self.token == Token::Comma {
                        self.advance()?;
                    }
                }
                self.advance()?;
            }
            self.emit.emit_init_chain(self.symtab, parent, &args, line)?;
        }

        self.expect(&Token::LeftCurly)?;
        loop {
            if self.token == Token::RightCurly {
                self.advance()?;
                self.emit.leave_class(self.symtab, class_id)?;
                self.templates.pop();
                return Ok(());
            }
            if self.token == Token::EndOfFile {
                return Err(self.raise("Unexpected end of input inside a class body."));
            }
            if self.at_keyword(Keyword::Define) {
                self.parse_define(Some(class_id))?;
            } else {
                self.statement()?;
            }
        }
    }

    fn parse_enum(&mut self) -> ParseResult<()> {
        self.advance()?;
        let name = self.expect_word()?;
        if self.symtab.class_by_name(&name).is_some() {
            return Err(self.raise(format!("Class {name} is already declared.")));
        }
        let class_id = self.symtab.new_class(&name, ClassKind::Enum, None);
        self.expect(&Token::LeftCurly)?;

        loop {
            match &self.token {
                Token::RightCurly => {
                    self.advance()?;
                    break;
                }
                Token::Comma => self.advance()?,
                Token::Word(w) if keyword_for(w) == Some(Keyword::Define) => {
                    self.parse_define(Some(class_id))?;
                }
                Token::Word(_) => {
                    let variant_name = self.expect_word()?;
                    if self.symtab.find_member(class_id, &variant_name).is_some() {
                        return Err(self.raise(format!(
                            "Enum {name} already has a member named {variant_name}."
                        )));
                    }
                    let mut arg_sigs = Vec::new();
                    if self.token == Token::LeftParen {
                        self.advance()?;
                        while self.token != Token::RightParen {
                            arg_sigs.push(self.parse_type()?);
                            if self.token == Token::Comma {
                                self.advance()?;
                            }
                        }
                        self.advance()?;
                    }
                    let class = self.symtab.class_mut(class_id);
                    let index = u16::try_from(class.variants.len())
                        .expect("variant count exceeds u16");
                    class.variants.push(VariantDef {
                        name: variant_name.clone().into(),
                        arg_sigs,
                    });
                    class
                        .members
                        .insert(variant_name, ClassMember::Variant(index));
                }
                other => {
                    return Err(self.raise(format!(
                        "Expected a variant or 'define', not '{}'.",
                        other.name()
                    )));
                }
            }
        }

        if self.symtab.class(class_id).variants.is_empty() {
            return Err(self.raise(format!("Enum {name} needs at least one variant.")));
        }
        Ok(())
    }

    fn parse_import(&mut self) -> ParseResult<()> {
        let line = self.line();
        self.advance()?;
        let name = self.expect_word()?;
        if self.symtab.find_package(&name).is_none() {
            return Err(Raise::new(
                ErrorClass::Import,
                format!("Cannot import '{name}': package not registered."),
                line,
            ));
        }
        Ok(())
    }

    // -- types -------------------------------------------------------------

    fn template_position(&self, word: &str) -> Option<u16> {
        let mut chars = word.chars();
        let letter = chars.next()?;
        if chars.next().is_some() || !letter.is_ascii_uppercase() {
            return None;
        }
        let frame = self.templates.last()?;
        frame
            .iter()
            .any(|&c| c == letter)
            .then(|| u16::from(letter as u8 - b'A'))
    }

    fn parse_type(&mut self) -> ParseResult<SigId> {
        let name = self.expect_word()?;
        if let Some(position) = self.template_position(&name) {
            return Ok(self.symtab.template_sig(position));
        }
        let class = self
            .symtab
            .class_by_name(&name)
            .ok_or_else(|| self.raise(format!("{name} is not a declared type.")))?;
        match class {
            CLS_LIST => {
                self.expect(&Token::LeftBracket)?;
                let elem = self.parse_type()?;
                self.expect(&Token::RightBracket)?;
                Ok(self.symtab.list_sig(elem))
            }
            CLS_HASH => {
                self.expect(&Token::LeftBracket)?;
                let key = self.parse_type()?;
                self.expect(&Token::Comma)?;
                let value = self.parse_type()?;
                self.expect(&Token::RightBracket)?;
                Ok(self.symtab.hash_sig(key, value))
            }
            CLS_TUPLE => {
                self.expect(&Token::LeftBracket)?;
                let mut members = Vec::new();
                while self.token != Token::RightBracket {
                    members.push(self.parse_type()?);
                    if self.token == Token::Comma {
                        self.advance()?;
                    }
                }
                self.advance()?;
                Ok(self.symtab.ensure_unique_sig(CLS_TUPLE, &members, 0))
            }
            CLS_FUNCTION => {
                self.expect(&Token::LeftParen)?;
                let mut params = Vec::new();
                let mut varargs = false;
                let unit = self.symtab.sig_for_class(crate::symtab::CLS_UNIT);
                let mut ret = unit;
                while self.token != Token::RightParen {
                    if self.token == Token::Arrow {
                        self.advance()?;
                        ret = self.parse_type()?;
                        break;
                    }
                    params.push(self.parse_type()?);
                    if self.token == Token::ThreeDots {
                        varargs = true;
                        self.advance()?;
                    }
                    if self.token == Token::Comma {
                        self.advance()?;
                    }
                }
                self.expect(&Token::RightParen)?;
                Ok(self.symtab.function_sig(ret, &params, varargs))
            }
            other => Ok(self.symtab.sig_for_class(other)),
        }
    }

    // -- expressions -------------------------------------------------------

    /// Builds one full expression into the pool.
    fn expression(&mut self) -> ParseResult<()> {
        self.expression_value()?;
        self.expression_ops()
    }

    fn binary_op_for(token: &Token) -> Option<ExprOp> {
        let op = match token {
            Token::Plus => ExprOp::Plus,
            Token::Minus => ExprOp::Minus,
            Token::Multiply => ExprOp::Multiply,
            Token::Divide => ExprOp::Divide,
            Token::Percent => ExprOp::Modulo,
            Token::LeftShift => ExprOp::LeftShift,
            Token::RightShift => ExprOp::RightShift,
            Token::BitAnd => ExprOp::BitAnd,
            Token::BitOr => ExprOp::BitOr,
            Token::Caret => ExprOp::BitXor,
            Token::EqEq => ExprOp::EqEq,
            Token::NotEq => ExprOp::NotEq,
            Token::Lt => ExprOp::Lt,
            Token::LtEq => ExprOp::LtEq,
            Token::Gt => ExprOp::Gt,
            Token::GtEq => ExprOp::GtEq,
            Token::LogicalAnd => ExprOp::LogicalAnd,
            Token::LogicalOr => ExprOp::LogicalOr,
            Token::Equal => ExprOp::Assign,
            Token::PlusEq => ExprOp::PlusAssign,
            Token::MinusEq => ExprOp::MinusAssign,
            Token::MultiplyEq => ExprOp::MulAssign,
            Token::DivideEq => ExprOp::DivAssign,
            Token::PercentEq => ExprOp::ModAssign,
            Token::LeftShiftEq => ExprOp::LeftShiftAssign,
            Token::RightShiftEq => ExprOp::RightShiftAssign,
            Token::BitAndEq => ExprOp::AndAssign,
            Token::BitOrEq => ExprOp::OrAssign,
            Token::CaretEq => ExprOp::XorAssign,
            _ => return None,
        };
        Some(op)
    }

    fn expression_ops(&mut self) -> ParseResult<()> {
        loop {
            let line = self.line();

            // `||` after a value is always the or operator; in value
            // position it opens a lambda instead.
            if let Some(op) = Self::binary_op_for(&self.token) {
                self.pool.push_binary_op(op, line);
                self.advance()?;
                self.expression_value()?;
                continue;
            }

            match &self.token {
                Token::Dot => {
                    self.advance()?;
                    if self.token == Token::TypecastParen {
                        self.advance()?;
                        let sig = self.parse_type()?;
                        self.expect(&Token::RightParen)?;
                        self.pool.enter_typecast(sig, line);
                        self.pool.leave_tree();
                    } else {
                        let member = self.expect_word()?;
                        self.pool
                            .push_suffix(TreeKind::OoAccess { name: member }, line);
                    }
                }
                Token::LeftParen => {
                    self.pool.enter_tree(TreeKind::Call, line);
                    self.advance()?;
                    if self.token == Token::RightParen {
                        self.pool.leave_tree();
                        self.advance()?;
                    } else {
                        self.expression_value()?;
                    }
                }
                Token::LeftBracket => {
                    self.pool.enter_tree(TreeKind::Subscript, line);
                    self.advance()?;
                    self.expression_value()?;
                }
                Token::Comma => {
                    if self.pool.save_depth() == 0 {
                        return Ok(());
                    }
                    match self.pool.caller_tree_kind().clone() {
                        TreeKind::Call
                        | TreeKind::ListTree
                        | TreeKind::HashTree
                        | TreeKind::TupleTree => {
                            self.pool.collect_arg();
                            self.advance()?;
                            self.expression_value()?;
                        }
                        _ => return Err(self.raise("Unexpected ','.")),
                    }
                }
                Token::Arrow => {
                    if self.pool.save_depth() == 0 {
                        return Ok(());
                    }
                    match self.pool.caller_tree_kind().clone() {
                        TreeKind::ListTree | TreeKind::HashTree => {
                            self.pool.morph_entered_to_hash();
                            self.pool.collect_arg();
                            self.advance()?;
                            self.expression_value()?;
                        }
                        _ => return Err(self.raise("Unexpected '=>'.")),
                    }
                }
                Token::RightParen => {
                    if self.pool.save_depth() == 0 {
                        return Ok(());
                    }
                    match self.pool.caller_tree_kind().clone() {
                        TreeKind::Call | TreeKind::Parenth => {
                            self.pool.leave_tree();
                            self.advance()?;
                        }
                        other => {
                            return Err(self.raise(format!("')' does not close {other:?}.")));
                        }
                    }
                }
                Token::RightBracket => {
                    if self.pool.save_depth() == 0 {
                        return Ok(());
                    }
                    match self.pool.caller_tree_kind().clone() {
                        TreeKind::Subscript | TreeKind::ListTree | TreeKind::HashTree => {
                            self.pool.leave_tree();
                            self.advance()?;
                        }
                        other => {
                            return Err(self.raise(format!("']' does not close {other:?}.")));
                        }
                    }
                }
                Token::TupleClose => {
                    if self.pool.save_depth() == 0 {
                        return Ok(());
                    }
                    match self.pool.caller_tree_kind().clone() {
                        TreeKind::TupleTree => {
                            self.pool.leave_tree();
                            self.advance()?;
                        }
                        other => {
                            return Err(self.raise(format!("']>' does not close {other:?}.")));
                        }
                    }
                }
                _ => {
                    if self.pool.save_depth() != 0 {
                        return Err(self.raise(format!(
                            "Expected a value or closing token, not '{}'.",
                            self.token.name()
                        )));
                    }
                    return Ok(());
                }
            }
        }
    }

    fn expression_value(&mut self) -> ParseResult<()> {
        // Unary prefixes are right-associative and stack.
        loop {
            let line = self.line();
            match self.token {
                Token::Minus => {
                    self.pool.push_unary_op(ExprOp::UnaryMinus, line);
                    self.advance()?;
                }
                Token::Not => {
                    self.pool.push_unary_op(ExprOp::UnaryNot, line);
                    self.advance()?;
                }
                _ => break,
            }
        }

        let line = self.line();
        match self.token.clone() {
            Token::IntegerLit(value) => {
                let literal = self.symtab.new_literal(LitValue::Integer(value));
                self.pool.push_value(TreeKind::Readonly { literal }, line);
                self.advance()
            }
            Token::DoubleLit(value) => {
                let literal = self.symtab.new_literal(LitValue::Double(value));
                self.pool.push_value(TreeKind::Readonly { literal }, line);
                self.advance()
            }
            Token::StringLit(value) => {
                let literal = self.symtab.new_literal(LitValue::Str(value.into()));
                self.pool.push_value(TreeKind::Readonly { literal }, line);
                self.advance()
            }
            Token::ByteStringLit(value) => {
                let literal = self.symtab.new_literal(LitValue::Bytes(value.into()));
                self.pool.push_value(TreeKind::Readonly { literal }, line);
                self.advance()
            }
            Token::ByteLit(value) => {
                let literal = self.symtab.new_literal(LitValue::Byte(value));
                self.pool.push_value(TreeKind::Readonly { literal }, line);
                self.advance()
            }
            Token::Word(word) => self.value_word(&word),
            Token::PropWord(name) => {
                self.push_var_value("self")?;
                self.pool.push_suffix(TreeKind::OoAccess { name }, line);
                self.advance()
            }
            Token::LeftParen => {
                self.pool.enter_tree(TreeKind::Parenth, line);
                self.advance()?;
                if matches!(self.token, Token::BitOr | Token::LogicalOr) {
                    self.parse_lambda()
                } else {
                    self.expression_value()
                }
            }
            Token::LeftBracket => {
                self.pool.enter_tree(TreeKind::ListTree, line);
                self.advance()?;
                if self.token == Token::RightBracket {
                    self.pool.leave_tree();
                    self.advance()
                } else {
                    self.expression_value()
                }
            }
            Token::TupleOpen => {
                self.pool.enter_tree(TreeKind::TupleTree, line);
                self.advance()?;
                self.expression_value()
            }
            Token::BitOr | Token::LogicalOr => self.parse_lambda(),
            other => Err(self.raise(format!("Expected a value, not '{}'.", other.name()))),
        }
    }

    fn push_var_value(&mut self, name: &str) -> ParseResult<()> {
        let line = self.line();
        let var_id = self
            .symtab
            .find_var(name)
            .ok_or_else(|| self.raise(format!("{name} has not been declared.")))?;
        let var = self.symtab.var(var_id);
        let kind = match var.kind {
            VarKind::Readonly(func) => TreeKind::DefinedFunc { func },
            VarKind::Local(_) | VarKind::Global(_) => {
                let depth = var.depth;
                let current = self.emit.function_depth();
                if depth == current {
                    TreeKind::LocalVar { var: var_id }
                } else if depth == 1 {
                    TreeKind::GlobalVar { var: var_id }
                } else {
                    TreeKind::Upvalue { var: var_id }
                }
            }
        };
        self.pool.push_value(kind, line);
        Ok(())
    }

    fn value_word(&mut self, word: &str) -> ParseResult<()> {
        let line = self.line();
        if let Some(keyword) = keyword_for(word) {
            match keyword {
                Keyword::True | Keyword::False => {
                    let literal = self
                        .symtab
                        .new_literal(LitValue::Boolean(keyword == Keyword::True));
                    self.pool.push_value(TreeKind::Readonly { literal }, line);
                    return self.advance();
                }
                Keyword::SelfKw => {
                    self.push_var_value("self")?;
                    return self.advance();
                }
                Keyword::DunderLine => {
                    let literal = self
                        .symtab
                        .new_literal(LitValue::Integer(i64::from(line)));
                    self.pool.push_value(TreeKind::Readonly { literal }, line);
                    return self.advance();
                }
                Keyword::DunderFile => {
                    let literal = self
                        .symtab
                        .new_literal(LitValue::Str(self.file_label.clone().into()));
                    self.pool.push_value(TreeKind::Readonly { literal }, line);
                    return self.advance();
                }
                Keyword::DunderFunction => {
                    let name = self.emit.current_function_name(self.symtab);
                    let literal = self.symtab.new_literal(LitValue::Str(name.into()));
                    self.pool.push_value(TreeKind::Readonly { literal }, line);
                    return self.advance();
                }
                other => {
                    return Err(self.raise(format!("Expected a value, not '{other}'.")));
                }
            }
        }

        if self.symtab.find_var(word).is_some() {
            self.push_var_value(word)?;
            return self.advance();
        }

        if let Some(class_id) = self.symtab.class_by_name(word) {
            let kind = self.symtab.class(class_id).kind;
            if kind == ClassKind::Enum {
                // Enum names qualify variants: Color.Red.
                self.advance()?;
                self.expect(&Token::Dot)?;
                let variant_name = self.expect_word()?;
                let Some(ClassMember::Variant(variant)) =
                    self.symtab.find_member(class_id, &variant_name)
                else {
                    return Err(self.raise(format!(
                        "{variant_name} is not a variant of enum {word}."
                    )));
                };
                self.pool.push_value(
                    TreeKind::VariantCtor {
                        class: class_id,
                        variant,
                    },
                    line,
                );
                return Ok(());
            }
            if let Some(ctor) = self.symtab.class(class_id).ctor {
                self.pool.push_value(TreeKind::DefinedFunc { func: ctor }, line);
                return self.advance();
            }
            return Err(self.raise(format!("Class {word} cannot be used as a value.")));
        }

        if let Some((class, variant)) = self.symtab.find_variant_global(word) {
            self.pool
                .push_value(TreeKind::VariantCtor { class, variant }, line);
            return self.advance();
        }

        if let Some(package) = self.symtab.find_package(word) {
            self.pool.push_value(TreeKind::PackageRef { package }, line);
            return self.advance();
        }

        Err(self.raise(format!("{word} has not been declared.")))
    }

    /// A lambda: `(|x: Integer| x + 1)` or `(||{ ... })`. The pool state
    /// freezes so the body compiles with a fresh expression, and thaws
    /// with the finished method pushed as a value.
    fn parse_lambda(&mut self) -> ParseResult<()> {
        let line = self.line();
        let mut params: Vec<(String, SigId)> = Vec::new();
        match self.token {
            Token::LogicalOr => self.advance()?,
            Token::BitOr => {
                self.advance()?;
                while self.token != Token::BitOr {
                    let name = self.expect_word()?;
                    self.expect(&Token::Colon)?;
                    let sig = self.parse_type()?;
                    params.push((name, sig));
                    if self.token == Token::Comma {
                        self.advance()?;
                    }
                }
                self.advance()?;
            }
            _ => unreachable!("parse_lambda entered without a pipe token"),
        }

        self.pool.freeze();
        self.templates.push(Vec::new());
        let func = self.emit.enter_define(
            self.symtab,
            BlockKind::Lambda,
            "(lambda)",
            "(lambda)".to_string(),
            &params,
            None,
            false,
            None,
            line,
        )?;

        if self.token == Token::LeftCurly {
            self.advance()?;
            while self.token != Token::RightCurly {
                if self.token == Token::EndOfFile {
                    return Err(self.raise("Unexpected end of input inside a lambda."));
                }
                self.statement()?;
            }
            self.advance()?;
        } else {
            self.expression()?;
            self.emit
                .emit_lambda_value_return(&mut self.pool, self.symtab, line)?;
        }

        self.emit.leave_block(self.symtab)?;
        self.templates.pop();
        self.pool.thaw();
        self.pool.push_value(TreeKind::Lambda { func }, line);
        Ok(())
    }
}
