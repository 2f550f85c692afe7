use std::sync::Arc;

use ordered_float::OrderedFloat;

use crate::ast::{
    BinOp, Block, Expr, InterpPart, MacroDef, Node, Path, Reference, Segment, Span, UnOp,
};
use crate::error::{TemplateError, TemplateResult};
use crate::value::Value;

/// The closed set of directive names. Anything else after `#` is either a
/// macro call (when followed by an argument list) or plain text.
const DIRECTIVES: &[&str] = &[
    "if", "elseif", "else", "end", "foreach", "set", "macro", "include", "parse", "stop", "define",
    "evaluate", "noescape",
];

pub(crate) fn parse(input: &str, name: &str) -> TemplateResult<Block> {
    let mut parser = Parser::new(input, name);
    let (block, term) = parser.parse_block(BlockCtx::top())?;
    debug_assert!(matches!(term, Term::Eof));
    Ok(block)
}

/// How a block parse stopped.
enum Term {
    Eof,
    End,
    Else,
    Elseif { leading: bool },
}

/// What the enclosing construct allows a block to be terminated by.
#[derive(Clone, Copy)]
struct BlockCtx {
    /// The construct awaiting `#end`, with its opening position; `None` at
    /// the top level, where any terminator is stray.
    opener: Option<(&'static str, Span)>,
    /// Whether `#elseif`/`#else` close this block (an `#if` branch before
    /// its `#else`).
    allow_if_terms: bool,
}

impl BlockCtx {
    fn top() -> Self {
        Self {
            opener: None,
            allow_if_terms: false,
        }
    }

    fn body(keyword: &'static str, span: Span) -> Self {
        Self {
            opener: Some((keyword, span)),
            allow_if_terms: false,
        }
    }

    fn if_branch(span: Span) -> Self {
        Self {
            opener: Some(("#if", span)),
            allow_if_terms: true,
        }
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
    name: &'a str,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str, name: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            name,
        }
    }

    // ------------------------------------------------------------------
    // Cursor primitives
    // ------------------------------------------------------------------

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        self.input[self.pos..].chars().nth(1)
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += ch.len_utf8();
        Some(ch)
    }

    fn eat(&mut self, ch: char) -> bool {
        if self.peek() == Some(ch) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn lookahead(&self, prefix: &str) -> bool {
        self.input[self.pos..].starts_with(prefix)
    }

    fn eat_str(&mut self, prefix: &str) -> bool {
        if self.lookahead(prefix) {
            self.pos += prefix.len();
            true
        } else {
            false
        }
    }

    /// Consumes a word operator only when it is not a prefix of a longer
    /// identifier (`or` in `$a or $b`, but not in `orange`).
    fn eat_word(&mut self, word: &str) -> bool {
        if self.lookahead(word) {
            let follows = self.input[self.pos + word.len()..].chars().next();
            if !follows.is_some_and(is_ident_part) {
                self.pos += word.len();
                return true;
            }
        }
        false
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t' | '\r' | '\n')) {
            self.bump();
        }
    }

    fn skip_inline_ws(&mut self) {
        while matches!(self.peek(), Some(' ' | '\t')) {
            self.bump();
        }
    }

    fn line_col(&self, pos: usize) -> (u32, u32) {
        let before = &self.input[..pos];
        let line = before.matches('\n').count() as u32 + 1;
        let column = before.chars().rev().take_while(|&c| c != '\n').count() as u32 + 1;
        (line, column)
    }

    fn span_at(&self, pos: usize) -> Span {
        let (line, column) = self.line_col(pos);
        Span { line, column }
    }

    fn error_at(&self, pos: usize, expected: impl Into<String>) -> TemplateError {
        let (line, column) = self.line_col(pos);
        TemplateError::Syntax {
            name: self.name.to_string(),
            line,
            column,
            expected: expected.into(),
        }
    }

    fn error(&self, expected: impl Into<String>) -> TemplateError {
        self.error_at(self.pos, expected)
    }

    fn unterminated(&self, keyword: &'static str, opened: Span) -> TemplateError {
        self.error(format!(
            "#end closing {} opened at {}:{}",
            keyword, opened.line, opened.column
        ))
    }

    fn expect_char(&mut self, ch: char) -> TemplateResult<()> {
        if self.eat(ch) {
            Ok(())
        } else {
            Err(self.error(format!("'{}'", ch)))
        }
    }

    /// Directive headers allow horizontal whitespace before the paren:
    /// `#if ($x)`.
    fn expect_open_paren(&mut self) -> TemplateResult<()> {
        self.skip_inline_ws();
        self.expect_char('(')
    }

    // ------------------------------------------------------------------
    // Whitespace gobbling
    // ------------------------------------------------------------------

    /// True when nothing but horizontal whitespace precedes `pos` on its
    /// line. A leading BOM counts as whitespace.
    fn line_leading(&self, pos: usize) -> bool {
        let line_start = self.input[..pos].rfind('\n').map(|i| i + 1).unwrap_or(0);
        self.input[line_start..pos]
            .chars()
            .all(|c| matches!(c, ' ' | '\t' | '\u{feff}'))
    }

    /// Standalone-directive-line rule: when the directive started its line
    /// and nothing but horizontal whitespace follows it, consume through the
    /// trailing newline. Returns whether the line was standalone, so the
    /// caller can drop the directive's indentation from the pending text.
    fn maybe_gobble(&mut self, leading: bool) -> bool {
        if !leading {
            return false;
        }
        let save = self.pos;
        self.skip_inline_ws();
        match self.peek() {
            None => true,
            Some('\n') => {
                self.bump();
                true
            }
            Some('\r') if self.peek_second() == Some('\n') => {
                self.bump();
                self.bump();
                true
            }
            _ => {
                self.pos = save;
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Template body
    // ------------------------------------------------------------------

    fn parse_block(&mut self, ctx: BlockCtx) -> TemplateResult<(Block, Term)> {
        let mut block = Block::default();
        let mut buf = String::new();
        loop {
            match self.peek() {
                None => {
                    flush(&mut block, &mut buf);
                    if let Some((keyword, span)) = ctx.opener {
                        return Err(self.unterminated(keyword, span));
                    }
                    return Ok((block, Term::Eof));
                }
                Some('$') => {
                    let start = self.pos;
                    match self.try_parse_reference()? {
                        Some(reference) => {
                            flush(&mut block, &mut buf);
                            block.nodes.push(Node::Reference(reference));
                        }
                        None => {
                            self.pos = start;
                            self.bump();
                            buf.push('$');
                        }
                    }
                }
                Some('#') => {
                    if let Some(term) = self.handle_hash(&mut block, &mut buf, ctx)? {
                        return Ok((block, term));
                    }
                }
                Some('\\') => self.scan_backslashes(&mut buf),
                Some(ch) => {
                    self.bump();
                    buf.push(ch);
                }
            }
        }
    }

    /// A run of k backslashes before `$`/`#` collapses to k/2; an odd run
    /// escapes the sigil itself. Backslashes anywhere else are plain text.
    fn scan_backslashes(&mut self, buf: &mut String) {
        let mut count = 0usize;
        while self.peek() == Some('\\') {
            self.bump();
            count += 1;
        }
        match self.peek() {
            Some('$') | Some('#') => {
                for _ in 0..count / 2 {
                    buf.push('\\');
                }
                if count % 2 == 1 {
                    if let Some(sigil) = self.bump() {
                        buf.push(sigil);
                    }
                }
            }
            _ => {
                for _ in 0..count {
                    buf.push('\\');
                }
            }
        }
    }

    /// Everything starting with `#`: comments, directives, terminators,
    /// macro calls, or just a literal hash. Returns `Some(term)` when the
    /// enclosing block ends here.
    fn handle_hash(
        &mut self,
        block: &mut Block,
        buf: &mut String,
        ctx: BlockCtx,
    ) -> TemplateResult<Option<Term>> {
        let start = self.pos;
        let leading = self.line_leading(start);

        if self.lookahead("##") {
            // Line comments swallow their newline.
            while let Some(ch) = self.bump() {
                if ch == '\n' {
                    break;
                }
            }
            return Ok(None);
        }
        if self.lookahead("#*") {
            match self.input[self.pos + 2..].find("*#") {
                Some(idx) => {
                    self.pos += 2 + idx + 2;
                    if self.maybe_gobble(leading) {
                        trim_indent(buf);
                    }
                    return Ok(None);
                }
                None => {
                    // No closing marker: the hash is literal text.
                    self.bump();
                    buf.push('#');
                    return Ok(None);
                }
            }
        }

        let input = self.input;
        let braced = input[self.pos + 1..].starts_with('{');
        let word_start = self.pos + 1 + usize::from(braced);
        let word_end = word_start
            + input[word_start..]
                .find(|c: char| !is_ident_part(c))
                .unwrap_or(input.len() - word_start);
        let word = &input[word_start..word_end];

        let directive =
            DIRECTIVES.contains(&word) && (!braced || input[word_end..].starts_with('}'));
        if directive {
            self.pos = word_end + usize::from(braced);
            let span = self.span_at(start);
            match word {
                "end" => {
                    if ctx.opener.is_none() {
                        return Err(self.error_at(start, "an open block directive before #end"));
                    }
                    if self.maybe_gobble(leading) {
                        trim_indent(buf);
                    }
                    flush(block, buf);
                    return Ok(Some(Term::End));
                }
                "else" => {
                    if !ctx.allow_if_terms {
                        return Err(self.error_at(start, "an enclosing #if for #else"));
                    }
                    if self.maybe_gobble(leading) {
                        trim_indent(buf);
                    }
                    flush(block, buf);
                    return Ok(Some(Term::Else));
                }
                "elseif" => {
                    if !ctx.allow_if_terms {
                        return Err(self.error_at(start, "an enclosing #if for #elseif"));
                    }
                    flush(block, buf);
                    return Ok(Some(Term::Elseif { leading }));
                }
                _ => {}
            }
            let (node, trim) = match word {
                "if" => self.parse_if(leading, span)?,
                "foreach" => self.parse_foreach(leading, span)?,
                "set" => self.parse_set(leading, span)?,
                "macro" => self.parse_macro(leading, span)?,
                "define" => self.parse_define(leading, span)?,
                "include" => self.parse_include(leading, span)?,
                "parse" => self.parse_parse(leading, span)?,
                "evaluate" => self.parse_evaluate(leading, span)?,
                "noescape" => self.parse_noescape(leading, span)?,
                "stop" => (Node::Stop, self.maybe_gobble(leading)),
                _ => unreachable!("directive set is closed"),
            };
            if trim {
                trim_indent(buf);
            }
            flush(block, buf);
            block.nodes.push(node);
            return Ok(None);
        }

        // A `#name(` sequence is a macro call; any failure inside rewinds to
        // a literal hash, so hex colour codes and anchor hrefs survive.
        // Names are matched case-insensitively, so a miscased directive word
        // stays literal rather than becoming a call.
        let callable = !word.is_empty()
            && word.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            && !braced
            && !DIRECTIVES.contains(&word.to_ascii_lowercase().as_str());
        if callable {
            let save = self.pos;
            self.pos = word_end;
            self.skip_inline_ws();
            if self.peek() == Some('(') {
                let span = self.span_at(start);
                match self.parse_macro_call_args() {
                    Ok(args) => {
                        let node = Node::MacroCall {
                            name: word.to_ascii_lowercase(),
                            args,
                            span,
                        };
                        let trim = self.maybe_gobble(leading);
                        if trim {
                            trim_indent(buf);
                        }
                        flush(block, buf);
                        block.nodes.push(node);
                        return Ok(None);
                    }
                    Err(_) => self.pos = save,
                }
            } else {
                self.pos = save;
            }
        }

        self.bump();
        buf.push('#');
        Ok(None)
    }

    // ------------------------------------------------------------------
    // Directives
    // ------------------------------------------------------------------

    fn parse_if(&mut self, leading: bool, span: Span) -> TemplateResult<(Node, bool)> {
        self.expect_open_paren()?;
        self.skip_ws();
        let condition = self.parse_expr()?;
        self.skip_ws();
        self.expect_char(')')?;
        let header_trim = self.maybe_gobble(leading);

        let mut branches = Vec::new();
        let (body, mut term) = self.parse_block(BlockCtx::if_branch(span))?;
        branches.push((condition, body));

        loop {
            match term {
                Term::End => return Ok((finish_if(branches, None), header_trim)),
                Term::Else => {
                    let (else_body, _) = self.parse_block(BlockCtx::body("#if", span))?;
                    return Ok((finish_if(branches, Some(else_body)), header_trim));
                }
                Term::Elseif { leading: el_leading } => {
                    self.expect_open_paren()?;
                    self.skip_ws();
                    let condition = self.parse_expr()?;
                    self.skip_ws();
                    self.expect_char(')')?;
                    if self.maybe_gobble(el_leading) {
                        if let Some((_, prev)) = branches.last_mut() {
                            prev.trim_trailing_indent();
                        }
                    }
                    let (body, next) = self.parse_block(BlockCtx::if_branch(span))?;
                    branches.push((condition, body));
                    term = next;
                }
                Term::Eof => unreachable!("EOF inside a block reports unterminated"),
            }
        }
    }

    fn parse_foreach(&mut self, leading: bool, span: Span) -> TemplateResult<(Node, bool)> {
        self.expect_open_paren()?;
        self.skip_ws();
        self.expect_char('$')?;
        let var = self.parse_ident()?;
        self.skip_ws();
        if !self.eat_word("in") {
            return Err(self.error("'in'"));
        }
        self.skip_ws();
        let iterable = self.parse_expr()?;
        self.skip_ws();
        self.expect_char(')')?;
        let trim = self.maybe_gobble(leading);
        let (body, _) = self.parse_block(BlockCtx::body("#foreach", span))?;
        Ok((
            Node::Foreach {
                var,
                iterable,
                body,
                span,
            },
            trim,
        ))
    }

    fn parse_set(&mut self, leading: bool, span: Span) -> TemplateResult<(Node, bool)> {
        self.expect_open_paren()?;
        self.skip_ws();
        self.expect_char('$')?;
        let target = self.parse_path()?;
        self.skip_ws();
        self.expect_char('=')?;
        self.skip_ws();
        let value = self.parse_expr()?;
        self.skip_ws();
        self.expect_char(')')?;
        Ok((
            Node::Set {
                target,
                value,
                span,
            },
            self.maybe_gobble(leading),
        ))
    }

    fn parse_macro(&mut self, leading: bool, span: Span) -> TemplateResult<(Node, bool)> {
        self.expect_open_paren()?;
        self.skip_ws();
        let name_pos = self.pos;
        let name = self.parse_ident()?.to_ascii_lowercase();
        if DIRECTIVES.contains(&name.as_str()) {
            return Err(self.error_at(name_pos, "a non-reserved macro name"));
        }
        let params = self.parse_param_names()?;
        self.skip_ws();
        self.expect_char(')')?;
        let trim = self.maybe_gobble(leading);
        let (body, _) = self.parse_block(BlockCtx::body("#macro", span))?;
        Ok((
            Node::MacroDef(Arc::new(MacroDef { name, params, body })),
            trim,
        ))
    }

    fn parse_define(&mut self, leading: bool, span: Span) -> TemplateResult<(Node, bool)> {
        self.expect_open_paren()?;
        self.skip_ws();
        self.expect_char('$')?;
        let name = self.parse_ident()?;
        let params = self.parse_param_names()?;
        self.skip_ws();
        self.expect_char(')')?;
        let trim = self.maybe_gobble(leading);
        let (body, _) = self.parse_block(BlockCtx::body("#define", span))?;
        Ok((
            Node::Define(Arc::new(MacroDef { name, params, body })),
            trim,
        ))
    }

    /// `$name` parameters separated by whitespace or commas.
    fn parse_param_names(&mut self) -> TemplateResult<Vec<String>> {
        let mut params = Vec::new();
        loop {
            self.skip_ws();
            while self.eat(',') {
                self.skip_ws();
            }
            if !self.eat('$') {
                return Ok(params);
            }
            params.push(self.parse_ident()?);
        }
    }

    fn parse_include(&mut self, leading: bool, span: Span) -> TemplateResult<(Node, bool)> {
        self.expect_open_paren()?;
        self.skip_ws();
        let mut names = vec![self.parse_expr()?];
        self.skip_ws();
        while self.eat(',') {
            self.skip_ws();
            names.push(self.parse_expr()?);
            self.skip_ws();
        }
        self.expect_char(')')?;
        Ok((Node::Include { names, span }, self.maybe_gobble(leading)))
    }

    fn parse_parse(&mut self, leading: bool, span: Span) -> TemplateResult<(Node, bool)> {
        self.expect_open_paren()?;
        self.skip_ws();
        let name = self.parse_expr()?;
        self.skip_ws();
        self.expect_char(')')?;
        Ok((Node::Parse { name, span }, self.maybe_gobble(leading)))
    }

    fn parse_evaluate(&mut self, leading: bool, span: Span) -> TemplateResult<(Node, bool)> {
        self.expect_open_paren()?;
        self.skip_ws();
        let source = self.parse_expr()?;
        self.skip_ws();
        self.expect_char(')')?;
        Ok((Node::Evaluate { source, span }, self.maybe_gobble(leading)))
    }

    /// `#noescape` captures raw text up to the matching `#end`; nothing in
    /// between is interpreted.
    fn parse_noescape(&mut self, leading: bool, span: Span) -> TemplateResult<(Node, bool)> {
        let trim = self.maybe_gobble(leading);
        let input = self.input;
        let rest = &input[self.pos..];
        let mut search = 0usize;
        let end = loop {
            let Some(found) = rest[search..].find("#end").map(|i| i + search) else {
                let braced = rest.find("#{end}");
                break braced;
            };
            let after = rest[found + 4..].chars().next();
            if !after.is_some_and(is_ident_part) {
                match rest.find("#{end}") {
                    Some(b) if b < found => break Some(b),
                    _ => break Some(found),
                }
            }
            search = found + 4;
        };
        let Some(end) = end else {
            self.pos = self.input.len();
            return Err(self.unterminated("#noescape", span));
        };
        let mut body = rest[..end].to_string();
        let end_start = self.pos + end;
        let end_leading = self.line_leading(end_start);
        let marker_len = if self.input[end_start..].starts_with("#{end}") {
            6
        } else {
            4
        };
        self.pos = end_start + marker_len;
        if self.maybe_gobble(end_leading) {
            trim_indent(&mut body);
        }
        Ok((Node::Noescape(body), trim))
    }

    /// Macro-call arguments: values separated by commas or whitespace,
    /// closed by `)`. The cursor sits on the opening paren.
    fn parse_macro_call_args(&mut self) -> TemplateResult<Vec<Expr>> {
        self.expect_char('(')?;
        let mut args = Vec::new();
        loop {
            self.skip_ws();
            while self.eat(',') {
                self.skip_ws();
            }
            if self.eat(')') {
                return Ok(args);
            }
            args.push(self.parse_expr()?);
        }
    }

    // ------------------------------------------------------------------
    // References
    // ------------------------------------------------------------------

    /// Tries a `$…` reference. Commits once an identifier start is seen
    /// (after the optional `!` and `{`); before that point any mismatch
    /// restores the cursor and returns `None` so the `$` stays literal.
    fn try_parse_reference(&mut self) -> TemplateResult<Option<Reference>> {
        let start = self.pos;
        let span = self.span_at(start);
        self.bump(); // '$'
        let quiet = self.eat('!');
        let braced = self.eat('{');
        match self.peek() {
            Some(c) if is_ident_start(c) => {}
            _ => {
                self.pos = start;
                return Ok(None);
            }
        }
        let path = self.parse_path()?;
        let alternate = if braced && self.eat('|') {
            self.skip_ws();
            let expr = self.parse_expr()?;
            self.skip_ws();
            Some(Box::new(expr))
        } else {
            None
        };
        if braced {
            self.expect_char('}')?;
        }
        let raw = self.input[start..self.pos].to_string();
        Ok(Some(Reference {
            quiet,
            path,
            alternate,
            raw,
            span,
        }))
    }

    fn parse_path(&mut self) -> TemplateResult<Path> {
        let mut segments = Vec::new();
        let name = self.parse_ident()?;
        segments.push(self.name_or_call(name)?);
        loop {
            match self.peek() {
                Some('.') => {
                    // The dot belongs to the reference only when an
                    // identifier follows; `$x.` is a value and a full stop.
                    if !self.peek_second().is_some_and(is_ident_start) {
                        break;
                    }
                    self.bump();
                    let name = self.parse_ident()?;
                    segments.push(self.name_or_call(name)?);
                }
                Some('[') => {
                    self.bump();
                    self.skip_ws();
                    let index = self.parse_expr()?;
                    self.skip_ws();
                    self.expect_char(']')?;
                    segments.push(Segment::Index(index));
                }
                _ => break,
            }
        }
        Ok(Path { segments })
    }

    /// An argument list attaches only when the paren is immediate:
    /// `$f(1)` is a call, `$f (1)` renders `$f` then ` (1)`.
    fn name_or_call(&mut self, name: String) -> TemplateResult<Segment> {
        if self.peek() == Some('(') {
            let args = self.parse_ref_call_args()?;
            Ok(Segment::Call(name, args))
        } else {
            Ok(Segment::Name(name))
        }
    }

    /// Reference-call arguments are comma-separated (unlike macro calls).
    fn parse_ref_call_args(&mut self) -> TemplateResult<Vec<Expr>> {
        self.expect_char('(')?;
        self.skip_ws();
        let mut args = Vec::new();
        if self.eat(')') {
            return Ok(args);
        }
        loop {
            args.push(self.parse_expr()?);
            self.skip_ws();
            if self.eat(',') {
                self.skip_ws();
                continue;
            }
            self.expect_char(')')?;
            return Ok(args);
        }
    }

    fn parse_ident(&mut self) -> TemplateResult<String> {
        match self.peek() {
            Some(c) if is_ident_start(c) => {}
            _ => return Err(self.error("an identifier")),
        }
        let start = self.pos;
        while self.peek().is_some_and(is_ident_part) {
            self.bump();
        }
        Ok(self.input[start..self.pos].to_string())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_expr(&mut self) -> TemplateResult<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> TemplateResult<Expr> {
        let mut left = self.parse_and()?;
        loop {
            self.skip_ws();
            if self.eat_str("||") || self.eat_word("or") {
                self.skip_ws();
                let right = self.parse_and()?;
                left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_and(&mut self) -> TemplateResult<Expr> {
        let mut left = self.parse_not()?;
        loop {
            self.skip_ws();
            if self.eat_str("&&") || self.eat_word("and") {
                self.skip_ws();
                let right = self.parse_not()?;
                left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_not(&mut self) -> TemplateResult<Expr> {
        self.skip_ws();
        let negated = if self.peek() == Some('!') && self.peek_second() != Some('=') {
            self.bump();
            true
        } else {
            self.eat_word("not")
        };
        if negated {
            let operand = self.parse_not()?;
            return Ok(Expr::Unary(UnOp::Not, Box::new(operand)));
        }
        self.parse_rel()
    }

    /// Comparison does not chain: at most one relational operator.
    fn parse_rel(&mut self) -> TemplateResult<Expr> {
        let left = self.parse_add()?;
        self.skip_ws();
        let op = if self.eat_str("==") || self.eat_word("eq") {
            BinOp::Eq
        } else if self.eat_str("!=") || self.eat_word("ne") {
            BinOp::Ne
        } else if self.eat_str("<=") || self.eat_word("le") {
            BinOp::Le
        } else if self.eat_str(">=") || self.eat_word("ge") {
            BinOp::Ge
        } else if self.eat('<') || self.eat_word("lt") {
            BinOp::Lt
        } else if self.eat('>') || self.eat_word("gt") {
            BinOp::Gt
        } else {
            return Ok(left);
        };
        self.skip_ws();
        let right = self.parse_add()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_add(&mut self) -> TemplateResult<Expr> {
        let mut left = self.parse_mul()?;
        loop {
            self.skip_ws();
            let op = if self.eat('+') {
                BinOp::Add
            } else if self.eat('-') {
                BinOp::Sub
            } else {
                return Ok(left);
            };
            self.skip_ws();
            let right = self.parse_mul()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_mul(&mut self) -> TemplateResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            self.skip_ws();
            let op = if self.eat('*') {
                BinOp::Mul
            } else if self.eat('/') {
                BinOp::Div
            } else if self.eat('%') {
                BinOp::Rem
            } else {
                return Ok(left);
            };
            self.skip_ws();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn parse_unary(&mut self) -> TemplateResult<Expr> {
        self.skip_ws();
        if self.eat('-') {
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary(UnOp::Neg, Box::new(operand)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> TemplateResult<Expr> {
        self.skip_ws();
        let Some(ch) = self.peek() else {
            return Err(self.error("an expression"));
        };
        match ch {
            '$' => match self.try_parse_reference()? {
                Some(reference) => Ok(Expr::Reference(reference)),
                None => Err(self.error("a reference")),
            },
            '\'' => Ok(Expr::Literal(Value::Str(self.parse_plain_string()?))),
            '"' => self.parse_interp_string(),
            '(' => {
                self.bump();
                let inner = self.parse_expr()?;
                self.skip_ws();
                self.expect_char(')')?;
                Ok(inner)
            }
            '[' => self.parse_list_or_range(),
            '{' => self.parse_map_literal(),
            '0'..='9' => self.parse_number(),
            c if is_ident_start(c) => {
                if self.eat_word("true") {
                    Ok(Expr::Literal(Value::Bool(true)))
                } else if self.eat_word("false") {
                    Ok(Expr::Literal(Value::Bool(false)))
                } else if self.eat_word("null") {
                    Ok(Expr::Literal(Value::Null))
                } else {
                    Err(self.error("an expression"))
                }
            }
            _ => Err(self.error("an expression")),
        }
    }

    fn parse_list_or_range(&mut self) -> TemplateResult<Expr> {
        self.bump(); // '['
        self.skip_ws();
        if self.eat(']') {
            return Ok(Expr::List(Vec::new()));
        }
        let first = self.parse_expr()?;
        self.skip_ws();
        if self.eat_str("..") {
            self.skip_ws();
            let last = self.parse_expr()?;
            self.skip_ws();
            self.expect_char(']')?;
            return Ok(Expr::Range(Box::new(first), Box::new(last)));
        }
        let mut items = vec![first];
        loop {
            self.skip_ws();
            if self.eat(']') {
                return Ok(Expr::List(items));
            }
            self.expect_char(',')?;
            self.skip_ws();
            items.push(self.parse_expr()?);
        }
    }

    fn parse_map_literal(&mut self) -> TemplateResult<Expr> {
        self.bump(); // '{'
        self.skip_ws();
        let mut entries = Vec::new();
        if self.eat('}') {
            return Ok(Expr::Map(entries));
        }
        loop {
            let key = self.parse_expr()?;
            self.skip_ws();
            self.expect_char(':')?;
            self.skip_ws();
            let value = self.parse_expr()?;
            entries.push((key, value));
            self.skip_ws();
            if self.eat(',') {
                self.skip_ws();
                continue;
            }
            self.expect_char('}')?;
            return Ok(Expr::Map(entries));
        }
    }

    fn parse_number(&mut self) -> TemplateResult<Expr> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
        // A dot continues the number only before a digit; `1..3` is a range.
        let mut float = false;
        if self.peek() == Some('.') && self.peek_second().is_some_and(|c| c.is_ascii_digit()) {
            float = true;
            self.bump();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }
        let literal = &self.input[start..self.pos];
        if float {
            let parsed = literal
                .parse::<f64>()
                .map_err(|_| self.error_at(start, "a floating point literal"))?;
            Ok(Expr::Literal(Value::Float(OrderedFloat(parsed))))
        } else {
            let parsed = literal
                .parse::<i64>()
                .map_err(|_| self.error_at(start, "an integer literal"))?;
            Ok(Expr::Literal(Value::Int(parsed)))
        }
    }

    /// Single-quoted string: no interpolation.
    fn parse_plain_string(&mut self) -> TemplateResult<String> {
        self.bump(); // '\''
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("closing \"'\"")),
                Some('\'') => return Ok(out),
                Some('\\') => match self.bump() {
                    None => return Err(self.error("an escape character")),
                    Some('n') => out.push('\n'),
                    Some('r') => out.push('\r'),
                    Some('t') => out.push('\t'),
                    Some('b') => out.push('\u{8}'),
                    Some('\'') => out.push('\''),
                    Some('\\') => out.push('\\'),
                    Some(other) => {
                        out.push('\\');
                        out.push(other);
                    }
                },
                Some(other) => out.push(other),
            }
        }
    }

    /// Double-quoted string: literal parts interleaved with `$`
    /// references. `\$` suppresses interpolation; directives are not
    /// recognized inside strings.
    fn parse_interp_string(&mut self) -> TemplateResult<Expr> {
        self.bump(); // '"'
        let mut parts: Vec<InterpPart> = Vec::new();
        let mut current = String::new();
        loop {
            let Some(ch) = self.peek() else {
                return Err(self.error("closing '\"'"));
            };
            match ch {
                '"' => {
                    self.bump();
                    break;
                }
                '\\' => {
                    self.bump();
                    match self.bump() {
                        None => return Err(self.error("an escape character")),
                        Some('n') => current.push('\n'),
                        Some('r') => current.push('\r'),
                        Some('t') => current.push('\t'),
                        Some('b') => current.push('\u{8}'),
                        Some('"') => current.push('"'),
                        Some('\\') => current.push('\\'),
                        Some('$') => current.push('$'),
                        Some(other) => {
                            current.push('\\');
                            current.push(other);
                        }
                    }
                }
                '$' => {
                    let start = self.pos;
                    match self.try_parse_reference()? {
                        Some(reference) => {
                            if !current.is_empty() {
                                parts.push(InterpPart::Text(std::mem::take(&mut current)));
                            }
                            parts.push(InterpPart::Reference(reference));
                        }
                        None => {
                            self.pos = start;
                            self.bump();
                            current.push('$');
                        }
                    }
                }
                _ => {
                    self.bump();
                    current.push(ch);
                }
            }
        }
        if parts.is_empty() {
            return Ok(Expr::Literal(Value::Str(current)));
        }
        if !current.is_empty() {
            parts.push(InterpPart::Text(current));
        }
        Ok(Expr::Interp(parts))
    }
}

fn flush(block: &mut Block, buf: &mut String) {
    if !buf.is_empty() {
        block.nodes.push(Node::Text(std::mem::take(buf)));
    }
}

fn trim_indent(buf: &mut String) {
    let keep = buf.trim_end_matches([' ', '\t']).len();
    buf.truncate(keep);
}

fn finish_if(branches: Vec<(Expr, Block)>, else_body: Option<Block>) -> Node {
    Node::If {
        branches,
        else_body,
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_part(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
