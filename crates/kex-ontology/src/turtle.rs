//! Turtle subset parser
//!
//! Covers what ontology sources use in practice: `@prefix`/`PREFIX`,
//! `@base`/`BASE`, IRIs, prefixed names, `a`, string literals (short and
//! long, with language tags or datatypes), numbers, booleans, `;`/`,` lists,
//! blank node labels, `[ ... ]` property lists, and `( ... )` collections.
//! Errors carry the source fragment where parsing stopped.

use std::collections::BTreeMap;

use kex_core::{KexError, Result};

use crate::vocab;

/// RDF term
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    Iri(String),
    Blank(String),
    Literal {
        value: String,
        lang: Option<String>,
        datatype: Option<String>,
    },
}

impl Term {
    pub fn as_iri(&self) -> Option<&str> {
        match self {
            Self::Iri(iri) => Some(iri),
            _ => None,
        }
    }

    pub fn as_literal(&self) -> Option<&str> {
        match self {
            Self::Literal { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// `(subject, predicate, object)` with the predicate always an IRI
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Triple {
    pub subject: Term,
    pub predicate: String,
    pub object: Term,
}

/// Parser output
#[derive(Debug, Clone, Default)]
pub struct TurtleDocument {
    pub prefixes: BTreeMap<String, String>,
    pub triples: Vec<Triple>,
}

/// Parse Turtle text into triples
pub fn parse(source: &str) -> Result<TurtleDocument> {
    let mut parser = Parser {
        src: source,
        pos: 0,
        prefixes: BTreeMap::new(),
        base: None,
        triples: Vec::new(),
        blank_counter: 0,
    };
    parser.document()?;
    Ok(TurtleDocument {
        prefixes: parser.prefixes,
        triples: parser.triples,
    })
}

const FRAGMENT_CHARS: usize = 40;

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    prefixes: BTreeMap<String, String>,
    base: Option<String>,
    triples: Vec<Triple>,
    blank_counter: usize,
}

fn is_pn_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

fn is_local_char(c: char) -> bool {
    is_pn_char(c) || c == '.' || c == ':' || c == '%'
}

impl<'a> Parser<'a> {
    // ------------------------------------------------------------------
    // Cursor helpers
    // ------------------------------------------------------------------

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_nth(&self, n: usize) -> Option<char> {
        self.rest().chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, s: &str) -> bool {
        if self.rest().starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        self.skip_ws();
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{c}`")))
        }
    }

    /// Case-insensitive keyword followed by whitespace
    fn eat_keyword_ci(&mut self, keyword: &str) -> bool {
        let rest = self.rest();
        let matches = rest.len() > keyword.len()
            && rest.is_char_boundary(keyword.len())
            && rest[..keyword.len()].eq_ignore_ascii_case(keyword)
            && rest[keyword.len()..]
                .chars()
                .next()
                .is_some_and(char::is_whitespace);
        if matches {
            self.pos += keyword.len();
        }
        matches
    }

    fn skip_ws(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.pos += c.len_utf8();
                }
                Some('#') => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn error(&self, message: impl Into<String>) -> KexError {
        let line = self.src[..self.pos].matches('\n').count() + 1;
        let fragment: String = if self.pos >= self.src.len() {
            let chars: Vec<char> = self.src.chars().rev().take(FRAGMENT_CHARS).collect();
            chars.into_iter().rev().collect()
        } else {
            self.rest().chars().take(FRAGMENT_CHARS).collect()
        };
        KexError::OntologyParse {
            fragment: fragment.trim().to_string(),
            message: format!("{} (line {line})", message.into()),
        }
    }

    fn fresh_blank(&mut self) -> Term {
        self.blank_counter += 1;
        Term::Blank(format!("_:gen{}", self.blank_counter))
    }

    fn emit(&mut self, subject: Term, predicate: &str, object: Term) {
        self.triples.push(Triple {
            subject,
            predicate: predicate.to_string(),
            object,
        });
    }

    // ------------------------------------------------------------------
    // Grammar
    // ------------------------------------------------------------------

    fn document(&mut self) -> Result<()> {
        loop {
            self.skip_ws();
            if self.peek().is_none() {
                return Ok(());
            }
            if self.eat_str("@prefix") {
                self.prefix_decl()?;
                self.expect('.')?;
            } else if self.eat_str("@base") {
                self.base_decl()?;
                self.expect('.')?;
            } else if self.eat_keyword_ci("PREFIX") {
                self.prefix_decl()?;
            } else if self.eat_keyword_ci("BASE") {
                self.base_decl()?;
            } else {
                self.triples_statement()?;
            }
        }
    }

    fn prefix_decl(&mut self) -> Result<()> {
        self.skip_ws();
        let start = self.pos;
        while self.peek().is_some_and(|c| is_pn_char(c) || c == '.') {
            self.bump();
        }
        let prefix = self.src[start..self.pos].to_string();
        if !self.eat(':') {
            return Err(self.error("expected `:` after prefix name"));
        }
        self.skip_ws();
        let iri = self.iri_ref()?;
        self.prefixes.insert(prefix, iri);
        Ok(())
    }

    fn base_decl(&mut self) -> Result<()> {
        self.skip_ws();
        let iri = self.iri_ref()?;
        self.base = Some(iri);
        Ok(())
    }

    fn triples_statement(&mut self) -> Result<()> {
        let standalone_list = self.peek() == Some('[');
        let subject = self.subject()?;
        self.skip_ws();
        if standalone_list && self.peek() == Some('.') {
            self.bump();
            return Ok(());
        }
        self.predicate_object_list(&subject)?;
        self.expect('.')
    }

    fn predicate_object_list(&mut self, subject: &Term) -> Result<()> {
        loop {
            self.skip_ws();
            let predicate = self.verb()?;
            self.object_list(subject, &predicate)?;
            self.skip_ws();
            if !self.eat(';') {
                return Ok(());
            }
            loop {
                self.skip_ws();
                if !self.eat(';') {
                    break;
                }
            }
            self.skip_ws();
            match self.peek() {
                Some('.') | Some(']') | None => return Ok(()),
                _ => {}
            }
        }
    }

    fn object_list(&mut self, subject: &Term, predicate: &str) -> Result<()> {
        loop {
            self.skip_ws();
            let object = self.object()?;
            self.emit(subject.clone(), predicate, object);
            self.skip_ws();
            if !self.eat(',') {
                return Ok(());
            }
        }
    }

    fn verb(&mut self) -> Result<String> {
        if self.peek() == Some('a')
            && self
                .peek_nth(1)
                .is_some_and(|c| c.is_whitespace() || matches!(c, '<' | '[' | '(' | '"'))
        {
            self.bump();
            return Ok(vocab::RDF_TYPE.to_string());
        }
        match self.peek() {
            Some('<') => self.iri_ref(),
            Some(_) => self.prefixed_name(),
            None => Err(self.error("expected predicate")),
        }
    }

    fn subject(&mut self) -> Result<Term> {
        self.skip_ws();
        match self.peek() {
            Some('<') => Ok(Term::Iri(self.iri_ref()?)),
            Some('_') if self.peek_nth(1) == Some(':') => self.blank_label(),
            Some('[') => self.blank_property_list(),
            Some('(') => self.collection(),
            Some(_) => Ok(Term::Iri(self.prefixed_name()?)),
            None => Err(self.error("expected subject")),
        }
    }

    fn object(&mut self) -> Result<Term> {
        self.skip_ws();
        match self.peek() {
            Some('<') => Ok(Term::Iri(self.iri_ref()?)),
            Some('_') if self.peek_nth(1) == Some(':') => self.blank_label(),
            Some('[') => self.blank_property_list(),
            Some('(') => self.collection(),
            Some('"') | Some('\'') => self.literal(),
            Some(c) if c.is_ascii_digit() || matches!(c, '+' | '-') => self.number(),
            Some('.') if self.peek_nth(1).is_some_and(|c| c.is_ascii_digit()) => self.number(),
            Some(_) => {
                if let Some(b) = self.boolean() {
                    return Ok(b);
                }
                Ok(Term::Iri(self.prefixed_name()?))
            }
            None => Err(self.error("expected object")),
        }
    }

    fn iri_ref(&mut self) -> Result<String> {
        if !self.eat('<') {
            return Err(self.error("expected `<`"));
        }
        let start = self.pos;
        loop {
            match self.bump() {
                Some('>') => break,
                Some(c) if c.is_whitespace() => {
                    return Err(self.error("whitespace inside IRI"));
                }
                Some(_) => {}
                None => return Err(self.error("unterminated IRI")),
            }
        }
        let raw = &self.src[start..self.pos - 1];
        Ok(self.resolve_relative(raw))
    }

    fn resolve_relative(&self, raw: &str) -> String {
        if raw.contains(':') {
            return raw.to_string();
        }
        match &self.base {
            Some(base) => format!("{base}{raw}"),
            None => raw.to_string(),
        }
    }

    fn prefixed_name(&mut self) -> Result<String> {
        let start = self.pos;
        while self.peek().is_some_and(|c| is_pn_char(c) || c == '.') {
            self.bump();
        }
        let prefix = &self.src[start..self.pos];
        if !self.eat(':') {
            self.pos = start;
            return Err(self.error("expected IRI or prefixed name"));
        }
        let local_start = self.pos;
        while self.peek().is_some_and(is_local_char) {
            self.bump();
        }
        // A trailing '.' terminates the statement, not the name
        while self.pos > local_start && self.src[..self.pos].ends_with('.') {
            self.pos -= 1;
        }
        let local = &self.src[local_start..self.pos];
        let Some(namespace) = self.prefixes.get(prefix) else {
            self.pos = start;
            return Err(self.error(format!("undeclared prefix `{prefix}:`")));
        };
        Ok(format!("{namespace}{local}"))
    }

    fn blank_label(&mut self) -> Result<Term> {
        self.eat_str("_:");
        let start = self.pos;
        while self.peek().is_some_and(is_pn_char) {
            self.bump();
        }
        if start == self.pos {
            return Err(self.error("empty blank node label"));
        }
        Ok(Term::Blank(format!("_:{}", &self.src[start..self.pos])))
    }

    fn blank_property_list(&mut self) -> Result<Term> {
        self.eat('[');
        let node = self.fresh_blank();
        self.skip_ws();
        if self.eat(']') {
            return Ok(node);
        }
        self.predicate_object_list(&node)?;
        self.expect(']')?;
        Ok(node)
    }

    fn collection(&mut self) -> Result<Term> {
        self.eat('(');
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.eat(')') {
                break;
            }
            if self.peek().is_none() {
                return Err(self.error("unterminated collection"));
            }
            items.push(self.object()?);
        }

        let mut head = Term::Iri(vocab::RDF_NIL.to_string());
        for item in items.into_iter().rev() {
            let node = self.fresh_blank();
            self.emit(node.clone(), vocab::RDF_FIRST, item);
            self.emit(node.clone(), vocab::RDF_REST, head);
            head = node;
        }
        Ok(head)
    }

    fn literal(&mut self) -> Result<Term> {
        let value = self.string()?;
        let mut lang = None;
        let mut datatype = None;
        if self.eat('@') {
            let start = self.pos;
            while self
                .peek()
                .is_some_and(|c| c.is_ascii_alphanumeric() || c == '-')
            {
                self.bump();
            }
            if start == self.pos {
                return Err(self.error("empty language tag"));
            }
            lang = Some(self.src[start..self.pos].to_ascii_lowercase());
        } else if self.eat_str("^^") {
            datatype = Some(match self.peek() {
                Some('<') => self.iri_ref()?,
                _ => self.prefixed_name()?,
            });
        }
        Ok(Term::Literal {
            value,
            lang,
            datatype,
        })
    }

    fn string(&mut self) -> Result<String> {
        let quote = match self.peek() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(self.error("expected string literal")),
        };
        let triple: String = std::iter::repeat(quote).take(3).collect();
        let long = self.eat_str(&triple);
        if !long {
            self.bump();
        }

        let mut out = String::new();
        loop {
            if long && self.eat_str(&triple) {
                return Ok(out);
            }
            match self.bump() {
                None => return Err(self.error("unterminated string literal")),
                Some(c) if c == quote && !long => return Ok(out),
                Some('\n') if !long => return Err(self.error("newline in short string")),
                Some('\\') => out.push(self.escape()?),
                Some(c) => out.push(c),
            }
        }
    }

    fn escape(&mut self) -> Result<char> {
        match self.bump() {
            Some('t') => Ok('\t'),
            Some('b') => Ok('\u{8}'),
            Some('n') => Ok('\n'),
            Some('r') => Ok('\r'),
            Some('f') => Ok('\u{c}'),
            Some(c @ ('"' | '\'' | '\\')) => Ok(c),
            Some('u') => self.hex_escape(4),
            Some('U') => self.hex_escape(8),
            _ => Err(self.error("invalid escape sequence")),
        }
    }

    fn hex_escape(&mut self, len: usize) -> Result<char> {
        let digits: String = self.rest().chars().take(len).collect();
        if digits.len() != len {
            return Err(self.error("truncated unicode escape"));
        }
        let code = u32::from_str_radix(&digits, 16)
            .map_err(|_| self.error("invalid unicode escape"))?;
        self.pos += len;
        char::from_u32(code).ok_or_else(|| self.error("invalid unicode code point"))
    }

    fn number(&mut self) -> Result<Term> {
        let start = self.pos;
        if matches!(self.peek(), Some('+' | '-')) {
            self.bump();
        }
        let mut datatype = vocab::XSD_INTEGER;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
        }
        if self.peek() == Some('.') && self.peek_nth(1).is_some_and(|c| c.is_ascii_digit()) {
            self.bump();
            datatype = vocab::XSD_DECIMAL;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            self.bump();
            datatype = vocab::XSD_DOUBLE;
            if matches!(self.peek(), Some('+' | '-')) {
                self.bump();
            }
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.bump();
            }
        }
        let text = &self.src[start..self.pos];
        if !text.chars().any(|c| c.is_ascii_digit()) {
            self.pos = start;
            return Err(self.error("malformed number"));
        }
        Ok(Term::Literal {
            value: text.to_string(),
            lang: None,
            datatype: Some(datatype.to_string()),
        })
    }

    fn boolean(&mut self) -> Option<Term> {
        for word in ["true", "false"] {
            let rest = self.rest();
            if rest.starts_with(word)
                && !rest[word.len()..]
                    .chars()
                    .next()
                    .is_some_and(|c| is_local_char(c) && c != '.')
            {
                self.pos += word.len();
                return Some(Term::Literal {
                    value: word.to_string(),
                    lang: None,
                    datatype: Some(vocab::XSD_BOOLEAN.to_string()),
                });
            }
        }
        None
    }
}
