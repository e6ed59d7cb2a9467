//! Field references used in criteria keys, ordering and projections
//!
//! A field is a column, optionally followed by a JSON traversal:
//!
//! - `title`, `"Title"` - plain or quoted column
//! - `body->>'title'`, `"body" ->> 'title'`, `body->'tags'->>0` - arrow paths
//! - `body#>>'{a,b}'` - path-array operators
//! - `address.city` - dotted shorthand, rendered as `"address"#>>'{city}'`
//!
//! Every part is re-rendered with quoted identifiers and escaped literals, so the
//! original text never reaches SQL verbatim.

use crate::error::{DataMapperError, Result};
use crate::sql::sanitize::{quote_identifier, quote_literal};

/// One key or index in a JSON traversal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(i64),
}

/// A single `->` / `->>` step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub segment: PathSegment,
    /// `->>` when true, `->` otherwise
    pub text: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsonPath {
    None,
    Arrows(Vec<Step>),
    /// `#>` / `#>>` with the key list
    Keys { keys: Vec<String>, text: bool },
}

/// A parsed field reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    pub column: String,
    pub path: JsonPath,
}

impl FieldRef {
    /// A bare column reference
    pub fn column(name: impl Into<String>) -> Self {
        Self {
            column: name.into(),
            path: JsonPath::None,
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        Parser::new(input).parse()
    }

    pub fn has_path(&self) -> bool {
        self.path != JsonPath::None
    }

    /// Whether the expression evaluates to text (a `->>` / `#>>` extraction)
    pub fn yields_text(&self) -> bool {
        match &self.path {
            JsonPath::None => false,
            JsonPath::Arrows(steps) => steps.last().is_some_and(|s| s.text),
            JsonPath::Keys { text, .. } => *text,
        }
    }

    /// Whether the expression evaluates to a JSON value (`->` / `#>`)
    pub fn yields_json(&self) -> bool {
        self.has_path() && !self.yields_text()
    }

    /// Re-root this reference inside a document body column.
    ///
    /// `title` becomes `body->>'title'`, `address.city` becomes
    /// `body#>>'{address,city}'` and `meta->>'x'` becomes `body->'meta'->>'x'`.
    pub fn into_document(self, body: &str) -> Self {
        let head = self.column;
        let path = match self.path {
            JsonPath::None => JsonPath::Arrows(vec![Step {
                segment: PathSegment::Key(head),
                text: true,
            }]),
            JsonPath::Arrows(mut steps) => {
                steps.insert(
                    0,
                    Step {
                        segment: PathSegment::Key(head),
                        text: false,
                    },
                );
                JsonPath::Arrows(steps)
            }
            JsonPath::Keys { mut keys, text } => {
                keys.insert(0, head);
                JsonPath::Keys { keys, text }
            }
        };
        Self {
            column: body.to_string(),
            path,
        }
    }

    /// Render as SQL
    pub fn to_sql(&self) -> String {
        let mut sql = quote_identifier(&self.column);
        match &self.path {
            JsonPath::None => {}
            JsonPath::Arrows(steps) => {
                for step in steps {
                    sql.push_str(if step.text { "->>" } else { "->" });
                    match &step.segment {
                        PathSegment::Key(key) => sql.push_str(&quote_literal(key)),
                        PathSegment::Index(i) => sql.push_str(&i.to_string()),
                    }
                }
            }
            JsonPath::Keys { keys, text } => {
                sql.push_str(if *text { "#>>" } else { "#>" });
                sql.push_str(&quote_literal(&path_array(keys)));
            }
        }
        sql
    }

    /// Name used for the output column when projecting this field
    pub fn output_name(&self) -> String {
        match &self.path {
            JsonPath::None => self.column.clone(),
            JsonPath::Arrows(steps) => match steps.last().map(|s| &s.segment) {
                Some(PathSegment::Key(key)) => key.clone(),
                Some(PathSegment::Index(i)) => i.to_string(),
                None => self.column.clone(),
            },
            JsonPath::Keys { keys, .. } => keys.last().cloned().unwrap_or_else(|| self.column.clone()),
        }
    }
}

fn path_array(keys: &[String]) -> String {
    let items: Vec<String> = keys
        .iter()
        .map(|k| {
            let plain = !k.is_empty()
                && k
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_' || c == '-');
            if plain {
                k.clone()
            } else {
                format!("\"{}\"", k.replace('\\', "\\\\").replace('"', "\\\""))
            }
        })
        .collect();
    format!("{{{}}}", items.join(","))
}

struct Parser<'a> {
    input: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.trim().chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, reason: &str) -> DataMapperError {
        DataMapperError::invalid_criteria(format!("Invalid field '{}': {}", self.input, reason))
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn starts_with(&self, s: &str) -> bool {
        s.chars()
            .enumerate()
            .all(|(i, c)| self.chars.get(self.pos + i) == Some(&c))
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn parse(mut self) -> Result<FieldRef> {
        if self.at_end() {
            return Err(self.error("empty field"));
        }
        let column = self.identifier()?;
        self.skip_whitespace();

        if self.at_end() {
            return Ok(FieldRef::column(column));
        }

        if self.peek() == Some('.') {
            let mut keys = Vec::new();
            while self.peek() == Some('.') {
                self.pos += 1;
                keys.push(self.identifier()?);
            }
            self.skip_whitespace();
            if !self.at_end() {
                return Err(self.error("unexpected trailing input"));
            }
            return Ok(FieldRef {
                column,
                path: JsonPath::Keys { keys, text: true },
            });
        }

        if self.starts_with("#>") {
            let text = self.starts_with("#>>");
            self.pos += if text { 3 } else { 2 };
            self.skip_whitespace();
            let literal = self.string_literal()?;
            self.skip_whitespace();
            if !self.at_end() {
                return Err(self.error("unexpected trailing input"));
            }
            let keys = parse_path_array(&literal).ok_or_else(|| self.error("malformed path array"))?;
            return Ok(FieldRef {
                column,
                path: JsonPath::Keys { keys, text },
            });
        }

        let mut steps = Vec::new();
        while !self.at_end() {
            let text = if self.starts_with("->>") {
                self.pos += 3;
                true
            } else if self.starts_with("->") {
                self.pos += 2;
                false
            } else {
                return Err(self.error("expected a JSON operator"));
            };
            self.skip_whitespace();
            let segment = match self.peek() {
                Some('\'') => PathSegment::Key(self.string_literal()?),
                Some(c) if c.is_ascii_digit() || c == '-' => PathSegment::Index(self.integer()?),
                _ => return Err(self.error("expected a quoted key or an index")),
            };
            steps.push(Step { segment, text });
            self.skip_whitespace();
        }

        Ok(FieldRef {
            column,
            path: JsonPath::Arrows(steps),
        })
    }

    fn identifier(&mut self) -> Result<String> {
        if self.peek() == Some('"') {
            self.pos += 1;
            let mut out = String::new();
            loop {
                match self.peek() {
                    None => return Err(self.error("unterminated quoted identifier")),
                    Some('"') if self.chars.get(self.pos + 1) == Some(&'"') => {
                        out.push('"');
                        self.pos += 2;
                    }
                    Some('"') => {
                        self.pos += 1;
                        break;
                    }
                    Some(c) => {
                        out.push(c);
                        self.pos += 1;
                    }
                }
            }
            if out.is_empty() {
                return Err(self.error("empty quoted identifier"));
            }
            Ok(out)
        } else {
            let start = self.pos;
            while self
                .peek()
                .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '$')
            {
                self.pos += 1;
            }
            if start == self.pos {
                return Err(self.error("expected an identifier"));
            }
            Ok(self.chars[start..self.pos].iter().collect())
        }
    }

    fn string_literal(&mut self) -> Result<String> {
        if self.peek() != Some('\'') {
            return Err(self.error("expected a quoted string"));
        }
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated string literal")),
                Some('\'') if self.chars.get(self.pos + 1) == Some(&'\'') => {
                    out.push('\'');
                    self.pos += 2;
                }
                Some('\'') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn integer(&mut self) -> Result<i64> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        let digits: String = self.chars[start..self.pos].iter().collect();
        digits.parse().map_err(|_| self.error("invalid array index"))
    }
}

/// Parse the contents of `'{a,b,"c d"}'`
fn parse_path_array(literal: &str) -> Option<Vec<String>> {
    let inner = literal.trim().strip_prefix('{')?.strip_suffix('}')?;
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }
    let mut keys = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if quoted => current.push(chars.next()?),
            '"' => quoted = !quoted,
            ',' if !quoted => keys.push(std::mem::take(&mut current).trim().to_string()),
            c => current.push(c),
        }
    }
    if quoted {
        return None;
    }
    keys.push(current.trim().to_string());
    Some(keys)
}
