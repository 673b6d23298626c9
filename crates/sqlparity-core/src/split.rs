use std::io;
use std::path::Path;

/// A directive comment attached to a statement, e.g. `--query k1` becomes
/// `Command { name: "query", args: ["k1"] }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
}

/// One SQL statement plus the directive comments collected since the previous
/// statement boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stmt {
    pub text: String,
    pub commands: Vec<Command>,
}

/// Splits a SQL script into statements.
///
/// `#` line comments and `/* ... */` block comments are discarded, except
/// hint comments (`/*+ ... */`) which stay part of the statement text.
/// A line comment of the form `--name args...` (no whitespace between the
/// dashes and the name) is a directive and is attached to the next emitted
/// statement. Semicolons inside quoted literals do not terminate statements.
///
/// The iterator is single-use and forward-only. Construction from a file
/// surfaces I/O errors immediately; after that the only terminal condition is
/// end of input.
pub struct Splitter {
    src: Vec<u8>,
    pos: usize,
}

impl Splitter {
    pub fn new(text: impl Into<String>) -> Self {
        Splitter {
            src: text.into().into_bytes(),
            pos: 0,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Splitter::new(text))
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.src.get(self.pos + ahead).copied()
    }

    /// Consumes up to (not including) the next newline, returning the line as
    /// UTF-8 text.
    fn take_line(&mut self) -> String {
        let start = self.pos;
        while let Some(b) = self.peek(0) {
            if b == b'\n' {
                break;
            }
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.src[start..self.pos]).into_owned()
    }

    /// Consumes a quoted literal (including both quotes) and appends it
    /// verbatim. Handles backslash escapes and doubled-quote escapes; an
    /// unterminated literal runs to end of input.
    fn take_literal(&mut self, quote: u8, out: &mut String) {
        let start = self.pos;
        self.pos += 1;
        while let Some(b) = self.peek(0) {
            if b == b'\\' && quote != b'`' {
                self.pos += (2).min(self.src.len() - self.pos);
                continue;
            }
            if b == quote {
                if self.peek(1) == Some(quote) {
                    self.pos += 2;
                    continue;
                }
                self.pos += 1;
                break;
            }
            self.pos += 1;
        }
        out.push_str(&String::from_utf8_lossy(&self.src[start..self.pos]));
    }

    /// Consumes a block comment (including delimiters). Returns its full text
    /// so hint comments can be kept. An unterminated comment runs to end of
    /// input.
    fn take_block_comment(&mut self) -> String {
        let start = self.pos;
        self.pos += 2;
        while let Some(b) = self.peek(0) {
            if b == b'*' && self.peek(1) == Some(b'/') {
                self.pos += 2;
                break;
            }
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.src[start..self.pos]).into_owned()
    }
}

fn parse_directive(line: &str) -> Command {
    let mut fields = line.split_whitespace();
    let name = fields
        .next()
        .unwrap_or_default()
        .trim_start_matches('-')
        .to_string();
    Command {
        name,
        args: fields.map(str::to_string).collect(),
    }
}

impl Iterator for Splitter {
    type Item = Stmt;

    fn next(&mut self) -> Option<Stmt> {
        let mut text = String::new();
        let mut commands = Vec::new();
        loop {
            let Some(b) = self.peek(0) else {
                if text.is_empty() {
                    return None;
                }
                return Some(Stmt { text, commands });
            };
            match b {
                b';' => {
                    self.pos += 1;
                    if text.is_empty() {
                        continue;
                    }
                    text.push(';');
                    return Some(Stmt { text, commands });
                }
                b'#' => {
                    self.take_line();
                }
                b'-' if self.peek(1) == Some(b'-') => {
                    let line = self.take_line();
                    let bytes = line.as_bytes();
                    if bytes.len() > 2 && !bytes[2].is_ascii_whitespace() {
                        commands.push(parse_directive(&line));
                    }
                }
                b'/' if self.peek(1) == Some(b'*') => {
                    let comment = self.take_block_comment();
                    if comment.starts_with("/*+") {
                        text.push_str(&comment);
                    }
                }
                b'\'' | b'"' | b'`' => {
                    self.take_literal(b, &mut text);
                }
                _ if b.is_ascii_whitespace() && text.is_empty() => {
                    self.pos += 1;
                }
                _ => {
                    // Copy the run up to the next byte the lexer cares about.
                    let start = self.pos;
                    while let Some(c) = self.peek(0) {
                        if matches!(c, b';' | b'#' | b'-' | b'/' | b'\'' | b'"' | b'`') {
                            break;
                        }
                        self.pos += 1;
                    }
                    if self.pos == start {
                        self.pos += 1;
                    }
                    text.push_str(&String::from_utf8_lossy(&self.src[start..self.pos]));
                }
            }
        }
    }
}
