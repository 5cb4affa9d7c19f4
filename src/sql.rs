//! SQL text processing.
//!
//! A command's text may contain several `;`-separated statements. Each is
//! sent as its own Parse/Bind/Execute group, so placeholders are rewritten
//! per statement: `@name` and `$n` references become `$1..$k` in order of
//! first appearance, and the statement records which command parameter
//! each `$k` binds. Semicolons and placeholders inside string literals,
//! quoted identifiers, dollar-quoted bodies and comments are left alone.

use smallvec::SmallVec;

use crate::error::{PgError, PgResult};
use crate::types::Parameter;

/// Reference from a rewritten placeholder back to a command parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamRef {
    /// `$n`, stored zero-based.
    Positional(usize),
    /// `@name`, without the `@`.
    Named(String),
}

/// One statement of a command, ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStatement {
    pub sql: String,
    pub refs: Vec<ParamRef>,
    /// Sent verbatim; every command parameter binds in order.
    pub raw: bool,
}

impl ParsedStatement {
    /// Indices into `params` for `$1..$k` of this statement.
    pub fn bind_indices(&self, params: &[Parameter]) -> PgResult<SmallVec<[usize; 8]>> {
        if self.raw {
            return Ok((0..params.len()).collect());
        }

        self.refs
            .iter()
            .map(|r| match r {
                ParamRef::Positional(i) if *i < params.len() => Ok(*i),
                ParamRef::Positional(i) => Err(PgError::Usage(format!(
                    "Placeholder ${} has no matching parameter ({} supplied)",
                    i + 1,
                    params.len()
                ))),
                ParamRef::Named(name) => params
                    .iter()
                    .position(|p| {
                        p.name
                            .as_deref()
                            .is_some_and(|n| n.eq_ignore_ascii_case(name))
                    })
                    .ok_or_else(|| {
                        PgError::Usage(format!("No parameter named @{} was supplied", name))
                    }),
            })
            .collect()
    }
}

/// Split and rewrite a command's SQL text.
///
/// In raw mode the text is a single statement passed through untouched.
/// Always yields at least one statement; an empty text yields one empty
/// statement, which the server answers with EmptyQueryResponse.
pub fn parse(sql: &str, raw: bool) -> Vec<ParsedStatement> {
    if raw {
        return vec![ParsedStatement {
            sql: sql.to_string(),
            refs: Vec::new(),
            raw: true,
        }];
    }

    let mut parser = Parser {
        src: sql,
        out: String::with_capacity(sql.len()),
        refs: Vec::new(),
        statements: Vec::new(),
    };
    parser.run();

    if parser.statements.is_empty() {
        parser.statements.push(ParsedStatement {
            sql: String::new(),
            refs: Vec::new(),
            raw: false,
        });
    }
    parser.statements
}

struct Parser<'a> {
    src: &'a str,
    out: String,
    refs: Vec<ParamRef>,
    statements: Vec<ParsedStatement>,
}

impl Parser<'_> {
    fn run(&mut self) {
        let src = self.src;
        let b = src.as_bytes();
        let mut i = 0;
        // Start of text not yet copied to `out`
        let mut copied = 0;

        while i < b.len() {
            let next = b.get(i + 1).copied();
            match b[i] {
                b'\'' => i = skip_string(b, i, is_escape_string(b, i)),
                b'"' => i = skip_string(b, i, false),
                b'-' if next == Some(b'-') => {
                    i = b[i..]
                        .iter()
                        .position(|c| *c == b'\n')
                        .map_or(b.len(), |p| i + p + 1);
                }
                b'/' if next == Some(b'*') => i = skip_block_comment(b, i),
                b':' if next == Some(b':') => i += 2,
                b'$' if next.is_some_and(|c| c.is_ascii_digit()) && !follows_ident(b, i) => {
                    let end = scan(b, i + 1, |c| c.is_ascii_digit());
                    match src[i + 1..end].parse::<usize>() {
                        Ok(n) if n > 0 => {
                            self.out.push_str(&src[copied..i]);
                            self.placeholder(ParamRef::Positional(n - 1));
                            copied = end;
                        }
                        _ => {}
                    }
                    i = end;
                }
                b'$' if !follows_ident(b, i) => i = skip_dollar_quote(b, i),
                b'@' if next == Some(b'@') => i += 2,
                b'@' if next.is_some_and(is_ident_start) && !follows_ident(b, i) => {
                    let end = scan(b, i + 1, is_ident_byte);
                    self.out.push_str(&src[copied..i]);
                    self.placeholder(ParamRef::Named(src[i + 1..end].to_string()));
                    copied = end;
                    i = end;
                }
                b';' => {
                    self.out.push_str(&src[copied..i]);
                    self.finish_statement();
                    i += 1;
                    copied = i;
                }
                _ => i += 1,
            }
        }

        self.out.push_str(&src[copied.min(b.len())..]);
        self.finish_statement();
    }

    fn placeholder(&mut self, r: ParamRef) {
        let k = match self.refs.iter().position(|existing| *existing == r) {
            Some(k) => k,
            None => {
                self.refs.push(r);
                self.refs.len() - 1
            }
        };
        self.out.push('$');
        self.out.push_str(&(k + 1).to_string());
    }

    fn finish_statement(&mut self) {
        let sql = self.out.trim();
        if !sql.is_empty() {
            self.statements.push(ParsedStatement {
                sql: sql.to_string(),
                refs: std::mem::take(&mut self.refs),
                raw: false,
            });
        }
        self.out.clear();
        self.refs.clear();
    }
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c >= 0x80
}

fn is_ident_byte(c: u8) -> bool {
    is_ident_start(c) || c.is_ascii_digit() || c == b'$'
}

fn follows_ident(b: &[u8], i: usize) -> bool {
    i > 0 && is_ident_byte(b[i - 1])
}

fn scan(b: &[u8], from: usize, pred: impl Fn(u8) -> bool) -> usize {
    b[from..]
        .iter()
        .position(|c| !pred(*c))
        .map_or(b.len(), |p| from + p)
}

/// `E'...'` literals honor backslash escapes.
fn is_escape_string(b: &[u8], i: usize) -> bool {
    i > 0 && matches!(b[i - 1], b'E' | b'e') && (i < 2 || !is_ident_byte(b[i - 2]))
}

/// Skip a quoted run starting at the opening quote; doubled quotes escape.
fn skip_string(b: &[u8], start: usize, backslash: bool) -> usize {
    let quote = b[start];
    let mut j = start + 1;
    while j < b.len() {
        if backslash && b[j] == b'\\' {
            j += 2;
            continue;
        }
        if b[j] == quote {
            if b.get(j + 1) == Some(&quote) {
                j += 2;
                continue;
            }
            return j + 1;
        }
        j += 1;
    }
    b.len()
}

fn skip_block_comment(b: &[u8], start: usize) -> usize {
    let mut depth = 0usize;
    let mut j = start;
    while j + 1 < b.len() {
        match (b[j], b[j + 1]) {
            (b'/', b'*') => {
                depth += 1;
                j += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                j += 2;
                if depth == 0 {
                    return j;
                }
            }
            _ => j += 1,
        }
    }
    b.len()
}

/// Skip `$tag$ ... $tag$`; a lone `$` is ordinary text.
fn skip_dollar_quote(b: &[u8], start: usize) -> usize {
    let tag_end = scan(b, start + 1, |c| is_ident_byte(c) && c != b'$');
    if b.get(tag_end) != Some(&b'$') {
        return start + 1;
    }
    let tag = &b[start..=tag_end];
    let body = tag_end + 1;
    b[body..]
        .windows(tag.len())
        .position(|w| w == tag)
        .map_or(b.len(), |p| body + p + tag.len())
}
