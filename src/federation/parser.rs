// SPDX-License-Identifier: Apache-2.0

//! Federation query parser.
//!
//! Turns one SELECT statement into a [`ParsedQuery`]. Keyword boundaries are
//! located first; balanced delimiters are then scanned with explicit quote and
//! parenthesis tracking, so commas or keywords inside string literals and
//! function calls never split anything.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::engine::error::{EngineError, EngineResult};

use super::types::{JoinClause, ParsedQuery};

/// Words that may precede `JOIN` and are never table aliases
const JOIN_MODIFIERS: [&str; 6] = ["inner", "outer", "left", "right", "full", "cross"];

/// Clauses that end the FROM list and the WHERE predicate
const CLAUSE_TERMINATORS: [&str; 3] = ["GROUP BY", "ORDER BY", "LIMIT"];

/// One character of scanned SQL
#[derive(Debug, Clone, Copy)]
struct Lexeme {
    pos: usize,
    ch: char,
    /// False inside string literals and quoted identifiers, quotes included
    code: bool,
    /// Parenthesis depth relative to the start of the text
    depth: i32,
}

fn lex(text: &str) -> Vec<Lexeme> {
    let mut lexemes = Vec::with_capacity(text.len());
    let mut quote: Option<char> = None;
    let mut depth = 0;

    for (pos, ch) in text.char_indices() {
        match quote {
            Some(q) => {
                lexemes.push(Lexeme { pos, ch, code: false, depth });
                if ch == q {
                    quote = None;
                }
            }
            None if ch == '\'' || ch == '"' => {
                quote = Some(ch);
                lexemes.push(Lexeme { pos, ch, code: false, depth });
            }
            None => {
                if ch == ')' {
                    depth -= 1;
                }
                lexemes.push(Lexeme { pos, ch, code: true, depth });
                if ch == '(' {
                    depth += 1;
                }
            }
        }
    }
    lexemes
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Case-insensitive whole-word match of `keyword` at byte offset `pos`
fn keyword_at(text: &str, pos: usize, keyword: &str) -> bool {
    let Some(candidate) = text.get(pos..pos + keyword.len()) else {
        return false;
    };
    if !candidate.eq_ignore_ascii_case(keyword) {
        return false;
    }
    let before = text[..pos].chars().next_back();
    let after = text[pos + keyword.len()..].chars().next();
    !before.is_some_and(|c| is_ident_char(c) || c == '.') && !after.is_some_and(is_ident_char)
}

/// First occurrence of `keyword` at or after `from`, outside quotes and, when
/// `depth` is given, at that parenthesis depth
fn find_keyword(text: &str, keyword: &str, from: usize, depth: Option<i32>) -> Option<usize> {
    lex(text)
        .into_iter()
        .filter(|lx| lx.pos >= from && lx.code && depth.map_or(true, |d| lx.depth == d))
        .map(|lx| lx.pos)
        .find(|&pos| keyword_at(text, pos, keyword))
}

/// Earliest top-level clause terminator or unmatched `)` in `text`
fn clause_end(text: &str) -> usize {
    let unmatched = lex(text)
        .into_iter()
        .find(|lx| lx.code && lx.depth < 0)
        .map(|lx| lx.pos);
    CLAUSE_TERMINATORS
        .iter()
        .filter_map(|kw| find_keyword(text, kw, 0, Some(0)))
        .chain(unmatched)
        .min()
        .unwrap_or(text.len())
}

/// Collapses whitespace runs outside quotes to single spaces
fn normalize_whitespace(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut pending_space = false;
    for lx in lex(sql.trim()) {
        if lx.code && lx.ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(lx.ch);
    }
    out
}

/// Splits on `sep` at parenthesis depth zero, outside quotes. Parts are
/// trimmed and empty parts dropped.
pub fn split_top_level(text: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut start = 0;
    for lx in lex(text) {
        if lx.code && lx.depth == 0 && lx.ch == sep {
            parts.push(text[start..lx.pos].trim().to_string());
            start = lx.pos + sep.len_utf8();
        }
    }
    parts.push(text[start..].trim().to_string());
    parts.retain(|p| !p.is_empty());
    parts
}

/// Splits on any of `keywords` at parenthesis depth zero, outside quotes
pub fn split_on_keywords(text: &str, keywords: &[&str]) -> Vec<String> {
    let mut parts = Vec::new();
    let mut start = 0;
    for lx in lex(text) {
        if !lx.code || lx.depth != 0 || lx.pos < start {
            continue;
        }
        if let Some(kw) = keywords.iter().find(|kw| keyword_at(text, lx.pos, kw)) {
            parts.push(text[start..lx.pos].trim().to_string());
            start = lx.pos + kw.len();
        }
    }
    parts.push(text[start..].trim().to_string());
    parts.retain(|p| !p.is_empty());
    parts
}

/// Splits a predicate on top-level `AND`, keeping `x BETWEEN a AND b` whole.
/// A predicate with a top-level `OR` is a single conjunct.
pub fn split_conjuncts(predicate: &str) -> Vec<String> {
    if split_on_keywords(predicate, &["OR"]).len() > 1 {
        return vec![predicate.trim().to_string()];
    }
    let mut parts = Vec::new();
    let mut start = 0;
    let mut pending_between = false;
    for lx in lex(predicate) {
        if !lx.code || lx.depth != 0 || lx.pos < start {
            continue;
        }
        if keyword_at(predicate, lx.pos, "BETWEEN") {
            pending_between = true;
        } else if keyword_at(predicate, lx.pos, "AND") {
            if pending_between {
                pending_between = false;
            } else {
                parts.push(predicate[start..lx.pos].trim().to_string());
                start = lx.pos + 3;
            }
        }
    }
    parts.push(predicate[start..].trim().to_string());
    parts.retain(|p| !p.is_empty());
    parts
}

/// Splits a script into statements on `;` outside quotes
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut start = 0;
    for lx in lex(script) {
        if lx.code && lx.ch == ';' {
            statements.push(script[start..lx.pos].trim().to_string());
            start = lx.pos + 1;
        }
    }
    statements.push(script[start..].trim().to_string());
    statements.retain(|s| !s.is_empty());
    statements
}

/// Applies `f` to every run of text outside quotes, copying quoted runs as is
pub fn map_unquoted(text: &str, mut f: impl FnMut(&str) -> String) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run_start = 0;
    let mut in_code = true;
    for lx in lex(text) {
        if lx.code != in_code {
            let run = &text[run_start..lx.pos];
            if in_code {
                out.push_str(&f(run));
            } else {
                out.push_str(run);
            }
            run_start = lx.pos;
            in_code = lx.code;
        }
    }
    let run = &text[run_start..];
    if in_code {
        out.push_str(&f(run));
    } else {
        out.push_str(run);
    }
    out
}

fn identifier_chain_regex() -> Option<&'static Regex> {
    static CHAIN: OnceLock<Option<Regex>> = OnceLock::new();
    CHAIN
        .get_or_init(|| Regex::new(r"\b[A-Za-z_][A-Za-z0-9_]*(?:\.(?:[A-Za-z_][A-Za-z0-9_]*|\*))+").ok())
        .as_ref()
}

fn three_part_regex() -> Option<&'static Regex> {
    static THREE_PART: OnceLock<Option<Regex>> = OnceLock::new();
    THREE_PART
        .get_or_init(|| {
            Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)\b").ok()
        })
        .as_ref()
}

/// Dotted identifier chains (`a.b`, `a.b.c`, `a.*`) outside quotes, split
/// into their parts
pub fn identifier_chains(text: &str) -> Vec<Vec<String>> {
    let Some(regex) = identifier_chain_regex() else {
        return Vec::new();
    };
    let mut chains = Vec::new();
    map_unquoted(text, |run| {
        for m in regex.find_iter(run) {
            chains.push(m.as_str().split('.').map(str::to_string).collect());
        }
        run.to_string()
    });
    chains
}

/// Rewrites three-part names `a.b.c` to `a.b_c` outside quotes
pub fn normalize_three_part_names(predicate: &str) -> String {
    let Some(regex) = three_part_regex() else {
        return predicate.to_string();
    };
    map_unquoted(predicate, |run| regex.replace_all(run, "$1.${2}_$3").into_owned())
}

/// Table identifier and optional alias of one FROM-list item
fn table_item(item: &str) -> Option<(String, Option<String>)> {
    let tokens: Vec<&str> = item.split_whitespace().collect();
    let table = tokens.first()?.to_string();
    let alias = match tokens.get(1) {
        Some(t) if t.eq_ignore_ascii_case("as") => tokens.get(2).copied(),
        Some(t) => Some(*t),
        None => None,
    }
    .map(|a| a.trim_matches(|c| c == '"' || c == '\'').to_string())
    .filter(|a| {
        !a.is_empty()
            && !a.eq_ignore_ascii_case("as")
            && !JOIN_MODIFIERS.contains(&a.to_lowercase().as_str())
    });
    Some((table, alias))
}

/// Start of the join phrase (`LEFT OUTER JOIN` …) whose `JOIN` is at `join_pos`
fn join_phrase_start(segment: &str, join_pos: usize) -> usize {
    let mut start = join_pos;
    loop {
        let before = segment[..start].trim_end();
        let word_start = before
            .rfind(|c: char| !is_ident_char(c))
            .map(|i| i + 1)
            .unwrap_or(0);
        let word = &before[word_start..];
        if !word.is_empty() && JOIN_MODIFIERS.contains(&word.to_lowercase().as_str()) {
            start = word_start;
        } else {
            return start;
        }
    }
}

/// Byte offsets of every top-level `JOIN` keyword in the FROM segment
fn join_positions(segment: &str) -> Vec<usize> {
    lex(segment)
        .into_iter()
        .filter(|lx| lx.code && lx.depth == 0 && keyword_at(segment, lx.pos, "JOIN"))
        .map(|lx| lx.pos)
        .collect()
}

struct FromScan {
    tables: Vec<String>,
    aliases: BTreeMap<String, String>,
    joins: Vec<JoinClause>,
}

impl FromScan {
    fn add_item(&mut self, item: &str) -> EngineResult<Option<(String, Option<String>)>> {
        let Some((table, alias)) = table_item(item) else {
            return Ok(None);
        };
        if self.tables.contains(&table) {
            return Err(EngineError::parse(format!(
                "Table '{table}' appears more than once; self-joins are not supported"
            )));
        }
        self.tables.push(table.clone());
        if let Some(alias) = &alias {
            match self.aliases.get(alias) {
                Some(bound) if bound != &table => {
                    return Err(EngineError::parse(format!(
                        "Alias '{alias}' is bound to both '{bound}' and '{table}'"
                    )));
                }
                _ => {
                    self.aliases.insert(alias.clone(), table.clone());
                }
            }
        }
        Ok(Some((table, alias)))
    }
}

fn scan_from_segment(segment: &str) -> EngineResult<FromScan> {
    let mut scan = FromScan {
        tables: Vec::new(),
        aliases: BTreeMap::new(),
        joins: Vec::new(),
    };

    let joins = join_positions(segment);
    let first_end = joins
        .first()
        .map(|&pos| join_phrase_start(segment, pos))
        .unwrap_or(segment.len());
    for item in split_top_level(&segment[..first_end], ',') {
        scan.add_item(&item)?;
    }

    for (i, &pos) in joins.iter().enumerate() {
        let end = joins
            .get(i + 1)
            .map(|&next| join_phrase_start(segment, next))
            .unwrap_or(segment.len());
        let piece = &segment[pos + 4..end];

        let Some(on) = find_keyword(piece, "ON", 0, Some(0)) else {
            // CROSS JOIN or USING: the table still counts, there is no condition
            for item in split_top_level(piece, ',') {
                scan.add_item(&item)?;
            }
            continue;
        };

        let mut tail = split_top_level(&piece[on + 2..], ',').into_iter();
        let condition = tail.next().unwrap_or_default();
        if let Some((table, alias)) = scan.add_item(&piece[..on])? {
            scan.joins.push(JoinClause {
                table,
                alias,
                condition,
            });
        }
        for item in tail {
            scan.add_item(&item)?;
        }
    }

    Ok(scan)
}

/// Parses one SELECT statement.
pub fn parse(sql: &str) -> EngineResult<ParsedQuery> {
    let sql = normalize_whitespace(sql);
    let sql = sql.trim_end_matches(';').trim_end();

    let select = find_keyword(sql, "SELECT", 0, None)
        .ok_or_else(|| EngineError::parse("Statement has no SELECT"))?;
    let depth = lex(sql)
        .into_iter()
        .find(|lx| lx.pos == select)
        .map(|lx| lx.depth)
        .unwrap_or(0);
    let from = find_keyword(sql, "FROM", select + 6, Some(depth))
        .ok_or_else(|| EngineError::parse("Statement has no FROM after SELECT"))?;

    let columns = split_top_level(&sql[select + 6..from], ',');
    let select_all = columns.iter().any(|c| c.contains('*'));

    let after_from = &sql[from + 4..];
    let where_pos = find_keyword(after_from, "WHERE", 0, Some(0));
    let from_end = where_pos
        .unwrap_or(after_from.len())
        .min(clause_end(after_from));
    let scan = scan_from_segment(after_from[..from_end].trim())?;

    let where_clause = where_pos
        .map(|pos| {
            let predicate = &after_from[pos + 5..];
            normalize_three_part_names(predicate[..clause_end(predicate)].trim())
        })
        .filter(|predicate| !predicate.is_empty());

    Ok(ParsedQuery {
        columns,
        select_all,
        tables: scan.tables,
        aliases: scan.aliases,
        joins: scan.joins,
        where_clause,
    })
}
