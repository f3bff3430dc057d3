//! Probe expression parsing and evaluation.
//!
//! A probe describes when a template applies. It is either a single
//! expression string or an ordered list of strings that is folded through
//! explicit `AND`/`OR` tokens:
//!
//! ```text
//! probe  := atom (op atom)*
//! atom   := "TRUE" | "FALSE" | "FOUND(" interface ")"
//!         | "MATCH_ONE" "(" probe ")"
//!         | interface "(" kv (, kv)* ")"
//! op     := "AND" | "OR"
//! ```
//!
//! Condition values are tagged lexically at parse time: slash-delimited
//! strings are regex literals (full-string match), everything else is a
//! plain literal. Evaluation is pure against a mirror snapshot; the
//! evaluator holds no state.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde_json::Value;

use entity_manager_common::BusSnapshot;

use crate::error::{EmError, Result};

/// A parsed condition value of an interface atom.
#[derive(Debug, Clone)]
pub enum ProbeValue {
    /// Compared for equality (numbers coerce across integer/float kinds).
    Literal(Value),
    /// Compared by full-string regex match on the property's string form.
    Regex(Regex),
}

/// One atom of a probe expression.
#[derive(Debug, Clone)]
pub enum ProbeAtom {
    /// Always matches once, with an empty binding.
    True,
    /// Never matches.
    False,
    /// Matches iff at least one detector exposes the interface.
    Found(String),
    /// Restricts the inner expression to its first match.
    MatchOne(Box<ProbeExpr>),
    /// Matches every detector exposing the interface whose properties
    /// satisfy all conditions.
    Interface {
        name: String,
        conditions: Vec<(String, ProbeValue)>,
    },
}

/// Binary operator between atoms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOp {
    And,
    Or,
}

/// A parsed probe: a first atom folded left-to-right through operators.
#[derive(Debug, Clone)]
pub struct ProbeExpr {
    first: ProbeAtom,
    rest: Vec<(ProbeOp, ProbeAtom)>,
}

impl ProbeExpr {
    /// The expression that never matches. Invalid probes degrade to this.
    pub fn never() -> Self {
        Self {
            first: ProbeAtom::False,
            rest: Vec::new(),
        }
    }

    /// Collect every interface name this expression probes.
    pub fn collect_interfaces(&self, out: &mut BTreeSet<String>) {
        collect_atom(&self.first, out);
        for (_, atom) in &self.rest {
            collect_atom(atom, out);
        }
    }
}

fn collect_atom(atom: &ProbeAtom, out: &mut BTreeSet<String>) {
    match atom {
        ProbeAtom::Found(iface) => {
            out.insert(iface.clone());
        }
        ProbeAtom::Interface { name, .. } => {
            out.insert(name.clone());
        }
        ProbeAtom::MatchOne(inner) => inner.collect_interfaces(out),
        ProbeAtom::True | ProbeAtom::False => {}
    }
}

/// One successful binding of a probe against the snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeMatch {
    /// Placeholder name → concrete value.
    pub replacements: BTreeMap<String, Value>,
    /// Detector object paths whose properties contributed to the match.
    pub paths: BTreeSet<String>,
}

/// Parse the `Probe` field of a template: a string or an array of strings.
pub fn parse(probe: &Value) -> Result<ProbeExpr> {
    let mut tokens = Vec::new();
    match probe {
        Value::String(s) => tokenize(s, &mut tokens)?,
        Value::Array(items) => {
            for item in items {
                let s = item
                    .as_str()
                    .ok_or_else(|| EmError::probe("probe statement is not a string"))?;
                tokenize(s, &mut tokens)?;
            }
        }
        _ => return Err(EmError::probe("probe is neither string nor array")),
    }
    parse_tokens(&tokens)
}

#[derive(Debug)]
enum Token {
    Op(ProbeOp),
    Atom(ProbeAtom),
}

/// Split a probe string on whitespace outside parentheses and quotes,
/// parsing each piece.
fn tokenize(input: &str, out: &mut Vec<Token>) -> Result<()> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = None;
    let chars: Vec<char> = input.chars().collect();

    let flush = |start: &mut Option<usize>, end: usize, out: &mut Vec<Token>| -> Result<()> {
        if let Some(s) = start.take() {
            let piece: String = chars[s..end].iter().collect();
            out.push(parse_piece(&piece)?);
        }
        Ok(())
    };

    for (i, &c) in chars.iter().enumerate() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '(' => depth += 1,
                ')' => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| EmError::probe(format!("unbalanced ')' in '{}'", input)))?;
                }
                c if c.is_whitespace() && depth == 0 => {
                    flush(&mut start, i, out)?;
                    continue;
                }
                _ => {}
            },
        }
        if start.is_none() {
            start = Some(i);
        }
    }
    if depth != 0 || quote.is_some() {
        return Err(EmError::probe(format!("unterminated probe '{}'", input)));
    }
    flush(&mut start, chars.len(), out)
}

fn parse_piece(piece: &str) -> Result<Token> {
    match piece {
        "TRUE" => return Ok(Token::Atom(ProbeAtom::True)),
        "FALSE" => return Ok(Token::Atom(ProbeAtom::False)),
        "AND" => return Ok(Token::Op(ProbeOp::And)),
        "OR" => return Ok(Token::Op(ProbeOp::Or)),
        _ => {}
    }

    let open = piece
        .find('(')
        .ok_or_else(|| EmError::probe(format!("'{}' is not a probe atom", piece)))?;
    if !piece.ends_with(')') {
        return Err(EmError::probe(format!("'{}' is missing ')'", piece)));
    }
    let head = &piece[..open];
    let body = &piece[open + 1..piece.len() - 1];

    match head {
        "FOUND" => {
            let iface = body.trim().trim_matches(|c| c == '\'' || c == '"');
            if iface.is_empty() {
                return Err(EmError::probe("FOUND with empty interface"));
            }
            Ok(Token::Atom(ProbeAtom::Found(iface.to_string())))
        }
        "MATCH_ONE" => {
            let mut inner = Vec::new();
            tokenize(body, &mut inner)?;
            Ok(Token::Atom(ProbeAtom::MatchOne(Box::new(parse_tokens(
                &inner,
            )?))))
        }
        _ => parse_interface_atom(head, body).map(Token::Atom),
    }
}

fn parse_interface_atom(name: &str, body: &str) -> Result<ProbeAtom> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_') {
        return Err(EmError::probe(format!("'{}' is not an interface name", name)));
    }

    let body = body.trim();
    let json_body = if body.is_empty() {
        "{}".to_string()
    } else if body.starts_with('{') {
        body.to_string()
    } else {
        format!("{{{}}}", body)
    };

    // JSON5 accepts the single-quoted form templates are written in.
    let parsed: Value = json5::from_str(&json_body)
        .map_err(|e| EmError::probe(format!("bad condition block '{}': {}", body, e)))?;
    let object = parsed
        .as_object()
        .ok_or_else(|| EmError::probe(format!("condition block '{}' is not an object", body)))?;

    let mut conditions = Vec::new();
    for (key, value) in object {
        let condition = match value {
            Value::String(s) if s.len() >= 2 && s.starts_with('/') && s.ends_with('/') => {
                let pattern = &s[1..s.len() - 1];
                let regex = Regex::new(&format!("^(?:{})$", pattern))
                    .map_err(|e| EmError::probe(format!("bad regex '{}': {}", s, e)))?;
                ProbeValue::Regex(regex)
            }
            other => ProbeValue::Literal(other.clone()),
        };
        conditions.push((key.clone(), condition));
    }

    Ok(ProbeAtom::Interface {
        name: name.to_string(),
        conditions,
    })
}

fn parse_tokens(tokens: &[Token]) -> Result<ProbeExpr> {
    let mut iter = tokens.iter();
    let first = match iter.next() {
        Some(Token::Atom(atom)) => atom.clone(),
        Some(Token::Op(op)) => {
            return Err(EmError::probe(format!("probe starts with operator {:?}", op)));
        }
        None => return Err(EmError::probe("empty probe")),
    };

    let mut rest = Vec::new();
    loop {
        match iter.next() {
            None => break,
            Some(Token::Op(op)) => match iter.next() {
                Some(Token::Atom(atom)) => rest.push((*op, atom.clone())),
                _ => return Err(EmError::probe("operator without right-hand atom")),
            },
            Some(Token::Atom(_)) => {
                return Err(EmError::probe("adjacent atoms without operator"));
            }
        }
    }

    Ok(ProbeExpr { first, rest })
}

/// Evaluate a probe against a snapshot, yielding every match.
pub fn evaluate(expr: &ProbeExpr, snapshot: &BusSnapshot) -> Vec<ProbeMatch> {
    let mut matches = eval_atom(&expr.first, snapshot);
    for (op, atom) in &expr.rest {
        let right = eval_atom(atom, snapshot);
        matches = match op {
            ProbeOp::And => merge_product(&matches, &right),
            ProbeOp::Or => union(matches, right),
        };
    }
    matches
}

fn eval_atom(atom: &ProbeAtom, snapshot: &BusSnapshot) -> Vec<ProbeMatch> {
    match atom {
        ProbeAtom::True => vec![ProbeMatch::default()],
        ProbeAtom::False => Vec::new(),
        ProbeAtom::Found(iface) => {
            let mut paths = BTreeSet::new();
            for objects in snapshot.values() {
                for (path, interfaces) in objects {
                    if interfaces.contains_key(iface) {
                        paths.insert(path.clone());
                    }
                }
            }
            if paths.is_empty() {
                Vec::new()
            } else {
                vec![ProbeMatch {
                    replacements: BTreeMap::new(),
                    paths,
                }]
            }
        }
        ProbeAtom::MatchOne(inner) => {
            let mut matches = evaluate(inner, snapshot);
            matches.truncate(1);
            matches
        }
        ProbeAtom::Interface { name, conditions } => {
            let mut matches = Vec::new();
            for objects in snapshot.values() {
                for (path, interfaces) in objects {
                    let Some(properties) = interfaces.get(name) else {
                        continue;
                    };
                    let satisfied = conditions.iter().all(|(key, expected)| {
                        properties.get(key).is_some_and(|actual| match expected {
                            ProbeValue::Literal(literal) => actual.matches_literal(literal),
                            ProbeValue::Regex(regex) => regex.is_match(&actual.to_string()),
                        })
                    });
                    if satisfied {
                        matches.push(ProbeMatch {
                            replacements: properties
                                .iter()
                                .map(|(k, v)| (k.clone(), v.to_json()))
                                .collect(),
                            paths: [path.clone()].into(),
                        });
                    }
                }
            }
            matches
        }
    }
}

/// Cartesian product with binding-merge; pairs that bind the same key to
/// different values are rejected.
fn merge_product(left: &[ProbeMatch], right: &[ProbeMatch]) -> Vec<ProbeMatch> {
    let mut out = Vec::new();
    for a in left {
        'pair: for b in right {
            let mut merged = a.clone();
            for (key, value) in &b.replacements {
                match merged.replacements.get(key) {
                    Some(existing) if existing != value => continue 'pair,
                    _ => {
                        merged.replacements.insert(key.clone(), value.clone());
                    }
                }
            }
            merged.paths.extend(b.paths.iter().cloned());
            out.push(merged);
        }
    }
    out
}

fn union(mut left: Vec<ProbeMatch>, right: Vec<ProbeMatch>) -> Vec<ProbeMatch> {
    for m in right {
        if !left.contains(&m) {
            left.push(m);
        }
    }
    left
}
