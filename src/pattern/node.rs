//! The per-segment AST behind `SegmentPattern`: parsing, substitution,
//! and regex synthesis.

use indexmap::IndexMap;

use super::PatternError;

/// One node of a parsed segment expression.
///
/// `Text` holds unescaped literal text: `%%` in the source has already
/// become a plain `%` by the time it lands here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Node {
    Text(String),
    Variable {
        key: String,
        modifier: Option<Modifier>,
    },
    Conditional(Vec<Node>),
    IfElse {
        left: Vec<Node>,
        right: Vec<Node>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Modifier {
    Lower,
    Upper,
    Title,
}

impl Modifier {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '_' => Some(Modifier::Lower),
            '^' => Some(Modifier::Upper),
            '!' => Some(Modifier::Title),
            _ => None,
        }
    }

    fn apply(self, value: &str) -> String {
        match self {
            Modifier::Lower => value.to_lowercase(),
            Modifier::Upper => value.to_uppercase(),
            Modifier::Title => title_case(value),
        }
    }
}

/// Uppercases the first cased character of every cased run and
/// lowercases the rest of the run, so `it's` becomes `It'S`.
fn title_case(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut previous_cased = false;

    for ch in value.chars() {
        let cased = ch.is_alphabetic();
        if cased && !previous_cased {
            result.extend(ch.to_uppercase());
        } else if cased {
            result.extend(ch.to_lowercase());
        } else {
            result.push(ch);
        }
        previous_cased = cased;
    }

    result
}

/// A substitution attempt that could not complete, with every key that
/// was missing along the way.
#[derive(Debug)]
pub(super) struct FillFailure {
    pub keys: Vec<String>,
}

/// Parses a whole segment expression into nodes.
///
/// Node forms are tried in a fixed priority order against the input; a
/// round that consumes nothing is a syntax error at that offset.
pub(super) fn parse_expression(expression: &str) -> Result<Vec<Node>, PatternError> {
    let mut nodes = Vec::new();
    let mut rest = expression;

    while !rest.is_empty() {
        let parsed = match consume_if_else(rest)? {
            Some(step) => Some(step),
            None => match consume_conditional(rest)? {
                Some(step) => Some(step),
                None => consume_text(rest)
                    .or_else(|| consume_long_variable(rest))
                    .or_else(|| consume_short_variable(rest)),
            },
        };

        match parsed {
            Some((node, consumed)) => {
                nodes.push(node);
                rest = &rest[consumed..];
            }
            None => {
                return Err(PatternError::syntax(
                    expression,
                    expression.len() - rest.len(),
                ));
            }
        }
    }

    Ok(nodes)
}

/// Consumes the `%? ... %?` delimiters shared by conditionals and
/// if/else groups. Groups close at the first `%?` after the opener;
/// there is no nesting.
fn consume_group(s: &str) -> Option<(&str, usize)> {
    let rest = s.strip_prefix("%?")?;
    let close = rest.find("%?")?;
    Some((&rest[..close], 2 + close + 2))
}

fn consume_if_else(s: &str) -> Result<Option<(Node, usize)>, PatternError> {
    let (contents, consumed) = match consume_group(s) {
        Some(group) => group,
        None => return Ok(None),
    };
    let split_at = match contents.find("%:") {
        Some(index) => index,
        None => return Ok(None),
    };

    let left = parse_expression(&contents[..split_at])?;
    let right = parse_expression(&contents[split_at + 2..])?;
    Ok(Some((Node::IfElse { left, right }, consumed)))
}

fn consume_conditional(s: &str) -> Result<Option<(Node, usize)>, PatternError> {
    let (contents, consumed) = match consume_group(s) {
        Some(group) => group,
        None => return Ok(None),
    };

    let children = parse_expression(contents)?;
    Ok(Some((Node::Conditional(children), consumed)))
}

fn consume_text(s: &str) -> Option<(Node, usize)> {
    let mut chars = s.char_indices().peekable();
    let mut text = String::new();
    let mut end = 0;

    while let Some((index, ch)) = chars.next() {
        if ch == '%' {
            match chars.peek() {
                Some((_, '%')) => {
                    chars.next();
                    text.push('%');
                    end = index + 2;
                }
                _ => break,
            }
        } else {
            text.push(ch);
            end = index + ch.len_utf8();
        }
    }

    if end == 0 {
        None
    } else {
        Some((Node::Text(text), end))
    }
}

fn consume_long_variable(s: &str) -> Option<(Node, usize)> {
    let rest = s.strip_prefix('%')?;
    let (modifier, rest, modifier_len) = match rest.chars().next().and_then(Modifier::from_char) {
        Some(modifier) => (Some(modifier), &rest[1..], 1),
        None => (None, rest, 0),
    };

    let body = rest.strip_prefix('{')?;
    let close = body.find('}')?;
    if close == 0 {
        return None;
    }

    let key = body[..close].to_owned();
    Some((
        Node::Variable { key, modifier },
        1 + modifier_len + 1 + close + 1,
    ))
}

fn consume_short_variable(s: &str) -> Option<(Node, usize)> {
    let rest = s.strip_prefix('%')?;
    let mut chars = rest.chars();
    let first = chars.next()?;

    match Modifier::from_char(first) {
        Some(modifier) => {
            let key = chars.next()?;
            if !key.is_ascii_alphabetic() {
                return None;
            }
            Some((
                Node::Variable {
                    key: key.to_string(),
                    modifier: Some(modifier),
                },
                3,
            ))
        }
        None => {
            if !first.is_ascii_alphabetic() {
                return None;
            }
            Some((
                Node::Variable {
                    key: first.to_string(),
                    modifier: None,
                },
                2,
            ))
        }
    }
}

/// Substitutes into a node list, concatenating the pieces.
pub(super) fn fill_nodes(
    nodes: &[Node],
    substitutions: &IndexMap<String, String>,
) -> Result<String, FillFailure> {
    let mut out = String::new();
    for node in nodes {
        out.push_str(&node.fill(substitutions)?);
    }
    Ok(out)
}

impl Node {
    fn fill(&self, substitutions: &IndexMap<String, String>) -> Result<String, FillFailure> {
        match self {
            Node::Text(text) => Ok(text.clone()),
            Node::Variable { key, modifier } => match substitutions.get(key) {
                Some(value) => Ok(match modifier {
                    Some(modifier) => modifier.apply(value),
                    None => value.clone(),
                }),
                None => Err(FillFailure {
                    keys: vec![key.clone()],
                }),
            },
            Node::Conditional(children) => {
                Ok(fill_nodes(children, substitutions).unwrap_or_default())
            }
            Node::IfElse { left, right } => match fill_nodes(left, substitutions) {
                Ok(filled) => Ok(filled),
                Err(left_failure) => match fill_nodes(right, substitutions) {
                    Ok(filled) => Ok(filled),
                    Err(right_failure) => {
                        let mut keys = left_failure.keys;
                        keys.extend(right_failure.keys);
                        Err(FillFailure { keys })
                    }
                },
            },
        }
    }

    /// Appends this node's regex form to `out`, allocating capture groups
    /// in emission order.
    pub(super) fn append_regex(
        &self,
        substitutions: &IndexMap<String, String>,
        table: &mut GroupTable,
        out: &mut String,
    ) {
        match self {
            Node::Text(text) => out.push_str(&regex::escape(text)),
            Node::Variable { key, .. } => {
                let name = table.allocate(key);
                out.push_str("(?P<");
                out.push_str(&name);
                out.push_str(">.+?)");
            }
            Node::Conditional(children) => {
                out.push_str("(?:");
                for child in children {
                    child.append_regex(substitutions, table, out);
                }
                out.push_str(")?");
            }
            Node::IfElse { left, right } => {
                let (first, second) = order_branches(left, right, substitutions);
                out.push_str("(?:");
                for child in first {
                    child.append_regex(substitutions, table, out);
                }
                out.push('|');
                for child in second {
                    child.append_regex(substitutions, table, out);
                }
                out.push(')');
            }
        }
    }
}

/// Chooses which if/else branch to try first when matching.
///
/// The branch with fewer unresolved variables goes first; a key counts
/// as resolved when it appears in the substitutions the splitter was
/// compiled against. Ties fall back to fewer variable occurrences in
/// total, then to the left branch.
fn order_branches<'a>(
    left: &'a [Node],
    right: &'a [Node],
    substitutions: &IndexMap<String, String>,
) -> (&'a [Node], &'a [Node]) {
    let mut left_keys = Vec::new();
    collect_variable_keys(left, &mut left_keys);
    let mut right_keys = Vec::new();
    collect_variable_keys(right, &mut right_keys);

    let left_unknown = left_keys
        .iter()
        .filter(|key| !substitutions.contains_key(*key))
        .count();
    let right_unknown = right_keys
        .iter()
        .filter(|key| !substitutions.contains_key(*key))
        .count();

    if left_unknown < right_unknown {
        (left, right)
    } else if left_unknown > right_unknown {
        (right, left)
    } else if left_keys.len() <= right_keys.len() {
        (left, right)
    } else {
        (right, left)
    }
}

fn collect_variable_keys(nodes: &[Node], keys: &mut Vec<String>) {
    for node in nodes {
        match node {
            Node::Text(_) => {}
            Node::Variable { key, .. } => keys.push(key.clone()),
            Node::Conditional(children) => collect_variable_keys(children, keys),
            Node::IfElse { left, right } => {
                collect_variable_keys(left, keys);
                collect_variable_keys(right, keys);
            }
        }
    }
}

/// Allocates regex capture group names and remembers which tag key each
/// one belongs to. Names reuse the key where the key is a safe group
/// name; repeats and unsafe keys get derived names instead.
pub(super) struct GroupTable {
    groups: Vec<(String, String)>,
}

impl GroupTable {
    pub(super) fn new() -> Self {
        Self { groups: Vec::new() }
    }

    fn allocate(&mut self, key: &str) -> String {
        let mut name = if is_group_name(key) {
            key.to_owned()
        } else {
            format!("v{}", self.groups.len())
        };
        while self.groups.iter().any(|(existing, _)| existing == &name) {
            name.push('_');
        }

        self.groups.push((name.clone(), key.to_owned()));
        name
    }

    pub(super) fn into_groups(self) -> Vec<(String, String)> {
        self.groups
    }
}

fn is_group_name(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
