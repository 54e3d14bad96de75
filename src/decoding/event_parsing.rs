use alloy::dyn_abi::DynSolType;
use alloy::primitives::{keccak256, B256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventParseError {
    #[error("Invalid event signature: {0}")]
    InvalidSignature(String),
    #[error("Failed to parse type '{0}': {1}")]
    TypeParse(String, String),
    #[error("Missing closing parenthesis in '{0}'")]
    MissingCloseParen(String),
    #[error("Invalid parameter '{0}'")]
    InvalidParam(String),
    #[error("Anonymous events are not supported: {0}")]
    Anonymous(String),
}

/// Parsed event parameter
#[derive(Debug, Clone, PartialEq)]
pub struct EventParam {
    /// Declared name, or `arg{position}` when the signature leaves it out
    pub name: String,
    pub param_type: DynSolType,
    /// Canonical type as it appears in the canonical signature
    pub type_string: String,
    pub indexed: bool,
}

/// Parsed event definition
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub name: String,
    pub signature: String,
    pub canonical_signature: String,
    pub topic0: B256,
    pub params: Vec<EventParam>,
}

impl ParsedEvent {
    /// Parse a human-readable signature such as
    /// `event Transfer(address indexed from, address indexed to, uint256 indexed tokenId)`.
    /// The leading `event` keyword and a trailing `;` are optional. Tuple
    /// parameters may carry field names, which are dropped from the
    /// canonical form.
    pub fn from_signature(signature: &str) -> Result<Self, EventParseError> {
        let trimmed = signature.trim().trim_end_matches(';').trim();
        let body = trimmed.strip_prefix("event ").unwrap_or(trimmed).trim();

        let open_paren = body
            .find('(')
            .ok_or_else(|| EventParseError::InvalidSignature(signature.to_string()))?;

        let name = body[..open_paren].trim().to_string();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(EventParseError::InvalidSignature(signature.to_string()));
        }

        let close_paren = find_matching_close_paren(body, open_paren)
            .ok_or_else(|| EventParseError::MissingCloseParen(signature.to_string()))?;

        match body[close_paren + 1..].trim() {
            "" => {}
            "anonymous" => return Err(EventParseError::Anonymous(signature.to_string())),
            _ => return Err(EventParseError::InvalidSignature(signature.to_string())),
        }

        let params = split_top_level(&body[open_paren + 1..close_paren])
            .into_iter()
            .enumerate()
            .map(|(i, p)| parse_param(p, i))
            .collect::<Result<Vec<_>, _>>()?;

        let type_strings: Vec<&str> = params.iter().map(|p| p.type_string.as_str()).collect();
        let canonical_signature = format!("{}({})", name, type_strings.join(","));
        let topic0 = keccak256(canonical_signature.as_bytes());

        Ok(ParsedEvent {
            name,
            signature: signature.trim().to_string(),
            canonical_signature,
            topic0,
            params,
        })
    }

    pub fn indexed_params(&self) -> impl Iterator<Item = &EventParam> {
        self.params.iter().filter(|p| p.indexed)
    }

    pub fn data_params(&self) -> impl Iterator<Item = &EventParam> {
        self.params.iter().filter(|p| !p.indexed)
    }

    pub fn indexed_count(&self) -> usize {
        self.indexed_params().count()
    }

    /// Same canonical event with the same `indexed` layout, so both decode
    /// any matching log identically.
    pub fn same_layout(&self, other: &ParsedEvent) -> bool {
        self.topic0 == other.topic0
            && self.params.len() == other.params.len()
            && self
                .params
                .iter()
                .zip(&other.params)
                .all(|(a, b)| a.type_string == b.type_string && a.indexed == b.indexed)
    }
}

fn find_matching_close_paren(s: &str, open_pos: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s[open_pos..].char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(open_pos + i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on commas that are not nested inside parentheses.
fn split_top_level(s: &str) -> Vec<&str> {
    if s.trim().is_empty() {
        return Vec::new();
    }

    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts
}

/// Split a parameter into its type text and the words after it.
fn split_type_and_rest(param: &str) -> Result<(&str, Vec<&str>), EventParseError> {
    let type_end = if param.starts_with('(') {
        let close = find_matching_close_paren(param, 0)
            .ok_or_else(|| EventParseError::MissingCloseParen(param.to_string()))?;
        // array suffixes such as `[]` or `[2]` belong to the type
        param[close + 1..]
            .find(char::is_whitespace)
            .map(|i| close + 1 + i)
            .unwrap_or(param.len())
    } else {
        param.find(char::is_whitespace).unwrap_or(param.len())
    };

    let rest = param[type_end..].split_whitespace().collect();
    Ok((&param[..type_end], rest))
}

/// Canonical form of a type, with tuple field names removed and aliases
/// such as `uint` expanded.
fn canonical_type(type_text: &str) -> Result<String, EventParseError> {
    let text = type_text.trim();
    let raw = if text.starts_with('(') {
        let close = find_matching_close_paren(text, 0)
            .ok_or_else(|| EventParseError::MissingCloseParen(text.to_string()))?;
        let fields = split_top_level(&text[1..close])
            .into_iter()
            .map(|field| {
                if field.is_empty() {
                    return Err(EventParseError::InvalidParam(text.to_string()));
                }
                let (ty, _) = split_type_and_rest(field)?;
                canonical_type(ty)
            })
            .collect::<Result<Vec<_>, _>>()?;
        format!("({}){}", fields.join(","), &text[close + 1..])
    } else {
        text.to_string()
    };

    let parsed = DynSolType::parse(&raw)
        .map_err(|e| EventParseError::TypeParse(raw.clone(), e.to_string()))?;
    Ok(parsed.sol_type_name().into_owned())
}

fn parse_param(param: &str, position: usize) -> Result<EventParam, EventParseError> {
    if param.is_empty() {
        return Err(EventParseError::InvalidParam(param.to_string()));
    }

    let (type_text, rest) = split_type_and_rest(param)?;
    let (indexed, name) = match rest.as_slice() {
        [] => (false, None),
        ["indexed"] => (true, None),
        ["indexed", name] => (true, Some(*name)),
        [name] => (false, Some(*name)),
        _ => return Err(EventParseError::InvalidParam(param.to_string())),
    };

    let type_string = canonical_type(type_text)?;
    let param_type = DynSolType::parse(&type_string)
        .map_err(|e| EventParseError::TypeParse(type_string.clone(), e.to_string()))?;

    Ok(EventParam {
        name: name
            .map(str::to_string)
            .unwrap_or_else(|| format!("arg{}", position)),
        param_type,
        type_string,
        indexed,
    })
}
