//! Parsing of `key=value` prompt arguments with shell-style quoting.

use std::collections::HashMap;

pub(super) fn parse_kv_args(input: &str) -> Result<HashMap<String, String>, String> {
    if input.trim().is_empty() {
        return Ok(HashMap::new());
    }

    let mut args = HashMap::new();
    for token in split_tokens(input)? {
        let Some((key, value)) = token.split_once('=') else {
            return Err(format!(
                "Prompt arguments take the form key=value; got '{token}'."
            ));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err("Prompt argument names cannot be empty.".to_string());
        }
        args.insert(key.to_string(), value.to_string());
    }

    Ok(args)
}

/// Splits on unquoted whitespace; a matching pair of `'` or `"` groups
/// the enclosed text into one token.
fn split_tokens(input: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut pending = String::new();
    let mut quote: Option<char> = None;

    for ch in input.chars() {
        match (ch, quote) {
            ('"' | '\'', None) => quote = Some(ch),
            (c, Some(open)) if c == open => quote = None,
            (c, None) if c.is_whitespace() => {
                if !pending.is_empty() {
                    tokens.push(std::mem::take(&mut pending));
                }
            }
            (c, _) => pending.push(c),
        }
    }

    if let Some(open) = quote {
        return Err(format!(
            "Prompt arguments contain an unterminated {open} quote."
        ));
    }
    if !pending.is_empty() {
        tokens.push(pending);
    }
    Ok(tokens)
}
