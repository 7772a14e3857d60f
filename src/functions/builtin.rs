//! Functions available to every deployment.

use anyhow::{Result, anyhow};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value, json};

use super::FunctionRegistry;
use crate::content::ContentEvent;

static URL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https?://(?:[a-zA-Z0-9$\-_@.&+!*(),]|%[0-9a-fA-F]{2})+")
        .expect("URL pattern is valid")
});

pub fn register_builtins(registry: FunctionRegistry) -> FunctionRegistry {
    registry
        .register_fn("text_length", text_length)
        .register_fn("keyword_count", keyword_count)
        .register_fn("has_url", has_url)
}

/// Number of characters in the body text.
pub fn text_length(
    content: &ContentEvent,
    _args: &[Value],
    _kwargs: &Map<String, Value>,
) -> Result<Value> {
    Ok(json!(content.record().text().chars().count()))
}

/// Total occurrences of the given keywords in the full text.
///
/// Keywords come from the first positional argument or the `keywords` kwarg.
pub fn keyword_count(
    content: &ContentEvent,
    args: &[Value],
    kwargs: &Map<String, Value>,
) -> Result<Value> {
    let keywords = args
        .first()
        .or_else(|| kwargs.get("keywords"))
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("keyword_count expects a list of keywords"))?;

    let text = content.record().full_text();
    let mut total = 0usize;
    for keyword in keywords {
        let keyword = keyword
            .as_str()
            .ok_or_else(|| anyhow!("keyword_count keywords must be strings"))?;
        if !keyword.is_empty() {
            total += text.matches(keyword).count();
        }
    }

    Ok(json!(total))
}

/// Whether the full text contains an http(s) link.
pub fn has_url(
    content: &ContentEvent,
    _args: &[Value],
    _kwargs: &Map<String, Value>,
) -> Result<Value> {
    Ok(json!(URL_PATTERN.is_match(&content.record().full_text())))
}
