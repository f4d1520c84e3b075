//! HTML lookups for the server-rendered portal pages.
//!
//! Kept synchronous: `scraper::Html` is not `Send`, so documents are parsed
//! and dropped before the caller awaits anything.

use scraper::{ElementRef, Html, Selector};

use crate::pipeline::UsageError;

const LOGOUT_TEXT: &[&str] = &["log out", "logout", "sign out"];

fn parse_selector(selector: &str) -> Result<Selector, UsageError> {
    Selector::parse(selector)
        .map_err(|e| UsageError::Config(format!("invalid selector '{selector}': {e:?}")))
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Value of the `<input name="{field}">` anti-forgery token, if the form has one.
pub fn csrf_token(html: &str, field: &str) -> Result<Option<String>, UsageError> {
    let selector = parse_selector(&format!(r#"input[name="{field}"]"#))?;
    let doc = Html::parse_document(html);

    let token = doc
        .select(&selector)
        .filter_map(|el| el.value().attr("value"))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string);
    Ok(token)
}

/// Whether the page offers a way to log out, i.e. the session is authenticated.
pub fn has_logout_affordance(html: &str, logout_selector: &str) -> Result<bool, UsageError> {
    let selector = parse_selector(logout_selector)?;
    let doc = Html::parse_document(html);

    if doc.select(&selector).next().is_some() {
        return Ok(true);
    }

    let clickable = parse_selector("a, button")?;
    let found = doc.select(&clickable).any(|el| {
        let text = element_text(el).to_lowercase();
        LOGOUT_TEXT.iter().any(|needle| text.contains(needle))
    });
    Ok(found)
}

/// Whitespace-collapsed text of the first element matching `usage_selector`.
pub fn usage_element_text(html: &str, usage_selector: &str) -> Result<Option<String>, UsageError> {
    let selector = parse_selector(usage_selector)?;
    let doc = Html::parse_document(html);

    let text = doc
        .select(&selector)
        .map(element_text)
        .find(|text| !text.is_empty());
    Ok(text)
}
