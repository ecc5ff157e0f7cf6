//! Small HTML helpers over `scraper`.

use super::BrowserError;
use scraper::{ElementRef, Html, Selector};

pub fn selector(css: &str) -> Result<Selector, BrowserError> {
    Selector::parse(css).map_err(|e| BrowserError::InvalidSelector(format!("{}: {}", css, e)))
}

pub fn matches(html: &str, css: &str) -> Result<bool, BrowserError> {
    let sel = selector(css)?;
    Ok(Html::parse_document(html).select(&sel).next().is_some())
}

/// Trimmed text of an element, or `None` when it is blank.
pub fn text_of(element: ElementRef<'_>) -> Option<String> {
    let text = element.text().collect::<String>();
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

pub fn first_text(html: &str, css: &str) -> Result<Option<String>, BrowserError> {
    let sel = selector(css)?;
    let document = Html::parse_document(html);
    Ok(document.select(&sel).find_map(text_of))
}

/// Whether some element's whole trimmed text is exactly `marker`.
///
/// Text that merely mentions the marker inside a longer string, or spread
/// over sibling elements, does not count.
pub fn has_text(html: &str, marker: &str) -> bool {
    let document = Html::parse_document(html);
    document
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(|el| !matches!(el.value().name(), "script" | "style" | "noscript"))
        .filter_map(text_of)
        .any(|text| text == marker)
}
