//! Cards from the `__NEXT_DATA__` JSON payload embedded in set pages.

use super::{CardLayout, EntryResult};
use crate::browser::dom;
use crate::models::Card;
use async_trait::async_trait;
use scraper::Html;
use serde_json::Value;

const SCRIPT: &str = "script#__NEXT_DATA__";

/// Keys under which the service nests the term list.
pub(super) const CONTAINER_KEYS: &[&str] = &["studiableItem", "terms", "cards", "studiableData"];
/// Keys that identify an object as a term.
const TERM_KEYS: &[&str] = &["word", "term", "definition", "cardSides"];

#[derive(Debug, Default)]
pub struct NextDataLayout;

fn payload(html: &str) -> Option<Value> {
    let sel = dom::selector(SCRIPT).ok()?;
    let document = Html::parse_document(html);
    let raw: String = document.select(&sel).next()?.text().collect();
    serde_json::from_str(&raw).ok()
}

fn looks_like_term(value: &Value) -> bool {
    value
        .as_object()
        .map(|obj| TERM_KEYS.iter().any(|k| obj.contains_key(*k)))
        .unwrap_or(false)
}

/// First array of term objects, searching the known container keys before
/// any other nesting.
pub(super) fn find_terms(value: &Value) -> Option<&Vec<Value>> {
    match value {
        Value::Array(items) => {
            if items.first().map(looks_like_term).unwrap_or(false) {
                return Some(items);
            }
            items.iter().find_map(find_terms)
        }
        Value::Object(obj) => CONTAINER_KEYS
            .iter()
            .filter_map(|k| obj.get(*k))
            .find_map(find_terms)
            .or_else(|| obj.values().find_map(find_terms)),
        _ => None,
    }
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn media_is(media: &Value, name: &str, code: u64) -> bool {
    match media.get("type") {
        Some(Value::String(s)) => s == name,
        Some(Value::Number(n)) => n.as_u64() == Some(code),
        _ => false,
    }
}

pub(super) fn parse_term(term: &Value, position: usize) -> EntryResult {
    let mut word = None;
    let mut definition = None;
    let mut image_url = None;

    if let Some(sides) = term.get("cardSides").and_then(Value::as_array) {
        for side in sides {
            let label = side.get("label").and_then(Value::as_str).unwrap_or_default();
            let media = side.get("media").and_then(Value::as_array);
            for m in media.into_iter().flatten() {
                if media_is(m, "text", 1) {
                    let text = non_empty(m.get("plainText"));
                    match label {
                        "word" => word = word.or(text),
                        "definition" => definition = definition.or(text),
                        _ => {}
                    }
                } else if media_is(m, "image", 2) {
                    image_url = image_url.or_else(|| non_empty(m.get("url")));
                }
            }
        }
    }

    let word = word
        .or_else(|| non_empty(term.get("word")))
        .or_else(|| non_empty(term.get("term")))
        .or_else(|| non_empty(term.get("front")))
        .ok_or_else(|| format!("card {} has no term text", position + 1))?;
    let definition = definition
        .or_else(|| non_empty(term.get("definition")))
        .or_else(|| non_empty(term.get("back")))
        .ok_or_else(|| format!("card {} has no definition text", position + 1))?;
    let image_url = image_url
        .or_else(|| non_empty(term.get("image")))
        .or_else(|| non_empty(term.get("imageUrl")))
        .or_else(|| non_empty(term.get("_imageUrl")));

    let choices: Vec<String> = term
        .get("choices")
        .or_else(|| term.get("options"))
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|c| non_empty(Some(c))).collect())
        .unwrap_or_default();
    let correct_answer = non_empty(term.get("correctAnswer")).or_else(|| non_empty(term.get("answer")));

    Ok(Card {
        term: word,
        definition,
        image_url,
        choices,
        correct_answer,
    })
}

#[async_trait]
impl CardLayout for NextDataLayout {
    fn version(&self) -> &'static str {
        "next-data"
    }

    fn detect(&self, html: &str) -> bool {
        self.entry_count(html) > 0
    }

    fn entry_count(&self, html: &str) -> usize {
        payload(html)
            .as_ref()
            .and_then(find_terms)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn parse_entries(&self, html: &str) -> Vec<EntryResult> {
        let Some(data) = payload(html) else {
            return Vec::new();
        };
        find_terms(&data)
            .map(|terms| {
                terms
                    .iter()
                    .enumerate()
                    .map(|(i, term)| parse_term(term, i))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn page(data: Value) -> String {
        format!(
            r#"<html><body><div id="__next"></div><script id="__NEXT_DATA__" type="application/json">{}</script></body></html>"#,
            data
        )
    }

    #[test]
    fn test_card_sides_shape() {
        let html = page(json!({
            "props": {"pageProps": {"dehydratedReduxStateKey": {"setPage": {"studiableItem": [
                {"id": 1, "cardSides": [
                    {"label": "word", "media": [{"type": 1, "plainText": "Mitochondria"}]},
                    {"label": "definition", "media": [
                        {"type": 1, "plainText": "Powerhouse of the cell"},
                        {"type": 2, "url": "https://img.test/mito.png"}
                    ]}
                ]}
            ]}}}}
        }));
        let entries = NextDataLayout.parse_entries(&html);
        assert_eq!(entries.len(), 1);
        let card = entries[0].as_ref().unwrap();
        assert_eq!(card.term, "Mitochondria");
        assert_eq!(card.definition, "Powerhouse of the cell");
        assert_eq!(card.image_url.as_deref(), Some("https://img.test/mito.png"));
    }

    #[test]
    fn test_word_definition_shape_with_choices() {
        let html = page(json!({"terms": [
            {"word": "2 + 2", "definition": "4", "choices": ["3", "4", "5"], "correctAnswer": "4"},
            {"word": "", "definition": "orphan"}
        ]}));
        let entries = NextDataLayout.parse_entries(&html);
        let first = entries[0].as_ref().unwrap();
        assert_eq!(first.choices, vec!["3", "4", "5"]);
        assert_eq!(first.correct_answer.as_deref(), Some("4"));
        assert_eq!(entries[1], Err("card 2 has no term text".to_string()));
    }

    #[test]
    fn test_payload_without_terms() {
        let html = page(json!({"props": {"pageProps": {"title": "nothing here"}}}));
        assert_eq!(NextDataLayout.entry_count(&html), 0);
        assert!(!NextDataLayout.detect(&html));
        assert!(NextDataLayout.parse_entries("<p>no script</p>").is_empty());
    }
}
