//! Cards from JSON the set page fetched from the web API while loading.

use super::next_data::{find_terms, parse_term, CONTAINER_KEYS};
use super::EntryResult;
use crate::browser::CapturedResponse;
use serde_json::Value;

/// How deep below the top level a container key may sit.
const MAX_MARKER_DEPTH: usize = 3;

/// Arrays are searched without counting as a level.
fn has_container_key(value: &Value, depth: usize) -> bool {
    match value {
        Value::Object(obj) => obj.iter().any(|(key, child)| {
            CONTAINER_KEYS.contains(&key.as_str())
                || (depth < MAX_MARKER_DEPTH && has_container_key(child, depth + 1))
        }),
        Value::Array(items) => items.iter().any(|item| has_container_key(item, depth)),
        _ => false,
    }
}

/// Whether a response body looks like flashcard data.
pub fn is_card_payload(value: &Value) -> bool {
    value.is_object() && has_container_key(value, 0)
}

/// Entries from the captured response with the longest term list. Later
/// responses win ties. `None` when no response carried terms.
pub fn captured_entries(responses: &[CapturedResponse]) -> Option<Vec<EntryResult>> {
    let payloads: Vec<Value> = responses
        .iter()
        .filter_map(|r| match serde_json::from_str::<Value>(&r.body) {
            Ok(value) if is_card_payload(&value) => Some(value),
            Ok(_) => None,
            Err(e) => {
                log::debug!("Ignoring unparseable API response from {}: {}", r.url, e);
                None
            }
        })
        .collect();

    let terms = payloads
        .iter()
        .filter_map(find_terms)
        .filter(|terms| !terms.is_empty())
        .fold(None::<&Vec<Value>>, |best, terms| match best {
            Some(best) if best.len() > terms.len() => Some(best),
            _ => Some(terms),
        })?;

    Some(terms.iter().enumerate().map(|(i, term)| parse_term(term, i)).collect())
}
