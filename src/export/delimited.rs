//! The `/answer/` + `/question/` text format that Quizlet's import dialog
//! accepts with custom separators.
//!
//! A block per set: comment lines starting with `#`, then the whole card
//! sequence on one line. Blocks are separated by a blank line.
//!
//! Field text is escaped with `\`:
//!
//! | raw | written |
//! |---|---|
//! | `\` | `\\` |
//! | newline | `\n` |
//! | carriage return | `\r` |
//! | `#` at the start of a field | `\#` |
//! | a `/` that begins or is inside a separator token | `\/` |
//!
//! "Inside a separator token" also covers a field that ends with the start of
//! a token (`x/answer`), since the separator that follows would complete it.
//! A field without any of these is written verbatim, so ordinary sets read
//! exactly as Quizlet expects.

use crate::error::{Error, Result};
use crate::models::{Card, ScrapeResult};

pub const TERM_SEPARATOR: &str = "/answer/";
pub const CARD_SEPARATOR: &str = "/question/";
pub const IMAGE_SEPARATOR: &str = "/image/";
pub const ESCAPE: char = '\\';

const TOKENS: [&str; 3] = [TERM_SEPARATOR, CARD_SEPARATOR, IMAGE_SEPARATOR];

fn mark_slashes(field: &str, range: std::ops::Range<usize>, marked: &mut [bool]) {
    for (offset, b) in field.as_bytes()[range.clone()].iter().enumerate() {
        if *b == b'/' {
            marked[range.start + offset] = true;
        }
    }
}

/// Escapes one term, definition or image URL.
pub fn escape_field(field: &str) -> String {
    let mut marked = vec![false; field.len()];
    for token in TOKENS {
        let mut from = 0;
        while let Some(pos) = field[from..].find(token) {
            let at = from + pos;
            mark_slashes(field, at..at + token.len(), &mut marked);
            from = at + 1;
        }
        for len in 1..token.len() {
            if field.ends_with(&token[..len]) {
                mark_slashes(field, field.len() - len..field.len(), &mut marked);
            }
        }
    }

    let mut out = String::with_capacity(field.len());
    for (i, c) in field.char_indices() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '#' if i == 0 => out.push_str("\\#"),
            '/' if marked[i] => out.push_str("\\/"),
            _ => out.push(c),
        }
    }
    out
}

fn header_text(text: &str) -> String {
    text.replace(['\r', '\n'], " ")
}

/// Serializes scrape results into the delimited format.
///
/// Output depends only on the input: identical results encode to identical
/// bytes. Placeholder cards are left out of the body and accounted for in
/// the `Completeness` header line.
#[derive(Debug, Clone, Copy)]
pub struct DelimitedEncoder {
    pub include_images: bool,
}

impl Default for DelimitedEncoder {
    fn default() -> Self {
        Self { include_images: true }
    }
}

impl DelimitedEncoder {
    pub fn encode(&self, results: &[ScrapeResult]) -> String {
        let blocks: Vec<String> = results.iter().map(|r| self.encode_set(r)).collect();
        let mut out = blocks.join("\n\n");
        out.push('\n');
        out
    }

    fn encode_set(&self, result: &ScrapeResult) -> String {
        let mut lines = vec![
            format!("# {}", header_text(&result.set.title)),
            format!("# Set ID: {}", header_text(&result.set.id)),
            format!("# Cards: {}", result.parsed_cards().count()),
            format!("# Source: {}", result.set.source),
            format!("# Completeness: {}", result.completeness),
            "#".to_string(),
            "# Import settings:".to_string(),
            format!("#   Between term and definition: {}", TERM_SEPARATOR),
            format!("#   Between cards: {}", CARD_SEPARATOR),
        ];
        if self.include_images {
            lines.push(format!("#   Image tag: {}", IMAGE_SEPARATOR));
        }
        lines.push(format!("#   Escape character: {}", ESCAPE));
        lines.push("#".to_string());

        let body: Vec<String> = result.parsed_cards().map(|card| self.encode_card(card)).collect();
        lines.push(body.join(CARD_SEPARATOR));
        lines.join("\n")
    }

    fn encode_card(&self, card: &Card) -> String {
        let mut out = format!(
            "{}{}{}",
            escape_field(&card.term),
            TERM_SEPARATOR,
            escape_field(&card.definition)
        );
        if self.include_images {
            if let Some(url) = &card.image_url {
                out.push_str(IMAGE_SEPARATOR);
                out.push_str(&escape_field(url));
            }
        }
        out
    }
}

/// One set read back from a delimited export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedSet {
    pub title: String,
    pub id: Option<String>,
    pub cards: Vec<Card>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Term,
    Definition,
    Image,
}

#[derive(Default)]
struct CardBuilder {
    term: String,
    definition: String,
    image_url: Option<String>,
}

/// Splits one body line into cards, undoing the field escapes.
fn decode_body(body: &str) -> Result<Vec<Card>> {
    let mut cards = Vec::new();
    if body.is_empty() {
        return Ok(cards);
    }

    let mut slot = Slot::Term;
    let mut current = CardBuilder::default();
    let mut field = String::new();
    let mut rest = body;

    while let Some(c) = rest.chars().next() {
        if c == ESCAPE {
            let next = rest[1..]
                .chars()
                .next()
                .ok_or_else(|| Error::Decode("dangling escape at end of line".into()))?;
            field.push(match next {
                'n' => '\n',
                'r' => '\r',
                other => other,
            });
            rest = &rest[1 + next.len_utf8()..];
            continue;
        }

        if let Some(token) = TOKENS.iter().find(|t| rest.starts_with(**t)) {
            let value = std::mem::take(&mut field);
            match (*token, slot) {
                (TERM_SEPARATOR, Slot::Term) => {
                    current.term = value;
                    slot = Slot::Definition;
                }
                (IMAGE_SEPARATOR, Slot::Definition) => {
                    current.definition = value;
                    slot = Slot::Image;
                }
                (CARD_SEPARATOR, Slot::Definition) => {
                    current.definition = value;
                    cards.push(finish(std::mem::take(&mut current)));
                    slot = Slot::Term;
                }
                (CARD_SEPARATOR, Slot::Image) => {
                    current.image_url = Some(value);
                    cards.push(finish(std::mem::take(&mut current)));
                    slot = Slot::Term;
                }
                (token, _) => {
                    return Err(Error::Decode(format!(
                        "unexpected {} in card {}",
                        token,
                        cards.len() + 1
                    )))
                }
            }
            rest = &rest[token.len()..];
            continue;
        }

        field.push(c);
        rest = &rest[c.len_utf8()..];
    }

    match slot {
        Slot::Term => {
            return Err(Error::Decode(format!(
                "card {} has no {}",
                cards.len() + 1,
                TERM_SEPARATOR
            )))
        }
        Slot::Definition => current.definition = field,
        Slot::Image => current.image_url = Some(field),
    }
    cards.push(finish(current));
    Ok(cards)
}

fn finish(builder: CardBuilder) -> Card {
    Card {
        image_url: builder.image_url,
        ..Card::new(builder.term, builder.definition)
    }
}

/// Reads a delimited export back into cards.
pub fn decode(text: &str) -> Result<Vec<DecodedSet>> {
    let mut sets = Vec::new();
    let mut current: Option<DecodedSet> = None;
    let mut body_seen = false;

    for line in text.lines() {
        if let Some(comment) = line.strip_prefix('#') {
            if current.is_none() || body_seen {
                if let Some(done) = current.take() {
                    sets.push(done);
                }
                current = Some(DecodedSet {
                    title: comment.trim().to_string(),
                    ..DecodedSet::default()
                });
                body_seen = false;
            } else if let (Some(set), Some(id)) = (current.as_mut(), comment.trim().strip_prefix("Set ID:")) {
                set.id = Some(id.trim().to_string());
            }
            continue;
        }
        if body_seen {
            if line.is_empty() {
                continue;
            }
            return Err(Error::Decode("more than one body line in a set".into()));
        }
        let set = current.get_or_insert_with(DecodedSet::default);
        set.cards = decode_body(line)?;
        body_seen = true;
    }
    if let Some(done) = current {
        sets.push(done);
    }
    Ok(sets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CardEntry, SetMetadata, SetSource};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn result(cards: Vec<Card>) -> ScrapeResult {
        let mut result = ScrapeResult::from_entries(
            SetMetadata {
                id: "555".into(),
                title: "Cell Biology".into(),
                url: "https://quizlet.com/555/cell-biology-flash-cards/".into(),
                card_count: None,
                source: SetSource::Owned,
                discovered_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            },
            cards.into_iter().map(CardEntry::Parsed).collect(),
        );
        result.extracted_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        result
    }

    #[test]
    fn test_plain_fields_are_verbatim() {
        assert_eq!(escape_field("Powerhouse of the cell"), "Powerhouse of the cell");
        assert_eq!(escape_field("and/or"), "and/or");
        assert_eq!(escape_field("C# basics"), "C# basics");
    }

    #[test]
    fn test_separator_tokens_are_escaped() {
        assert_eq!(escape_field("a/answer/b"), r"a\/answer\/b");
        assert_eq!(escape_field("/question/"), r"\/question\/");
        assert_eq!(escape_field("x/answer"), r"x\/answer");
        assert_eq!(escape_field("trailing /"), r"trailing \/");
        assert_eq!(escape_field("back\\slash\nline"), r"back\\slash\nline");
        assert_eq!(escape_field("#hashtag"), r"\#hashtag");
    }

    #[test]
    fn test_encode_header_and_body() {
        let text = DelimitedEncoder::default().encode(&[result(vec![
            Card::new("DNA", "Deoxyribonucleic acid"),
            Card {
                image_url: Some("https://img.test/rna.png".into()),
                ..Card::new("RNA", "Ribonucleic acid")
            },
        ])]);
        let expected = "\
# Cell Biology
# Set ID: 555
# Cards: 2
# Source: owned
# Completeness: full
#
# Import settings:
#   Between term and definition: /answer/
#   Between cards: /question/
#   Image tag: /image/
#   Escape character: \\
#
DNA/answer/Deoxyribonucleic acid/question/RNA/answer/Ribonucleic acid/image/https://img.test/rna.png
";
        assert_eq!(text, expected);
    }

    #[test]
    fn test_images_can_be_left_out() {
        let encoder = DelimitedEncoder { include_images: false };
        let text = encoder.encode(&[result(vec![Card {
            image_url: Some("https://img.test/a.png".into()),
            ..Card::new("a", "b")
        }])]);
        assert!(!text.contains(IMAGE_SEPARATOR));
        assert!(text.ends_with("a/answer/b\n"));
    }

    #[test]
    fn test_encode_is_deterministic() {
        let input = vec![
            result(vec![Card::new("a", "b"), Card::new("c/answer/", "d")]),
            result(vec![]),
        ];
        let encoder = DelimitedEncoder::default();
        assert_eq!(encoder.encode(&input), encoder.encode(&input));
    }

    #[test]
    fn test_decode_multiple_sets() {
        let cards = vec![Card::new("x/answer", "1"), Card::new("#tag", "line\nbreak")];
        let text = DelimitedEncoder::default().encode(&[result(cards.clone()), result(vec![]), result(vec![Card::new("q", "a")])]);
        let decoded = decode(&text).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].title, "Cell Biology");
        assert_eq!(decoded[0].id.as_deref(), Some("555"));
        assert_eq!(decoded[0].cards, cards);
        assert!(decoded[1].cards.is_empty());
        assert_eq!(decoded[2].cards, vec![Card::new("q", "a")]);
    }

    #[test]
    fn test_decode_rejects_malformed_body() {
        assert!(matches!(decode("term without separator"), Err(Error::Decode(_))));
        assert!(matches!(decode("a/answer/b/answer/c"), Err(Error::Decode(_))));
        assert!(matches!(decode("a/answer/b\\"), Err(Error::Decode(_))));
    }

    fn field() -> impl Strategy<Value = String> {
        prop::collection::vec(
            prop_oneof![
                Just("/answer/".to_string()),
                Just("/question/".to_string()),
                Just("/image/".to_string()),
                Just("/answ".to_string()),
                Just("/".to_string()),
                Just("\\".to_string()),
                Just("#".to_string()),
                Just("\n".to_string()),
                "[a-zé ]{1,4}",
            ],
            0..6,
        )
        .prop_map(|parts| parts.concat())
    }

    proptest! {
        #[test]
        fn prop_escaped_cards_decode_to_the_original(
            pairs in prop::collection::vec((field(), field(), prop::option::of(field())), 1..5)
        ) {
            let cards: Vec<Card> = pairs
                .into_iter()
                .map(|(term, definition, image_url)| Card { image_url, ..Card::new(term, definition) })
                .collect();
            let text = DelimitedEncoder::default().encode(&[result(cards.clone())]);
            let decoded = decode(&text).unwrap();
            prop_assert_eq!(&decoded[0].cards, &cards);
        }
    }
}
