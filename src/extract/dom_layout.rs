use super::{CardLayout, EntryResult};
use crate::browser::dom;
use crate::models::Card;
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};

/// A layout where every card is a container element holding the term and
/// definition as child elements.
#[derive(Debug)]
pub struct DomLayout {
    pub version: &'static str,
    pub container: &'static str,
    pub term: &'static str,
    pub definition: &'static str,
}

/// Current set pages.
pub static TERM_LIST: DomLayout = DomLayout {
    version: "term-list",
    container: ".SetPageTerms-term",
    term: ".SetPageTerm-wordText",
    definition: ".SetPageTerm-definitionText",
};

/// Older set pages.
pub static LEGACY: DomLayout = DomLayout {
    version: "legacy",
    container: ".term",
    term: ".qWord",
    definition: ".qDef",
};

struct Compiled {
    container: Selector,
    term: Selector,
    definition: Selector,
    image: Selector,
}

impl DomLayout {
    // The selectors are constants; a parse failure means "no cards here".
    fn compile(&self) -> Option<Compiled> {
        Some(Compiled {
            container: dom::selector(self.container).ok()?,
            term: dom::selector(self.term).ok()?,
            definition: dom::selector(self.definition).ok()?,
            image: dom::selector("img").ok()?,
        })
    }

    fn parse_one(&self, sel: &Compiled, container: ElementRef<'_>) -> EntryResult {
        let term = container
            .select(&sel.term)
            .next()
            .and_then(dom::text_of)
            .ok_or_else(|| "term did not render".to_string())?;
        let definition = container
            .select(&sel.definition)
            .next()
            .and_then(dom::text_of)
            .ok_or_else(|| "definition did not render".to_string())?;
        let image_url = container
            .select(&sel.image)
            .next()
            .and_then(|img| img.value().attr("src").or_else(|| img.value().attr("data-src")))
            .filter(|src| !src.is_empty())
            .map(str::to_string);

        Ok(Card {
            image_url,
            ..Card::new(term, definition)
        })
    }
}

#[async_trait]
impl CardLayout for DomLayout {
    fn version(&self) -> &'static str {
        self.version
    }

    fn detect(&self, html: &str) -> bool {
        let Some(sel) = self.compile() else {
            return false;
        };
        let document = Html::parse_document(html);
        let found = document
            .select(&sel.container)
            .any(|c| c.select(&sel.term).next().is_some());
        found
    }

    fn entry_count(&self, html: &str) -> usize {
        let Some(sel) = self.compile() else {
            return 0;
        };
        let document = Html::parse_document(html);
        let count = document.select(&sel.container).count();
        count
    }

    fn parse_entries(&self, html: &str) -> Vec<EntryResult> {
        let Some(sel) = self.compile() else {
            return Vec::new();
        };
        let document = Html::parse_document(html);
        let entries: Vec<EntryResult> = document
            .select(&sel.container)
            .map(|container| self.parse_one(&sel, container))
            .collect();
        entries
    }

    fn paginated(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term_list(cards: &[(&str, &str)]) -> String {
        let rows: String = cards
            .iter()
            .map(|(t, d)| {
                format!(
                    r#"<div class="SetPageTerms-term"><div class="SetPageTerm-wordText"><span class="TermText">{}</span></div><div class="SetPageTerm-definitionText"><span class="TermText">{}</span></div></div>"#,
                    t, d
                )
            })
            .collect();
        format!("<html><body><section>{}</section></body></html>", rows)
    }

    #[test]
    fn test_term_list_preserves_order() {
        let html = term_list(&[("Mitochondria", "Powerhouse of the cell"), ("DNA", "Deoxyribonucleic acid")]);
        let entries = TERM_LIST.parse_entries(&html);
        assert_eq!(
            entries,
            vec![
                Ok(Card::new("Mitochondria", "Powerhouse of the cell")),
                Ok(Card::new("DNA", "Deoxyribonucleic acid")),
            ]
        );
        assert_eq!(TERM_LIST.entry_count(&html), 2);
    }

    #[test]
    fn test_blank_definition_is_a_placeholder() {
        let html = term_list(&[("RNA", "Ribonucleic acid"), ("ATP", "  ")]);
        let entries = TERM_LIST.parse_entries(&html);
        assert!(entries[0].is_ok());
        assert_eq!(entries[1], Err("definition did not render".to_string()));
    }

    #[test]
    fn test_image_is_captured() {
        let html = r#"<div class="SetPageTerms-term">
            <div class="SetPageTerm-wordText">Cell</div>
            <div class="SetPageTerm-definitionText">Unit of life<img src="https://img.test/cell.png"></div>
        </div>"#;
        let entries = TERM_LIST.parse_entries(html);
        assert_eq!(
            entries[0].as_ref().unwrap().image_url.as_deref(),
            Some("https://img.test/cell.png")
        );
    }

    #[test]
    fn test_legacy_layout() {
        let html = r#"<div class="terms">
            <div class="term"><span class="qWord">hola</span><span class="qDef">hello</span></div>
            <div class="term"><span class="qWord">adiós</span><span class="qDef">goodbye</span></div>
        </div>"#;
        let cards: Vec<Card> = LEGACY.parse_entries(html).into_iter().map(Result::unwrap).collect();
        assert_eq!(cards[1], Card::new("adiós", "goodbye"));
    }
}
