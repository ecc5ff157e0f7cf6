//! JSON and row-per-card renderings (CSV, TSV, Anki).

use crate::error::Result;
use crate::models::ScrapeResult;
use csv::{QuoteStyle, WriterBuilder};

pub fn to_json(results: &[ScrapeResult]) -> Result<String> {
    let json = match results {
        [single] => serde_json::to_string_pretty(single)?,
        _ => serde_json::to_string_pretty(results)?,
    };
    Ok(json)
}

/// One row per parsed card. A `set_id` column is added when more than one
/// set goes into the same file.
pub fn to_rows(results: &[ScrapeResult], delimiter: u8, include_images: bool) -> Result<String> {
    let with_set = results.len() > 1;
    let mut buf = Vec::new();
    {
        let mut writer = WriterBuilder::new()
            .delimiter(delimiter)
            .quote_style(QuoteStyle::Necessary)
            .from_writer(&mut buf);

        let mut header = Vec::new();
        if with_set {
            header.push("set_id");
        }
        header.extend(["term", "definition"]);
        if include_images {
            header.push("image_url");
        }
        writer.write_record(&header)?;

        for result in results {
            for card in result.parsed_cards() {
                let mut row: Vec<&str> = Vec::new();
                if with_set {
                    row.push(&result.set.id);
                }
                row.push(&card.term);
                row.push(&card.definition);
                if include_images {
                    row.push(card.image_url.as_deref().unwrap_or(""));
                }
                writer.write_record(&row)?;
            }
        }
        writer.flush().map_err(csv::Error::from)?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Semicolon-separated notes with `#` comment lines, the plain-text layout
/// Anki's importer reads.
pub fn to_anki(results: &[ScrapeResult]) -> Result<String> {
    let mut out = String::new();
    for result in results {
        out.push_str(&format!("# {}\n", result.set.title.replace(['\r', '\n'], " ")));
        out.push_str(&format!(
            "# Exported from Quizlet - {} cards\n",
            result.parsed_cards().count()
        ));
        let mut buf = Vec::new();
        {
            let mut writer = WriterBuilder::new()
                .delimiter(b';')
                .has_headers(false)
                .from_writer(&mut buf);
            for card in result.parsed_cards() {
                writer.write_record([
                    card.term.replace(['\r', '\n'], " "),
                    card.definition.replace(['\r', '\n'], " "),
                ])?;
            }
            writer.flush().map_err(csv::Error::from)?;
        }
        out.push_str(&String::from_utf8_lossy(&buf));
    }
    Ok(out)
}
