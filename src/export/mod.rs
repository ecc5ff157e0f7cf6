//! Export of scrape results to files.
//!
//! The primary format is the delimited `/answer/` + `/question/` text in
//! [`delimited`]; JSON, CSV, TSV and Anki renderings are available as well.
//! Each set becomes one file per format, `<id>_<title>.<ext>`, or a batch
//! becomes a single `combined_export.<ext>`.

mod delimited;
mod tabular;

pub use delimited::{
    decode, escape_field, DecodedSet, DelimitedEncoder, CARD_SEPARATOR, ESCAPE, IMAGE_SEPARATOR,
    TERM_SEPARATOR,
};

use crate::atomic_file::write_atomic;
use crate::error::{Error, Result};
use crate::models::ScrapeResult;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

pub const COMBINED_STEM: &str = "combined_export";

const MAX_TITLE_LEN: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    /// Quizlet's custom-separator import text.
    Delimited,
    Json,
    Csv,
    Tsv,
    Anki,
}

impl ExportFormat {
    pub const ALL: [ExportFormat; 5] = [
        ExportFormat::Delimited,
        ExportFormat::Json,
        ExportFormat::Csv,
        ExportFormat::Tsv,
        ExportFormat::Anki,
    ];

    pub fn extension(self) -> &'static str {
        match self {
            Self::Delimited => "txt",
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Tsv => "tsv",
            Self::Anki => "anki.txt",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Delimited => "quizlet",
            Self::Json => "json",
            Self::Csv => "csv",
            Self::Tsv => "tsv",
            Self::Anki => "anki",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quizlet" | "txt" | "delimited" => Ok(Self::Delimited),
            "json" => Ok(Self::Json),
            "csv" => Ok(Self::Csv),
            "tsv" => Ok(Self::Tsv),
            "anki" => Ok(Self::Anki),
            other => Err(Error::Config(format!(
                "unknown export format {:?} (expected one of quizlet, json, csv, tsv, anki)",
                other
            ))),
        }
    }
}

static RESERVED_CHARS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).ok());

/// Filesystem-safe title: reserved characters removed, spaces turned into
/// underscores, at most 50 characters.
pub fn sanitize_filename(title: &str) -> String {
    let cleaned = match RESERVED_CHARS.as_ref() {
        Some(re) => re.replace_all(title.trim(), "").into_owned(),
        None => title.trim().to_string(),
    };
    cleaned.replace(' ', "_").chars().take(MAX_TITLE_LEN).collect()
}

/// File stem for one set, derived from its ID and title only.
pub fn file_stem(result: &ScrapeResult) -> String {
    let title = sanitize_filename(&result.set.title);
    if title.is_empty() {
        sanitize_filename(&result.set.id)
    } else {
        format!("{}_{}", sanitize_filename(&result.set.id), title)
    }
}

pub fn render(format: ExportFormat, results: &[ScrapeResult], include_images: bool) -> Result<String> {
    match format {
        ExportFormat::Delimited => Ok(DelimitedEncoder { include_images }.encode(results)),
        ExportFormat::Json => tabular::to_json(results),
        ExportFormat::Csv => tabular::to_rows(results, b',', include_images),
        ExportFormat::Tsv => tabular::to_rows(results, b'\t', include_images),
        ExportFormat::Anki => tabular::to_anki(results),
    }
}

#[derive(Debug, Clone)]
pub struct ExportWriter {
    output_dir: PathBuf,
    formats: Vec<ExportFormat>,
    include_images: bool,
}

impl ExportWriter {
    pub fn new(output_dir: impl Into<PathBuf>, formats: Vec<ExportFormat>, include_images: bool) -> Self {
        Self {
            output_dir: output_dir.into(),
            formats,
            include_images,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn write(&self, stem: &str, results: &[ScrapeResult]) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::with_capacity(self.formats.len());
        for format in &self.formats {
            let path = self
                .output_dir
                .join(format!("{}.{}", stem, format.extension()));
            let content = render(*format, results, self.include_images)?;
            write_atomic(&path, content.as_bytes())?;
            log::info!("Exported {} to: {}", format, path.display());
            paths.push(path);
        }
        Ok(paths)
    }

    /// Writes one file per configured format for `result`.
    pub fn write_set(&self, result: &ScrapeResult) -> Result<Vec<PathBuf>> {
        self.write(&file_stem(result), std::slice::from_ref(result))
    }

    /// Writes the whole batch into one file per configured format.
    pub fn write_combined(&self, results: &[ScrapeResult]) -> Result<Vec<PathBuf>> {
        if results.is_empty() {
            return Ok(Vec::new());
        }
        self.write(COMBINED_STEM, results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Card, CardEntry, SetMetadata, SetSource};
    use chrono::Utc;
    use std::fs;

    fn result(id: &str, title: &str) -> ScrapeResult {
        ScrapeResult::from_entries(
            SetMetadata {
                id: id.into(),
                title: title.into(),
                url: format!("https://quizlet.com/{}/x-flash-cards/", id),
                card_count: None,
                source: SetSource::Owned,
                discovered_at: Utc::now(),
            },
            vec![CardEntry::Parsed(Card::new("term", "definition"))],
        )
    }

    #[test]
    fn test_format_names() {
        assert_eq!("quizlet".parse::<ExportFormat>().unwrap(), ExportFormat::Delimited);
        assert_eq!("TSV".parse::<ExportFormat>().unwrap(), ExportFormat::Tsv);
        assert!(matches!("xml".parse::<ExportFormat>(), Err(Error::Config(_))));
        for format in ExportFormat::ALL {
            assert_eq!(format.to_string().parse::<ExportFormat>().unwrap(), format);
        }
    }

    #[test]
    fn test_sanitize_filename() {
        assert!(RESERVED_CHARS.is_some());
        assert_eq!(sanitize_filename("Bio: Cells / Organelles?"), "Bio_Cells__Organelles");
        assert_eq!(sanitize_filename(&"x".repeat(80)).len(), 50);
        assert_eq!(sanitize_filename("Ünïcode Sét"), "Ünïcode_Sét");
    }

    #[test]
    fn test_file_names_are_deterministic() {
        assert_eq!(file_stem(&result("123", "Cell Biology")), "123_Cell_Biology");
        assert_eq!(file_stem(&result("123", "???")), "123");
    }

    #[test]
    fn test_write_set_and_combined() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ExportWriter::new(dir.path(), vec![ExportFormat::Delimited, ExportFormat::Json], true);

        let paths = writer.write_set(&result("1", "Alpha")).unwrap();
        assert_eq!(
            paths,
            vec![dir.path().join("1_Alpha.txt"), dir.path().join("1_Alpha.json")]
        );
        let text = fs::read_to_string(&paths[0]).unwrap();
        assert!(text.ends_with("term/answer/definition\n"));

        let combined = writer
            .write_combined(&[result("1", "Alpha"), result("2", "Beta")])
            .unwrap();
        assert_eq!(combined[0], dir.path().join("combined_export.txt"));
        let decoded = decode(&fs::read_to_string(&combined[0]).unwrap()).unwrap();
        assert_eq!(decoded.len(), 2);
        assert!(writer.write_combined(&[]).unwrap().is_empty());
    }
}
