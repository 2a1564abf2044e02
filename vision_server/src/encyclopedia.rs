//! Photo encyclopedia: entries suggested per place, kept in an append-only CSV log.
//!
use std::{
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use common::protocol::{EncyclopediaEntry, GeneratedEncyclopedia};
use thiserror::Error;

use crate::llm::{ContentPart, LlmClient};

/// Longest accepted place name, in characters.
pub const MAX_PLACE_LEN: usize = 100;

/// Number of entries requested per place.
const ENTRIES_PER_PLACE: usize = 8;

#[derive(Debug, Error, PartialEq)]
pub enum PlaceError {
    #[error("place must not be empty")]
    Empty,
    #[error("place must be at most 100 characters")]
    TooLong,
}

/// Trim a place name and check its length.
pub fn validate_place(place: &str) -> Result<String, PlaceError> {
    let place = place.trim();
    if place.is_empty() {
        return Err(PlaceError::Empty);
    }
    if place.chars().count() > MAX_PLACE_LEN {
        return Err(PlaceError::TooLong);
    }

    Ok(place.to_owned())
}

/// CSV file with one encyclopedia entry per row.
///
/// Rows are only ever appended. Writes are serialized through a mutex.
pub struct EncyclopediaStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EncyclopediaStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append entries, creating the file with a header on first use.
    pub fn append(&self, entries: &[EncyclopediaEntry]) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("store lock poisoned"))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let is_new = fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file);
        for entry in entries {
            writer.serialize(entry)?;
        }
        writer.flush()?;

        log::debug!("Appended {} entries to {}", entries.len(), self.path.display());
        Ok(())
    }

    /// All logged entries. A missing file is an empty log.
    pub fn entries(&self) -> Result<Vec<EncyclopediaEntry>> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("store lock poisoned"))?;

        if !self.path.exists() {
            return Ok(vec![]);
        }

        let mut reader = csv::Reader::from_path(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        let entries = reader
            .deserialize()
            .collect::<Result<Vec<EncyclopediaEntry>, _>>()?;

        Ok(entries)
    }

    /// Places of the log in first-seen order, without duplicates.
    pub fn places(&self) -> Result<Vec<String>> {
        let mut places: Vec<String> = vec![];
        for entry in self.entries()? {
            if !places.contains(&entry.place) {
                places.push(entry.place);
            }
        }

        Ok(places)
    }

    pub fn entries_for(&self, place: &str) -> Result<Vec<EncyclopediaEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|entry| entry.place == place)
            .collect())
    }
}

/// Turn generated items into log rows dated `date`.
pub fn to_entries(generated: &GeneratedEncyclopedia, date: NaiveDate) -> Vec<EncyclopediaEntry> {
    let date = date.format("%Y-%m-%d").to_string();
    generated
        .encyclopedia
        .iter()
        .map(|item| EncyclopediaEntry {
            name: item.name.clone(),
            text: item.text.clone(),
            place: generated.place.clone(),
            date: date.clone(),
        })
        .collect()
}

fn encyclopedia_prompt(place: &str) -> String {
    let place_json = serde_json::to_string(place).unwrap_or_else(|_| "\"\"".to_owned());
    format!(
        r#"You edit content for a "collect it with photos" encyclopedia app.
For the destination below, pick subjects that visitors can easily find and photograph there.
Only choose subjects that really exist at that place and are open for viewing and photography.

Rules:
- exactly {ENTRIES_PER_PLACE} entries
- prefer subjects children can spot easily: prominent, well-known, visible all year
- avoid seasonal, uncertain or no-photography subjects
- for zoos, focus on popular animals that are easy to find
- "name" is short, a proper noun
- "text" is friendly for children, mentions a visual feature, at most 60 characters

Answer with this JSON only, no other text and no Markdown:
{{"place": {place_json}, "encyclopedia": [{{"name": "...", "text": "..."}}]}}

Destination: {place}"#
    )
}

/// Strip a Markdown code fence around a model answer.
fn strip_code_fence(answer: &str) -> &str {
    let answer = answer.trim();
    match answer.strip_prefix("```") {
        Some(rest) => {
            // Drop the info string (`json`) up to the end of the first line
            let rest = rest.split_once('\n').map_or("", |(_, body)| body);
            rest.trim_end().trim_end_matches("```").trim()
        }
        None => answer,
    }
}

/// Parse the model answer for `place`.
pub fn parse_generated(answer: &str, place: &str) -> Result<GeneratedEncyclopedia> {
    let mut generated: GeneratedEncyclopedia = serde_json::from_str(strip_code_fence(answer))
        .context("language model answer is not valid encyclopedia JSON")?;

    generated
        .encyclopedia
        .retain(|item| !item.name.trim().is_empty());
    if generated.encyclopedia.is_empty() {
        bail!("language model suggested no entries");
    }
    // Keep the place the user asked for
    generated.place = place.to_owned();

    Ok(generated)
}

/// Ask the language model for photo subjects at `place`.
pub async fn generate(llm: &LlmClient, place: &str) -> Result<GeneratedEncyclopedia> {
    let answer = llm
        .chat(vec![ContentPart::text(encyclopedia_prompt(place))])
        .await?;
    parse_generated(&answer, place)
}

#[cfg(test)]
mod test {
    use super::*;
    use common::protocol::EncyclopediaItem;

    fn entry(name: &str, place: &str) -> EncyclopediaEntry {
        EncyclopediaEntry {
            name: name.into(),
            text: format!("{name}, with \"quotes\", commas"),
            place: place.into(),
            date: "2024-05-01".into(),
        }
    }

    #[test]
    fn test_validate_place() {
        assert_eq!(validate_place("  Ueno Zoo \n"), Ok("Ueno Zoo".to_owned()));
        assert_eq!(validate_place("   "), Err(PlaceError::Empty));
        assert_eq!(validate_place(&"z".repeat(101)), Err(PlaceError::TooLong));
        assert!(validate_place(&"動".repeat(100)).is_ok());
    }

    #[test]
    fn test_store_appends_and_reads() {
        let dir = tempfile::tempdir().unwrap();
        let store = EncyclopediaStore::new(dir.path().join("data/Encyclopedia.csv"));

        assert!(store.entries().unwrap().is_empty());
        assert!(store.places().unwrap().is_empty());

        store
            .append(&[entry("Elephant", "Zoo"), entry("Giraffe", "Zoo")])
            .unwrap();
        store
            .append(&[entry("Tower", "City"), entry("Lion", "Zoo")])
            .unwrap();

        let entries = store.entries().unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0], entry("Elephant", "Zoo"));
        assert_eq!(store.places().unwrap(), vec!["Zoo", "City"]);
        assert_eq!(store.entries_for("City").unwrap(), vec![entry("Tower", "City")]);

        // One header only
        let content = fs::read_to_string(store.path()).unwrap();
        assert_eq!(content.matches("name,text,place,date").count(), 1);
    }

    #[test]
    fn test_concurrent_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(EncyclopediaStore::new(dir.path().join("log.csv")));

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    for idx in 0..5 {
                        store
                            .append(&[entry(&format!("item {worker}-{idx}"), "Zoo")])
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.entries().unwrap().len(), 20);
        let content = fs::read_to_string(store.path()).unwrap();
        assert_eq!(content.matches("name,text,place,date").count(), 1);
    }

    #[test]
    fn test_parse_generated() {
        let answer = "```json\n{\"place\": \"zoo\", \"encyclopedia\": [\
                      {\"name\": \"Panda\", \"text\": \"Black and white\"}, \
                      {\"name\": \" \", \"text\": \"nameless\"}]}\n```";
        let generated = parse_generated(answer, "Ueno Zoo").unwrap();
        assert_eq!(generated.place, "Ueno Zoo");
        assert_eq!(
            generated.encyclopedia,
            vec![EncyclopediaItem {
                name: "Panda".into(),
                text: "Black and white".into()
            }]
        );

        assert!(parse_generated("Sorry, I cannot help.", "zoo").is_err());
        assert!(parse_generated(r#"{"place": "zoo", "encyclopedia": []}"#, "zoo").is_err());
    }

    #[test]
    fn test_to_entries() {
        let generated = GeneratedEncyclopedia {
            place: "Zoo".into(),
            encyclopedia: vec![EncyclopediaItem {
                name: "Panda".into(),
                text: "Black and white".into(),
            }],
        };
        let date = NaiveDate::from_ymd_opt(2025, 1, 9).unwrap();
        let entries = to_entries(&generated, date);
        assert_eq!(entries[0].date, "2025-01-09");
        assert_eq!(entries[0].place, "Zoo");
    }

    #[test]
    fn test_prompt_quotes_place() {
        let prompt = encyclopedia_prompt("The \"Big\" Park");
        assert!(prompt.contains(r#"{"place": "The \"Big\" Park""#));
        assert!(prompt.contains("exactly 8 entries"));
    }
}
