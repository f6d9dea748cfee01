use std::collections::BTreeMap;

use crate::db::Database;
use crate::error::{DirectoryError, VocabularyViolation};

/// Closed set of specialty codes maintained in the `specialties` table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecialtyVocabulary {
    entries: BTreeMap<String, String>,
}

impl SpecialtyVocabulary {
    pub fn new<I, C, D>(entries: I) -> Self
    where
        I: IntoIterator<Item = (C, D)>,
        C: Into<String>,
        D: Into<String>,
    {
        let entries = entries
            .into_iter()
            .map(|(code, description)| (code.into().trim().to_string(), description.into()))
            .filter(|(code, _)| !code.is_empty())
            .collect();
        Self { entries }
    }

    pub async fn load(db: &Database) -> Result<Self, DirectoryError> {
        let conn = db.lock().await;
        let mut stmt = conn.prepare("SELECT code, description FROM specialties ORDER BY code")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut entries = BTreeMap::new();
        for row in rows {
            let (code, description) = row?;
            entries.insert(code, description);
        }
        Ok(Self { entries })
    }

    pub fn contains(&self, code: &str) -> bool {
        self.entries.contains_key(code)
    }

    /// Maps a token onto a vocabulary code: exact match first, then a
    /// case-insensitive one.
    pub fn validate(&self, token: &str) -> Result<String, VocabularyViolation> {
        let token = token.trim();
        if self.entries.contains_key(token) {
            return Ok(token.to_string());
        }
        self.entries
            .keys()
            .find(|code| code.eq_ignore_ascii_case(token))
            .cloned()
            .ok_or_else(|| VocabularyViolation {
                token: token.to_string(),
            })
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(code, description)| (code.as_str(), description.as_str()))
    }

    /// One `CODE: description` line per entry, for prompts.
    pub fn prompt_listing(&self) -> String {
        self.entries
            .iter()
            .map(|(code, description)| {
                if description.trim().is_empty() {
                    code.clone()
                } else {
                    format!("{code}: {}", description.trim())
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Inserts or updates vocabulary entries; returns how many rows were written.
pub async fn upsert_specialties(
    db: &Database,
    vocabulary: &SpecialtyVocabulary,
) -> Result<usize, DirectoryError> {
    let mut conn = db.lock().await;
    let tx = conn.transaction()?;
    let mut written = 0usize;
    {
        let mut stmt = tx.prepare(
            "
            INSERT INTO specialties (code, description)
            VALUES (?1, ?2)
            ON CONFLICT(code) DO UPDATE SET description = excluded.description
            ",
        )?;
        for (code, description) in vocabulary.entries() {
            written += stmt.execute([code, description])?;
        }
    }
    tx.commit()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocabulary() -> SpecialtyVocabulary {
        SpecialtyVocabulary::new([
            ("ENT", "Ear, Nose and Throat"),
            ("ORTHO", "Orthopedics"),
            ("SPORTS", ""),
        ])
    }

    #[test]
    fn validate_prefers_exact_then_case_insensitive() {
        let vocab = vocabulary();
        assert_eq!(vocab.validate("ENT").unwrap(), "ENT");
        assert_eq!(vocab.validate(" ortho ").unwrap(), "ORTHO");
        assert_eq!(
            vocab.validate("cardiology").unwrap_err(),
            VocabularyViolation {
                token: "cardiology".to_string()
            }
        );
    }

    #[test]
    fn prompt_listing_includes_descriptions_when_present() {
        assert_eq!(
            vocabulary().prompt_listing(),
            "ENT: Ear, Nose and Throat\nORTHO: Orthopedics\nSPORTS"
        );
    }

    #[test]
    fn blank_codes_are_dropped() {
        let vocab = SpecialtyVocabulary::new([(" ", "nothing"), ("PCP", "Primary care")]);
        assert_eq!(vocab.codes().collect::<Vec<_>>(), ["PCP"]);
    }

    #[tokio::test]
    async fn upsert_then_load_round_trips_through_sqlite() {
        let db = Database::open_in_memory().unwrap();
        assert!(SpecialtyVocabulary::load(&db).await.unwrap().is_empty());

        assert_eq!(upsert_specialties(&db, &vocabulary()).await.unwrap(), 3);
        let updated = SpecialtyVocabulary::new([("SPORTS", "Sports medicine")]);
        upsert_specialties(&db, &updated).await.unwrap();

        let loaded = SpecialtyVocabulary::load(&db).await.unwrap();
        assert_eq!(loaded.len(), 3);
        assert!(loaded.contains("ENT"));
        assert!(loaded.prompt_listing().ends_with("SPORTS: Sports medicine"));
    }
}
