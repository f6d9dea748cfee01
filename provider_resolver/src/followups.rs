use serde::{Deserialize, Serialize};
use tracing::info;

use crate::classifier::SpecialtyClassifier;
use crate::constants::UNKNOWN_SPECIALTY;
use crate::db::Database;
use crate::error::FollowUpError;
use crate::model::GeoPoint;
use crate::ranker::{CandidateMatch, CandidateRanker};
use crate::vocabulary::SpecialtyVocabulary;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatientContext {
    pub location: GeoPoint,
    pub insurance_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FollowUpSuggestion {
    pub task: String,
    pub specialty: String,
    pub candidates: Vec<CandidateMatch>,
}

/// Classifies follow-up tasks and finds nearby providers for each one.
#[derive(Clone)]
pub struct FollowUpPlanner {
    db: Database,
    classifier: SpecialtyClassifier,
    ranker: CandidateRanker,
}

impl FollowUpPlanner {
    pub fn new(db: Database, classifier: SpecialtyClassifier, ranker: CandidateRanker) -> Self {
        Self {
            db,
            classifier,
            ranker,
        }
    }

    /// One classification then one ranking per task, in input order. The
    /// vocabulary is read once per call so edits apply to the next request.
    pub async fn suggest(
        &self,
        tasks: &[String],
        patient: PatientContext,
        max_distance_m: Option<f64>,
    ) -> Result<Vec<FollowUpSuggestion>, FollowUpError> {
        let vocabulary = SpecialtyVocabulary::load(&self.db).await?;
        let mut suggestions = Vec::with_capacity(tasks.len());

        for task in tasks {
            let specialty = self.classifier.classify(task, &vocabulary).await?;
            let candidates = if specialty == UNKNOWN_SPECIALTY {
                Vec::new()
            } else {
                self.ranker
                    .rank(
                        &specialty,
                        patient.location,
                        patient.insurance_id,
                        max_distance_m,
                    )
                    .await?
            };
            suggestions.push(FollowUpSuggestion {
                task: task.clone(),
                specialty,
                candidates,
            });
        }

        info!(
            tasks = tasks.len(),
            matched = suggestions.iter().filter(|s| !s.candidates.is_empty()).count(),
            "Built follow-up suggestions"
        );
        Ok(suggestions)
    }
}
