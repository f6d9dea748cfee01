use serde::Serialize;
use tracing::debug;

use crate::constants::SUGGESTION_MAX_DISTANCE_M;
use crate::directory::ProviderDirectory;
use crate::error::DirectoryError;
use crate::model::{GeoPoint, ProviderRecord};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateMatch {
    pub provider: ProviderRecord,
    pub distance_m: f64,
}

/// Nearby providers of one specialty that accept the patient's insurance.
#[derive(Clone)]
pub struct CandidateRanker {
    directory: ProviderDirectory,
    default_max_distance_m: f64,
}

impl CandidateRanker {
    pub fn new(directory: ProviderDirectory) -> Self {
        Self {
            directory,
            default_max_distance_m: SUGGESTION_MAX_DISTANCE_M,
        }
    }

    pub fn with_default_max_distance(mut self, max_distance_m: f64) -> Self {
        self.default_max_distance_m = max_distance_m;
        self
    }

    /// Nearest first. An empty list is a valid answer; the radius and filters
    /// are never relaxed.
    pub async fn rank(
        &self,
        specialty: &str,
        patient: GeoPoint,
        insurance_id: i64,
        max_distance_m: Option<f64>,
    ) -> Result<Vec<CandidateMatch>, DirectoryError> {
        let max_distance_m = max_distance_m.unwrap_or(self.default_max_distance_m);
        let hits = self
            .directory
            .find_near(patient, max_distance_m, specialty, insurance_id)
            .await?;
        debug!(
            specialty,
            insurance_id,
            max_distance_m,
            candidates = hits.len(),
            "Ranked candidates"
        );
        Ok(hits
            .into_iter()
            .map(|(provider, distance_m)| CandidateMatch {
                provider,
                distance_m,
            })
            .collect())
    }
}
