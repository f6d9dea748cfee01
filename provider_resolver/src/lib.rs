//! Resolves partial provider identities extracted from clinical documents to
//! NPIs, keeps a local provider directory enriched as a side effect, and
//! suggests nearby in-network providers for follow-up tasks.

pub mod batch;
pub mod classifier;
pub mod common;
pub mod config;
pub mod constants;
pub mod db;
pub mod directory;
pub mod error;
pub mod followups;
pub mod geo;
pub mod llm;
pub mod model;
pub mod pending;
pub mod ranker;
pub mod registry;
pub mod resolver;
pub mod vocabulary;

pub use config::{ClientConfig, Services};
pub use db::Database;
pub use directory::{ProviderDirectory, UpsertResult};
pub use error::{DirectoryError, FollowUpError, LlmError, RegistryError, ResolveError};
pub use followups::{FollowUpPlanner, FollowUpSuggestion, PatientContext};
pub use model::{Address, GeoPoint, Location, ProviderRecord, ResolutionQuery};
pub use pending::{DeferredResolver, PendingQueue, PendingReason, ResolutionOutcome, RetrySummary};
pub use ranker::{CandidateMatch, CandidateRanker};
pub use resolver::{ProviderResolver, Resolution, ResolvedBy};
pub use vocabulary::SpecialtyVocabulary;
