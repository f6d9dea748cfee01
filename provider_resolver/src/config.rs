use anyhow::{Context, Result};
use reqwest::Client;
use std::{path::PathBuf, sync::Arc};
use tracing::info;

use crate::classifier::SpecialtyClassifier;
use crate::common::clean;
use crate::constants::{
    DEFAULT_GEOCODE_API_URL, DEFAULT_NPI_API_BASE_URL, DEFAULT_NPI_API_VERSION,
    DEFAULT_OPENAI_BASE_URL, DEFAULT_OPENAI_MODEL, SUGGESTION_MAX_DISTANCE_M, USER_AGENT,
};
use crate::db::Database;
use crate::directory::ProviderDirectory;
use crate::followups::FollowUpPlanner;
use crate::geo::{Geocoder, GoogleGeocoder, NoGeocoder};
use crate::llm::{OpenAiClient, StructuredLlm};
use crate::pending::{DeferredResolver, PendingQueue};
use crate::ranker::CandidateRanker;
use crate::registry::NpiRegistryClient;
use crate::resolver::ProviderResolver;
use crate::vocabulary::SpecialtyVocabulary;

/// Settings shared by every entry point. Each flag also reads from the
/// environment (and so from `.env`).
#[derive(clap::Args, Debug, Clone)]
pub struct ClientConfig {
    /// SQLite database holding the directory, vocabulary and pending queue.
    #[arg(long, env = "PROVIDER_DB_PATH", default_value = "data/providers.sqlite")]
    pub db_path: PathBuf,

    /// NPI API base URL.
    #[arg(long, env = "NPI_API_BASE_URL", default_value = DEFAULT_NPI_API_BASE_URL)]
    pub npi_api_base_url: String,

    /// NPI API version query parameter.
    #[arg(long, env = "NPI_API_VERSION", default_value = DEFAULT_NPI_API_VERSION)]
    pub npi_api_version: String,

    /// Max attempts for throttled or failing registry requests.
    #[arg(long, default_value_t = 5)]
    pub max_retries: u32,

    /// Global request start rate for registry calls (0 disables spacing).
    ///
    /// NPPES reference: https://npiregistry.cms.hhs.gov/api-page
    #[arg(long, default_value_t = 2)]
    pub requests_per_second: u32,

    /// Enables the specialty classifier and follow-up suggestions.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_OPENAI_BASE_URL)]
    pub openai_base_url: String,

    #[arg(long, env = "OPENAI_MODEL", default_value = DEFAULT_OPENAI_MODEL)]
    pub openai_model: String,

    /// Enables geocoding of provider locations. Without it locations are
    /// stored without coordinates.
    #[arg(long, env = "GOOGLE_MAPS_API_KEY", hide_env_values = true)]
    pub google_maps_api_key: Option<String>,

    #[arg(long, env = "GEOCODE_API_URL", default_value = DEFAULT_GEOCODE_API_URL)]
    pub geocode_api_url: String,

    /// Default radius for follow-up suggestions, in metres.
    #[arg(long, default_value_t = SUGGESTION_MAX_DISTANCE_M)]
    pub suggestion_max_distance_m: f64,
}

/// Components wired from one [`ClientConfig`].
#[derive(Clone)]
pub struct Services {
    pub db: Database,
    pub directory: ProviderDirectory,
    pub registry: NpiRegistryClient,
    pub deferred: DeferredResolver,
    pub ranker: CandidateRanker,
    /// `None` without an OpenAI key.
    pub planner: Option<FollowUpPlanner>,
}

impl ClientConfig {
    pub fn http_client(&self) -> Result<Client> {
        Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("Failed creating HTTP client")
    }

    pub fn registry(&self, client: Client) -> NpiRegistryClient {
        NpiRegistryClient::new(
            client,
            self.npi_api_base_url.clone(),
            self.npi_api_version.clone(),
            self.max_retries,
            self.requests_per_second,
        )
    }

    pub fn geocoder(&self, client: Client) -> Arc<dyn Geocoder> {
        match clean(self.google_maps_api_key.as_deref()) {
            Some(key) => Arc::new(GoogleGeocoder::new(
                client,
                self.geocode_api_url.clone(),
                key,
            )),
            None => {
                info!("GOOGLE_MAPS_API_KEY not set; provider locations will not be geocoded");
                Arc::new(NoGeocoder)
            }
        }
    }

    pub fn llm(&self, client: Client) -> Result<Option<Arc<dyn StructuredLlm>>> {
        let Some(key) = clean(self.openai_api_key.as_deref()) else {
            info!("OPENAI_API_KEY not set; follow-up suggestions are disabled");
            return Ok(None);
        };
        let llm = OpenAiClient::new(
            client,
            key,
            self.openai_base_url.clone(),
            self.openai_model.clone(),
        )
        .context("Failed configuring OpenAI client")?;
        Ok(Some(Arc::new(llm)))
    }

    pub async fn connect(&self) -> Result<Services> {
        let db = Database::open(&self.db_path)?;
        let client = self.http_client()?;

        let directory = ProviderDirectory::new(db.clone());
        let registry = self.registry(client.clone());
        let vocabulary = SpecialtyVocabulary::load(&db)
            .await
            .context("Failed loading specialty vocabulary")?;

        let mut resolver = ProviderResolver::new(
            directory.clone(),
            Arc::new(registry.clone()),
            self.geocoder(client.clone()),
        );
        if vocabulary.is_empty() {
            info!("Specialty vocabulary is empty; query specialties are stored unchecked");
        } else {
            resolver = resolver.with_vocabulary(vocabulary);
        }

        let deferred = DeferredResolver::new(Arc::new(resolver), PendingQueue::new(db.clone()));
        let ranker = CandidateRanker::new(directory.clone())
            .with_default_max_distance(self.suggestion_max_distance_m);
        let planner = self.llm(client)?.map(|llm| {
            FollowUpPlanner::new(
                db.clone(),
                SpecialtyClassifier::new(llm),
                ranker.clone(),
            )
        });

        info!(
            db = %self.db_path.display(),
            follow_ups = planner.is_some(),
            "Services ready"
        );
        Ok(Services {
            db,
            directory,
            registry,
            deferred,
            ranker,
            planner,
        })
    }
}
