//! Provider identity resolution.
//!
//! A query runs through an ordered list of [`ResolutionStrategy`]s; the first
//! one that produces an NPI wins and the query's signals are merged into the
//! directory record for that NPI.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::directory::ProviderDirectory;
use crate::error::{GeocodeError, RegistryError, ResolveError};
use crate::geo::Geocoder;
use crate::model::{Location, ProviderRecord, ResolutionQuery};
use crate::registry::{ProviderRegistry, RegistryMatch, RegistryQueryShape, RegistrySearch};
use crate::vocabulary::SpecialtyVocabulary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedBy {
    ProvidedIdentifier,
    DirectoryMatch,
    Registry(RegistryQueryShape),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    Resolved { npi: String, resolved_by: ResolvedBy },
    Unresolved,
}

impl Resolution {
    pub fn npi(&self) -> Option<&str> {
        match self {
            Resolution::Resolved { npi, .. } => Some(npi),
            Resolution::Unresolved => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StrategyHit {
    pub npi: String,
    pub resolved_by: ResolvedBy,
    /// Present when the registry produced the hit; feeds the new record.
    pub registry_match: Option<RegistryMatch>,
}

#[async_trait]
pub trait ResolutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` passes the query on to the next strategy.
    async fn attempt(&self, query: &ResolutionQuery) -> Result<Option<StrategyHit>, ResolveError>;
}

pub fn is_well_formed_npi(npi: &str) -> bool {
    npi.len() == 10 && npi.bytes().all(|b| b.is_ascii_digit())
}

/// Trusts an NPI already present in the document.
pub struct ProvidedIdentifier;

#[async_trait]
impl ResolutionStrategy for ProvidedIdentifier {
    fn name(&self) -> &'static str {
        "provided_identifier"
    }

    async fn attempt(&self, query: &ResolutionQuery) -> Result<Option<StrategyHit>, ResolveError> {
        let Some(npi) = query.npi.as_deref() else {
            return Ok(None);
        };
        if !is_well_formed_npi(npi) {
            warn!(npi, "Ignoring malformed NPI on query");
            return Ok(None);
        }
        Ok(Some(StrategyHit {
            npi: npi.to_string(),
            resolved_by: ResolvedBy::ProvidedIdentifier,
            registry_match: None,
        }))
    }
}

/// Exact first/last name plus specialty membership against the directory.
pub struct DirectoryMatch {
    directory: ProviderDirectory,
}

impl DirectoryMatch {
    pub fn new(directory: ProviderDirectory) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl ResolutionStrategy for DirectoryMatch {
    fn name(&self) -> &'static str {
        "directory_match"
    }

    async fn attempt(&self, query: &ResolutionQuery) -> Result<Option<StrategyHit>, ResolveError> {
        let (Some(first), Some(last), Some(specialty)) = (
            query.first_name.as_deref(),
            query.last_name.as_deref(),
            query.specialty.as_deref(),
        ) else {
            return Ok(None);
        };

        let mut matches = self
            .directory
            .find_by_name_and_specialty(first, last, specialty)
            .await?;
        match matches.len() {
            0 => Ok(None),
            1 => {
                let record = matches.remove(0);
                Ok(Some(StrategyHit {
                    npi: record.npi,
                    resolved_by: ResolvedBy::DirectoryMatch,
                    registry_match: None,
                }))
            }
            _ => Err(ResolveError::AmbiguousMatch {
                first_name: first.to_string(),
                last_name: last.to_string(),
                specialty: specialty.to_string(),
                candidates: matches.into_iter().map(|r| r.npi).collect(),
            }),
        }
    }
}

/// One registry query shape. The default chain holds one per shape, tightest
/// first.
pub struct RegistryLookup {
    registry: Arc<dyn ProviderRegistry>,
    shape: RegistryQueryShape,
}

impl RegistryLookup {
    pub fn new(registry: Arc<dyn ProviderRegistry>, shape: RegistryQueryShape) -> Self {
        Self { registry, shape }
    }
}

#[async_trait]
impl ResolutionStrategy for RegistryLookup {
    fn name(&self) -> &'static str {
        match self.shape {
            RegistryQueryShape::NameCityState => "registry_name_city_state",
            RegistryQueryShape::NameState => "registry_name_state",
            RegistryQueryShape::Name => "registry_name",
        }
    }

    async fn attempt(&self, query: &ResolutionQuery) -> Result<Option<StrategyHit>, ResolveError> {
        let (Some(first), Some(last)) = (query.first_name.as_deref(), query.last_name.as_deref())
        else {
            return Ok(None);
        };
        let location = query.location.as_ref();
        let Some(search) = RegistrySearch::for_shape(
            self.shape,
            first,
            last,
            location.and_then(|a| a.city()),
            location.and_then(|a| a.state()),
        ) else {
            return Ok(None);
        };

        match self.registry.search(&search).await {
            Ok(matches) => {
                if matches.len() > 1 {
                    debug!(
                        shape = self.shape.as_str(),
                        results = matches.len(),
                        "Registry returned several providers, taking the first"
                    );
                }
                Ok(matches.into_iter().next().map(|found| StrategyHit {
                    npi: found.npi.clone(),
                    resolved_by: ResolvedBy::Registry(self.shape),
                    registry_match: Some(found),
                }))
            }
            Err(RegistryError::Rejected(message)) => {
                debug!(shape = self.shape.as_str(), %message, "Registry rejected query");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

pub fn default_strategies(
    directory: &ProviderDirectory,
    registry: Arc<dyn ProviderRegistry>,
) -> Vec<Box<dyn ResolutionStrategy>> {
    let mut strategies: Vec<Box<dyn ResolutionStrategy>> = vec![
        Box::new(ProvidedIdentifier),
        Box::new(DirectoryMatch::new(directory.clone())),
    ];
    for shape in RegistryQueryShape::FALLBACK_ORDER {
        strategies.push(Box::new(RegistryLookup::new(Arc::clone(&registry), shape)));
    }
    strategies
}

pub struct ProviderResolver {
    directory: ProviderDirectory,
    geocoder: Arc<dyn Geocoder>,
    strategies: Vec<Box<dyn ResolutionStrategy>>,
    vocabulary: Option<SpecialtyVocabulary>,
}

impl ProviderResolver {
    pub fn new(
        directory: ProviderDirectory,
        registry: Arc<dyn ProviderRegistry>,
        geocoder: Arc<dyn Geocoder>,
    ) -> Self {
        let strategies = default_strategies(&directory, registry);
        Self {
            directory,
            geocoder,
            strategies,
            vocabulary: None,
        }
    }

    /// Query specialties outside `vocabulary` are dropped before matching.
    pub fn with_vocabulary(mut self, vocabulary: SpecialtyVocabulary) -> Self {
        self.vocabulary = Some(vocabulary);
        self
    }

    pub fn with_strategies(mut self, strategies: Vec<Box<dyn ResolutionStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    #[instrument(skip_all, fields(provider = %query.display_name()))]
    pub async fn resolve(&self, query: &ResolutionQuery) -> Result<Resolution, ResolveError> {
        let query = self.prepare(query)?;

        for strategy in &self.strategies {
            let Some(hit) = strategy.attempt(&query).await? else {
                continue;
            };
            self.enrich(&query, &hit).await?;
            info!(npi = %hit.npi, resolved_by = strategy.name(), "Resolved provider");
            return Ok(Resolution::Resolved {
                npi: hit.npi,
                resolved_by: hit.resolved_by,
            });
        }

        info!("No provider match, leaving unresolved");
        Ok(Resolution::Unresolved)
    }

    fn prepare(&self, query: &ResolutionQuery) -> Result<ResolutionQuery, ResolveError> {
        let mut query = query.normalized();
        if query.first_name.is_none() && query.last_name.is_none() {
            return Err(ResolveError::InvalidQuery(
                "query has neither a first nor a last name".to_string(),
            ));
        }
        if let Some(vocabulary) = &self.vocabulary {
            if let Some(specialty) = query.specialty.take() {
                query.specialty = match vocabulary.validate(&specialty) {
                    Ok(code) => Some(code),
                    Err(violation) => {
                        warn!(%violation, "Dropping query specialty");
                        None
                    }
                };
            }
        }
        Ok(query)
    }

    /// Merges the query (and registry data, if any) into the record for the
    /// hit's NPI. Skips the write when nothing would change.
    async fn enrich(&self, query: &ResolutionQuery, hit: &StrategyHit) -> Result<(), ResolveError> {
        let existing = self.directory.find_by_id(&hit.npi).await?;
        let registry = hit.registry_match.as_ref();

        let first_name = query
            .first_name
            .clone()
            .or_else(|| registry.and_then(|m| m.first_name.clone()))
            .or_else(|| existing.as_ref().map(|r| r.first_name.clone()));
        let last_name = query
            .last_name
            .clone()
            .or_else(|| registry.and_then(|m| m.last_name.clone()))
            .or_else(|| existing.as_ref().map(|r| r.last_name.clone()));
        let (Some(first_name), Some(last_name)) = (first_name, last_name) else {
            warn!(npi = %hit.npi, "No full name for new provider, skipping directory write");
            return Ok(());
        };

        let mut fragment = ProviderRecord::new(&hit.npi, first_name, last_name);
        fragment.degree = query
            .degree
            .clone()
            .or_else(|| registry.and_then(|m| m.credential.clone()));
        fragment.email = query.email.clone();
        fragment.phone_number = query.phone_number.clone();
        if let Some(specialty) = &query.specialty {
            fragment.specialties.insert(specialty.clone());
        }

        let address = query
            .location
            .clone()
            .or_else(|| registry.and_then(|m| m.practice_address.clone()));
        if let Some(address) = address {
            let address = address.normalized();
            let geocoded = existing
                .as_ref()
                .is_some_and(|r| r.location_is_geocoded(&address));
            let coordinates = if geocoded {
                None
            } else {
                match self.geocoder.geocode(&address).await {
                    Ok(point) => point,
                    // A refused request will be refused again; keep the address ungeocoded.
                    Err(GeocodeError::Rejected(reason)) => {
                        warn!(
                            npi = %hit.npi,
                            %reason,
                            "Geocoder rejected address, storing it without coordinates"
                        );
                        None
                    }
                    Err(err) => return Err(err.into()),
                }
            };
            fragment.locations.push(Location::new(address, coordinates));
        }

        if let Some(existing) = &existing {
            let mut probe = existing.clone();
            if !probe.merge(&fragment) {
                debug!(npi = %hit.npi, "Directory record already holds these signals");
                return Ok(());
            }
        }
        self.directory.upsert(&fragment).await?;
        Ok(())
    }
}
