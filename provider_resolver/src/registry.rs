use async_trait::async_trait;
use reqwest::{Client, header::RETRY_AFTER};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::common::{
    RateSlot, clean, is_retryable_status, next_backoff, parse_retry_after, truncate_for_log,
};
use crate::error::RegistryError;
use crate::model::Address;

/// Parameter sets tried against the registry, tightest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryQueryShape {
    NameCityState,
    NameState,
    Name,
}

impl RegistryQueryShape {
    pub const FALLBACK_ORDER: [RegistryQueryShape; 3] = [
        RegistryQueryShape::NameCityState,
        RegistryQueryShape::NameState,
        RegistryQueryShape::Name,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryQueryShape::NameCityState => "name_city_state",
            RegistryQueryShape::NameState => "name_state",
            RegistryQueryShape::Name => "name",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySearch {
    pub first_name: String,
    pub last_name: String,
    pub city: Option<String>,
    pub state: Option<String>,
}

impl RegistrySearch {
    /// Builds the search for `shape`, or `None` when a location field the
    /// shape needs is missing.
    pub fn for_shape(
        shape: RegistryQueryShape,
        first_name: &str,
        last_name: &str,
        city: Option<&str>,
        state: Option<&str>,
    ) -> Option<Self> {
        let city = clean(city);
        let state = clean(state);
        let (city, state) = match shape {
            RegistryQueryShape::NameCityState => (Some(city?), Some(state?)),
            RegistryQueryShape::NameState => (None, Some(state?)),
            RegistryQueryShape::Name => (None, None),
        };
        Some(Self {
            first_name: first_name.trim().to_string(),
            last_name: last_name.trim().to_string(),
            city,
            state,
        })
    }

    fn query_params<'a>(&'a self, api_version: &'a str) -> Vec<(&'static str, &'a str)> {
        let mut params = vec![
            ("version", api_version),
            ("first_name", self.first_name.as_str()),
            ("last_name", self.last_name.as_str()),
        ];
        if let Some(city) = &self.city {
            params.push(("city", city.as_str()));
        }
        if let Some(state) = &self.state {
            params.push(("state", state.as_str()));
        }
        params
    }
}

/// One registry result, reduced to what the directory can use.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryMatch {
    pub npi: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub credential: Option<String>,
    pub primary_taxonomy: Option<String>,
    pub practice_address: Option<Address>,
}

#[async_trait]
pub trait ProviderRegistry: Send + Sync {
    /// Runs a single query shape. Results come back in registry order.
    async fn search(&self, search: &RegistrySearch) -> Result<Vec<RegistryMatch>, RegistryError>;

    /// Walks the fallback order and returns the first result of the first
    /// shape that yields any. Rejected queries count as "no match" for their
    /// shape.
    async fn lookup(
        &self,
        first_name: &str,
        last_name: &str,
        city: Option<&str>,
        state: Option<&str>,
    ) -> Result<Option<RegistryMatch>, RegistryError> {
        for shape in RegistryQueryShape::FALLBACK_ORDER {
            let Some(search) = RegistrySearch::for_shape(shape, first_name, last_name, city, state)
            else {
                continue;
            };
            match self.search(&search).await {
                Ok(matches) => {
                    if let Some(found) = matches.into_iter().next() {
                        return Ok(Some(found));
                    }
                }
                Err(RegistryError::Rejected(message)) => {
                    debug!(shape = shape.as_str(), %message, "Registry rejected query shape");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }
}

/// Client for the NPPES NPI registry API.
#[derive(Clone)]
pub struct NpiRegistryClient {
    client: Client,
    api_base_url: String,
    api_version: String,
    max_retries: u32,
    rate: RateSlot,
}

impl NpiRegistryClient {
    pub fn new(
        client: Client,
        api_base_url: impl Into<String>,
        api_version: impl Into<String>,
        max_retries: u32,
        requests_per_second: u32,
    ) -> Self {
        Self {
            client,
            api_base_url: api_base_url.into(),
            api_version: api_version.into(),
            max_retries: max_retries.max(1),
            rate: RateSlot::per_second(requests_per_second),
        }
    }

    async fn fetch(&self, search: &RegistrySearch) -> Result<NpiApiResponse, RegistryError> {
        let attempts = self.max_retries;
        let mut backoff = Duration::from_secs(1);
        let who = format!("{} {}", search.first_name, search.last_name);

        for attempt in 1..=attempts {
            self.rate.wait().await;
            let response = self
                .client
                .get(&self.api_base_url)
                .query(&search.query_params(&self.api_version))
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.json::<NpiApiResponse>().await.map_err(|e| {
                            RegistryError::Unavailable(format!(
                                "invalid NPI API JSON for {who}: {e}"
                            ))
                        });
                    }

                    let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                    let body = resp.text().await.unwrap_or_default();
                    if is_retryable_status(status) {
                        if attempt == attempts {
                            return Err(RegistryError::Unavailable(format!(
                                "retryable status {status} for {who} after {attempts} attempts. Body: {}",
                                truncate_for_log(&body)
                            )));
                        }
                        warn!(%status, attempt, "NPI API throttled or failing, retrying");
                        tokio::time::sleep(retry_after.unwrap_or(backoff)).await;
                        backoff = next_backoff(backoff);
                        continue;
                    }

                    return Err(RegistryError::Unavailable(format!(
                        "non-retryable status {status} for {who}. Body: {}",
                        truncate_for_log(&body)
                    )));
                }
                Err(err) => {
                    if attempt == attempts {
                        return Err(RegistryError::Unavailable(format!(
                            "request failed for {who}: {err}"
                        )));
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff);
                }
            }
        }

        Err(RegistryError::Unavailable(format!(
            "no attempts made for {who}"
        )))
    }
}

#[async_trait]
impl ProviderRegistry for NpiRegistryClient {
    async fn search(&self, search: &RegistrySearch) -> Result<Vec<RegistryMatch>, RegistryError> {
        let response = self.fetch(search).await?;
        let matches = matches_from_response(response)?;
        debug!(
            first_name = %search.first_name,
            last_name = %search.last_name,
            city = search.city.as_deref().unwrap_or(""),
            state = search.state.as_deref().unwrap_or(""),
            results = matches.len(),
            "NPI registry search"
        );
        Ok(matches)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct NpiApiResponse {
    #[serde(default)]
    results: Vec<NpiResult>,
    #[serde(default, rename = "Errors")]
    errors: Vec<NpiApiError>,
}

#[derive(Debug, Deserialize)]
struct NpiApiError {
    description: Option<String>,
    field: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NpiResult {
    // String in v2.1 responses, integer in some older ones.
    number: Option<Value>,
    basic: Option<NpiBasic>,
    #[serde(default)]
    addresses: Vec<NpiAddress>,
    #[serde(default)]
    taxonomies: Vec<NpiTaxonomy>,
}

#[derive(Debug, Deserialize)]
struct NpiBasic {
    first_name: Option<String>,
    last_name: Option<String>,
    credential: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NpiAddress {
    address_purpose: Option<String>,
    address_1: Option<String>,
    address_2: Option<String>,
    city: Option<String>,
    state: Option<String>,
    postal_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NpiTaxonomy {
    desc: Option<String>,
    #[serde(default)]
    primary: bool,
}

pub(crate) fn matches_from_response(
    response: NpiApiResponse,
) -> Result<Vec<RegistryMatch>, RegistryError> {
    if !response.errors.is_empty() {
        let message = response
            .errors
            .iter()
            .map(|e| match (e.field.as_deref(), e.description.as_deref()) {
                (Some(field), Some(description)) => format!("{field}: {description}"),
                (None, Some(description)) => description.to_string(),
                (Some(field), None) => field.to_string(),
                (None, None) => "unspecified error".to_string(),
            })
            .collect::<Vec<_>>()
            .join("; ");
        return Err(RegistryError::Rejected(message));
    }

    Ok(response
        .results
        .into_iter()
        .filter_map(extract_match)
        .collect())
}

fn extract_match(result: NpiResult) -> Option<RegistryMatch> {
    let npi = match result.number? {
        Value::String(s) => clean(Some(&s))?,
        Value::Number(n) => n.to_string(),
        _ => return None,
    };

    let (first_name, last_name, credential) = match &result.basic {
        Some(basic) => (
            clean(basic.first_name.as_deref()),
            clean(basic.last_name.as_deref()),
            clean(basic.credential.as_deref()),
        ),
        None => (None, None, None),
    };

    let primary_taxonomy = result
        .taxonomies
        .iter()
        .find(|t| t.primary)
        .or_else(|| result.taxonomies.first())
        .and_then(|t| clean(t.desc.as_deref()));

    let practice_address = result
        .addresses
        .iter()
        .find(|a| a.address_purpose.as_deref() == Some("LOCATION"))
        .and_then(practice_address);

    Some(RegistryMatch {
        npi,
        first_name,
        last_name,
        credential,
        primary_taxonomy,
        practice_address,
    })
}

fn practice_address(address: &NpiAddress) -> Option<Address> {
    let line_1 = clean(address.address_1.as_deref())?;
    let street = match clean(address.address_2.as_deref()) {
        Some(line_2) => format!("{line_1} {line_2}"),
        None => line_1,
    };
    Some(
        Address {
            street,
            city: clean(address.city.as_deref()).unwrap_or_default(),
            state: clean(address.state.as_deref()).unwrap_or_default(),
            zip_code: clean(address.postal_code.as_deref()).unwrap_or_default(),
        }
        .normalized(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn parse(value: Value) -> Result<Vec<RegistryMatch>, RegistryError> {
        matches_from_response(serde_json::from_value(value).unwrap())
    }

    #[test]
    fn parses_names_credential_taxonomy_and_practice_address() {
        let matches = parse(json!({
            "result_count": 1,
            "results": [{
                "number": "1609958305",
                "basic": {"first_name": "ELLA", "last_name": "LEERS", "credential": "M.D."},
                "addresses": [
                    {"address_purpose": "MAILING", "address_1": "PO BOX 1", "city": "ALBANY",
                     "state": "NY", "postal_code": "122010001"},
                    {"address_purpose": "LOCATION", "address_1": "1 BEDFORD AVE", "address_2": "STE 2",
                     "city": "BROOKLYN", "state": "NY", "postal_code": "112111234"}
                ],
                "taxonomies": [
                    {"desc": "Sports Medicine", "primary": false},
                    {"desc": "Family Medicine", "primary": true}
                ]
            }]
        }))
        .unwrap();

        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert_eq!(m.npi, "1609958305");
        assert_eq!(m.first_name.as_deref(), Some("ELLA"));
        assert_eq!(m.credential.as_deref(), Some("M.D."));
        assert_eq!(m.primary_taxonomy.as_deref(), Some("Family Medicine"));
        let address = m.practice_address.as_ref().unwrap();
        assert_eq!(address.street, "1 BEDFORD AVE STE 2");
        assert_eq!(address.zip_code, "11211");
    }

    #[test]
    fn numeric_identifier_and_missing_sections_are_tolerated() {
        let matches = parse(json!({"results": [{"number": 1609958305u64}, {"basic": {}}]})).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].npi, "1609958305");
        assert_eq!(matches[0].practice_address, None);
        assert!(parse(json!({})).unwrap().is_empty());
    }

    #[test]
    fn errors_payload_is_a_rejection() {
        let err = parse(json!({
            "Errors": [{"description": "No valid search criteria provided", "field": "generic"}]
        }))
        .unwrap_err();
        assert!(
            matches!(err, RegistryError::Rejected(m) if m == "generic: No valid search criteria provided")
        );
    }

    #[test]
    fn shapes_need_their_location_fields() {
        assert!(
            RegistrySearch::for_shape(
                RegistryQueryShape::NameCityState,
                "Ella",
                "Leers",
                None,
                Some("NY")
            )
            .is_none()
        );
        let s = RegistrySearch::for_shape(
            RegistryQueryShape::NameState,
            "Ella",
            "Leers",
            Some("Brooklyn"),
            Some("NY"),
        )
        .unwrap();
        assert_eq!(s.city, None);
        assert_eq!(
            s.query_params("2.1"),
            [
                ("version", "2.1"),
                ("first_name", "Ella"),
                ("last_name", "Leers"),
                ("state", "NY")
            ]
        );
    }

    enum Reply {
        Matches(Vec<&'static str>),
        Rejected,
        Down,
    }

    struct ScriptedRegistry {
        replies: Mutex<Vec<Reply>>,
        seen: Mutex<Vec<RegistrySearch>>,
    }

    impl ScriptedRegistry {
        fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ProviderRegistry for ScriptedRegistry {
        async fn search(
            &self,
            search: &RegistrySearch,
        ) -> Result<Vec<RegistryMatch>, RegistryError> {
            self.seen.lock().unwrap().push(search.clone());
            let reply = self.replies.lock().unwrap().remove(0);
            match reply {
                Reply::Matches(npis) => Ok(npis
                    .into_iter()
                    .map(|npi| RegistryMatch {
                        npi: npi.to_string(),
                        first_name: None,
                        last_name: None,
                        credential: None,
                        primary_taxonomy: None,
                        practice_address: None,
                    })
                    .collect()),
                Reply::Rejected => Err(RegistryError::Rejected("bad".to_string())),
                Reply::Down => Err(RegistryError::Unavailable("down".to_string())),
            }
        }
    }

    #[tokio::test]
    async fn lookup_falls_back_and_takes_first_result() {
        let registry = ScriptedRegistry::new(vec![
            Reply::Matches(vec![]),
            Reply::Rejected,
            Reply::Matches(vec!["1111111111", "2222222222"]),
        ]);
        let found = registry
            .lookup("Ella", "Leers", Some("Brooklyn"), Some("NY"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.npi, "1111111111");

        let seen = registry.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].city.as_deref(), Some("Brooklyn"));
        assert_eq!(seen[1].city, None);
        assert_eq!(seen[2].state, None);
    }

    #[tokio::test]
    async fn lookup_skips_shapes_without_location() {
        let registry = ScriptedRegistry::new(vec![Reply::Matches(vec![])]);
        let found = registry.lookup("Ella", "Leers", None, None).await.unwrap();
        assert!(found.is_none());
        assert_eq!(registry.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lookup_propagates_unavailable() {
        let registry = ScriptedRegistry::new(vec![Reply::Down]);
        let err = registry
            .lookup("Ella", "Leers", None, Some("NY"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Unavailable(_)));
    }
}
