use std::net::SocketAddr;

use anyhow::Context;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use provider_resolver::{
    Database, DeferredResolver, DirectoryError, FollowUpError, FollowUpPlanner, GeoPoint,
    PatientContext, ProviderDirectory, ResolutionQuery, ResolveError, Services,
    SpecialtyVocabulary,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::cli::ServeArgs;

const DEFAULT_RETRY_LIMIT: usize = 100;
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;

#[derive(Clone)]
struct AppState {
    db: Database,
    directory: ProviderDirectory,
    deferred: DeferredResolver,
    planner: Option<FollowUpPlanner>,
}

impl From<Services> for AppState {
    fn from(services: Services) -> Self {
        Self {
            db: services.db,
            directory: services.directory,
            deferred: services.deferred,
            planner: services.planner,
        }
    }
}

pub async fn run(opts: ServeArgs) -> anyhow::Result<()> {
    let services = opts.config.connect().await.context("connect services")?;
    let app = router(AppState::from(services));

    let addr: SocketAddr = format!("{}:{}", opts.host, opts.port)
        .parse()
        .context("parse host:port")?;

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed listening for ctrl-c");
    }
    tracing::info!("Shutting down");
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/specialties", get(api_specialties))
        .route("/api/providers/resolve", post(api_resolve))
        .route("/api/providers/:npi", get(api_provider_detail))
        .route("/api/follow-ups", post(api_follow_ups))
        .route("/api/pending", get(api_pending_list))
        .route("/api/pending/retry", post(api_pending_retry))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct SpecialtyEntry {
    code: String,
    description: String,
}

async fn api_specialties(State(st): State<AppState>) -> impl IntoResponse {
    match SpecialtyVocabulary::load(&st.db).await {
        Ok(vocabulary) => {
            let entries: Vec<SpecialtyEntry> = vocabulary
                .entries()
                .map(|(code, description)| SpecialtyEntry {
                    code: code.to_string(),
                    description: description.to_string(),
                })
                .collect();
            Json(entries).into_response()
        }
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ResolveParams {
    #[serde(default)]
    defer: bool,
}

#[derive(Debug, Serialize)]
struct Accepted {
    status: &'static str,
}

async fn api_resolve(
    State(st): State<AppState>,
    Query(params): Query<ResolveParams>,
    Json(query): Json<ResolutionQuery>,
) -> impl IntoResponse {
    if params.defer {
        let normalized = query.normalized();
        if normalized.first_name.is_none() && normalized.last_name.is_none() {
            return (
                StatusCode::BAD_REQUEST,
                "query has neither a first nor a last name".to_string(),
            )
                .into_response();
        }
        st.deferred.spawn(query);
        return (StatusCode::ACCEPTED, Json(Accepted { status: "accepted" })).into_response();
    }

    match st.deferred.resolve_or_defer(&query).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e @ ResolveError::InvalidQuery(_)) => {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Err(e) => internal_error(e),
    }
}

async fn api_provider_detail(
    State(st): State<AppState>,
    AxumPath(npi): AxumPath<String>,
) -> impl IntoResponse {
    match st.directory.find_by_id(npi.trim()).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, format!("provider {npi} not found")).into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    lat: f64,
    lng: f64,
    insurance_id: i64,
}

#[derive(Debug, Deserialize)]
struct FollowUpRequest {
    user_info: UserInfo,
    tasks: Vec<String>,
    #[serde(default)]
    max_distance_m: Option<f64>,
}

async fn api_follow_ups(
    State(st): State<AppState>,
    Json(req): Json<FollowUpRequest>,
) -> impl IntoResponse {
    let Some(planner) = st.planner.as_ref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            "follow-up suggestions need an OpenAI API key".to_string(),
        )
            .into_response();
    };
    let patient = PatientContext {
        location: GeoPoint {
            lat: req.user_info.lat,
            lng: req.user_info.lng,
        },
        insurance_id: req.user_info.insurance_id,
    };

    match planner.suggest(&req.tasks, patient, req.max_distance_m).await {
        Ok(suggestions) => Json(suggestions).into_response(),
        Err(FollowUpError::Directory(e @ DirectoryError::InvalidSearch(_))) => {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Err(e @ FollowUpError::Classification(_)) => {
            tracing::warn!(error = %e, "Follow-up classification failed");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct PendingParams {
    limit: Option<usize>,
    max_attempts: Option<u32>,
}

async fn api_pending_list(
    State(st): State<AppState>,
    Query(params): Query<PendingParams>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(DEFAULT_RETRY_LIMIT);
    match st.deferred.queue().list(limit).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn api_pending_retry(
    State(st): State<AppState>,
    Query(params): Query<PendingParams>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(DEFAULT_RETRY_LIMIT);
    let max_attempts = params.max_attempts.unwrap_or(DEFAULT_RETRY_MAX_ATTEMPTS);
    match st.deferred.retry_pending(limit, max_attempts).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => internal_error(e),
    }
}

fn internal_error(e: impl std::fmt::Display) -> axum::response::Response {
    tracing::error!(error = %e, "Request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use provider_resolver::classifier::SpecialtyClassifier;
    use provider_resolver::geo::NoGeocoder;
    use provider_resolver::llm::{StructuredLlm, StructuredPrompt};
    use provider_resolver::registry::{ProviderRegistry, RegistryMatch, RegistrySearch};
    use provider_resolver::vocabulary::upsert_specialties;
    use provider_resolver::{
        Address, CandidateRanker, LlmError, Location, PendingQueue, ProviderRecord,
        ProviderResolver, RegistryError,
    };
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    struct LeersRegistry;

    #[async_trait]
    impl ProviderRegistry for LeersRegistry {
        async fn search(
            &self,
            search: &RegistrySearch,
        ) -> Result<Vec<RegistryMatch>, RegistryError> {
            if !search.last_name.eq_ignore_ascii_case("leers") {
                return Ok(Vec::new());
            }
            Ok(vec![RegistryMatch {
                npi: "1609958305".to_string(),
                first_name: Some("ELLA".to_string()),
                last_name: Some("LEERS".to_string()),
                credential: Some("MD".to_string()),
                primary_taxonomy: None,
                practice_address: None,
            }])
        }
    }

    struct EntLlm;

    #[async_trait]
    impl StructuredLlm for EntLlm {
        async fn complete_json(&self, prompt: &StructuredPrompt) -> Result<String, LlmError> {
            let specialty = prompt.user.contains("ENT").then_some("ENT");
            Ok(json!({ "specialty": specialty }).to_string())
        }
    }

    async fn test_state(with_llm: bool) -> AppState {
        let db = Database::open_in_memory().unwrap();
        upsert_specialties(
            &db,
            &SpecialtyVocabulary::new([("ENT", "Ear, Nose and Throat"), ("PCP", "Primary care")]),
        )
        .await
        .unwrap();

        let directory = ProviderDirectory::new(db.clone());
        let mut ent = ProviderRecord::new("1000000002", "Near", "Doc");
        ent.specialties.insert("ENT".to_string());
        ent.insurances.insert(3);
        ent.locations.push(Location::new(
            Address {
                street: "2 Near St".to_string(),
                city: "Brooklyn".to_string(),
                state: "NY".to_string(),
                zip_code: "11211".to_string(),
            },
            Some(GeoPoint {
                lat: 40.7222,
                lng: -73.9620,
            }),
        ));
        directory.upsert(&ent).await.unwrap();

        let resolver = ProviderResolver::new(
            directory.clone(),
            Arc::new(LeersRegistry),
            Arc::new(NoGeocoder),
        );
        let deferred = DeferredResolver::new(Arc::new(resolver), PendingQueue::new(db.clone()));
        let planner = with_llm.then(|| {
            FollowUpPlanner::new(
                db.clone(),
                SpecialtyClassifier::new(Arc::new(EntLlm)),
                CandidateRanker::new(directory.clone()),
            )
        });

        AppState {
            db,
            directory,
            deferred,
            planner,
        }
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn specialties_are_listed() {
        let app = router(test_state(false).await);
        let response = app.oneshot(get_request("/api/specialties")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!([
                {"code": "ENT", "description": "Ear, Nose and Throat"},
                {"code": "PCP", "description": "Primary care"}
            ])
        );
    }

    #[tokio::test]
    async fn resolve_returns_outcome_and_record_is_retrievable() {
        let state = test_state(false).await;
        let query = json!({"first_name": "Ella", "last_name": "Leers", "specialty": "PCP"});

        let response = router(state.clone())
            .oneshot(json_request("POST", "/api/providers/resolve", query))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({"status": "resolved", "npi": "1609958305", "resolved_by": {"registry": "name"}})
        );

        let response = router(state)
            .oneshot(get_request("/api/providers/1609958305"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let record = body_json(response).await;
        assert_eq!(record["specialties"], json!(["PCP"]));
        assert_eq!(record["degree"], json!("MD"));
    }

    #[tokio::test]
    async fn unmatched_provider_is_reported_pending() {
        let state = test_state(false).await;
        let query = json!({"first_name": "Nobody", "last_name": "Known"});
        let response = router(state.clone())
            .oneshot(json_request("POST", "/api/providers/resolve", query))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], json!("pending"));
        assert_eq!(body["reason"], json!("unresolved"));

        let response = router(state)
            .oneshot(get_request("/api/pending"))
            .await
            .unwrap();
        let entries = body_json(response).await;
        assert_eq!(entries.as_array().unwrap().len(), 1);
        assert_eq!(entries[0]["query"]["last_name"], json!("Known"));
    }

    #[tokio::test]
    async fn nameless_query_is_bad_request() {
        let state = test_state(false).await;
        for uri in ["/api/providers/resolve", "/api/providers/resolve?defer=true"] {
            let response = router(state.clone())
                .oneshot(json_request("POST", uri, json!({"npi": "1609958305"})))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        }
    }

    #[tokio::test]
    async fn deferred_resolution_is_accepted_and_completes_in_background() {
        let state = test_state(false).await;
        let query = json!({"first_name": "Ella", "last_name": "Leers"});
        let response = router(state.clone())
            .oneshot(json_request(
                "POST",
                "/api/providers/resolve?defer=true",
                query,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let mut found = false;
        for _ in 0..100 {
            if state.directory.find_by_id("1609958305").await.unwrap().is_some() {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(found);
    }

    #[tokio::test]
    async fn unknown_provider_is_not_found() {
        let response = router(test_state(false).await)
            .oneshot(get_request("/api/providers/0000000000"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn follow_ups_need_an_llm() {
        let body = json!({
            "user_info": {"lat": 40.7197743, "lng": -73.9641896, "insurance_id": 3},
            "tasks": ["Schedule an appointment with a ENT specialist"]
        });
        let response = router(test_state(false).await)
            .oneshot(json_request("POST", "/api/follow-ups", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn follow_ups_rank_nearby_providers_per_task() {
        let body = json!({
            "user_info": {"lat": 40.7197743, "lng": -73.9641896, "insurance_id": 3},
            "tasks": ["Schedule an appointment with a ENT specialist", "Get bloodwork"]
        });
        let response = router(test_state(true).await)
            .oneshot(json_request("POST", "/api/follow-ups", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let suggestions = body_json(response).await;
        assert_eq!(suggestions[0]["specialty"], json!("ENT"));
        assert_eq!(
            suggestions[0]["candidates"][0]["provider"]["npi"],
            json!("1000000002")
        );
        assert!(suggestions[0]["candidates"][0]["distance_m"].as_f64().unwrap() < 1_000.0);
        assert_eq!(suggestions[1]["specialty"], json!("unknown"));
        assert_eq!(suggestions[1]["candidates"], json!([]));
    }

    #[tokio::test]
    async fn pending_retry_reports_summary() {
        let response = router(test_state(false).await)
            .oneshot(json_request("POST", "/api/pending/retry?limit=10", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({"attempted": 0, "resolved": 0, "still_pending": 0, "discarded": 0})
        );
    }
}
