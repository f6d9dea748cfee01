use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::common::now_unix_seconds;
use crate::db::Database;
use crate::error::{DirectoryError, ResolveError};
use crate::model::ResolutionQuery;
use crate::resolver::{ProviderResolver, Resolution, ResolvedBy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingReason {
    /// No strategy produced an identifier; waits for the registry or a human.
    Unresolved,
    /// An I/O failure interrupted resolution.
    Transient,
    /// Several directory records matched; needs a human.
    Ambiguous,
}

impl PendingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingReason::Unresolved => "unresolved",
            PendingReason::Transient => "transient",
            PendingReason::Ambiguous => "ambiguous",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "unresolved" => Some(PendingReason::Unresolved),
            "transient" => Some(PendingReason::Transient),
            "ambiguous" => Some(PendingReason::Ambiguous),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingResolution {
    pub id: i64,
    pub query: ResolutionQuery,
    pub reason: PendingReason,
    pub last_error: Option<String>,
    pub attempts: u32,
    pub created_at_unix: i64,
    pub updated_at_unix: i64,
}

/// Resolutions that could not complete, kept for retry or review.
#[derive(Clone)]
pub struct PendingQueue {
    db: Database,
}

impl PendingQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn enqueue(
        &self,
        query: &ResolutionQuery,
        reason: PendingReason,
        last_error: Option<&str>,
    ) -> Result<i64, DirectoryError> {
        let query_json = serde_json::to_string(query)?;
        let now = now_unix_seconds();
        let conn = self.db.lock().await;
        conn.execute(
            "
            INSERT INTO pending_resolutions
                (query_json, reason, last_error, attempts, created_at_unix, updated_at_unix)
            VALUES (?1, ?2, ?3, 0, ?4, ?4)
            ",
            params![query_json, reason.as_str(), last_error, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get(&self, id: i64) -> Result<Option<PendingResolution>, DirectoryError> {
        let conn = self.db.lock().await;
        let row = conn
            .query_row(
                "
                SELECT id, query_json, reason, last_error, attempts, created_at_unix, updated_at_unix
                FROM pending_resolutions
                WHERE id = ?1
                ",
                [id],
                raw_row,
            )
            .optional()?;
        row.map(decode_row).transpose()
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<PendingResolution>, DirectoryError> {
        let conn = self.db.lock().await;
        select_rows(
            &conn,
            "
            SELECT id, query_json, reason, last_error, attempts, created_at_unix, updated_at_unix
            FROM pending_resolutions
            ORDER BY id
            LIMIT ?1
            ",
            params![limit as i64],
        )
    }

    /// Entries worth another attempt: not ambiguous and under `max_attempts`.
    pub async fn list_retryable(
        &self,
        limit: usize,
        max_attempts: u32,
    ) -> Result<Vec<PendingResolution>, DirectoryError> {
        let conn = self.db.lock().await;
        select_rows(
            &conn,
            "
            SELECT id, query_json, reason, last_error, attempts, created_at_unix, updated_at_unix
            FROM pending_resolutions
            WHERE reason <> ?1 AND attempts < ?2
            ORDER BY id
            LIMIT ?3
            ",
            params![
                PendingReason::Ambiguous.as_str(),
                max_attempts as i64,
                limit as i64
            ],
        )
    }

    /// Removes a resolved entry. Returns false when it was already gone.
    pub async fn complete(&self, id: i64) -> Result<bool, DirectoryError> {
        let conn = self.db.lock().await;
        let deleted = conn.execute("DELETE FROM pending_resolutions WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    pub async fn record_failure(
        &self,
        id: i64,
        reason: PendingReason,
        last_error: Option<&str>,
    ) -> Result<(), DirectoryError> {
        let conn = self.db.lock().await;
        conn.execute(
            "
            UPDATE pending_resolutions
            SET reason = ?2,
                last_error = ?3,
                attempts = attempts + 1,
                updated_at_unix = ?4
            WHERE id = ?1
            ",
            params![id, reason.as_str(), last_error, now_unix_seconds()],
        )?;
        Ok(())
    }

    pub async fn count(&self) -> Result<usize, DirectoryError> {
        let conn = self.db.lock().await;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM pending_resolutions", [], |row| {
                row.get(0)
            })?;
        Ok(count.max(0) as usize)
    }
}

fn select_rows(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<PendingResolution>, DirectoryError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, raw_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(decode_row(row?)?);
    }
    Ok(out)
}

type RawRow = (i64, String, String, Option<String>, i64, i64, i64);

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_row(raw: RawRow) -> Result<PendingResolution, DirectoryError> {
    let (id, query_json, reason, last_error, attempts, created_at_unix, updated_at_unix) = raw;
    let reason = PendingReason::parse(&reason).ok_or_else(|| {
        DirectoryError::InvalidRecord(format!("pending entry {id} has unknown reason {reason:?}"))
    })?;
    Ok(PendingResolution {
        id,
        query: serde_json::from_str(&query_json)?,
        reason,
        last_error,
        attempts: attempts.max(0) as u32,
        created_at_unix,
        updated_at_unix,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Resolved {
        npi: String,
        resolved_by: ResolvedBy,
    },
    Pending {
        pending_id: i64,
        reason: PendingReason,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetrySummary {
    pub attempted: usize,
    pub resolved: usize,
    pub still_pending: usize,
    pub discarded: usize,
}

/// Runs resolutions that must never block or fail ingestion: anything short
/// of a resolved identifier lands in the pending queue.
#[derive(Clone)]
pub struct DeferredResolver {
    resolver: Arc<ProviderResolver>,
    queue: PendingQueue,
}

impl DeferredResolver {
    pub fn new(resolver: Arc<ProviderResolver>, queue: PendingQueue) -> Self {
        Self { resolver, queue }
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    /// `InvalidQuery` comes back as an error and is never queued. The only
    /// other error is a `Transient` failure to write the queue entry itself.
    pub async fn resolve_or_defer(
        &self,
        query: &ResolutionQuery,
    ) -> Result<ResolutionOutcome, ResolveError> {
        let (reason, error) = match self.resolver.resolve(query).await {
            Ok(Resolution::Resolved { npi, resolved_by }) => {
                return Ok(ResolutionOutcome::Resolved { npi, resolved_by });
            }
            Ok(Resolution::Unresolved) => (PendingReason::Unresolved, None),
            Err(err @ ResolveError::InvalidQuery(_)) => return Err(err),
            Err(err @ ResolveError::AmbiguousMatch { .. }) => {
                (PendingReason::Ambiguous, Some(err.to_string()))
            }
            Err(err @ ResolveError::Transient(_)) => {
                warn!(error = %err, "Resolution failed, deferring");
                (PendingReason::Transient, Some(err.to_string()))
            }
        };

        let pending_id = self
            .queue
            .enqueue(query, reason, error.as_deref())
            .await?;
        info!(
            pending_id,
            reason = reason.as_str(),
            provider = %query.display_name(),
            "Queued provider resolution"
        );
        Ok(ResolutionOutcome::Pending { pending_id, reason })
    }

    /// Resolves in the background. Once started the task runs to completion
    /// even if the handle is dropped.
    pub fn spawn(&self, query: ResolutionQuery) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            match this.resolve_or_defer(&query).await {
                Ok(outcome) => debug!(?outcome, "Background resolution finished"),
                Err(err) => warn!(error = %err, "Background resolution rejected query"),
            }
        })
    }

    pub async fn retry_pending(
        &self,
        limit: usize,
        max_attempts: u32,
    ) -> Result<RetrySummary, DirectoryError> {
        let entries = self.queue.list_retryable(limit, max_attempts).await?;
        let mut summary = RetrySummary::default();

        for entry in entries {
            summary.attempted += 1;
            match self.resolver.resolve(&entry.query).await {
                Ok(Resolution::Resolved { npi, .. }) => {
                    self.queue.complete(entry.id).await?;
                    info!(pending_id = entry.id, %npi, "Pending resolution completed");
                    summary.resolved += 1;
                }
                Ok(Resolution::Unresolved) => {
                    self.queue
                        .record_failure(entry.id, PendingReason::Unresolved, None)
                        .await?;
                    summary.still_pending += 1;
                }
                Err(err @ ResolveError::InvalidQuery(_)) => {
                    warn!(pending_id = entry.id, error = %err, "Discarding invalid pending entry");
                    self.queue.complete(entry.id).await?;
                    summary.discarded += 1;
                }
                Err(err) => {
                    let reason = if matches!(err, ResolveError::AmbiguousMatch { .. }) {
                        PendingReason::Ambiguous
                    } else {
                        PendingReason::Transient
                    };
                    self.queue
                        .record_failure(entry.id, reason, Some(&err.to_string()))
                        .await?;
                    summary.still_pending += 1;
                }
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ProviderDirectory;
    use crate::error::RegistryError;
    use crate::geo::NoGeocoder;
    use crate::model::ProviderRecord;
    use crate::registry::{ProviderRegistry, RegistryMatch, RegistryQueryShape, RegistrySearch};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU8, Ordering};

    const EMPTY: u8 = 0;
    const KNOWS_ELLA: u8 = 1;
    const DOWN: u8 = 2;

    struct SwitchableRegistry {
        mode: AtomicU8,
    }

    impl SwitchableRegistry {
        fn new(mode: u8) -> Arc<Self> {
            Arc::new(Self {
                mode: AtomicU8::new(mode),
            })
        }

        fn set(&self, mode: u8) {
            self.mode.store(mode, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ProviderRegistry for SwitchableRegistry {
        async fn search(
            &self,
            _search: &RegistrySearch,
        ) -> Result<Vec<RegistryMatch>, RegistryError> {
            match self.mode.load(Ordering::SeqCst) {
                KNOWS_ELLA => Ok(vec![RegistryMatch {
                    npi: "1609958305".to_string(),
                    first_name: None,
                    last_name: None,
                    credential: None,
                    primary_taxonomy: None,
                    practice_address: None,
                }]),
                DOWN => Err(RegistryError::Unavailable("timeout".to_string())),
                _ => Ok(Vec::new()),
            }
        }
    }

    fn deferred(registry: Arc<SwitchableRegistry>) -> (DeferredResolver, ProviderDirectory) {
        let db = Database::open_in_memory().unwrap();
        let directory = ProviderDirectory::new(db.clone());
        let resolver = ProviderResolver::new(directory.clone(), registry, Arc::new(NoGeocoder));
        (
            DeferredResolver::new(Arc::new(resolver), PendingQueue::new(db)),
            directory,
        )
    }

    fn ella() -> ResolutionQuery {
        ResolutionQuery::named("Ella", "Leers").with_specialty("PCP")
    }

    #[tokio::test]
    async fn unresolved_query_is_queued_then_retried_to_completion() {
        let registry = SwitchableRegistry::new(EMPTY);
        let (deferred, directory) = deferred(registry.clone());

        let outcome = deferred.resolve_or_defer(&ella()).await.unwrap();
        let ResolutionOutcome::Pending { pending_id, reason } = outcome else {
            panic!("expected pending outcome, got {outcome:?}");
        };
        assert_eq!(reason, PendingReason::Unresolved);

        let entry = deferred.queue().get(pending_id).await.unwrap().unwrap();
        assert_eq!(entry.query, ella());
        assert_eq!(entry.attempts, 0);

        let summary = deferred.retry_pending(10, 5).await.unwrap();
        assert_eq!(summary.still_pending, 1);
        let entry = deferred.queue().get(pending_id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, 1);

        registry.set(KNOWS_ELLA);
        let summary = deferred.retry_pending(10, 5).await.unwrap();
        assert_eq!(
            summary,
            RetrySummary {
                attempted: 1,
                resolved: 1,
                still_pending: 0,
                discarded: 0,
            }
        );
        assert_eq!(deferred.queue().count().await.unwrap(), 0);
        assert!(directory.find_by_id("1609958305").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn transient_failures_stop_after_max_attempts() {
        let registry = SwitchableRegistry::new(DOWN);
        let (deferred, _) = deferred(registry);

        let outcome = deferred.resolve_or_defer(&ella()).await.unwrap();
        assert!(matches!(
            outcome,
            ResolutionOutcome::Pending {
                reason: PendingReason::Transient,
                ..
            }
        ));
        let entries = deferred.queue().list(10).await.unwrap();
        assert!(entries[0].last_error.as_deref().unwrap().contains("timeout"));

        assert_eq!(deferred.retry_pending(10, 2).await.unwrap().attempted, 1);
        assert_eq!(deferred.retry_pending(10, 2).await.unwrap().attempted, 1);
        assert_eq!(deferred.retry_pending(10, 2).await.unwrap().attempted, 0);
        assert_eq!(deferred.queue().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn ambiguous_entries_wait_for_a_human() {
        let registry = SwitchableRegistry::new(EMPTY);
        let (deferred, directory) = deferred(registry);
        for npi in ["1000000001", "1000000002"] {
            let mut r = ProviderRecord::new(npi, "Ella", "Leers");
            r.specialties.insert("PCP".to_string());
            directory.upsert(&r).await.unwrap();
        }

        let outcome = deferred.resolve_or_defer(&ella()).await.unwrap();
        assert!(matches!(
            outcome,
            ResolutionOutcome::Pending {
                reason: PendingReason::Ambiguous,
                ..
            }
        ));
        assert_eq!(deferred.retry_pending(10, 5).await.unwrap().attempted, 0);
    }

    #[tokio::test]
    async fn invalid_queries_are_not_queued() {
        let (deferred, _) = deferred(SwitchableRegistry::new(EMPTY));
        let err = deferred
            .resolve_or_defer(&ResolutionQuery::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::InvalidQuery(_)));
        assert_eq!(deferred.queue().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn spawned_resolution_lands_in_the_directory() {
        let (deferred, directory) = deferred(SwitchableRegistry::new(KNOWS_ELLA));
        deferred.spawn(ella()).await.unwrap();
        let record = directory.find_by_id("1609958305").await.unwrap().unwrap();
        assert!(record.specialties.contains("PCP"));
    }

    #[test]
    fn resolved_outcome_serializes_with_status_tag() {
        let outcome = ResolutionOutcome::Resolved {
            npi: "1609958305".to_string(),
            resolved_by: ResolvedBy::Registry(RegistryQueryShape::NameState),
        };
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            serde_json::json!({
                "status": "resolved",
                "npi": "1609958305",
                "resolved_by": {"registry": "name_state"}
            })
        );
    }

    #[tokio::test]
    async fn failed_queue_write_surfaces_as_transient() {
        let db = Database::open_in_memory().unwrap();
        db.lock()
            .await
            .execute_batch("DROP TABLE pending_resolutions")
            .unwrap();
        let resolver = ProviderResolver::new(
            ProviderDirectory::new(db.clone()),
            SwitchableRegistry::new(EMPTY),
            Arc::new(NoGeocoder),
        );
        let deferred = DeferredResolver::new(Arc::new(resolver), PendingQueue::new(db));

        let err = deferred.resolve_or_defer(&ella()).await.unwrap_err();
        assert!(matches!(err, ResolveError::Transient(_)));
    }
}
