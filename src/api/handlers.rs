//! API Handlers
//!
//! HTTP request handlers for each group cache endpoint. Reads run on the
//! blocking pool; every mutation goes through the writer queue.

use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path, Query, State},
    Json,
};
use tokio::task::JoinHandle;

use crate::cache::{CacheKind, CacheRegistry, ChangeSubscriptions, IngestStats, RebuildReport};
use crate::directory::MemoryDirectory;
use crate::error::{CacheError, Result};
use crate::ingest::ChangeIngester;
use crate::models::{
    AddShardRequest, CacheStatus, ChangeEventRequest, EventResponse, HealthResponse, IndexStatus,
    MembershipQuery, MembershipResponse, RebuildRequest, RemoveResponse, ShardResponse,
    StatsResponse,
};
use crate::query::QueryFrontend;
use crate::tasks::{spawn_writer, WriterHandle};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<CacheRegistry>,
    pub queries: QueryFrontend,
    pub writer: WriterHandle,
    pub stats: Arc<Mutex<IngestStats>>,
}

impl AppState {
    /// Creates the state around an initialized registry and starts the
    /// writer task.
    ///
    /// # Arguments
    /// * `registry` - Registry shared by readers and the writer
    /// * `queue_depth` - Capacity of the writer queue
    pub fn new(registry: Arc<CacheRegistry>, queue_depth: usize) -> Self {
        Self::start(registry, queue_depth).0
    }

    /// Like `new`, also returning the writer task so the caller can wait for
    /// it to drain on shutdown.
    pub fn start(registry: Arc<CacheRegistry>, queue_depth: usize) -> (Self, JoinHandle<()>) {
        let ingester = Arc::new(ChangeIngester::new(Arc::clone(&registry)));
        let stats = ingester.stats_handle();
        let (writer, task) = spawn_writer(ingester, queue_depth);
        let state = Self {
            queries: QueryFrontend::new(Arc::clone(&registry)),
            registry,
            writer,
            stats,
        };
        (state, task)
    }
}

/// Runs blocking storage work off the async workers.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| CacheError::Internal(format!("blocking task failed: {}", e)))?
}

/// Handler for GET /groups-for-user
pub async fn groups_for_user_handler(
    State(state): State<AppState>,
    Query(query): Query<MembershipQuery>,
) -> Result<Json<MembershipResponse>> {
    let queries = state.queries.clone();
    let (dn, nested) = (query.dn.clone(), query.nested);
    let groups = blocking(move || queries.groups_for_user(&dn, nested)).await?;
    Ok(Json(MembershipResponse::new(query.dn, query.nested, groups)))
}

/// Handler for GET /users-in-group
pub async fn users_in_group_handler(
    State(state): State<AppState>,
    Query(query): Query<MembershipQuery>,
) -> Result<Json<MembershipResponse>> {
    let queries = state.queries.clone();
    let (dn, nested) = (query.dn.clone(), query.nested);
    let users = blocking(move || queries.users_in_group(&dn, nested)).await?;
    Ok(Json(MembershipResponse::new(query.dn, query.nested, users)))
}

/// Handler for POST /events
///
/// Any error answers non-2xx so the notifier replays the event.
pub async fn event_handler(
    State(state): State<AppState>,
    Json(req): Json<ChangeEventRequest>,
) -> Result<Json<EventResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(CacheError::InvalidRequest(error_msg));
    }
    let report = state.writer.submit_event(req.into_event()).await?;
    Ok(Json(report.into()))
}

/// Handler for POST /admin/caches/:name/rebuild
pub async fn rebuild_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<RebuildRequest>,
) -> Result<Json<RebuildReport>> {
    let source: MemoryDirectory = req.entries.into_iter().map(Into::into).collect();
    let report = state.writer.rebuild(name, source).await?;
    Ok(Json(report))
}

/// Handler for POST /admin/caches/:name/shards
pub async fn add_shard_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<AddShardRequest>,
) -> Result<Json<ShardResponse>> {
    if req.shard_class.trim().is_empty() {
        return Err(CacheError::InvalidRequest(
            "shard_class cannot be empty".to_string(),
        ));
    }
    let added = state
        .writer
        .add_shard(name.clone(), req.shard_class.clone())
        .await?;
    let built = {
        let registry = Arc::clone(&state.registry);
        let name = name.clone();
        blocking(move || registry.is_built(&name)).await?
    };
    Ok(Json(ShardResponse {
        cache: name,
        shard_class: req.shard_class,
        added,
        rebuild_required: !built,
    }))
}

/// Handler for DELETE /admin/caches/:name
pub async fn remove_cache_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<RemoveResponse>> {
    state.writer.remove_cache(name.clone()).await?;
    Ok(Json(RemoveResponse::new(name)))
}

/// Handler for GET /admin/subscriptions
pub async fn subscriptions_handler(
    State(state): State<AppState>,
) -> Result<Json<ChangeSubscriptions>> {
    Ok(Json(state.registry.regenerate_change_subscriptions()?))
}

/// Handler for GET /stats
pub async fn stats_handler(State(state): State<AppState>) -> Result<Json<StatsResponse>> {
    let ingest = state
        .stats
        .lock()
        .map(|s| s.clone())
        .map_err(|_| CacheError::Internal("stats lock poisoned".to_string()))?;

    let registry = Arc::clone(&state.registry);
    let (caches, index) = blocking(move || {
        let mut caches = Vec::new();
        for cache in registry.caches()? {
            caches.push(CacheStatus {
                name: cache.name().to_string(),
                kind: match cache.kind() {
                    CacheKind::Sharded(_) => "sharded",
                    CacheKind::Derived(_) => "derived",
                },
                shards: cache.shards().iter().map(|s| s.name.to_string()).collect(),
                built: registry.is_built(cache.name())?,
                entries: cache.len()?,
            });
        }
        let index = registry.index()?;
        let status = IndexStatus {
            generation: index.generation(),
            groups: index.group_count(),
            edges: index.edge_count(),
            stale: index.is_stale(),
        };
        Ok((caches, status))
    })
    .await?;

    Ok(Json(StatsResponse {
        backend: state.registry.backend_kind().to_string(),
        generation: state.registry.generation(),
        failure_rate: ingest.failure_rate(),
        ingest,
        index,
        caches,
    }))
}

/// Handler for GET /health
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::directory::Operation;
    use crate::models::EntryPayload;
    use crate::storage::BackendKind;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn create_test_state() -> (AppState, TempDir) {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let mut config = Config::with_data_dir(BackendKind::Lmdb, dir.path());
        config.lmdb_map_size_mb = 16;
        let registry = Arc::new(CacheRegistry::init(&config).unwrap());
        (AppState::new(registry, 16), dir)
    }

    fn staff(members: &[&str]) -> BTreeMap<String, Vec<String>> {
        BTreeMap::from([
            ("objectClass".to_string(), vec!["posixGroup".to_string()]),
            (
                "uniqueMember".to_string(),
                members.iter().map(|m| format!("uid={},dc=example", m)).collect(),
            ),
            (
                "memberUid".to_string(),
                members.iter().map(|m| m.to_string()).collect(),
            ),
        ])
    }

    async fn rebuild_empty(state: &AppState, cache: &str) {
        rebuild_handler(
            State(state.clone()),
            Path(cache.to_string()),
            Json(RebuildRequest { entries: vec![] }),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_query_before_rebuild_is_stale() {
        let (state, _dir) = create_test_state();
        let result = groups_for_user_handler(
            State(state),
            Query(MembershipQuery {
                dn: "uid=alice,dc=example".to_string(),
                nested: true,
            }),
        )
        .await;
        assert!(matches!(result, Err(CacheError::StaleCache(_))));
    }

    #[tokio::test]
    async fn test_event_then_query() {
        let (state, _dir) = create_test_state();
        rebuild_empty(&state, "direct-members").await;
        rebuild_empty(&state, "nested-groups").await;
        rebuild_empty(&state, "uids").await;

        let req = ChangeEventRequest {
            operation: Operation::Add,
            dn: "cn=staff,dc=example".to_string(),
            old_dn: None,
            old_attributes: BTreeMap::new(),
            new_attributes: staff(&["alice"]),
        };
        let Json(resp) = event_handler(State(state.clone()), Json(req)).await.unwrap();
        assert!(resp.keys_written >= 2);

        let Json(resp) = users_in_group_handler(
            State(state.clone()),
            Query(MembershipQuery {
                dn: "CN=Staff,DC=Example".to_string(),
                nested: false,
            }),
        )
        .await
        .unwrap();
        assert_eq!(resp.results, vec!["uid=alice,dc=example"]);

        let Json(stats) = stats_handler(State(state)).await.unwrap();
        assert_eq!(stats.ingest.events_processed, 1);
        assert!(stats.caches.iter().all(|c| c.built));
    }

    #[tokio::test]
    async fn test_invalid_event_rejected() {
        let (state, _dir) = create_test_state();
        let req = ChangeEventRequest {
            operation: Operation::Delete,
            dn: "cn=staff,dc=example".to_string(),
            old_dn: None,
            old_attributes: BTreeMap::new(),
            new_attributes: BTreeMap::new(),
        };
        let result = event_handler(State(state), Json(req)).await;
        assert!(matches!(result, Err(CacheError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_rebuild_from_snapshot() {
        let (state, _dir) = create_test_state();
        let entries = vec![EntryPayload {
            dn: "cn=staff,dc=example".to_string(),
            attributes: staff(&["alice", "bob"]),
        }];
        let Json(report) = rebuild_handler(
            State(state.clone()),
            Path("direct-members".to_string()),
            Json(RebuildRequest { entries }),
        )
        .await
        .unwrap();
        assert_eq!(report.entries_scanned, 1);

        let Json(resp) = groups_for_user_handler(
            State(state),
            Query(MembershipQuery {
                dn: "uid=bob,dc=example".to_string(),
                nested: false,
            }),
        )
        .await
        .unwrap();
        assert_eq!(resp.results, vec!["cn=staff,dc=example"]);
    }

    #[tokio::test]
    async fn test_add_shard_requires_rebuild() {
        let (state, _dir) = create_test_state();
        let Json(resp) = add_shard_handler(
            State(state),
            Path("hosts".to_string()),
            Json(AddShardRequest {
                shard_class: "computer-uid".to_string(),
            }),
        )
        .await
        .unwrap();
        assert!(resp.added);
        assert!(resp.rebuild_required);
    }
}
