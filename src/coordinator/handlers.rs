use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::{delete, get, post, put},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::service::Coordinator;
use crate::error::{CoordinatorError, NamespaceError, PeerError, SelectionError};
use crate::peer::types::{PeerDefinition, PeerName, PeerSummary};
use crate::selection::types::{ChainKind, FilterSpec, SelectionContext};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub error: String,
}

type Failure = (StatusCode, Json<ErrorResponse>);

fn failure(status: StatusCode, error: impl ToString) -> Failure {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

fn status_of(error: &CoordinatorError) -> StatusCode {
    match error {
        CoordinatorError::Peer(PeerError::UnknownPeer(_)) => StatusCode::NOT_FOUND,
        CoordinatorError::Peer(PeerError::AlreadyExists(_)) => StatusCode::CONFLICT,
        CoordinatorError::Peer(_) | CoordinatorError::Rpc(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoordinatorError::Selection(_) => StatusCode::SERVICE_UNAVAILABLE,
        CoordinatorError::Namespace(NamespaceError::NotFound(_)) => StatusCode::NOT_FOUND,
        CoordinatorError::Namespace(_) | CoordinatorError::Config(_) => StatusCode::BAD_REQUEST,
    }
}

fn coordinator_failure(error: impl Into<CoordinatorError>) -> Failure {
    let error = error.into();
    tracing::warn!("Admin request failed: {}", error);
    failure(status_of(&error), error)
}

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/peers", get(handle_list_peers).post(handle_add_peer))
        .route("/peers/:name", delete(handle_remove_peer))
        .route("/peers/:name/remerge", post(handle_force_remerge))
        .route("/selection/:chain", put(handle_set_chain))
        .route("/owners", get(handle_list_owners))
        .route("/select", post(handle_select))
        .layer(Extension(coordinator))
}

pub async fn handle_list_peers(
    Extension(coordinator): Extension<Arc<Coordinator>>,
) -> Json<Vec<PeerSummary>> {
    Json(coordinator.peer_summaries())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddPeerRequest {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub credentials: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Dial right away instead of waiting for the reconnect loop.
    #[serde(default)]
    pub connect: bool,
}

pub async fn handle_add_peer(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Json(req): Json<AddPeerRequest>,
) -> Result<(StatusCode, Json<PeerSummary>), Failure> {
    if req.name.trim().is_empty() {
        return Err(failure(StatusCode::BAD_REQUEST, "peer name is empty"));
    }
    let mut definition = PeerDefinition::new(req.name, req.endpoint);
    definition.credentials = req.credentials;
    definition.properties = req.properties;

    let peer = coordinator
        .add_peer(definition)
        .map_err(coordinator_failure)?;

    if req.connect {
        let name = peer.name().clone();
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.connect_peer(&name).await {
                tracing::warn!("Initial connect to {} failed: {}", name, e);
            }
        });
    }
    Ok((StatusCode::CREATED, Json(peer.summary())))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemovePeerResponse {
    pub peer: String,
    pub files_dropped: usize,
}

pub async fn handle_remove_peer(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Path(name): Path<String>,
) -> Result<Json<RemovePeerResponse>, Failure> {
    let removed = coordinator
        .remove_peer(&PeerName::new(name.clone()))
        .map_err(coordinator_failure)?;
    Ok(Json(RemovePeerResponse {
        peer: name,
        files_dropped: removed,
    }))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemergeRequest {
    #[serde(default)]
    pub subtree: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemergeResponse {
    pub session: String,
    pub completed: bool,
    pub directories: usize,
    pub files_created: usize,
    pub files_removed: usize,
    pub owners_added: usize,
    pub owners_removed: usize,
    pub conflicts: usize,
}

pub async fn handle_force_remerge(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Path(name): Path<String>,
    body: Option<Json<RemergeRequest>>,
) -> Result<Json<RemergeResponse>, Failure> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let report = coordinator
        .force_remerge(&PeerName::new(name), req.subtree.as_deref())
        .await
        .map_err(coordinator_failure)?;
    Ok(Json(RemergeResponse {
        session: report.session.to_string(),
        completed: report.completed,
        directories: report.directories,
        files_created: report.files_created,
        files_removed: report.files_removed,
        owners_added: report.owners_added,
        owners_removed: report.owners_removed,
        conflicts: report.conflicts.len(),
    }))
}

pub async fn handle_set_chain(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Path(chain): Path<String>,
    Json(specs): Json<Vec<FilterSpec>>,
) -> Result<Json<Vec<FilterSpec>>, Failure> {
    let kind: ChainKind = chain.parse().map_err(coordinator_failure)?;
    coordinator
        .set_filter_chain_config(kind, &specs)
        .map_err(coordinator_failure)?;
    Ok(Json(coordinator.filter_chain_config().specs(kind).to_vec()))
}

#[derive(Debug, Clone, Deserialize)]
pub struct OwnersQuery {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OwnersResponse {
    pub path: String,
    pub owners: Vec<String>,
    pub available: Vec<String>,
}

pub async fn handle_list_owners(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Query(query): Query<OwnersQuery>,
) -> Result<Json<OwnersResponse>, Failure> {
    let owners = coordinator
        .list_owners(&query.path)
        .map_err(coordinator_failure)?;
    let available = owners
        .iter()
        .filter(|name| coordinator.is_peer_available(name))
        .map(|name| name.to_string())
        .collect();
    Ok(Json(OwnersResponse {
        path: query.path,
        owners: owners.iter().map(|name| name.to_string()).collect(),
        available,
    }))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectRequest {
    pub chain: ChainKind,
    pub path: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub source_peer: Option<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl SelectRequest {
    fn context(&self) -> SelectionContext {
        let mut ctx = SelectionContext::store(self.path.clone(), self.size);
        ctx.direction = self.chain.direction();
        ctx.user = self.user.clone();
        ctx.source_peer = self.source_peer.as_deref().map(PeerName::new);
        ctx.exclude = self.exclude.iter().map(PeerName::new).collect();
        ctx
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedPeer {
    pub peer: String,
    pub score: i64,
}

pub async fn handle_select(
    Extension(coordinator): Extension<Arc<Coordinator>>,
    Json(req): Json<SelectRequest>,
) -> Result<Json<Vec<RankedPeer>>, Failure> {
    let ctx = req.context();

    let ranked: Result<_, SelectionError> = match req.chain {
        ChainKind::Store => coordinator.select_peer_for_store(&ctx).await,
        ChainKind::Retrieve => coordinator.select_peer_for_retrieve(&ctx).await,
        ChainKind::JobStore => coordinator.select_replication_target(&ctx).await,
        ChainKind::JobRetrieve => coordinator.select_replication_source(&ctx).await,
    };
    let ranked = ranked.map_err(coordinator_failure)?;

    Ok(Json(
        ranked
            .iter()
            .map(|scored| RankedPeer {
                peer: scored.name().to_string(),
                score: scored.score,
            })
            .collect(),
    ))
}
