//! Webhook server: a single HTTP listener normalizing push events from five
//! forge vendors into `(repository, branch)` pulls.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{any, get};
use axum::Router;
use log::{debug, error, info};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::repo::{PullOutcome, RepoWorker};

use super::ReconcileRequest;

const GIT_REFS_HEADS: &str = "refs/heads/";

/// Read-only view of the repository registry plus a send-only change
/// notification endpoint, handed to the webhook handlers at construction so
/// they don't need a reference back to the Runner itself.
#[derive(Clone)]
pub struct WebhookState {
    pub registry: Arc<HashMap<String, Arc<RepoWorker>>>,
    pub change_tx: mpsc::Sender<String>,
    /// The same work queue the pollers feed; a push that actually moved HEAD
    /// is reconciled through it rather than just pulled.
    pub work_tx: mpsc::Sender<ReconcileRequest>,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/{repository}/github", any(github_handler))
        .route("/{repository}/gitea", any(github_handler))
        .route("/{repository}/stash", any(stash_handler))
        .route("/{repository}/bitbucket", any(bitbucket_handler))
        .route("/{repository}/gitlab", any(gitlab_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

pub async fn serve(
    state: WebhookState,
    address: &str,
    port: u16,
    ct: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("{address}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("webhook http server listening on {addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await?;
    Ok(())
}

/// `refs/heads/<branch>` → `Some(branch)`, anything else (including a ref
/// too short to carry the prefix) → `None`.
fn strip_refs_heads(ref_str: &str) -> Option<&str> {
    if ref_str.len() > GIT_REFS_HEADS.len() && ref_str.starts_with(GIT_REFS_HEADS) {
        Some(&ref_str[GIT_REFS_HEADS.len()..])
    } else {
        None
    }
}

async fn handle_push(
    state: &WebhookState,
    repository: &str,
    branch: &str,
    vendor: &str,
) -> (StatusCode, String) {
    let Some(worker) = state.registry.get(repository) else {
        debug!("webhook for unknown repository {repository} from {vendor}, ignoring");
        return (StatusCode::OK, String::new());
    };

    info!("repo found, begin pull: {repository}/{branch} (via {vendor})");
    match worker.pull(branch).await {
        Ok(PullOutcome::UpToDate) => {
            let msg = format!("Up to date: {repository}/{branch}");
            debug!("{msg}");
            (StatusCode::OK, msg)
        }
        Ok(PullOutcome::Changed) => {
            let msg = format!("Changed: {repository}/{branch}");
            info!("{msg}");
            let _ = state.change_tx.send(repository.to_owned()).await;
            let _ = state
                .work_tx
                .send(ReconcileRequest { repo_name: repository.to_owned() })
                .await;
            (StatusCode::OK, msg)
        }
        Err(e) => {
            let msg = format!("Failed: {repository}/{branch} - {e:#}");
            error!("{msg}");
            (StatusCode::INTERNAL_SERVER_ERROR, msg)
        }
    }
}

#[derive(Deserialize, Default)]
struct GithubPayload {
    #[serde(rename = "ref")]
    ref_: String,
}

async fn github_handler(
    State(state): State<WebhookState>,
    Path(repository): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> (StatusCode, String) {
    let event_type = headers
        .get("X-Github-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();

    info!("received hook event from GitHub for {repository}, event={event_type}");

    if event_type.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing X-Github-Event header".to_owned());
    }
    if event_type != "push" {
        return (StatusCode::OK, String::new());
    }

    let payload: GithubPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(_) => return (StatusCode::INTERNAL_SERVER_ERROR, "Cannot unmarshal JSON".to_owned()),
    };
    if payload.ref_.is_empty() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "ref is empty".to_owned());
    }
    let Some(branch) = strip_refs_heads(&payload.ref_) else {
        return (StatusCode::OK, String::new());
    };

    handle_push(&state, &repository, branch, "github").await
}

#[derive(Deserialize)]
struct StashRefChange {
    #[serde(rename = "refId")]
    ref_id: String,
}

#[derive(Deserialize)]
struct StashPayload {
    #[serde(rename = "refChanges")]
    ref_changes: Vec<StashRefChange>,
}

async fn stash_handler(
    State(state): State<WebhookState>,
    Path(repository): Path<String>,
    body: axum::body::Bytes,
) -> (StatusCode, String) {
    let payload: StashPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(_) => return (StatusCode::INTERNAL_SERVER_ERROR, "Cannot unmarshal JSON".to_owned()),
    };
    let Some(change) = payload.ref_changes.first() else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "ref is empty".to_owned());
    };
    if change.ref_id.is_empty() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "ref is empty".to_owned());
    }
    let Some(branch) = strip_refs_heads(&change.ref_id) else {
        return (StatusCode::OK, String::new());
    };

    handle_push(&state, &repository, branch, "stash").await
}

#[derive(Deserialize)]
struct BitbucketNew {
    name: String,
}

#[derive(Deserialize)]
struct BitbucketChange {
    new: BitbucketNew,
}

#[derive(Deserialize)]
struct BitbucketPush {
    changes: Vec<BitbucketChange>,
}

#[derive(Deserialize)]
struct BitbucketPayload {
    push: BitbucketPush,
}

async fn bitbucket_handler(
    State(state): State<WebhookState>,
    Path(repository): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> (StatusCode, String) {
    let event_type = headers
        .get("X-Event-Key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    if event_type.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing X-Event-key header".to_owned());
    }
    if event_type != "repo:push" {
        return (StatusCode::OK, String::new());
    }

    let payload: BitbucketPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(_) => return (StatusCode::INTERNAL_SERVER_ERROR, "Cannot unmarshal JSON".to_owned()),
    };
    let Some(change) = payload.push.changes.first() else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "ref is empty".to_owned());
    };
    // Bitbucket's payload carries the bare branch name rather than a full
    // ref; for parity with the other vendors it's treated as if it had
    // already been stripped of `refs/heads/`.
    if change.new.name.is_empty() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "ref is empty".to_owned());
    }

    handle_push(&state, &repository, &change.new.name, "bitbucket").await
}

#[derive(Deserialize, Default)]
struct GitlabPayload {
    #[serde(rename = "ref")]
    ref_: String,
}

async fn gitlab_handler(
    State(state): State<WebhookState>,
    Path(repository): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> (StatusCode, String) {
    let event_type = headers
        .get("X-Gitlab-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_owned();
    if event_type.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing X-Gitlab-Event header".to_owned());
    }
    if event_type != "Push Hook" {
        return (StatusCode::OK, String::new());
    }

    let payload: GitlabPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(_) => return (StatusCode::INTERNAL_SERVER_ERROR, "Cannot unmarshal JSON".to_owned()),
    };
    if payload.ref_.is_empty() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "ref is empty".to_owned());
    }
    let Some(branch) = strip_refs_heads(&payload.ref_) else {
        return (StatusCode::OK, String::new());
    };

    handle_push(&state, &repository, branch, "gitlab").await
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_strip_refs_heads() {
        assert_eq!(strip_refs_heads("refs/heads/main"), Some("main"));
        assert_eq!(strip_refs_heads("refs/tags/v1"), None);
        assert_eq!(strip_refs_heads("refs/heads/"), None);
        assert_eq!(strip_refs_heads(""), None);
    }
}
