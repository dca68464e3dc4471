//! Trigger layer: the two sources of reconcile requests fed into the Runner's
//! work queue — interval pollers and the multi-vendor webhook server.

pub mod poll;
pub mod webhook;

/// One request to reconcile every tracked branch of a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileRequest {
    pub repo_name: String,
}
