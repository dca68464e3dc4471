//! Runner: top-level orchestrator. Builds the Repository Workers and KV
//! transport from a loaded [`Config`], wires the trigger layer to a bounded
//! work queue, and drains that queue with a pool of reconcile consumers.

use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::kv::consul::ConsulTransport;
use crate::kv::KvHandler;
use crate::reconcile::Reconciler;
use crate::repo::RepoWorker;
use crate::trigger::poll::spawn_pollers;
use crate::trigger::webhook::{self, WebhookState};
use crate::trigger::ReconcileRequest;
use crate::util::ErrGroup;

const WORK_QUEUE_CAPACITY: usize = 256;
const CONSUMER_POOL_SIZE: usize = 4;

pub struct Runner {
    config: Config,
    once: bool,
    repos: Arc<HashMap<String, Arc<RepoWorker>>>,
    transport: ConsulTransport,
    ct: CancellationToken,

    pub errors: mpsc::Receiver<anyhow::Error>,
    pub shutdown_done: mpsc::Receiver<()>,
    pub repo_changed: mpsc::Receiver<String>,

    errors_tx: mpsc::Sender<anyhow::Error>,
    shutdown_done_tx: mpsc::Sender<()>,
    repo_changed_tx: mpsc::Sender<String>,
}

impl Runner {
    /// Build every Repository Worker (running `ensure()` on each) and the KV
    /// transport. Does not start any triggers yet.
    pub async fn new(config: Config, once: bool) -> anyhow::Result<Self> {
        let transport = ConsulTransport::new(&config.consul)?;

        let mut repos = HashMap::new();
        for repo_cfg in &config.repos {
            let worker = Arc::new(RepoWorker::new(
                std::path::Path::new(&config.local_store),
                repo_cfg.clone(),
            ));
            worker.ensure().await?;
            repos.insert(repo_cfg.name.clone(), worker);
        }

        let (errors_tx, errors) = mpsc::channel(16);
        let (shutdown_done_tx, shutdown_done) = mpsc::channel(1);
        let (repo_changed_tx, repo_changed) = mpsc::channel(256);

        Ok(Self {
            config,
            once,
            repos: Arc::new(repos),
            transport,
            ct: CancellationToken::new(),
            errors,
            shutdown_done,
            repo_changed,
            errors_tx,
            shutdown_done_tx,
            repo_changed_tx,
        })
    }

    /// Cooperative shutdown: stop accepting new triggers, let in-flight
    /// reconciles finish, then signal done.
    pub fn stop(&self) {
        info!("stop requested, cancelling trigger layer");
        self.ct.cancel();
    }

    /// A clone of the cancellation token driving shutdown, for callers (the
    /// signal-handling loop) that need to trigger `stop()` while `start()` is
    /// running on another task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.ct.clone()
    }

    /// Drive the trigger layer and the reconcile consumer pool. In one-shot
    /// mode, runs exactly one reconcile pass over every configured repo and
    /// branch, then signals `shutdown_done` and returns.
    pub async fn start(&mut self) {
        if self.once {
            self.run_once().await;
            let _ = self.shutdown_done_tx.send(()).await;
            return;
        }

        let (work_tx, work_rx) = mpsc::channel::<ReconcileRequest>(WORK_QUEUE_CAPACITY);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let mut group = ErrGroup::new(self.ct.clone());

        let poll_targets: Vec<(String, std::time::Duration)> = self
            .config
            .repos
            .iter()
            .flat_map(|r| {
                r.hooks.iter().filter_map(move |h| {
                    if h.kind == crate::config::HookType::Polling {
                        h.interval.map(|d| (r.name.clone(), d))
                    } else {
                        None
                    }
                })
            })
            .collect();
        spawn_pollers(&mut group, self.ct.clone(), work_tx.clone(), poll_targets);

        if self.config.repos.iter().any(|r| r.has_webhook_trigger()) {
            let state = WebhookState {
                registry: self.repos.clone(),
                change_tx: self.repo_changed_tx.clone(),
                work_tx: work_tx.clone(),
            };
            let address = self.config.webhook.address.clone();
            let port = self.config.webhook.port;
            let ct = self.ct.clone();
            group.spawn(async move { webhook::serve(state, &address, port, ct).await });
        }

        for _ in 0..CONSUMER_POOL_SIZE {
            let work_rx = work_rx.clone();
            let repos = self.repos.clone();
            let transport = self.transport.clone();
            let ct = self.ct.clone();
            let errors_tx = self.errors_tx.clone();
            let repo_changed_tx = self.repo_changed_tx.clone();
            group.spawn(async move {
                loop {
                    let request = {
                        let mut rx = work_rx.lock().await;
                        tokio::select! {
                            _ = ct.cancelled() => None,
                            r = rx.recv() => r,
                        }
                    };
                    let Some(request) = request else { return Ok(()) };
                    let Some(worker) = repos.get(&request.repo_name) else {
                        warn!("reconcile request for unknown repo {}", request.repo_name);
                        continue;
                    };
                    if let Err(e) = reconcile_repo(worker, &transport).await {
                        error!("reconcile failed for {}: {e:#}", request.repo_name);
                        let _ = errors_tx.send(e).await;
                    } else {
                        let _ = repo_changed_tx.send(request.repo_name.clone()).await;
                    }
                }
            });
        }

        if let Err(e) = group.wait().await {
            let _ = self.errors_tx.send(e).await;
        }
        let _ = self.shutdown_done_tx.send(()).await;
    }

    async fn run_once(&self) {
        for worker in self.repos.values() {
            if let Err(e) = reconcile_repo(worker, &self.transport).await {
                error!("reconcile failed for {}: {e:#}", worker.config.name);
                let _ = self.errors_tx.send(e).await;
            }
        }
    }
}

async fn reconcile_repo(worker: &Arc<RepoWorker>, transport: &ConsulTransport) -> anyhow::Result<()> {
    let mut kv = KvHandler::new(transport.clone());
    let branches = worker.config.branches.clone();
    for branch in &branches {
        worker.checkout_and_pull(branch).await?;
        let mut reconciler = Reconciler::new(worker, &mut kv, transport);
        reconciler.reconcile_branch(branch).await?;
    }
    Ok(())
}
