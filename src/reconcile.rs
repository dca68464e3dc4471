//! Reconciler: for one (repo, branch) pair, compares the ref sentinel
//! recorded in the KV against the branch's current HEAD and buffers the put/
//! delete operations needed to bring the KV subtree into equivalence, then
//! commits them through a [`KvHandler`].

use log::{debug, info, warn};
use thiserror::Error;

use crate::config::Repo as RepoConfig;
use crate::kv::{KvError, KvHandler, KvTransport};
use crate::repo::{FileChange, RepoError, RepoWorker};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("reading ref sentinel for {repo}/{branch}: {source:#}")]
    ReadSentinel {
        repo: String,
        branch: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Reads and writes ref sentinels. Implemented on top of the same
/// [`KvTransport`] the KV Handler uses, since the sentinel lives in the KV
/// the Reconciler is writing to.
pub trait SentinelStore: Send + Sync {
    fn get(&self, key: &str) -> impl std::future::Future<Output = Result<Option<String>, anyhow::Error>> + Send;
}

/// Key synthesis for one repo: `<mount_point><repo_name>/<branch_name>/<path>`,
/// with `skip_repo_name`/`skip_branch_name` eliding their components and
/// `source_root` trimmed off the front of each path before synthesis.
pub struct KeySynth<'a> {
    repo: &'a RepoConfig,
}

impl<'a> KeySynth<'a> {
    pub fn new(repo: &'a RepoConfig) -> Self {
        Self { repo }
    }

    fn prefix(&self, branch: &str) -> String {
        let mut prefix = self.repo.mount_point.clone();
        if !self.repo.skip_repo_name {
            prefix.push_str(&self.repo.name);
            prefix.push('/');
        }
        if !self.repo.skip_branch_name {
            prefix.push_str(branch);
            prefix.push('/');
        }
        prefix
    }

    /// `None` if `path` falls outside `source_root` or trims to empty.
    pub fn key(&self, branch: &str, path: &str) -> Option<String> {
        let trimmed = self.trim_source_root(path)?;
        if trimmed.is_empty() {
            return None;
        }
        Some(format!("{}{}", self.prefix(branch), trimmed))
    }

    fn trim_source_root<'p>(&self, path: &'p str) -> Option<&'p str> {
        if self.repo.source_root.is_empty() || self.repo.source_root == "/" {
            return Some(path);
        }
        let root = self.repo.source_root.trim_start_matches('/');
        path.strip_prefix(root)
    }

    /// The ref sentinel key, with the trailing `/` of the prefix replaced by
    /// `.ref` (or `<mount_point><repo_name>.ref` when `skip_branch_name` is
    /// set, since then there's no branch component to suffix).
    pub fn sentinel_key(&self, branch: &str) -> String {
        let mut prefix = self.prefix(branch);
        prefix.pop(); // drop trailing '/'
        format!("{prefix}.ref")
    }
}

pub struct Reconciler<'a, T: KvTransport, S: SentinelStore> {
    worker: &'a RepoWorker,
    kv: &'a mut KvHandler<T>,
    sentinels: &'a S,
}

impl<'a, T: KvTransport, S: SentinelStore> Reconciler<'a, T, S> {
    pub fn new(worker: &'a RepoWorker, kv: &'a mut KvHandler<T>, sentinels: &'a S) -> Self {
        Self { worker, kv, sentinels }
    }

    pub async fn reconcile_branch(&mut self, branch: &str) -> Result<(), ReconcileError> {
        let synth = KeySynth::new(&self.worker.config);
        let sentinel_key = synth.sentinel_key(branch);

        let kv_ref = self
            .sentinels
            .get(&sentinel_key)
            .await
            .map_err(|source| ReconcileError::ReadSentinel {
                repo: self.worker.config.name.clone(),
                branch: branch.to_owned(),
                source,
            })?;

        let head = self.worker.head(branch).await?;

        match kv_ref {
            None => {
                info!("init KV PUT branch: {}/{}", self.worker.config.name, branch);
                self.seed(branch, &head, &synth).await?;
                self.kv.put(sentinel_key, head.clone().into_bytes());
                self.kv.commit().await?;
            }
            Some(ref known) if known == &head => {
                debug!("{}/{} is up to date at {}", self.worker.config.name, branch, head);
            }
            Some(known) => {
                self.worker.check_ref(branch).await?;
                if let Err(e) = self.diff(branch, &known, &head, &synth).await {
                    warn!("handleDeltas error: {e:#}, repo={}", self.worker.config.name);
                }
                self.kv.put(sentinel_key, head.clone().into_bytes());
                self.kv.commit().await?;
                info!("KV PUT ref change: {}/{}", self.worker.config.name, branch);
            }
        }
        Ok(())
    }

    async fn seed(&mut self, branch: &str, head: &str, synth: &KeySynth<'_>) -> Result<(), ReconcileError> {
        let root = self.worker.config.source_root.trim_start_matches('/');
        let files = self.worker.list_tree(head, root).await?;
        for path in files {
            let Some(key) = synth.key(branch, &path) else { continue };
            let bytes = self.worker.read_blob(head, &path).await?;
            self.kv.put(key, bytes);
        }
        Ok(())
    }

    async fn diff(
        &mut self,
        branch: &str,
        old: &str,
        new: &str,
        synth: &KeySynth<'_>,
    ) -> Result<(), ReconcileError> {
        let changes = self.worker.diff(old, new).await?;
        for change in changes {
            match &change {
                FileChange::Added(path) | FileChange::Modified(path) => {
                    let Some(key) = synth.key(branch, path) else { continue };
                    let bytes = self.worker.read_blob(new, path).await?;
                    self.kv.put(key, bytes);
                }
                FileChange::Deleted(path) => {
                    let Some(key) = synth.key(branch, path) else { continue };
                    self.kv.delete(key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::{Credentials, Hook, HookType};

    fn repo_cfg(mount_point: &str, skip_branch: bool, skip_repo: bool, source_root: &str) -> RepoConfig {
        RepoConfig {
            name: "demo".to_owned(),
            url: "https://example.com/demo.git".to_owned(),
            branches: vec!["main".to_owned()],
            hooks: vec![Hook { kind: HookType::Polling, interval: Some(std::time::Duration::from_secs(60)), url: String::new() }],
            source_root: source_root.to_owned(),
            mount_point: mount_point.to_owned(),
            skip_branch_name: skip_branch,
            skip_repo_name: skip_repo,
            credentials: Credentials::default(),
        }
    }

    #[test]
    fn test_key_synthesis_default() {
        let cfg = repo_cfg("", false, false, "");
        let synth = KeySynth::new(&cfg);
        assert_eq!(synth.key("main", "README.md").unwrap(), "demo/main/README.md");
        assert_eq!(synth.sentinel_key("main"), "demo/main.ref");
    }

    #[test]
    fn test_key_synthesis_mount_and_skip_branch() {
        let cfg = repo_cfg("site/", true, false, "");
        let synth = KeySynth::new(&cfg);
        assert_eq!(synth.key("main", "a.txt").unwrap(), "site/demo/a.txt");
        assert_eq!(synth.sentinel_key("main"), "site/demo.ref");
    }

    #[test]
    fn test_key_synthesis_source_root_trims_and_filters() {
        let cfg = repo_cfg("", false, false, "/app/");
        let synth = KeySynth::new(&cfg);
        assert_eq!(synth.key("main", "app/a.txt").unwrap(), "demo/main/a.txt");
        assert!(synth.key("main", "other/a.txt").is_none());
    }

    #[test]
    fn test_key_synthesis_skip_repo_name() {
        let cfg = repo_cfg("", false, true, "");
        let synth = KeySynth::new(&cfg);
        assert_eq!(synth.key("main", "a.txt").unwrap(), "main/a.txt");
    }
}
