//! Repository Worker: owns one on-disk clone of one configured repository and
//! serializes every Git operation against it behind a single mutex, the same
//! way the upstream Repository type wraps its worktree in a `sync.Mutex`.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::LazyLock;

use base64::Engine as _;
use log::debug;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};

use crate::config::Repo as RepoConfig;
use crate::process::{CommandExt, OutputExt};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("cloning {url} into {path:?}: {source:#}")]
    Clone {
        url: String,
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("fetching branch {branch:?}: {source:#}")]
    Fetch {
        branch: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("checking out branch {branch:?}: {source:#}")]
    Checkout {
        branch: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("resolving ref {rev:?}: {source:#}")]
    RevParse {
        rev: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("ref {rev:?} does not exist")]
    UnknownRef { rev: String },

    #[error("diffing {old} to {new}: {source:#}")]
    Diff {
        old: String,
        new: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("reading blob {path:?} at {rev}: {source:#}")]
    ReadBlob {
        path: PathBuf,
        rev: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("walking tree at {rev}: {source:#}")]
    ListTree {
        rev: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("authentication failed for {0}")]
    Auth(String),
}

/// One file that changed between two revisions, as used both by the
/// incremental-diff path and by the full-seed tree walk (which reports
/// everything as `Added`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    Added(String),
    Modified(String),
    Deleted(String),
}

impl FileChange {
    pub fn path(&self) -> &str {
        match self {
            FileChange::Added(p) | FileChange::Modified(p) | FileChange::Deleted(p) => p,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    UpToDate,
    Changed,
}

static COMMAND_SEM: LazyLock<Semaphore> = LazyLock::new(|| Semaphore::new(64));

/// Mirrors `bjackman_limmat::git::GitCommand`: holds a semaphore permit for
/// as long as the child process lives, bounding concurrent `git` subprocesses
/// across the whole daemon regardless of how many repos are active.
struct GitCommand {
    _permit: SemaphorePermit<'static>,
    command: Command,
}

impl GitCommand {
    fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut Self {
        self.command.arg(arg);
        self
    }

    fn args(&mut self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> &mut Self {
        self.command.args(args);
        self
    }

    async fn execute(&mut self) -> anyhow::Result<Output> {
        self.command.execute().await
    }

    async fn output(&mut self) -> std::io::Result<Output> {
        self.command.output().await
    }
}

/// A Repository Worker: a single clone on disk, plus the auth and identity
/// needed to operate on it, serialized through `lock`.
pub struct RepoWorker {
    pub config: RepoConfig,
    path: PathBuf,
    git_binary: PathBuf,
    lock: Mutex<()>,
}

impl RepoWorker {
    pub fn new(local_store: &Path, config: RepoConfig) -> Self {
        let path = local_store.join(&config.name);
        Self {
            config,
            path,
            git_binary: PathBuf::from("git"),
            lock: Mutex::new(()),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.path
    }

    fn git<'a>(&'a self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> GitCommandBuilder<'a> {
        GitCommandBuilder { worker: self, args: args.into_iter().map(|a| a.as_ref().to_owned()).collect() }
    }

    async fn acquire(&self, mut cmd: Command) -> GitCommand {
        GitCommand {
            _permit: COMMAND_SEM.acquire().await.unwrap(),
            command: {
                cmd.current_dir(&self.path);
                cmd
            },
        }
    }

    /// Clone the repo if `path` doesn't exist yet; otherwise assume it's
    /// already a valid clone of the right remote.
    pub async fn ensure(&self) -> Result<(), RepoError> {
        let _guard = self.lock.lock().await;
        if self.path.join(".git").exists() {
            return Ok(());
        }
        std::fs::create_dir_all(self.path.parent().unwrap_or(Path::new(".")))
            .map_err(|e| RepoError::Clone {
                url: self.config.url.clone(),
                path: self.path.clone(),
                source: e.into(),
            })?;

        let mut cmd = Command::new(&self.git_binary);
        cmd.args(["clone", "--origin", "origin"])
            .arg(&self.config.url)
            .arg(&self.path);
        self.with_auth_env(&mut cmd);
        let mut gitcmd = self.acquire_bare(cmd).await;
        let output = gitcmd.output().await.map_err(|e| RepoError::Clone {
            url: self.config.url.clone(),
            path: self.path.clone(),
            source: e.into(),
        })?;

        if output.status.success() {
            return Ok(());
        }

        // The partially-written directory must not survive a failed clone
        // either way: an auth failure would otherwise wedge every future
        // `ensure()` behind a non-empty, non-`.git` directory, and so would
        // any other failure.
        let _ = std::fs::remove_dir_all(&self.path);

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if is_auth_failure(&stderr) {
            return Err(RepoError::Auth(self.config.url.clone()));
        }
        Err(RepoError::Clone {
            url: self.config.url.clone(),
            path: self.path.clone(),
            source: anyhow::anyhow!("git clone failed: {}", stderr.trim()),
        })
    }

    /// Like `acquire`, but doesn't `current_dir` into `self.path` (used for
    /// clone, which must run with a cwd that already exists).
    async fn acquire_bare(&self, cmd: Command) -> GitCommand {
        GitCommand {
            _permit: COMMAND_SEM.acquire().await.unwrap(),
            command: cmd,
        }
    }

    fn with_auth_env(&self, cmd: &mut Command) {
        let creds = &self.config.credentials;
        if !creds.private_key.key.is_empty() {
            let mut ssh = format!("ssh -i {}", shell_quote(&creds.private_key.key));
            if creds.private_key.skip_host_key_check {
                ssh.push_str(" -o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null");
            }
            cmd.env("GIT_SSH_COMMAND", ssh);
        } else if !creds.username.is_empty() && !creds.password.is_empty() {
            let token =
                base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", creds.username, creds.password));
            cmd.args(["-c", &format!("http.extraHeader=Authorization: Basic {token}")]);
        }
    }

    /// Fetch and hard-checkout the given branch, matching the upstream's
    /// force-checkout-then-force-pull semantics.
    pub async fn checkout_and_pull(&self, branch: &str) -> Result<(), RepoError> {
        let _guard = self.lock.lock().await;
        self.do_checkout_and_pull(branch).await
    }

    /// Like `checkout_and_pull`, but classifies whether HEAD actually moved,
    /// the way the webhook handlers need to distinguish "already up to date"
    /// from "changed" without a second, separately-locked round trip.
    pub async fn pull(&self, branch: &str) -> Result<PullOutcome, RepoError> {
        let _guard = self.lock.lock().await;
        let before = self.rev_parse(&format!("refs/heads/{branch}")).await?;
        self.do_checkout_and_pull(branch).await?;
        let after = self.rev_parse(&format!("refs/heads/{branch}")).await?;
        Ok(if before == after {
            PullOutcome::UpToDate
        } else {
            PullOutcome::Changed
        })
    }

    async fn do_checkout_and_pull(&self, branch: &str) -> Result<(), RepoError> {
        let mut fetch = Command::new(&self.git_binary);
        fetch.current_dir(&self.path).args(["fetch", "origin", branch]);
        self.with_auth_env(&mut fetch);
        self.acquire_bare(fetch)
            .await
            .execute()
            .await
            .map_err(|source| RepoError::Fetch { branch: branch.to_owned(), source })?;

        self.git(["checkout", "-B", branch, &format!("origin/{branch}")])
            .await
            .execute()
            .await
            .map_err(|source| RepoError::Checkout { branch: branch.to_owned(), source })?;

        self.git(["reset", "--hard", &format!("origin/{branch}")])
            .await
            .execute()
            .await
            .map_err(|source| RepoError::Checkout { branch: branch.to_owned(), source })?;

        Ok(())
    }

    /// Resolve `rev` to a commit hash. `None` if the rev doesn't exist (e.g.
    /// the ref sentinel names a commit that's since been force-pushed away).
    pub async fn rev_parse(&self, rev: &str) -> Result<Option<String>, RepoError> {
        let output = self
            .git(["rev-parse", "--verify", &format!("{rev}^{{commit}}")])
            .await
            .output()
            .await
            .map_err(|e| RepoError::RevParse { rev: rev.to_owned(), source: e.into() })?;
        if !output.status.success() {
            return Ok(None);
        }
        let hash = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        Ok(Some(hash))
    }

    pub async fn head(&self, branch: &str) -> Result<String, RepoError> {
        self.rev_parse(&format!("refs/heads/{branch}"))
            .await?
            .ok_or_else(|| RepoError::UnknownRef { rev: branch.to_owned() })
    }

    pub async fn check_ref(&self, rev: &str) -> Result<(), RepoError> {
        match self.rev_parse(rev).await? {
            Some(_) => Ok(()),
            None => Err(RepoError::UnknownRef { rev: rev.to_owned() }),
        }
    }

    /// `git diff --name-status old..new`, parsed into [`FileChange`]s. Rename
    /// entries are reported as a delete of the old path plus an add of the
    /// new one, matching go-git's `object.Changes` being flattened that way
    /// upstream.
    pub async fn diff(&self, old: &str, new: &str) -> Result<Vec<FileChange>, RepoError> {
        let output = self
            .git(["diff", "--name-status", "--no-renames", old, new])
            .await
            .execute()
            .await
            .map_err(|source| RepoError::Diff { old: old.to_owned(), new: new.to_owned(), source })?;
        let text = String::from_utf8_lossy(&output.stdout);
        let mut changes = Vec::new();
        for line in text.lines() {
            let mut parts = line.splitn(2, '\t');
            let (Some(status), Some(path)) = (parts.next(), parts.next()) else {
                continue;
            };
            let path = path.to_owned();
            changes.push(match status.chars().next() {
                Some('A') => FileChange::Added(path),
                Some('D') => FileChange::Deleted(path),
                _ => FileChange::Modified(path),
            });
        }
        Ok(changes)
    }

    /// List every blob under `root` (a `/`-free prefix with no leading
    /// slash, or `""` for the whole tree) at `rev`, for the full-seed path.
    pub async fn list_tree(&self, rev: &str, root: &str) -> Result<Vec<String>, RepoError> {
        let mut args = vec!["ls-tree".to_owned(), "-r".to_owned(), "--name-only".to_owned(), "--full-tree".to_owned(), rev.to_owned()];
        if !root.is_empty() {
            args.push(root.to_owned());
        }
        let output = self
            .git(args)
            .await
            .execute()
            .await
            .map_err(|source| RepoError::ListTree { rev: rev.to_owned(), source })?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|s| s.to_owned())
            .collect())
    }

    pub async fn read_blob(&self, rev: &str, path: &str) -> Result<Vec<u8>, RepoError> {
        let output = self
            .git(["show", &format!("{rev}:{path}")])
            .await
            .execute()
            .await
            .map_err(|source| RepoError::ReadBlob { path: PathBuf::from(path), rev: rev.to_owned(), source })?;
        Ok(output.stdout)
    }
}

struct GitCommandBuilder<'a> {
    worker: &'a RepoWorker,
    args: Vec<std::ffi::OsString>,
}

impl<'a> GitCommandBuilder<'a> {
    async fn build(self) -> GitCommand {
        let mut cmd = Command::new(&self.worker.git_binary);
        cmd.args(&self.args);
        self.worker.with_auth_env(&mut cmd);
        self.worker.acquire(cmd).await
    }
}

impl<'a> std::future::IntoFuture for GitCommandBuilder<'a> {
    type Output = GitCommand;
    type IntoFuture = std::pin::Pin<Box<dyn std::future::Future<Output = GitCommand> + Send + 'a>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.build())
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Classifies a failed `git clone`'s stderr as an authentication/authorization
/// rejection, the way the upstream go-git client distinguishes
/// `transport.ErrAuthenticationRequired`/`ErrAuthorizationFailed` from any
/// other transport error. The `git` CLI has no typed equivalent, so this
/// recognizes the phrasing it and common credential helpers emit on a
/// rejected clone.
fn is_auth_failure(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    [
        "authentication failed",
        "could not read username",
        "could not read password",
        "permission denied (publickey)",
        "invalid username or password",
        "access denied",
        "403",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use tokio::process::Command;

    use super::*;
    use crate::config::{Credentials, Hook, HookType, PrivateKey};

    fn test_config(name: &str, url: &str) -> RepoConfig {
        RepoConfig {
            name: name.to_owned(),
            url: url.to_owned(),
            branches: vec!["main".to_owned()],
            hooks: vec![Hook { kind: HookType::Polling, interval: Some(std::time::Duration::from_secs(60)), url: String::new() }],
            source_root: String::new(),
            mount_point: String::new(),
            skip_branch_name: false,
            skip_repo_name: false,
            credentials: Credentials::default(),
        }
    }

    async fn init_origin(dir: &Path) {
        Command::new("git").arg("init").arg("-b").arg("main").arg(dir).output().await.unwrap();
        Command::new("git").current_dir(dir).args(["config", "user.email", "t@example.com"]).output().await.unwrap();
        Command::new("git").current_dir(dir).args(["config", "user.name", "t"]).output().await.unwrap();
        std::fs::write(dir.join("a.txt"), "hello").unwrap();
        Command::new("git").current_dir(dir).args(["add", "."]).output().await.unwrap();
        Command::new("git").current_dir(dir).args(["commit", "-m", "init"]).output().await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_and_head_and_list_tree() {
        let origin = TempDir::new().unwrap();
        init_origin(origin.path()).await;

        let store = TempDir::new().unwrap();
        let worker = RepoWorker::new(store.path(), test_config("demo", origin.path().to_str().unwrap()));
        worker.ensure().await.unwrap();
        worker.checkout_and_pull("main").await.unwrap();

        let head = worker.head("main").await.unwrap();
        assert_eq!(head.len(), 40);

        let files = worker.list_tree(&head, "").await.unwrap();
        assert_eq!(files, vec!["a.txt".to_owned()]);

        let blob = worker.read_blob(&head, "a.txt").await.unwrap();
        assert_eq!(blob, b"hello");
    }

    #[tokio::test]
    async fn test_diff_reports_added_modified_deleted() {
        let origin = TempDir::new().unwrap();
        init_origin(origin.path()).await;

        let store = TempDir::new().unwrap();
        let worker = RepoWorker::new(store.path(), test_config("demo", origin.path().to_str().unwrap()));
        worker.ensure().await.unwrap();
        worker.checkout_and_pull("main").await.unwrap();
        let old = worker.head("main").await.unwrap();

        std::fs::write(origin.path().join("a.txt"), "goodbye").unwrap();
        std::fs::write(origin.path().join("b.txt"), "new file").unwrap();
        Command::new("git").current_dir(origin.path()).args(["add", "."]).output().await.unwrap();
        Command::new("git").current_dir(origin.path()).args(["commit", "-m", "change"]).output().await.unwrap();

        worker.checkout_and_pull("main").await.unwrap();
        let new = worker.head("main").await.unwrap();

        let mut changes = worker.diff(&old, &new).await.unwrap();
        changes.sort_by(|a, b| a.path().cmp(b.path()));
        assert_eq!(
            changes,
            vec![
                FileChange::Modified("a.txt".to_owned()),
                FileChange::Added("b.txt".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn test_check_ref_unknown() {
        let origin = TempDir::new().unwrap();
        init_origin(origin.path()).await;
        let store = TempDir::new().unwrap();
        let worker = RepoWorker::new(store.path(), test_config("demo", origin.path().to_str().unwrap()));
        worker.ensure().await.unwrap();
        worker.checkout_and_pull("main").await.unwrap();
        assert!(worker.check_ref("deadbeefdeadbeefdeadbeefdeadbeefdeadbeef").await.is_err());
    }

    #[test]
    fn test_is_auth_failure_classification() {
        assert!(is_auth_failure("fatal: Authentication failed for 'https://example.com/demo.git/'"));
        assert!(is_auth_failure("Permission denied (publickey).\nfatal: Could not read from remote repository."));
        assert!(is_auth_failure("remote: Invalid username or password."));
        assert!(!is_auth_failure("fatal: unable to access 'https://example.com/demo.git/': Could not resolve host"));
        assert!(!is_auth_failure("fatal: repository 'https://example.com/demo.git/' not found"));
    }

    #[tokio::test]
    async fn test_ensure_removes_directory_on_clone_failure() {
        let store = TempDir::new().unwrap();
        let worker = RepoWorker::new(
            store.path(),
            test_config("demo", "/nonexistent/path/does-not-exist.git"),
        );
        let err = worker.ensure().await.unwrap_err();
        assert!(matches!(err, RepoError::Clone { .. }));
        assert!(!worker.workdir().exists());
    }
}
