//! KV Handler: buffers a sequence of KV operations for one reconcile pass and
//! commits them as one or more chunked transactions.

pub mod consul;

use log::debug;
use thiserror::Error;

pub const TXN_CHUNK_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum KvError {
    /// The remote store rolled back a transaction; carries the aggregated
    /// per-operation error messages it returned.
    #[error("transaction has been rolled back due to: {0}")]
    TransactionIntegrity(String),

    /// Couldn't even talk to the store (network, TLS, auth, decode failure).
    #[error("transport error talking to KV store: {0:#}")]
    Transport(#[source] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
    DeleteSubtree { key: String },
    /// Succeeds only if `key`'s current ModifyIndex equals `index`. Used to
    /// make the ref-sentinel write conditional on nothing else having
    /// reconciled the same branch concurrently.
    CheckIndex { key: String, index: u64 },
}

impl KvOp {
    pub fn key(&self) -> &str {
        match self {
            KvOp::Put { key, .. }
            | KvOp::Delete { key }
            | KvOp::DeleteSubtree { key }
            | KvOp::CheckIndex { key, .. } => key,
        }
    }
}

/// Transport abstraction so the chunking/reordering logic here can be tested
/// without a real Consul agent; [`consul::ConsulTransport`] is the only
/// production implementation.
pub trait KvTransport: Send + Sync {
    fn txn(
        &self,
        ops: &[KvOp],
    ) -> impl std::future::Future<Output = Result<TxnOutcome, KvError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOutcome {
    Ok,
    RolledBack(Vec<String>),
}

pub struct KvHandler<T: KvTransport> {
    transport: T,
    ops: Vec<KvOp>,
}

impl<T: KvTransport> KvHandler<T> {
    pub fn new(transport: T) -> Self {
        Self { transport, ops: Vec::new() }
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.ops.push(KvOp::Put { key: key.into(), value: value.into() });
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.push(KvOp::Delete { key: key.into() });
    }

    pub fn delete_subtree(&mut self, key: impl Into<String>) {
        self.ops.push(KvOp::DeleteSubtree { key: key.into() });
    }

    pub fn check_index(&mut self, key: impl Into<String>, index: u64) {
        self.ops.push(KvOp::CheckIndex { key: key.into(), index });
    }

    pub fn pending(&self) -> usize {
        self.ops.len()
    }

    /// Commit every buffered op, chunked into transactions of at most
    /// [`TXN_CHUNK_SIZE`] ops each. If a leading op is a `CheckIndex`, it's
    /// moved to the second-to-last position first, so the condition is
    /// evaluated as late as possible relative to the rest of the writes
    /// while the op that must be visibly "last" (typically the ref sentinel
    /// put) stays last. Aborts without committing later chunks if any chunk
    /// fails; already-committed chunks are not rolled back.
    pub async fn commit(&mut self) -> Result<(), KvError> {
        let mut ops = std::mem::take(&mut self.ops);
        if ops.is_empty() {
            return Ok(());
        }
        if matches!(ops.first(), Some(KvOp::CheckIndex { .. })) {
            let check = ops.remove(0);
            let last_index = ops.len() - 1;
            ops.insert(last_index, check);
        }

        for chunk in ops.chunks(TXN_CHUNK_SIZE) {
            match self.transport.txn(chunk).await? {
                TxnOutcome::Ok => {
                    debug!("transaction with {} items committed", chunk.len());
                }
                TxnOutcome::RolledBack(errors) => {
                    return Err(KvError::TransactionIntegrity(errors.join("\n")));
                }
            }
        }
        Ok(())
    }

    /// Discard whatever's buffered without committing it. Used when a
    /// reconcile pass fails partway through building its op list.
    pub fn reset(&mut self) {
        self.ops.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;

    use super::*;

    struct RecordingTransport {
        chunks: Mutex<Vec<Vec<KvOp>>>,
        fail_on_chunk: Option<usize>,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self { chunks: Mutex::new(Vec::new()), fail_on_chunk: None }
        }
    }

    impl KvTransport for RecordingTransport {
        async fn txn(&self, ops: &[KvOp]) -> Result<TxnOutcome, KvError> {
            let mut chunks = self.chunks.lock().unwrap();
            let this_chunk = chunks.len();
            chunks.push(ops.to_vec());
            if self.fail_on_chunk == Some(this_chunk) {
                return Ok(TxnOutcome::RolledBack(vec!["boom".to_owned()]));
            }
            Ok(TxnOutcome::Ok)
        }
    }

    #[tokio::test]
    async fn test_commit_reorders_leading_check_index() {
        let transport = RecordingTransport::new();
        let mut handler = KvHandler::new(transport);
        handler.check_index("repo/main.ref", 5);
        handler.put("repo/main/a.txt", b"a".to_vec());
        handler.put("repo/main/b.txt", b"b".to_vec());
        handler.put("repo/main.ref", b"newhash".to_vec());
        handler.commit().await.unwrap();

        let chunks = handler.transport.chunks.lock().unwrap();
        assert_eq!(chunks.len(), 1);
        let ops = &chunks[0];
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[0].key(), "repo/main/a.txt");
        assert_eq!(ops[1].key(), "repo/main/b.txt");
        assert!(matches!(ops[2], KvOp::CheckIndex { .. }));
        assert_eq!(ops[3].key(), "repo/main.ref");
    }

    #[tokio::test]
    async fn test_commit_chunks_at_64() {
        let transport = RecordingTransport::new();
        let mut handler = KvHandler::new(transport);
        for i in 0..130 {
            handler.put(format!("repo/main/{i}.txt"), b"x".to_vec());
        }
        handler.commit().await.unwrap();
        let chunks = handler.transport.chunks.lock().unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 64);
        assert_eq!(chunks[1].len(), 64);
        assert_eq!(chunks[2].len(), 2);
    }

    #[tokio::test]
    async fn test_commit_aborts_remaining_chunks_on_failure() {
        let mut transport = RecordingTransport::new();
        transport.fail_on_chunk = Some(0);
        let mut handler = KvHandler::new(transport);
        for i in 0..130 {
            handler.put(format!("repo/main/{i}.txt"), b"x".to_vec());
        }
        let err = handler.commit().await.unwrap_err();
        assert!(matches!(err, KvError::TransactionIntegrity(_)));
        let chunks = handler.transport.chunks.lock().unwrap();
        assert_eq!(chunks.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_empty_is_noop() {
        let transport = RecordingTransport::new();
        let mut handler = KvHandler::new(transport);
        handler.commit().await.unwrap();
        assert!(handler.transport.chunks.lock().unwrap().is_empty());
    }
}
