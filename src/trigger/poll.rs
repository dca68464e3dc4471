//! Interval-driven poller: one task per repository, ticking at the repo's
//! configured polling interval and submitting a [`ReconcileRequest`] each
//! time.

use std::time::Duration;

use log::debug;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::util::ErrGroup;

use super::ReconcileRequest;

/// Spawn one poller per `(repo_name, interval)` pair onto `group`, each
/// sending into `tx` until `ct` is cancelled.
pub fn spawn_pollers(
    group: &mut ErrGroup,
    ct: CancellationToken,
    tx: mpsc::Sender<ReconcileRequest>,
    targets: Vec<(String, Duration)>,
) {
    for (repo_name, interval) in targets {
        let tx = tx.clone();
        let ct = ct.clone();
        group.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so we don't
            // double-reconcile hot on the heels of startup's initial seed.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ct.cancelled() => return Ok(()),
                    _ = ticker.tick() => {
                        debug!("poll trigger firing for {repo_name}");
                        if tx.send(ReconcileRequest { repo_name: repo_name.clone() }).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_poller_sends_requests_until_cancelled() {
        let ct = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);
        let mut group = ErrGroup::new(ct.clone());
        spawn_pollers(
            &mut group,
            ct.clone(),
            tx,
            vec![("demo".to_owned(), Duration::from_millis(10))],
        );

        let req = rx.recv().await.unwrap();
        assert_eq!(req.repo_name, "demo");

        ct.cancel();
        group.wait().await.unwrap();
    }
}
