//! Scoped ownership of a GATT session.
//!
//! [`SessionGuard`] tears the session down exactly once: either through an
//! explicit [`SessionGuard::release`] or, if the owner bails out early, from
//! its `Drop` impl. [`PendingRelease`] covers the stretch before that, while
//! a transport has asked for a link but has no session to hand out yet.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::transport::GattSession;

/// Owns a [`GattSession`] and releases it on every exit path.
///
/// Release means unsubscribing every characteristic subscribed through the
/// guard, then disconnecting.
pub struct SessionGuard {
    session: Arc<dyn GattSession>,
    subscribed: Arc<Mutex<Vec<Uuid>>>,
    released: Arc<AtomicBool>,
}

impl SessionGuard {
    /// Take ownership of `session`.
    pub fn new(session: Box<dyn GattSession>) -> Self {
        Self {
            session: Arc::from(session),
            subscribed: Arc::new(Mutex::new(Vec::new())),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The guarded session.
    pub fn session(&self) -> &dyn GattSession {
        self.session.as_ref()
    }

    /// Subscribe to `uuid` and remember it for release.
    pub async fn subscribe(&self, uuid: Uuid) -> crate::Result<tokio::sync::mpsc::Receiver<Vec<u8>>> {
        let rx = self.session.subscribe(uuid).await?;
        self.subscribed.lock().await.push(uuid);
        Ok(rx)
    }

    /// Unsubscribe and disconnect. Later calls, and the drop, do nothing.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        teardown(self.session.clone(), self.subscribed.clone()).await;
    }
}

async fn teardown(session: Arc<dyn GattSession>, subscribed: Arc<Mutex<Vec<Uuid>>>) {
    let uuids: Vec<Uuid> = subscribed.lock().await.drain(..).collect();
    for uuid in uuids {
        if let Err(e) = session.unsubscribe(uuid).await {
            debug!(address = session.address(), %uuid, "Unsubscribe failed: {}", e);
        }
    }
    if let Err(e) = session.disconnect().await {
        warn!(address = session.address(), "Disconnect failed: {}", e);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.session.clone();
        let subscribed = self.subscribed.clone();
        if let Ok(handle) = Handle::try_current() {
            handle.spawn(teardown(session, subscribed));
        } else {
            warn!(
                address = session.address(),
                "No tokio runtime available to release GATT session"
            );
        }
    }
}

/// Release for a link requested before any [`GattSession`] owns it.
///
/// Unless disarmed, the release runs either through
/// [`PendingRelease::release_now`] or, when the connecting future is dropped
/// (e.g. on cancellation), on a spawned task.
#[must_use = "dropping a PendingRelease releases the link"]
pub struct PendingRelease {
    release: Option<BoxFuture<'static, ()>>,
}

impl PendingRelease {
    pub fn new(release: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            release: Some(Box::pin(release)),
        }
    }

    /// Run one connect step; if it fails, release before handing the error
    /// back.
    pub async fn attempt<T>(
        &mut self,
        step: impl Future<Output = crate::Result<T>>,
    ) -> crate::Result<T> {
        let result = step.await;
        if result.is_err()
            && let Some(release) = self.release.take()
        {
            release.await;
        }
        result
    }

    /// The link now belongs to a session; never release it from here.
    pub fn disarm(mut self) {
        self.release = None;
    }

    /// Release right away.
    pub async fn release_now(mut self) {
        if let Some(release) = self.release.take() {
            release.await;
        }
    }
}

impl Drop for PendingRelease {
    fn drop(&mut self) {
        let Some(release) = self.release.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                debug!("Releasing link abandoned during connect");
                handle.spawn(release);
            }
            Err(_) => warn!("No tokio runtime available to release abandoned link"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSession;

    fn session() -> MockSession {
        MockSession::builder("AA:BB:CC:DD:EE:01")
            .characteristic(blescale_types::uuids::QN_NOTIFY)
            .build()
    }

    #[tokio::test]
    async fn test_release_runs_once() {
        let mock = session();
        let stats = mock.stats();
        let guard = SessionGuard::new(Box::new(mock));
        let _rx = guard.subscribe(blescale_types::uuids::QN_NOTIFY).await.unwrap();

        guard.release().await;
        guard.release().await;
        drop(guard);
        tokio::task::yield_now().await;

        assert_eq!(stats.unsubscribes(), 1);
        assert_eq!(stats.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let mock = session();
        let stats = mock.stats();
        {
            let guard = SessionGuard::new(Box::new(mock));
            let _rx = guard.subscribe(blescale_types::uuids::QN_NOTIFY).await.unwrap();
        }
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(stats.unsubscribes(), 1);
        assert_eq!(stats.disconnects(), 1);
    }

    fn counting(count: &Arc<std::sync::atomic::AtomicUsize>) -> PendingRelease {
        let count = Arc::clone(count);
        PendingRelease::new(async move {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_pending_release_on_drop() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        drop(counting(&count));
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pending_release_after_failed_step() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut pending = counting(&count);

        assert_eq!(pending.attempt(async { Ok(7) }).await.unwrap(), 7);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let err = pending
            .attempt(async {
                Err::<(), _>(crate::Error::timeout(
                    "GATT characteristic discovery",
                    std::time::Duration::from_secs(30),
                ))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Timeout { .. }));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        drop(pending);
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pending_release_now_and_disarm() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        counting(&count).release_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        counting(&count).disarm();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
