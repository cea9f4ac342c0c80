//! Cancellation scopes.
//!
//! A scope is a `watch::Receiver<bool>` that flips to `true` once. Callers keep
//! the matching `watch::Sender` and fire it with `send(true)`.

use tokio::sync::watch;

/// A scope that never fires
pub fn never() -> watch::Receiver<bool> {
    watch::channel(false).1
}

/// Resolves once `scope` has fired.
///
/// A scope whose sender was dropped without firing never resolves.
pub async fn cancelled(scope: &mut watch::Receiver<bool>) {
    loop {
        if *scope.borrow_and_update() {
            return;
        }
        if scope.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Whether `scope` has already fired
pub fn is_cancelled(scope: &watch::Receiver<bool>) -> bool {
    *scope.borrow()
}
