//! Per-call deadline scopes.
//!
//! Each translation call derives a child of the caller's token and arms a
//! timer that cancels it. Work inside the call only watches the child, so
//! caller cancellation and deadline expiry look the same.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A cancellation scope that fires at a deadline or when its parent fires.
pub struct DeadlineScope {
    token: CancellationToken,
    timer: Option<JoinHandle<()>>,
}

impl DeadlineScope {
    /// Child of `parent`, cancelled after `timeout` if given.
    pub fn new(parent: &CancellationToken, timeout: Option<Duration>) -> Self {
        let token = parent.child_token();
        let timer = timeout.map(|timeout| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            })
        });
        Self { token, timer }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl Drop for DeadlineScope {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
