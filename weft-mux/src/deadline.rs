use std::time::Instant;

use tokio::sync::watch;

/// Absolute-deadline cell shared between the setter and blocked operations.
///
/// Setting a new deadline (or disabling it) wakes anything currently
/// waiting in [`Deadline::expired`], which then re-arms against the new
/// value. An already-elapsed deadline makes `expired` resolve immediately,
/// and the deadline stays in force for later operations until changed.
pub(crate) struct Deadline {
    tx: watch::Sender<Option<Instant>>,
}

impl Deadline {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Set the deadline; `None` disables it.
    pub(crate) fn set(&self, deadline: Option<Instant>) {
        self.tx.send_replace(deadline);
    }

    /// Resolves once an armed deadline has passed. Pending forever while
    /// the deadline is disabled.
    pub(crate) async fn expired(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            let armed = *rx.borrow_and_update();
            match armed {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => return,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                std::future::pending::<()>().await;
                            }
                        }
                    }
                }
                None => {
                    if rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn elapsed_deadline_resolves_immediately() {
        let deadline = Deadline::new();
        deadline.set(Some(Instant::now() - Duration::from_millis(5)));
        tokio::time::timeout(Duration::from_secs(1), deadline.expired())
            .await
            .expect("already-elapsed deadline should resolve");
    }

    #[tokio::test]
    async fn disabled_deadline_never_resolves() {
        let deadline = Deadline::new();
        let result =
            tokio::time::timeout(Duration::from_millis(50), deadline.expired()).await;
        assert!(result.is_err(), "unarmed deadline must stay pending");
    }

    #[tokio::test]
    async fn setting_a_deadline_wakes_a_blocked_waiter() {
        let deadline = Arc::new(Deadline::new());
        let waiter = {
            let deadline = deadline.clone();
            tokio::spawn(async move { deadline.expired().await })
        };
        // Let the waiter park on the disabled cell first.
        tokio::time::sleep(Duration::from_millis(20)).await;

        deadline.set(Some(Instant::now() + Duration::from_millis(30)));
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should observe the new deadline")
            .unwrap();
    }

    #[tokio::test]
    async fn disabling_re_arms_the_wait() {
        let deadline = Arc::new(Deadline::new());
        deadline.set(Some(Instant::now() + Duration::from_millis(40)));

        let waiter = {
            let deadline = deadline.clone();
            tokio::spawn(async move { deadline.expired().await })
        };
        // Disable before it fires; the waiter must go back to pending.
        tokio::time::sleep(Duration::from_millis(10)).await;
        deadline.set(None);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!waiter.is_finished());
        waiter.abort();
    }
}
