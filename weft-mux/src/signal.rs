use tokio::sync::watch;

use crate::error::Error;

/// One-shot broadcast event.
///
/// Fires at most once and stays fired; any number of tasks can wait on it
/// concurrently.
pub(crate) struct Event {
    tx: watch::Sender<bool>,
}

impl Event {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Fire the event. Returns true on the first call only.
    pub(crate) fn fire(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    pub(crate) fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail while
        // we are borrowed.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

/// One-shot cancel cell latching a terminal error.
///
/// The first raise wins; later raises are ignored so a stream cancelled
/// with `StreamClosed` does not get re-labelled `StreamReset` afterwards.
pub(crate) struct Cancel {
    tx: watch::Sender<Option<Error>>,
}

impl Cancel {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Latch `err` as the terminal error. Returns true on the first call.
    pub(crate) fn raise(&self, err: Error) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                false
            } else {
                *slot = Some(err);
                true
            }
        })
    }

    /// The latched error, if the cell has been raised.
    pub(crate) fn get(&self) -> Option<Error> {
        (*self.tx.borrow()).clone()
    }

    /// Resolves with the latched error once the cell is raised.
    pub(crate) async fn fired(&self) -> Error {
        let mut rx = self.tx.subscribe();
        loop {
            let latched = (*rx.borrow()).clone();
            if let Some(err) = latched {
                return err;
            }
            // Unreachable while `self` is borrowed; never resolve.
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}
