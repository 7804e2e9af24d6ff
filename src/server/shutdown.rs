//! Graceful-drain signaling between a worker and its connection tasks.
//!
//! A worker holds the [`Signal`]; every connection task holds a [`Watch`]
//! clone. Triggering the signal flips the watched flag (connections finish
//! their in-flight exchange and close), then resolves once the last watch
//! has been dropped.

use tokio::sync::{mpsc, watch};

pub(crate) fn channel() -> (Signal, Watch) {
    let (tx, rx) = watch::channel(false);
    let (guard, drained_rx) = mpsc::channel::<Never>(1);
    (
        Signal { tx, drained_rx },
        Watch { rx, _guard: guard },
    )
}

enum Never {}

pub(crate) struct Signal {
    tx: watch::Sender<bool>,
    drained_rx: mpsc::Receiver<Never>,
}

#[derive(Clone)]
pub(crate) struct Watch {
    rx: watch::Receiver<bool>,
    _guard: mpsc::Sender<Never>,
}

impl Signal {
    /// Flip every watch to draining and wait until all watches are gone.
    pub(crate) async fn drain(mut self) {
        let _ = self.tx.send(true);
        // The channel never carries a value; recv resolves None once the
        // last guard is dropped.
        while let Some(never) = self.drained_rx.recv().await {
            match never {}
        }
    }
}

impl Watch {
    pub(crate) fn is_draining(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the worker starts draining. A dropped signal counts
    /// as a drain so orphaned connections still unwind.
    pub(crate) async fn signaled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_resolves_after_watches_drop() {
        let (signal, watch) = channel();
        assert!(!watch.is_draining());

        let task = tokio::spawn(async move {
            let mut watch = watch;
            watch.signaled().await;
            assert!(watch.is_draining());
            // watch dropped here
        });

        signal.drain().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn cloned_watches_all_count() {
        let (signal, watch) = channel();
        let second = watch.clone();

        let t1 = tokio::spawn(async move {
            let mut w = watch;
            w.signaled().await;
        });
        let t2 = tokio::spawn(async move {
            let mut w = second;
            w.signaled().await;
        });

        signal.drain().await;
        t1.await.unwrap();
        t2.await.unwrap();
    }
}
