use tokio::sync::watch;

/// Create a shutdown signal pair. Dropping the `ShutdownHandle` tells every clone of the
/// `ShutdownSignal` to stop.
pub(crate) fn shutdown_signal() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(());

    (ShutdownHandle { _tx: tx }, ShutdownSignal { rx })
}

pub(crate) struct ShutdownHandle {
    _tx: watch::Sender<()>,
}

#[derive(Clone)]
pub(crate) struct ShutdownSignal {
    rx: watch::Receiver<()>,
}

impl ShutdownSignal {
    /// Resolves once the handle has been dropped.
    pub(crate) async fn wait(&mut self) {
        // Nobody ever sends a value, so `changed()` only returns once the sender is gone.
        while self.rx.changed().await.is_ok() {}
    }
}
