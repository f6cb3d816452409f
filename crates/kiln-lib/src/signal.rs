use std::{future::Future, sync::Arc};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
#[error("Failed to register signal handler: {0}")]
pub struct Error(#[from] std::io::Error);

/// Signals that stop a run.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Signal {
    /// SIGINT, SIGHUP or Ctrl-C
    Interrupt,
    /// SIGTERM
    Terminate,
}

#[cfg(unix)]
/// Resolves with the first SIGINT, SIGTERM or SIGHUP.
///
/// Handlers are registered before this returns, so it must be called from
/// within a tokio runtime.
pub fn get_signal() -> Result<impl Future<Output = Option<Signal>>, Error> {
    use tokio::signal::unix;
    let mut sigint = unix::signal(unix::SignalKind::interrupt())?;
    let mut sigterm = unix::signal(unix::SignalKind::terminate())?;
    let mut sighup = unix::signal(unix::SignalKind::hangup())?;

    Ok(async move {
        tokio::select! {
            res = sigint.recv() => res.map(|_| Signal::Interrupt),
            res = sighup.recv() => res.map(|_| Signal::Interrupt),
            res = sigterm.recv() => res.map(|_| Signal::Terminate),
        }
    })
}

#[cfg(not(unix))]
/// Resolves with the first Ctrl-C.
pub fn get_signal() -> Result<impl Future<Output = Option<Signal>>, Error> {
    Ok(async { tokio::signal::ctrl_c().await.ok().map(|_| Signal::Interrupt) })
}

/// Cancels a run's [`CancellationToken`] when a signal arrives.
///
/// Cancelling stops the scheduler from dispatching new nodes; nodes already
/// running see the same token and finish or abort on their own.
#[derive(Debug, Clone)]
pub struct SignalHandler {
    token: CancellationToken,
    close: Arc<mpsc::Sender<()>>,
}

impl SignalHandler {
    /// Watches `signal_source` until it resolves or [`close`](Self::close) is
    /// called. A source that resolves to `None` could not receive signals and
    /// leaves the token alone.
    pub fn new(
        signal_source: impl Future<Output = Option<Signal>> + Send + 'static,
        token: CancellationToken,
    ) -> Self {
        let (close, mut rx) = mpsc::channel::<()>(1);
        let worker_token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                signal = signal_source => match signal {
                    Some(signal) => {
                        warn!("received {signal:?}, stopping the run");
                        worker_token.cancel();
                    }
                    None => debug!("signal source closed without a signal"),
                },
                // A close message and every handler being dropped both end the watch.
                _ = rx.recv() => {}
            }
        });

        Self {
            token,
            close: Arc::new(close),
        }
    }

    /// Watches the process's own signals.
    pub fn from_os(token: CancellationToken) -> Result<Self, Error> {
        Ok(Self::new(get_signal()?, token))
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Stops watching without cancelling and waits for the watcher to exit.
    pub async fn close(&self) {
        if self.close.send(()).await.is_err() {
            // watcher has already exited
            return;
        }
        self.done().await;
    }

    /// Waits until the watcher has exited.
    pub async fn done(&self) {
        // Receiver is dropped once the worker task completes
        self.close.closed().await;
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn test_signal_cancels_token() {
        let (tx, rx) = oneshot::channel::<Signal>();
        let token = CancellationToken::new();
        let handler = SignalHandler::new(async move { rx.await.ok() }, token.clone());

        assert!(!token.is_cancelled());
        tx.send(Signal::Interrupt).unwrap();
        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), handler.done())
            .await
            .unwrap();
        assert!(handler.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_close_does_not_cancel() {
        let (_tx, rx) = oneshot::channel::<Signal>();
        let token = CancellationToken::new();
        let handler = SignalHandler::new(async move { rx.await.ok() }, token.clone());

        tokio::time::timeout(Duration::from_secs(5), handler.close())
            .await
            .unwrap();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_closed_source_does_not_cancel() {
        let (tx, rx) = oneshot::channel::<Signal>();
        let token = CancellationToken::new();
        let handler = SignalHandler::new(async move { rx.await.ok() }, token.clone());

        drop(tx);
        tokio::time::timeout(Duration::from_secs(5), handler.done())
            .await
            .unwrap();
        assert!(!token.is_cancelled());
    }
}
