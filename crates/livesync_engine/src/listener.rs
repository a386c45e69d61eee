//! Change feed listener.
//!
//! Holds one dedicated listen connection per notification channel and
//! forwards every raw payload to a handler. When the connection drops the
//! listener reconnects with fixed spacing; after too many consecutive failed
//! attempts it hands the last error to a fatal hook.

use crate::config::ListenerConfig;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Opens listen connections.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// Connects and starts listening on `channel`.
    async fn listen(&self, channel: &str) -> SyncResult<Box<dyn NotificationStream>>;
}

/// A live listen connection.
#[async_trait]
pub trait NotificationStream: Send {
    /// Waits for the next payload. `Ok(None)` means the connection closed.
    async fn recv(&mut self) -> SyncResult<Option<String>>;
}

/// Receives raw notification payloads.
pub type NotificationHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Called once the listener has given up reconnecting.
pub type FatalHook = Arc<dyn Fn(&SyncError) + Send + Sync>;

/// The default fatal hook: logs and terminates the process.
pub fn exit_process_hook() -> FatalHook {
    Arc::new(|err: &SyncError| {
        error!(error = %err, "change feed listener gave up reconnecting, exiting");
        std::process::exit(1);
    })
}

struct ListenerState {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Forwards notifications from one channel to a handler.
pub struct ChangeFeedListener {
    config: ListenerConfig,
    fatal_hook: FatalHook,
    listening: Arc<AtomicBool>,
    state: Mutex<Option<ListenerState>>,
}

impl ChangeFeedListener {
    /// Creates a listener with the process-terminating fatal hook.
    pub fn new(config: ListenerConfig) -> Self {
        Self {
            config,
            fatal_hook: exit_process_hook(),
            listening: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(None),
        }
    }

    /// Replaces the fatal hook.
    pub fn with_fatal_hook(mut self, hook: FatalHook) -> Self {
        self.fatal_hook = hook;
        self
    }

    /// True while a live stream is held.
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// True if the listener task is running.
    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .as_ref()
            .map_or(false, |s| !s.handle.is_finished())
    }

    /// Spawns the listen loop. Fails if it is already running.
    pub fn start(
        &self,
        source: Arc<dyn NotificationSource>,
        channel: impl Into<String>,
        handler: NotificationHandler,
    ) -> SyncResult<()> {
        let mut state = self.state.lock();
        if state.as_ref().map_or(false, |s| !s.handle.is_finished()) {
            return Err(SyncError::InvalidConfig(
                "change feed listener already started".into(),
            ));
        }

        let channel = channel.into();
        let config = self.config.clone();
        let fatal_hook = self.fatal_hook.clone();
        let listening = self.listening.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(listen_loop(
            source,
            channel,
            handler,
            config,
            fatal_hook,
            listening,
            shutdown_rx,
        ));
        *state = Some(ListenerState {
            handle,
            shutdown_tx,
        });
        Ok(())
    }

    /// Stops the listen loop and waits for it to exit.
    pub async fn stop(&self) {
        let state = self.state.lock().take();
        if let Some(state) = state {
            let _ = state.shutdown_tx.send(true);
            if let Err(e) = state.handle.await {
                warn!(error = %e, "change feed listener task failed");
            }
        }
        self.listening.store(false, Ordering::SeqCst);
    }
}

impl Drop for ChangeFeedListener {
    fn drop(&mut self) {
        if let Some(state) = self.state.get_mut().take() {
            let _ = state.shutdown_tx.send(true);
            state.handle.abort();
        }
    }
}

async fn listen_loop(
    source: Arc<dyn NotificationSource>,
    channel: String,
    handler: NotificationHandler,
    config: ListenerConfig,
    fatal_hook: FatalHook,
    listening: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut failures = 0u32;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        match source.listen(&channel).await {
            Ok(mut stream) => {
                info!(channel = %channel, "listening for change notifications");
                failures = 0;
                listening.store(true, Ordering::SeqCst);

                loop {
                    let next = tokio::select! {
                        next = stream.recv() => next,
                        _ = shutdown_rx.changed() => {
                            listening.store(false, Ordering::SeqCst);
                            debug!(channel = %channel, "change feed listener stopped");
                            return;
                        }
                    };
                    match next {
                        Ok(Some(payload)) => handler(payload),
                        Ok(None) => {
                            warn!(channel = %channel, "notification connection closed");
                            break;
                        }
                        Err(e) => {
                            warn!(channel = %channel, error = %e, "notification connection lost");
                            break;
                        }
                    }
                }

                listening.store(false, Ordering::SeqCst);
                drop(stream);
            }
            Err(e) => {
                failures += 1;
                warn!(
                    channel = %channel,
                    attempt = failures,
                    max_attempts = config.max_attempts,
                    error = %e,
                    "could not connect change feed listener"
                );
                if failures >= config.max_attempts {
                    fatal_hook(&e);
                    return;
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.retry_delay) => {}
            _ = shutdown_rx.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Source that fails every connection attempt.
    struct DeadSource {
        attempts: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl NotificationSource for DeadSource {
        async fn listen(&self, _channel: &str) -> SyncResult<Box<dyn NotificationStream>> {
            *self.attempts.lock() += 1;
            Err(SyncError::ConnectionLost("refused".into()))
        }
    }

    struct ChannelStream(mpsc::UnboundedReceiver<String>);

    #[async_trait]
    impl NotificationStream for ChannelStream {
        async fn recv(&mut self) -> SyncResult<Option<String>> {
            Ok(self.0.recv().await)
        }
    }

    /// Source handing out one prepared stream.
    struct OneShotSource(Mutex<Option<mpsc::UnboundedReceiver<String>>>);

    #[async_trait]
    impl NotificationSource for OneShotSource {
        async fn listen(&self, _channel: &str) -> SyncResult<Box<dyn NotificationStream>> {
            match self.0.lock().take() {
                Some(rx) => Ok(Box::new(ChannelStream(rx))),
                None => Err(SyncError::ConnectionLost("gone".into())),
            }
        }
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let attempts = Arc::new(Mutex::new(0));
        let source = Arc::new(DeadSource {
            attempts: attempts.clone(),
        });
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        let listener = ChangeFeedListener::new(
            ListenerConfig::new(10).with_retry_delay(Duration::from_millis(1)),
        )
        .with_fatal_hook(Arc::new(move |err: &SyncError| {
            let _ = fatal_tx.send(err.to_string());
        }));

        listener
            .start(source, "ch", Arc::new(|_payload: String| {}))
            .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), fatal_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(message.contains("refused"));
        assert_eq!(*attempts.lock(), 10);
        assert!(!listener.is_listening());
    }

    #[tokio::test]
    async fn forwards_payloads_and_stops() {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Arc::new(OneShotSource(Mutex::new(Some(rx))));
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let listener = ChangeFeedListener::new(ListenerConfig::default())
            .with_fatal_hook(Arc::new(|_err: &SyncError| {}));

        listener
            .start(
                source,
                "ch",
                Arc::new(move |payload: String| {
                    let _ = seen_tx.send(payload);
                }),
            )
            .unwrap();
        assert!(listener
            .start(
                Arc::new(OneShotSource(Mutex::new(None))),
                "ch",
                Arc::new(|_payload: String| {})
            )
            .is_err());

        tx.send("one".into()).unwrap();
        tx.send("two".into()).unwrap();
        assert_eq!(seen_rx.recv().await.unwrap(), "one");
        assert_eq!(seen_rx.recv().await.unwrap(), "two");
        assert!(listener.is_listening());

        listener.stop().await;
        assert!(!listener.is_listening());
        assert!(!listener.is_running());
    }
}
