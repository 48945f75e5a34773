//! Shared `LISTEN`/`NOTIFY` connection for queue wake-ups.
//!
//! Modeled on the `SharedListenerManager` in the host project's
//! `tasker-shared/src/messaging/service/providers/pgmq.rs`: rather than
//! opening one `PgListener` per subscribing domain, a single background task
//! owns one dedicated connection and multiplexes `LISTEN` channels and
//! subscribers over it. This keeps `spec.md` §5's "pool sized to at least
//! concurrency + router concurrency + 2 listener connections" from growing
//! unbounded as more domains come online in one process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tracing::{debug, error, info};

const COMMAND_BUFFER_SIZE: usize = 128;
const NOTIFICATION_BUFFER_SIZE: usize = 100;

#[derive(Debug)]
enum ListenerCommand {
    AddChannel(String),
    AddSubscriber {
        channel: String,
        tx: tokio::sync::mpsc::Sender<()>,
    },
}

struct SharedListenerState {
    pool: PgPool,
    command_tx: tokio::sync::mpsc::Sender<ListenerCommand>,
    command_rx: Mutex<Option<tokio::sync::mpsc::Receiver<ListenerCommand>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for SharedListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedListenerState")
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

/// Owns a single `PgListener` connection shared by every domain's wake-up
/// subscription.
///
/// The background task starts lazily on first subscription. Each call to
/// [`SharedListenerManager::subscribe`] registers a `LISTEN` channel (if not
/// already listened on) and a subscriber that is notified (an empty "poke",
/// not the payload itself — callers re-read the queue on wake-up, as
/// `spec.md` §4.6's drain loop does) whenever a matching `NOTIFY` arrives.
#[derive(Debug, Clone)]
pub struct SharedListenerManager {
    inner: Arc<SharedListenerState>,
}

impl SharedListenerManager {
    pub fn new(pool: PgPool) -> Self {
        let (command_tx, command_rx) = tokio::sync::mpsc::channel(COMMAND_BUFFER_SIZE);
        Self {
            inner: Arc::new(SharedListenerState {
                pool,
                command_tx,
                command_rx: Mutex::new(Some(command_rx)),
                started: AtomicBool::new(false),
            }),
        }
    }

    fn ensure_started(&self) {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let command_rx = self
                .inner
                .command_rx
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take()
                .expect("command_rx taken exactly once");
            let pool = self.inner.pool.clone();
            tokio::spawn(async move {
                shared_listener_task(pool, command_rx).await;
            });
        }
    }

    /// Subscribe to wake-ups on `channel`. Returns a receiver that yields a
    /// unit value every time a `NOTIFY` lands on that channel; callers treat
    /// it purely as a signal to re-poll, per `spec.md` §4.6's outer-wait step.
    pub fn subscribe(&self, channel: &str) -> tokio::sync::mpsc::Receiver<()> {
        self.ensure_started();
        let (tx, rx) = tokio::sync::mpsc::channel(NOTIFICATION_BUFFER_SIZE);
        let _ = self
            .inner
            .command_tx
            .try_send(ListenerCommand::AddChannel(channel.to_string()));
        let _ = self.inner.command_tx.try_send(ListenerCommand::AddSubscriber {
            channel: channel.to_string(),
            tx,
        });
        rx
    }
}

async fn shared_listener_task(
    pool: PgPool,
    mut command_rx: tokio::sync::mpsc::Receiver<ListenerCommand>,
) {
    let mut listener = match PgListener::connect_with(&pool).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "failed to open shared PgListener connection");
            return;
        }
    };

    info!("shared command-bus listener started");

    let mut subscribers: HashMap<String, Vec<tokio::sync::mpsc::Sender<()>>> = HashMap::new();
    let mut listening_channels: std::collections::HashSet<String> =
        std::collections::HashSet::new();

    while let Ok(command) = command_rx.try_recv() {
        process_command(command, &mut listener, &mut subscribers, &mut listening_channels).await;
    }

    loop {
        tokio::select! {
            notification = listener.recv() => {
                match notification {
                    Ok(notification) => {
                        let channel = notification.channel().to_string();
                        debug!(channel = %channel, "received NOTIFY");
                        if let Some(senders) = subscribers.get_mut(&channel) {
                            senders.retain(|tx| !tx.is_closed());
                            for tx in senders.iter() {
                                let _ = tx.send(()).await;
                            }
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "shared PgListener connection error");
                        break;
                    }
                }
            }
            command = command_rx.recv() => {
                match command {
                    Some(cmd) => {
                        process_command(cmd, &mut listener, &mut subscribers, &mut listening_channels).await;
                    }
                    None => {
                        info!("command channel closed, shutting down shared listener");
                        break;
                    }
                }
            }
        }
    }

    info!(
        channels = listening_channels.len(),
        subscribers = subscribers.len(),
        "shared command-bus listener stopped"
    );
}

async fn process_command(
    command: ListenerCommand,
    listener: &mut PgListener,
    subscribers: &mut HashMap<String, Vec<tokio::sync::mpsc::Sender<()>>>,
    listening_channels: &mut std::collections::HashSet<String>,
) {
    match command {
        ListenerCommand::AddChannel(channel) => {
            if listening_channels.contains(&channel) {
                return;
            }
            match listener.listen(&channel).await {
                Ok(()) => {
                    listening_channels.insert(channel.clone());
                    info!(channel = %channel, "added LISTEN channel");
                }
                Err(e) => {
                    error!(channel = %channel, error = %e, "failed to LISTEN on channel");
                }
            }
        }
        ListenerCommand::AddSubscriber { channel, tx } => {
            subscribers.entry(channel.clone()).or_default().push(tx);
            debug!(channel = %channel, "added wake-up subscriber");
        }
    }
}
