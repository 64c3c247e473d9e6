use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::chat::ChatPlatform;

struct Outgoing {
    chat_id: String,
    text: String,
}

/// Queue of chat notifications drained by a single worker, so messages leave
/// in the order they were queued and a slow platform never blocks dispatch.
pub struct Notifier {
    tx: mpsc::UnboundedSender<Outgoing>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Outgoing>>>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Queue a message. Messages queued before `spawn` are kept.
    pub fn notify(&self, chat_id: &str, text: impl Into<String>) {
        let outgoing = Outgoing {
            chat_id: chat_id.to_string(),
            text: text.into(),
        };
        if self.tx.send(outgoing).is_err() {
            tracing::warn!("notifier stopped, dropping message for {}", chat_id);
        }
    }

    /// Start the worker. Returns `None` if it was already started.
    pub fn spawn(&self, chat: Arc<dyn ChatPlatform>) -> Option<JoinHandle<()>> {
        let mut rx = self.rx.lock().unwrap_or_else(|e| e.into_inner()).take()?;
        Some(tokio::spawn(async move {
            while let Some(outgoing) = rx.recv().await {
                if !chat.send(&outgoing.chat_id, &outgoing.text).await {
                    tracing::warn!(
                        "{} rejected a message for chat {}",
                        chat.name(),
                        outgoing.chat_id
                    );
                }
            }
        }))
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
