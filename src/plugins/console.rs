use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::chat::{ChatPlatform, InboundMessage};
use crate::error::Result;

pub const CONSOLE_CHAT_ID: &str = "console";

/// Chat over the terminal: stdin lines in, stdout lines out.
pub struct ConsoleChat {
    next_message: AtomicU64,
}

impl ConsoleChat {
    pub fn new() -> Self {
        Self {
            next_message: AtomicU64::new(1),
        }
    }
}

impl Default for ConsoleChat {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatPlatform for ConsoleChat {
    fn name(&self) -> &str {
        "console"
    }

    async fn send(&self, _chat_id: &str, text: &str) -> bool {
        let mut stdout = tokio::io::stdout();
        let line = format!("{}\n", text);
        stdout.write_all(line.as_bytes()).await.is_ok() && stdout.flush().await.is_ok()
    }

    async fn run(&self, inbound: mpsc::Sender<InboundMessage>) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            let id = self.next_message.fetch_add(1, Ordering::Relaxed);
            let message = InboundMessage {
                chat_id: CONSOLE_CHAT_ID.to_string(),
                text: text.to_string(),
                message_id: format!("console-{}", id),
            };
            if inbound.send(message).await.is_err() {
                break;
            }
        }
        tracing::info!("console input closed");
        Ok(())
    }
}
