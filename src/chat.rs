use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// A message a human typed into a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub chat_id: String,
    pub text: String,
    pub message_id: String,
}

/// The messaging side of the relay. Implementations are expected to drop
/// repeated deliveries of the same `message_id` before forwarding.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver `text` to `chat_id`. Returns false if the platform rejected it.
    async fn send(&self, chat_id: &str, text: &str) -> bool;

    /// Receive messages until the platform closes, forwarding each to `inbound`.
    async fn run(&self, inbound: mpsc::Sender<InboundMessage>) -> Result<()>;
}
