//! Collaborator contract between a [`crate::dealer::Dealer`] and the chat it runs on

use crate::clock::Clock;
use crate::types::{ConversationId, UserDevice};
use crate::wire::{GameMessageEncoded, GameMessageWrappedEncoded};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Result type for helper calls; errors are opaque to the dealer
pub type HelperResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// What a dealer needs from its host: identity, time and a chat to talk on
#[async_trait]
pub trait DealersHelper: Send + Sync + 'static {
    /// The local participant
    fn me(&self) -> UserDevice;

    /// Clock used for deadlines and for reading "now"
    fn clock(&self) -> Arc<dyn Clock>;

    /// Trusted time from the chat server
    async fn server_time(&self) -> HelperResult<DateTime<Utc>>;

    /// Every flip message the chat saw at or after `since`, oldest first.
    ///
    /// The result must already contain the START the dealer is handling when
    /// it calls this: the chat archives a message before delivering it. The
    /// dealer skips exactly one copy identical to that START, so any further
    /// copy is treated as a replay of its game id.
    async fn read_history(&self, since: DateTime<Utc>) -> HelperResult<Vec<GameMessageWrappedEncoded>>;

    /// Broadcast an encoded message to the conversation
    async fn send_chat(&self, conversation_id: &ConversationId, msg: GameMessageEncoded) -> HelperResult<()>;
}
