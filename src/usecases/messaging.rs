//! One open conversation over the realtime message keyspace. The vendor
//! cannot filter by pair, so every snapshot is filtered and re-sorted
//! locally and replaces the visible list wholesale.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::entities::Message;
use crate::repositories::{MessageRepository, MessageSubscription, RepositoryError};

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("message is empty")]
    EmptyMessage,
    #[error(transparent)]
    Remote(#[from] RepositoryError),
}

pub struct Conversation {
    self_id: Uuid,
    peer_id: Uuid,
    repo: Arc<dyn MessageRepository>,
    subscription: MessageSubscription,
    visible: Vec<Message>,
    compose: String,
}

impl Conversation {
    pub async fn open(
        repo: Arc<dyn MessageRepository>,
        self_id: Uuid,
        peer_id: Uuid,
    ) -> Result<Self, RepositoryError> {
        let subscription = repo.subscribe().await?;
        let initial = subscription.snapshot();

        let mut conversation = Self {
            self_id,
            peer_id,
            repo,
            subscription,
            visible: vec![],
            compose: String::new(),
        };
        conversation.reconcile(initial);

        Ok(conversation)
    }

    pub fn self_id(&self) -> Uuid { self.self_id }

    pub fn peer_id(&self) -> Uuid { self.peer_id }

    /// Messages of this pair, ascending by the store-assigned timestamp.
    pub fn messages(&self) -> &[Message] { &self.visible }

    pub fn compose(&self) -> &str { &self.compose }

    pub fn set_compose(&mut self, text: impl Into<String>) { self.compose = text.into() }

    /// Waits for the next snapshot and folds it in. Returns `false` once
    /// the subscription has ended.
    pub async fn next_change(&mut self) -> bool {
        if !self.subscription.changed().await {
            return false;
        }

        let snapshot = self.subscription.snapshot();
        self.reconcile(snapshot);
        true
    }

    fn reconcile(&mut self, snapshot: Vec<Message>) {
        let mut visible: Vec<Message> = snapshot
            .into_iter()
            .filter(|m| {
                (m.sender_id == self.self_id && m.receiver_id == self.peer_id)
                    || (m.sender_id == self.peer_id && m.receiver_id == self.self_id)
            })
            .collect();
        visible.sort_by_key(|m| m.created_at);

        self.visible = visible;
    }

    /// Sends the compose buffer. The buffer is cleared only after the
    /// store confirms the write; a failed send leaves it intact so the
    /// user can retry. The sent message is never appended optimistically;
    /// it becomes visible once it comes back through the subscription with
    /// its authoritative timestamp.
    pub async fn send(&mut self) -> Result<(), MessagingError> {
        let trimmed = self.compose.trim();
        if trimmed.is_empty() {
            return Err(MessagingError::EmptyMessage);
        }

        let content = trimmed.to_owned();
        self.repo.send(self.self_id, self.peer_id, content).await?;

        self.compose.clear();
        Ok(())
    }

    /// Releases the realtime subscription. Dropping the conversation has
    /// the same effect.
    pub fn close(self) { self.subscription.close() }
}
