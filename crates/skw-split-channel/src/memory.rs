use async_trait::async_trait;
use futures::channel::{mpsc, oneshot};
use futures::SinkExt;
use skw_split_payload::{Envelope, Topic};

use crate::channel::MessageChannel;
use crate::ledger::{default_ledger_opt, run_ledger, LedgerCommand};
use crate::types::{ChannelError, MessageId};

/// Client side of the in-process ledger.
#[derive(Clone)]
pub struct InMemoryChannel {
    command_sender: mpsc::Sender<LedgerCommand>,
}

impl InMemoryChannel {
    pub fn new(command_sender: mpsc::Sender<LedgerCommand>) -> Self {
        Self { command_sender }
    }

    /// Start a ledger task on the current tokio runtime and connect to it.
    pub fn spawn(max_payload_bytes: usize) -> Self {
        let (config, command_sender) = default_ledger_opt(max_payload_bytes);
        run_ledger(config);
        Self::new(command_sender)
    }

    async fn request<T>(
        &self,
        command: LedgerCommand,
        result_receiver: oneshot::Receiver<T>,
    ) -> Result<T, ChannelError> {
        self.command_sender
            .clone()
            .send(command)
            .await
            .map_err(|_| ChannelError::Transport("ledger unavailable".to_string()))?;
        result_receiver
            .await
            .map_err(|_| ChannelError::Transport("ledger dropped the request".to_string()))
    }

    /// Every envelope ever published on `topic`, oldest first. This is the
    /// view any outside observer of the ledger has.
    pub async fn entries(&self, topic: &Topic) -> Result<Vec<(MessageId, Envelope)>, ChannelError> {
        let (result_sender, result_receiver) = oneshot::channel();
        self.request(
            LedgerCommand::Entries { topic: topic.clone(), result_sender },
            result_receiver,
        ).await
    }

    pub async fn shutdown(&self) -> Result<(), ChannelError> {
        let (result_sender, result_receiver) = oneshot::channel();
        self.request(LedgerCommand::Shutdown { result_sender }, result_receiver).await
    }
}

#[async_trait]
impl MessageChannel for InMemoryChannel {
    async fn send(&self, topic: &Topic, envelope: Envelope) -> Result<MessageId, ChannelError> {
        let (result_sender, result_receiver) = oneshot::channel();
        self.request(
            LedgerCommand::Publish { topic: topic.clone(), envelope, result_sender },
            result_receiver,
        ).await?
    }

    async fn poll_latest(&self, topic: &Topic) -> Result<Option<Envelope>, ChannelError> {
        let (result_sender, result_receiver) = oneshot::channel();
        self.request(
            LedgerCommand::Latest { topic: topic.clone(), result_sender },
            result_receiver,
        ).await
    }
}
