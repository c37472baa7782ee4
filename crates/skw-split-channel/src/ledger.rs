use std::collections::HashMap;

use futures::{channel::{mpsc, oneshot}, StreamExt};
use skw_split_payload::{Envelope, Topic};

use crate::types::{ChannelError, MessageId};

pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1_000_000;

#[derive(Debug)]
pub enum LedgerCommand {
    Publish {
        topic: Topic,
        envelope: Envelope,

        result_sender: oneshot::Sender<Result<MessageId, ChannelError>>,
    },

    Latest {
        topic: Topic,

        result_sender: oneshot::Sender<Option<Envelope>>,
    },

    // the full log of a topic, in publish order
    Entries {
        topic: Topic,

        result_sender: oneshot::Sender<Vec<(MessageId, Envelope)>>,
    },

    Shutdown {
        result_sender: oneshot::Sender<()>,
    },
}

pub struct LedgerConfig {
    max_payload_bytes: usize,

    command_receiver: mpsc::Receiver<LedgerCommand>,
}

impl LedgerConfig {
    pub fn new(
        max_payload_bytes: usize,
        command_receiver: mpsc::Receiver<LedgerCommand>,
    ) -> Self {
        Self {
            max_payload_bytes, command_receiver,
        }
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    pub fn pending_commands(&mut self) -> &mut mpsc::Receiver<LedgerCommand> {
        &mut self.command_receiver
    }
}

pub fn default_ledger_opt(
    max_payload_bytes: usize,
) -> (
    LedgerConfig,
    mpsc::Sender<LedgerCommand>,
) {
    // commands are executed as soon as they are available
    let (command_sender, command_receiver) = mpsc::channel(0);
    (
        LedgerConfig::new(max_payload_bytes, command_receiver),
        command_sender,
    )
}

/// Append-only log of envelopes per topic. Stands in for the public ledger
/// both segments post to: anyone can read every entry.
#[derive(Default)]
struct Ledger {
    entries: HashMap<String, Vec<(MessageId, Envelope)>>,
}

impl Ledger {
    fn publish(&mut self, topic: Topic, envelope: Envelope, max_payload_bytes: usize) -> Result<MessageId, ChannelError> {
        if !topic.is_valid() {
            return Err(ChannelError::Rejected(format!("malformed topic {}", topic)));
        }
        if envelope.ciphertext.len() > max_payload_bytes {
            return Err(ChannelError::Rejected(format!(
                "payload of {} bytes exceeds limit of {}",
                envelope.ciphertext.len(), max_payload_bytes
            )));
        }

        let id = MessageId::of(&topic, &envelope)?;
        self.entries
            .entry(topic.key())
            .or_default()
            .push((id, envelope));
        Ok(id)
    }

    fn latest(&self, topic: &Topic) -> Option<Envelope> {
        self.entries
            .get(&topic.key())
            .and_then(|log| log.last())
            .map(|(_, envelope)| envelope.clone())
    }

    fn entries(&self, topic: &Topic) -> Vec<(MessageId, Envelope)> {
        self.entries
            .get(&topic.key())
            .cloned()
            .unwrap_or_default()
    }
}

/// Spawn the ledger task. It runs until a `Shutdown` command arrives or every
/// command sender has been dropped.
pub fn run_ledger(mut config: LedgerConfig) {
    tokio::spawn(async move {
        let mut ledger = Ledger::default();
        let max_payload_bytes = config.max_payload_bytes();

        while let Some(command) = config.pending_commands().next().await {
            match command {
                LedgerCommand::Publish { topic, envelope, result_sender } => {
                    let status = ledger.publish(topic, envelope, max_payload_bytes);
                    if let Ok(id) = &status {
                        log::debug!("ledger accepted message {}", id);
                    }
                    // the publisher may have given up waiting
                    let _ = result_sender.send(status);
                },
                LedgerCommand::Latest { topic, result_sender } => {
                    let _ = result_sender.send(ledger.latest(&topic));
                },
                LedgerCommand::Entries { topic, result_sender } => {
                    let _ = result_sender.send(ledger.entries(&topic));
                },
                LedgerCommand::Shutdown { result_sender } => {
                    let _ = result_sender.send(());
                    break;
                },
            }
        }

        log::debug!("ledger task terminated");
    });
}
