pub mod types;
pub mod channel;
pub mod ledger;
pub mod memory;

#[cfg(feature = "dev")]
#[cfg_attr(docsrs, doc(cfg(feature = "dev")))]
pub mod dev;

// re-exports - traits
pub use channel::MessageChannel;

// re-exports
pub use ledger::{default_ledger_opt, run_ledger, LedgerCommand, LedgerConfig, DEFAULT_MAX_PAYLOAD_BYTES};
pub use memory::InMemoryChannel;
pub use types::{ChannelError, MessageId};
