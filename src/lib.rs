//! fairflip - provably fair multi-party flips over a chat channel
//!
//! Every participant commits to a random secret, the leader closes the
//! commitment round, everyone reveals, and the XOR of the revealed secrets
//! seeds a deterministic PRNG. Any participant (or a later auditor replaying
//! the chat history) derives the same outcome and can tell who cheated or
//! walked away.
//!
//! The [`dealer::Dealer`] is the entry point. It runs on top of a
//! [`helper::DealersHelper`] supplied by the host chat.

pub mod clock;
pub mod config;
pub mod dealer;
pub mod errors;
pub mod game;
pub mod helper;
pub mod prng;
pub mod replay;
pub mod secret;
pub mod sim;
pub mod types;
pub mod wire;

pub use config::DealerConfig;
pub use dealer::Dealer;
pub use errors::{FlipError, FlipResult};
pub use helper::DealersHelper;
pub use types::{FlipOutcome, FlipParameters, GameMetadata, GameStateUpdateMessage, GameUpdate, Start, UserDevice};
