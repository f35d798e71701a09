//! Error taxonomy for the flip dealer and its games
//!
//! Every failure a game can run into is a variant of [`FlipError`]. Errors are
//! `Clone` because the same value is both returned to the dealer's bookkeeping
//! and published on the update stream for the game it belongs to.

use crate::types::{ConversationId, GameId, GameMetadata, MessageType, Stage, UserDevice};
use std::fmt;

/// Result alias used across the crate
pub type FlipResult<T> = Result<T, FlipError>;

/// Root error type for all flip operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum FlipError {
    // Protocol setup
    #[error("game {game} was already started")]
    GameAlreadyStarted { game: GameMetadata },

    #[error("wrong sender in game {game}: expected {expected}, got {actual}")]
    WrongSender {
        game: GameMetadata,
        expected: UserDevice,
        actual: UserDevice,
    },

    #[error("user {user} is not registered in game {game}")]
    UnregisteredUser { game: GameMetadata, user: UserDevice },

    #[error("user {user} registered twice in game {game}")]
    DuplicateRegistration { game: GameMetadata, user: UserDevice },

    #[error("duplicate commitment value in game {game}")]
    DuplicateCommitment { game: GameMetadata },

    #[error("user {user} listed twice in commitment complete for game {game}")]
    DuplicateCommitmentComplete { game: GameMetadata, user: UserDevice },

    #[error("commitment for {user} disagrees with the leader's in game {game}")]
    CommitmentMismatch { game: GameMetadata, user: UserDevice },

    #[error("commitment complete players are not sorted in game {game}")]
    CommitmentCompleteSort { game: GameMetadata },

    #[error("game id {game_id} was used before")]
    GameReplay { game_id: GameId },

    #[error("game {game} is already finished")]
    GameFinished { game: GameMetadata },

    // Clocks
    #[error("local clock is too far from server time for game {game}")]
    BadLocalClock { game: GameMetadata },

    #[error("leader's start time is too far from server time for game {game}")]
    BadLeaderClock { game: GameMetadata },

    // Cryptographic and behavioral
    #[error("bad reveal from {user} in game {game}")]
    BadReveal { game: GameMetadata, user: UserDevice },

    #[error("duplicate reveal from {user} in game {game}")]
    DuplicateReveal { game: GameMetadata, user: UserDevice },

    #[error("reveal from {user} came too late in game {game}")]
    RevealTooLate { game: GameMetadata, user: UserDevice },

    #[error("reveal from {user} was built on a different commitment complete in game {game}")]
    BadCommitmentCompleteHash { game: GameMetadata, user: UserDevice },

    #[error("no reveal from {user} in game {game}")]
    NoReveal { game: GameMetadata, user: UserDevice },

    #[error("{} player(s) failed to reveal in game {game}: {}", .absentees.len(), UserList(.absentees))]
    Absentees {
        game: GameMetadata,
        absentees: Vec<UserDevice>,
    },

    // Structural
    #[error("message {message_type} is not valid in stage {stage} of game {game}")]
    BadMessageForStage {
        game: GameMetadata,
        message_type: MessageType,
        stage: Stage,
    },

    #[error("bad message in game {game}")]
    BadMessage { game: GameMetadata },

    #[error("bad flip parameters in game {game}")]
    BadFlipType { game: GameMetadata },

    #[error("unsupported protocol version {0}")]
    BadVersion(u32),

    #[error("malformed game data")]
    BadData,

    #[error("wire codec error: {0}")]
    Wire(String),

    #[error("message for conversation {actual} arrived on conversation {expected}")]
    BadChannel {
        expected: ConversationId,
        actual: ConversationId,
    },

    // Lifecycle
    #[error("game {game} was shut down")]
    GameShutdown { game: GameMetadata },

    #[error("game {game} timed out in stage {stage}")]
    Timeout { game: GameMetadata, stage: Stage },

    #[error("message type {0} cannot be injected from the network")]
    UnforwardableMessage(MessageType),

    #[error("operation cancelled")]
    Cancelled,

    #[error("dealer is already running")]
    DealerAlreadyRunning,

    #[error("dealer is stopped")]
    DealerStopped,

    #[error("dealer helper failed: {0}")]
    Helper(String),
}

impl FlipError {
    /// Wrap an error coming back across the [`crate::helper::DealersHelper`] seam.
    pub fn helper(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        FlipError::Helper(err.to_string())
    }

    /// Per-message errors that are logged without terminating the game.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FlipError::UnregisteredUser { .. })
    }

    /// Errors that mark a cooperative stop rather than a protocol failure.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, FlipError::GameShutdown { .. })
    }
}

impl From<bincode::Error> for FlipError {
    fn from(err: bincode::Error) -> Self {
        FlipError::Wire(err.to_string())
    }
}

impl From<base64::DecodeError> for FlipError {
    fn from(err: base64::DecodeError) -> Self {
        FlipError::Wire(err.to_string())
    }
}

struct UserList<'a>(&'a [UserDevice]);

impl fmt::Display for UserList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, u) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", u)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md() -> GameMetadata {
        GameMetadata {
            initiator: UserDevice::new(vec![1, 2], vec![3]),
            conversation_id: ConversationId::new(vec![9; 4]),
            game_id: GameId::from_bytes([7; 12]),
        }
    }

    #[test]
    fn test_absentees_display_lists_users() {
        let err = FlipError::Absentees {
            game: md(),
            absentees: vec![UserDevice::new(vec![0xaa], vec![0xbb]), UserDevice::new(vec![0xcc], vec![0xdd])],
        };
        let text = err.to_string();
        assert!(text.starts_with("2 player(s) failed to reveal"));
        assert!(text.contains("aa:bb, cc:dd"));
    }

    #[test]
    fn test_error_classification() {
        let shutdown = FlipError::GameShutdown { game: md() };
        assert!(shutdown.is_shutdown());
        assert!(!shutdown.is_recoverable());

        let unregistered = FlipError::UnregisteredUser {
            game: md(),
            user: UserDevice::new(vec![5], vec![6]),
        };
        assert!(unregistered.is_recoverable());
        assert!(!FlipError::BadData.is_recoverable());
    }

    #[test]
    fn test_helper_error_wrapping() {
        let err = FlipError::helper("connection reset".into());
        assert!(matches!(err, FlipError::Helper(ref msg) if msg == "connection reset"));
    }
}
