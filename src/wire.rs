//! Wire format for game messages
//!
//! A message travels as base64 text of a versioned envelope. The envelope
//! carries the protocol version and the bincode encoding of the version's
//! message. Anything that fails to decode, names an unknown version or carries
//! invalid metadata is rejected before it can reach a game.

use crate::errors::{FlipError, FlipResult};
use crate::game::PlayerControl;
use crate::secret::{Commitment, CommitmentCompleteHash, Secret};
use crate::types::{GameMetadata, MessageType, Start, UserDevice};
use base64::{engine::general_purpose, Engine as _};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const VERSION_V1: u32 = 1;

/// Upper bound on a decoded envelope or payload
const MAX_MESSAGE_BYTES: u64 = 1 << 20;

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_MESSAGE_BYTES)
}

pub(crate) fn codec_serialize<T: Serialize + ?Sized>(value: &T) -> FlipResult<Vec<u8>> {
    Ok(codec().serialize(value)?)
}

fn codec_deserialize<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> FlipResult<T> {
    codec().deserialize(bytes).map_err(|_| FlipError::BadData)
}

#[derive(Serialize, Deserialize)]
struct VersionedMessage {
    version: u32,
    payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDeviceCommitment {
    pub ud: UserDevice,
    pub commitment: Commitment,
}

/// The leader's closing list of players, sorted strictly by (user, device)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentComplete {
    pub players: Vec<UserDeviceCommitment>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reveal {
    pub secret: Secret,
    pub cch: CommitmentCompleteHash,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameMessageBody {
    Start(Start),
    Commitment(Commitment),
    CommitmentComplete(CommitmentComplete),
    Reveal(Reveal),
    End,
}

impl GameMessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            GameMessageBody::Start(_) => MessageType::Start,
            GameMessageBody::Commitment(_) => MessageType::Commitment,
            GameMessageBody::CommitmentComplete(_) => MessageType::CommitmentComplete,
            GameMessageBody::Reveal(_) => MessageType::Reveal,
            GameMessageBody::End => MessageType::End,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameMessageV1 {
    pub md: GameMetadata,
    pub body: GameMessageBody,
}

impl GameMessageV1 {
    pub fn encode(&self) -> FlipResult<GameMessageEncoded> {
        let envelope = VersionedMessage {
            version: VERSION_V1,
            payload: codec_serialize(self)?,
        };
        let raw = codec_serialize(&envelope)?;
        Ok(GameMessageEncoded(general_purpose::STANDARD.encode(raw)))
    }
}

/// Base64 text of a versioned game message
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GameMessageEncoded(String);

impl GameMessageEncoded {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn decode(&self) -> FlipResult<GameMessageV1> {
        let raw = general_purpose::STANDARD.decode(self.0.as_bytes())?;
        let envelope: VersionedMessage = codec_deserialize(&raw)?;
        if envelope.version != VERSION_V1 {
            return Err(FlipError::BadVersion(envelope.version));
        }
        let msg: GameMessageV1 = codec_deserialize(&envelope.payload)?;
        if !msg.md.check() {
            return Err(FlipError::BadData);
        }
        if let GameMessageBody::Start(start) = &msg.body {
            if !start.check() {
                return Err(FlipError::BadData);
            }
        }
        Ok(msg)
    }
}

/// An encoded message together with the sender the chat layer vouches for
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameMessageWrappedEncoded {
    pub sender: UserDevice,
    pub body: GameMessageEncoded,
}

impl GameMessageWrappedEncoded {
    pub fn decode(&self) -> FlipResult<GameMessageWrapped> {
        let msg = self.body.decode()?;
        Ok(GameMessageWrapped {
            sender: self.sender.clone(),
            msg,
            me: None,
            forward: false,
        })
    }
}

/// A decoded message in flight inside a dealer
#[derive(Clone, Debug)]
pub struct GameMessageWrapped {
    pub sender: UserDevice,
    pub msg: GameMessageV1,
    // Set only on a locally generated START: the leader's own player control.
    pub(crate) me: Option<Arc<PlayerControl>>,
    // Whether the dealer should relay this message to the chat after handling it.
    pub(crate) forward: bool,
}

impl GameMessageWrapped {
    pub fn metadata(&self) -> &GameMetadata {
        &self.msg.md
    }

    /// END is local bookkeeping and never crosses the wire
    pub fn is_forwardable(&self) -> bool {
        !matches!(self.msg.body, GameMessageBody::End)
    }

    pub fn encode(&self) -> FlipResult<GameMessageEncoded> {
        self.msg.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConversationId, GameId, GAME_ID_LEN};
    use chrono::Utc;

    fn md() -> GameMetadata {
        GameMetadata {
            initiator: UserDevice::new(vec![1; 16], vec![2; 16]),
            conversation_id: ConversationId::new(vec![3; 32]),
            game_id: GameId::generate(),
        }
    }

    #[test]
    fn test_encode_decode_start() {
        let msg = GameMessageV1 {
            md: md(),
            body: GameMessageBody::Start(Start::with_shuffle(Utc::now(), 4, 52)),
        };
        let decoded = msg.encode().unwrap().decode().unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.body.message_type(), MessageType::Start);
    }

    #[test]
    fn test_wrapped_decode_keeps_sender_and_is_not_forwarded() {
        let sender = UserDevice::new(vec![7], vec![8]);
        let msg = GameMessageV1 {
            md: md(),
            body: GameMessageBody::Commitment(Commitment::from_bytes([5; 32])),
        };
        let wrapped = GameMessageWrappedEncoded {
            sender: sender.clone(),
            body: msg.encode().unwrap(),
        }
        .decode()
        .unwrap();
        assert_eq!(wrapped.sender, sender);
        assert!(!wrapped.forward);
        assert!(wrapped.me.is_none());
        assert!(wrapped.is_forwardable());
    }

    #[test]
    fn test_end_is_not_forwardable() {
        let wrapped = GameMessageWrapped {
            sender: UserDevice::new(vec![1], vec![1]),
            msg: GameMessageV1 {
                md: md(),
                body: GameMessageBody::End,
            },
            me: None,
            forward: true,
        };
        assert!(!wrapped.is_forwardable());
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let msg = GameMessageV1 { md: md(), body: GameMessageBody::End };
        let envelope = VersionedMessage {
            version: 2,
            payload: codec_serialize(&msg).unwrap(),
        };
        let text = general_purpose::STANDARD.encode(codec_serialize(&envelope).unwrap());
        let err = GameMessageEncoded::new(text).decode().unwrap_err();
        assert!(matches!(err, FlipError::BadVersion(2)));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            GameMessageEncoded::new("not base64!!").decode(),
            Err(FlipError::Wire(_))
        ));
        let text = general_purpose::STANDARD.encode([0xde, 0xad, 0xbe, 0xef]);
        assert!(matches!(GameMessageEncoded::new(text).decode(), Err(FlipError::BadData)));
    }

    #[test]
    fn test_zero_game_id_is_rejected() {
        let mut bad = md();
        bad.game_id = GameId::from_bytes([0; GAME_ID_LEN]);
        let msg = GameMessageV1 { md: bad, body: GameMessageBody::End };
        assert!(matches!(msg.encode().unwrap().decode(), Err(FlipError::BadData)));
    }

    #[test]
    fn test_start_with_negative_window_is_rejected() {
        let mut start = Start::with_bool(Utc::now(), 2);
        start.commitment_window_msec = -5;
        let msg = GameMessageV1 {
            md: md(),
            body: GameMessageBody::Start(start),
        };
        assert!(matches!(msg.encode().unwrap().decode(), Err(FlipError::BadData)));
    }
}
