//! Secrets, commitments and the commitment-complete digest
//!
//! A commitment is `HMAC-SHA256(key = secret, msg = payload)` where the payload
//! binds the commitment to one game: its leader, conversation, id and declared
//! start. Commitments are compared in constant time.

use crate::errors::{FlipError, FlipResult};
use crate::types::{GameMetadata, Start, GAME_ID_LEN};
use crate::wire::{self, UserDeviceCommitment};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;

pub const SECRET_LEN: usize = 32;

pub(crate) type HmacSha256 = Hmac<Sha256>;

pub(crate) fn keyed_mac(key: &[u8]) -> FlipResult<HmacSha256> {
    HmacSha256::new_from_slice(key).map_err(|_| FlipError::BadData)
}

pub(crate) fn hmac_sha256(key: &[u8], data: &[u8]) -> FlipResult<[u8; 32]> {
    let mut mac = keyed_mac(key)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// A player's private contribution to the flip
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Secret([u8; SECRET_LEN]);

impl Secret {
    pub fn generate() -> Self {
        let mut bytes = [0u8; SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }

    /// Fold `other` into this secret
    pub fn xor(&mut self, other: &Secret) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a ^= b;
        }
    }

    pub fn compute_commitment(&self, payload: &CommitmentPayload) -> FlipResult<Commitment> {
        let bytes = wire::codec_serialize(payload)?;
        Ok(Commitment(hmac_sha256(&self.0, &bytes)?))
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", self)
    }
}

/// Binding, hiding digest of a [`Secret`]
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct Commitment([u8; 32]);

impl Commitment {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl PartialEq for Commitment {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for Commitment {}

impl fmt::Display for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Commitment({})", self)
    }
}

/// Everything a commitment is bound to besides the secret itself: the game's
/// leader, conversation, id and declared start time
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentPayload {
    pub version: u32,
    pub user: Vec<u8>,
    pub device: Vec<u8>,
    pub conversation: Vec<u8>,
    pub game_id: [u8; GAME_ID_LEN],
    pub start_time_msec: i64,
}

impl CommitmentPayload {
    pub fn new(md: &GameMetadata, start: &Start) -> Self {
        Self {
            version: wire::VERSION_V1,
            user: md.initiator.user.clone(),
            device: md.initiator.device.clone(),
            conversation: md.conversation_id.as_bytes().to_vec(),
            game_id: *md.game_id.as_bytes(),
            start_time_msec: start.start_time_msec,
        }
    }
}

/// SHA-256 over the canonical encoding of a commitment-complete player list
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentCompleteHash([u8; 32]);

impl CommitmentCompleteHash {
    pub fn compute(players: &[UserDeviceCommitment]) -> FlipResult<Self> {
        let bytes = wire::codec_serialize(players)?;
        Ok(Self(Sha256::digest(&bytes).into()))
    }
}

impl fmt::Debug for CommitmentCompleteHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitmentCompleteHash({})", hex::encode(self.0))
    }
}
