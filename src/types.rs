//! Core protocol types: identities, game metadata, START parameters and the
//! updates a game publishes.

use crate::config::{TimingConfig, MAX_WINDOW};
use crate::errors::FlipError;
use crate::secret::{Commitment, Secret};
use crate::wire::CommitmentComplete;
use chrono::{DateTime, TimeZone, Utc};
use num_bigint::BigInt;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const GAME_ID_LEN: usize = 12;

/// Largest permutation a shuffle flip may ask for
pub const MAX_SHUFFLE: i64 = 1 << 20;

/// A participant: one device of one user
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserDevice {
    pub user: Vec<u8>,
    pub device: Vec<u8>,
}

impl UserDevice {
    pub fn new(user: impl Into<Vec<u8>>, device: impl Into<Vec<u8>>) -> Self {
        Self {
            user: user.into(),
            device: device.into(),
        }
    }

    pub fn to_key(&self) -> UserDeviceKey {
        UserDeviceKey(format!("{},{}", hex::encode(&self.user), hex::encode(&self.device)))
    }

    pub(crate) fn check(&self) -> bool {
        !self.user.is_empty() && !self.device.is_empty()
    }
}

impl fmt::Display for UserDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(&self.user), hex::encode(&self.device))
    }
}

impl fmt::Debug for UserDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserDevice({})", self)
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(Vec<u8>);

impl ConversationId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConversationId({})", self)
    }
}

/// Identifier of a single flip, unique for all time
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GameId([u8; GAME_ID_LEN]);

impl GameId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; GAME_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; GAME_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; GAME_ID_LEN] {
        &self.0
    }

    pub fn to_key(&self) -> GameIdKey {
        GameIdKey(hex::encode(self.0))
    }

    pub(crate) fn check(&self) -> bool {
        self.0.iter().any(|b| *b != 0)
    }
}

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GameId({})", self)
    }
}

/// Canonical string key of a [`GameMetadata`]
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GameKey(String);

/// Canonical string key of a [`GameId`]
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GameIdKey(String);

/// Canonical string key of a [`UserDevice`]
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserDeviceKey(String);

macro_rules! display_key {
    ($($key:ty),*) => {
        $(impl fmt::Display for $key {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        })*
    };
}

display_key!(GameKey, GameIdKey, UserDeviceKey);

/// Who started a game, where, and under which id
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GameMetadata {
    pub initiator: UserDevice,
    pub conversation_id: ConversationId,
    pub game_id: GameId,
}

impl GameMetadata {
    pub fn to_key(&self) -> GameKey {
        GameKey(format!(
            "{},{},{}",
            self.initiator.to_key(),
            self.conversation_id,
            self.game_id
        ))
    }

    pub(crate) fn check(&self) -> bool {
        self.initiator.check() && !self.conversation_id.0.is_empty() && self.game_id.check()
    }
}

impl fmt::Display for GameMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_key())
    }
}

impl fmt::Debug for GameMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GameMetadata({})", self.to_key())
    }
}

/// What kind of value the flip produces
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlipParameters {
    Bool,
    /// Uniform in `[0, m)`, or `(m, 0]` for negative `m`
    Int(i64),
    /// Big-endian magnitude of the modulus
    Big(Vec<u8>),
    /// Permutation of `0..n`
    Shuffle(i64),
}

impl FlipParameters {
    pub fn big(modulus: &BigInt) -> Self {
        FlipParameters::Big(modulus.magnitude().to_bytes_be())
    }

    pub(crate) fn check(&self) -> bool {
        match self {
            FlipParameters::Bool => true,
            FlipParameters::Int(m) => *m != 0,
            FlipParameters::Big(bytes) => bytes.iter().any(|b| *b != 0),
            FlipParameters::Shuffle(n) => (0..=MAX_SHUFFLE).contains(n),
        }
    }
}

/// Game parameters announced by the leader
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Start {
    pub start_time_msec: i64,
    pub commitment_window_msec: i64,
    pub reveal_window_msec: i64,
    pub slack_msec: i64,
    pub commitment_complete_window_msec: i64,
    pub params: FlipParameters,
}

impl Start {
    /// Fill in timing from `timing`, stretched for games with many players
    pub fn new(now: DateTime<Utc>, n_players: usize, params: FlipParameters, timing: &TimingConfig) -> Self {
        Self::with_inflation(now, n_players, params, timing, 5)
    }

    pub fn with_inflation(
        now: DateTime<Utc>,
        n_players: usize,
        params: FlipParameters,
        timing: &TimingConfig,
        inflate_after: usize,
    ) -> Self {
        let window = |w: Duration| {
            let ms = w.as_millis() as i64;
            if n_players > inflate_after {
                inflate_millis(ms, n_players, inflate_after)
            } else {
                ms
            }
        };
        Self {
            start_time_msec: to_msec(now),
            commitment_window_msec: window(timing.commitment_window()),
            reveal_window_msec: window(timing.reveal_window()),
            slack_msec: window(timing.slack()),
            commitment_complete_window_msec: window(timing.commitment_complete_window()),
            params,
        }
    }

    pub fn with_bool(now: DateTime<Utc>, n_players: usize) -> Self {
        Self::new(now, n_players, FlipParameters::Bool, &TimingConfig::default())
    }

    pub fn with_int(now: DateTime<Utc>, n_players: usize, modulus: i64) -> Self {
        Self::new(now, n_players, FlipParameters::Int(modulus), &TimingConfig::default())
    }

    pub fn with_big(now: DateTime<Utc>, n_players: usize, modulus: &BigInt) -> Self {
        Self::new(now, n_players, FlipParameters::big(modulus), &TimingConfig::default())
    }

    pub fn with_shuffle(now: DateTime<Utc>, n_players: usize, n: i64) -> Self {
        Self::new(now, n_players, FlipParameters::Shuffle(n), &TimingConfig::default())
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        from_msec(self.start_time_msec)
    }

    pub fn commitment_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.commitment_window_msec)
    }

    pub fn reveal_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.reveal_window_msec)
    }

    pub fn slack(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.slack_msec)
    }

    /// Commitment window as a given participant observes it. The leader closes
    /// the round one slack after the window; everyone else waits one more.
    pub fn commitment_window_with_slack(&self, is_leader: bool) -> chrono::Duration {
        let slack = if is_leader { self.slack() } else { self.slack() * 2 };
        self.commitment_window() + slack
    }

    pub fn reveal_window_with_slack(&self) -> chrono::Duration {
        self.commitment_window() + self.reveal_window() + self.slack() * 2
    }

    /// Structural sanity of values that arrived over the wire
    pub(crate) fn check(&self) -> bool {
        let limit = MAX_WINDOW.as_millis() as i64;
        let windows = [
            self.commitment_window_msec,
            self.reveal_window_msec,
            self.slack_msec,
            self.commitment_complete_window_msec,
        ];
        windows.iter().all(|w| (0..=limit).contains(w))
            && (0..MAX_START_TIME_MSEC).contains(&self.start_time_msec)
    }
}

impl fmt::Display for Start {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Start{{t={} cw={} rw={} s={} ccw={}}}",
            self.start_time_msec,
            self.commitment_window_msec,
            self.reveal_window_msec,
            self.slack_msec,
            self.commitment_complete_window_msec
        )
    }
}

// Year 9999; keeps deadline arithmetic well inside chrono's range.
const MAX_START_TIME_MSEC: i64 = 253_402_300_799_000;

fn inflate_millis(ms: i64, n_players: usize, base: usize) -> i64 {
    let scaled = (n_players as f64).ln() * ms as f64 / (base as f64).ln();
    scaled.ceil() as i64
}

pub fn to_msec(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub fn from_msec(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Round1,
    Round2,
    RoundCleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Round1 => "ROUND1",
            Stage::Round2 => "ROUND2",
            Stage::RoundCleanup => "ROUND_CLEANUP",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Start,
    Commitment,
    CommitmentComplete,
    Reveal,
    End,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Start => "START",
            MessageType::Commitment => "COMMITMENT",
            MessageType::CommitmentComplete => "COMMITMENT_COMPLETE",
            MessageType::Reveal => "REVEAL",
            MessageType::End => "END",
        };
        f.write_str(name)
    }
}

/// Result of a finished flip
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FlipOutcome {
    Bool(bool),
    Int(i64),
    Big(BigInt),
    Shuffle(Vec<usize>),
}

impl fmt::Display for FlipOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlipOutcome::Bool(b) => write!(f, "{}", b),
            FlipOutcome::Int(i) => write!(f, "{}", i),
            FlipOutcome::Big(b) => write!(f, "{}", b),
            FlipOutcome::Shuffle(p) => write!(f, "{:?}", p),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommitmentUpdate {
    pub user: UserDevice,
    pub commitment: Commitment,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RevealUpdate {
    pub user: UserDevice,
    pub reveal: Secret,
}

/// Exactly one event in a game's life
#[derive(Clone, Debug)]
pub enum GameUpdate {
    Err(FlipError),
    Commitment(CommitmentUpdate),
    CommitmentComplete(CommitmentComplete),
    Reveal(RevealUpdate),
    Result(FlipOutcome),
}

/// Event published on the dealer's update stream
#[derive(Clone, Debug)]
pub struct GameStateUpdateMessage {
    pub metadata: GameMetadata,
    pub update: GameUpdate,
}

impl GameStateUpdateMessage {
    pub fn err(&self) -> Option<&FlipError> {
        match &self.update {
            GameUpdate::Err(e) => Some(e),
            _ => None,
        }
    }

    pub fn commitment(&self) -> Option<&CommitmentUpdate> {
        match &self.update {
            GameUpdate::Commitment(c) => Some(c),
            _ => None,
        }
    }

    pub fn commitment_complete(&self) -> Option<&CommitmentComplete> {
        match &self.update {
            GameUpdate::CommitmentComplete(cc) => Some(cc),
            _ => None,
        }
    }

    pub fn reveal(&self) -> Option<&RevealUpdate> {
        match &self.update {
            GameUpdate::Reveal(r) => Some(r),
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&FlipOutcome> {
        match &self.update {
            GameUpdate::Result(r) => Some(r),
            _ => None,
        }
    }
}
