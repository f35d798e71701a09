//! State machine for a single flip
//!
//! A [`Game`] is owned by one task. It consumes routed messages and its own
//! deadline timer, publishes every state change on the dealer's update stream
//! and posts its own protocol messages (commitment, commitment complete,
//! reveal, end) back through the dealer so they are handled locally exactly
//! like a peer's.
//!
//! Stages advance `ROUND1 -> ROUND2 -> ROUND_CLEANUP`. ROUND1 collects
//! commitments until the leader closes it with a commitment-complete listing
//! the included players. ROUND2 collects reveals from those players; once all
//! have revealed the XOR of their secrets seeds the PRNG that produces the
//! outcome.

use crate::clock::Clock;
use crate::dealer::Outbox;
use crate::errors::{FlipError, FlipResult};
use crate::prng::Prng;
use crate::secret::{Commitment, CommitmentCompleteHash, CommitmentPayload, Secret};
use crate::types::{
    CommitmentUpdate, FlipOutcome, FlipParameters, GameKey, GameMetadata, GameStateUpdateMessage, GameUpdate,
    MessageType, RevealUpdate, Stage, Start, UserDevice, UserDeviceKey,
};
use crate::wire::{CommitmentComplete, GameMessageBody, GameMessageWrapped, Reveal, UserDeviceCommitment};
use chrono::{DateTime, Utc};
use num_bigint::{BigInt, Sign};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The local participant's secret and commitment for one game
pub(crate) struct PlayerControl {
    pub(crate) me: UserDevice,
    pub(crate) secret: Secret,
    pub(crate) commitment: Commitment,
}

impl PlayerControl {
    pub(crate) fn new(me: UserDevice, md: &GameMetadata, start: &Start) -> FlipResult<Self> {
        let secret = Secret::generate();
        let commitment = secret.compute_commitment(&CommitmentPayload::new(md, start))?;
        Ok(Self { me, secret, commitment })
    }
}

impl fmt::Debug for PlayerControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlayerControl")
            .field("me", &self.me)
            .field("commitment", &self.commitment)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct GamePlayerState {
    ud: UserDevice,
    commitment: Option<Commitment>,
    commitment_time: Option<DateTime<Utc>>,
    leader_commitment: Option<Commitment>,
    included: bool,
    secret: Option<Secret>,
}

impl GamePlayerState {
    fn new(ud: &UserDevice) -> Self {
        Self {
            ud: ud.clone(),
            commitment: None,
            commitment_time: None,
            leader_commitment: None,
            included: false,
            secret: None,
        }
    }
}

fn player_state<'a>(
    players: &'a mut HashMap<UserDeviceKey, GamePlayerState>,
    ud: &UserDevice,
) -> &'a mut GamePlayerState {
    players.entry(ud.to_key()).or_insert_with(|| GamePlayerState::new(ud))
}

/// Whether the game loop keeps going after a handled event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Done,
}

pub(crate) struct Game {
    md: GameMetadata,
    key: GameKey,
    msg_id: u64,
    is_leader: bool,
    params: Start,
    // Local time the START was handled; every window is measured from here.
    started_at: DateTime<Utc>,
    stage: Stage,
    stage_for_timeout: Stage,
    players: HashMap<UserDeviceKey, GamePlayerState>,
    commitments: HashSet<[u8; 32]>,
    n_players: usize,
    me: Option<Arc<PlayerControl>>,
    commitment_complete_hash: Option<CommitmentCompleteHash>,
    updates: mpsc::UnboundedSender<GameStateUpdateMessage>,
    outbox: Option<Outbox>,
    outcome: Option<FlipOutcome>,
}

impl Game {
    pub(crate) fn new(
        md: GameMetadata,
        is_leader: bool,
        params: Start,
        started_at: DateTime<Utc>,
        me: Option<Arc<PlayerControl>>,
        updates: mpsc::UnboundedSender<GameStateUpdateMessage>,
        outbox: Option<Outbox>,
    ) -> Self {
        let key = md.to_key();
        Self {
            md,
            key,
            msg_id: 0,
            is_leader,
            params,
            started_at,
            stage: Stage::Round1,
            stage_for_timeout: Stage::Round1,
            players: HashMap::new(),
            commitments: HashSet::new(),
            n_players: 0,
            me,
            commitment_complete_hash: None,
            updates,
            outbox,
            outcome: None,
        }
    }

    pub(crate) fn key(&self) -> &GameKey {
        &self.key
    }

    pub(crate) fn metadata(&self) -> &GameMetadata {
        &self.md
    }

    pub(crate) fn start(&self) -> &Start {
        &self.params
    }

    pub(crate) fn outcome(&self) -> Option<&FlipOutcome> {
        self.outcome.as_ref()
    }

    /// Players named by the commitment-complete, in its order
    pub(crate) fn included_players(&self) -> Vec<UserDevice> {
        let mut included: Vec<UserDevice> =
            self.players.values().filter(|p| p.included).map(|p| p.ud.clone()).collect();
        included.sort();
        included
    }

    fn commitment_end_time(&self) -> DateTime<Utc> {
        self.started_at + self.params.commitment_window_with_slack(self.is_leader)
    }

    fn reveal_end_time(&self) -> DateTime<Utc> {
        self.started_at + self.params.reveal_window_with_slack()
    }

    /// When the timer next fires, or `None` once the game is cleaning up
    pub(crate) fn next_deadline(&self) -> Option<DateTime<Utc>> {
        match self.stage_for_timeout {
            Stage::Round1 => Some(self.commitment_end_time()),
            Stage::Round2 => Some(self.reveal_end_time()),
            Stage::RoundCleanup => None,
        }
    }

    /// Drive the game until it finishes, fails, is cancelled or its input closes
    pub(crate) async fn run(
        &mut self,
        rx: &mut mpsc::UnboundedReceiver<GameMessageWrapped>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> FlipResult<()> {
        debug!(game = %self.md, started_at = %self.started_at, leader = self.is_leader, "game running");
        loop {
            let deadline = self.next_deadline();
            let step = tokio::select! {
                _ = sleep_until_opt(clock.as_ref(), deadline) => self.handle_timer_event(),
                msg = rx.recv() => match msg {
                    Some(msg) => {
                        let now = clock.now();
                        self.handle_message(&msg, now)
                    }
                    None => return Err(FlipError::GameShutdown { game: self.md.clone() }),
                },
                _ = cancel.cancelled() => return Err(FlipError::Cancelled),
            };

            match step {
                Ok(Flow::Done) => return Ok(()),
                Ok(Flow::Continue) => {}
                Err(err) if err.is_recoverable() => {
                    warn!(game = %self.md, error = %err, "ignoring bad message");
                }
                Err(err) => {
                    self.publish(GameUpdate::Err(err.clone()));
                    return Err(err);
                }
            }
        }
    }

    /// Handle one routed message, as observed at `now`
    pub(crate) fn handle_message(&mut self, msg: &GameMessageWrapped, now: DateTime<Utc>) -> FlipResult<Flow> {
        let msg_id = self.msg_id;
        self.msg_id += 1;
        let message_type = msg.msg.body.message_type();
        debug!(game = %self.md, msg_id, sender = %msg.sender, %message_type, stage = %self.stage, "+ Game::handle_message");
        let res = self.dispatch(msg, now);
        match &res {
            Ok(_) => debug!(game = %self.md, msg_id, "- Game::handle_message -> ok"),
            Err(e) => debug!(game = %self.md, msg_id, "- Game::handle_message -> ERROR: {}", e),
        }
        res
    }

    fn dispatch(&mut self, msg: &GameMessageWrapped, now: DateTime<Utc>) -> FlipResult<Flow> {
        match &msg.msg.body {
            GameMessageBody::Start(_) => Err(self.bad_stage(MessageType::Start)),
            GameMessageBody::End => Ok(Flow::Done),
            GameMessageBody::Commitment(commitment) => {
                if self.stage == Stage::Round1 {
                    self.handle_commitment(&msg.sender, now, *commitment)?;
                } else {
                    self.handle_late_commitment(&msg.sender, *commitment)?;
                }
                Ok(Flow::Continue)
            }
            GameMessageBody::CommitmentComplete(cc) => {
                if self.stage != Stage::Round1 {
                    return Err(self.bad_stage(MessageType::CommitmentComplete));
                }
                self.handle_commitment_complete(&msg.sender, now, cc)?;
                Ok(Flow::Continue)
            }
            GameMessageBody::Reveal(reveal) => {
                if self.stage != Stage::Round2 {
                    return Err(self.bad_stage(MessageType::Reveal));
                }
                if now > self.reveal_end_time() {
                    return Err(FlipError::RevealTooLate {
                        game: self.md.clone(),
                        user: msg.sender.clone(),
                    });
                }
                self.handle_reveal(&msg.sender, reveal)
            }
        }
    }

    fn bad_stage(&self, message_type: MessageType) -> FlipError {
        FlipError::BadMessageForStage {
            game: self.md.clone(),
            message_type,
            stage: self.stage,
        }
    }

    fn handle_commitment(&mut self, sender: &UserDevice, now: DateTime<Utc>, commitment: Commitment) -> FlipResult<()> {
        let ps = player_state(&mut self.players, sender);
        if ps.commitment.is_some() {
            return Err(FlipError::DuplicateRegistration {
                game: self.md.clone(),
                user: sender.clone(),
            });
        }
        ps.commitment = Some(commitment);
        ps.commitment_time = Some(now);

        if !self.commitments.insert(*commitment.as_bytes()) {
            return Err(FlipError::DuplicateCommitment { game: self.md.clone() });
        }

        self.publish(GameUpdate::Commitment(CommitmentUpdate {
            user: sender.clone(),
            commitment,
        }));
        Ok(())
    }

    // Commitments that lose the race with the commitment-complete are not
    // counted, but one that contradicts what the leader listed is still an error.
    fn handle_late_commitment(&mut self, sender: &UserDevice, commitment: Commitment) -> FlipResult<()> {
        match self.players.get(&sender.to_key()).and_then(|p| p.leader_commitment) {
            Some(listed) if listed != commitment => Err(FlipError::CommitmentMismatch {
                game: self.md.clone(),
                user: sender.clone(),
            }),
            _ => {
                info!(game = %self.md, user = %sender, stage = %self.stage, "commitment arrived too late, ignoring");
                Ok(())
            }
        }
    }

    fn handle_commitment_complete(
        &mut self,
        sender: &UserDevice,
        now: DateTime<Utc>,
        cc: &CommitmentComplete,
    ) -> FlipResult<()> {
        if *sender != self.md.initiator {
            return Err(FlipError::WrongSender {
                game: self.md.clone(),
                expected: self.md.initiator.clone(),
                actual: sender.clone(),
            });
        }
        if !cc.players.windows(2).all(|w| w[0].ud < w[1].ud) {
            return Err(FlipError::CommitmentCompleteSort { game: self.md.clone() });
        }

        for u in &cc.players {
            self.handle_commitment_complete_player(u)?;
        }
        self.commitment_complete_hash = Some(CommitmentCompleteHash::compute(&cc.players)?);

        // The leader may leave out players we saw commit in time; we tolerate it.
        for ps in self.players.values() {
            if !ps.included && self.committed_in_time(ps) {
                warn!(game = %self.md, user = %ps.ud, "player committed in time but was not included");
            }
        }

        self.publish(GameUpdate::CommitmentComplete(cc.clone()));
        self.stage = Stage::Round2;
        self.stage_for_timeout = Stage::Round2;
        debug!(game = %self.md, n_players = self.n_players, at = %now, "commitment complete, waiting for reveals");
        self.maybe_reveal();
        Ok(())
    }

    fn handle_commitment_complete_player(&mut self, u: &UserDeviceCommitment) -> FlipResult<()> {
        let ps = player_state(&mut self.players, &u.ud);
        if ps.leader_commitment.is_some() {
            return Err(FlipError::DuplicateCommitmentComplete {
                game: self.md.clone(),
                user: u.ud.clone(),
            });
        }
        match ps.commitment {
            Some(seen) if seen != u.commitment => {
                return Err(FlipError::CommitmentMismatch {
                    game: self.md.clone(),
                    user: u.ud.clone(),
                });
            }
            Some(_) => {}
            None => debug!(game = %self.md, user = %u.ud, "adopting leader's commitment for latecomer"),
        }
        ps.leader_commitment = Some(u.commitment);
        ps.included = true;
        self.n_players += 1;
        Ok(())
    }

    fn committed_in_time(&self, ps: &GamePlayerState) -> bool {
        match ps.commitment_time {
            Some(t) => t - self.started_at < self.params.commitment_window_with_slack(true),
            None => false,
        }
    }

    fn maybe_reveal(&self) {
        let Some(me) = &self.me else { return };
        let included = self.players.get(&me.me.to_key()).map_or(false, |p| p.included);
        if !included {
            info!(game = %self.md, "leader did not include us, not revealing");
            return;
        }
        let Some(cch) = self.commitment_complete_hash else { return };
        self.send_outgoing(GameMessageBody::Reveal(Reveal { secret: me.secret, cch }));
    }

    fn handle_reveal(&mut self, sender: &UserDevice, reveal: &Reveal) -> FlipResult<Flow> {
        let Some(ps) = self.players.get_mut(&sender.to_key()) else {
            return Err(FlipError::UnregisteredUser {
                game: self.md.clone(),
                user: sender.clone(),
            });
        };
        if !ps.included {
            info!(game = %self.md, user = %sender, "skipping reveal from player left out of the game");
            return Ok(Flow::Continue);
        }
        if Some(reveal.cch) != self.commitment_complete_hash {
            return Err(FlipError::BadCommitmentCompleteHash {
                game: self.md.clone(),
                user: sender.clone(),
            });
        }
        if ps.secret.is_some() {
            return Err(FlipError::DuplicateReveal {
                game: self.md.clone(),
                user: sender.clone(),
            });
        }

        let payload = CommitmentPayload::new(&self.md, &self.params);
        let expected = reveal.secret.compute_commitment(&payload)?;
        if ps.leader_commitment.or(ps.commitment) != Some(expected) {
            return Err(FlipError::BadReveal {
                game: self.md.clone(),
                user: sender.clone(),
            });
        }
        ps.secret = Some(reveal.secret);

        self.publish(GameUpdate::Reveal(RevealUpdate {
            user: sender.clone(),
            reveal: reveal.secret,
        }));
        self.n_players = self.n_players.saturating_sub(1);
        if self.n_players == 0 {
            self.finish_game()?;
        }
        Ok(Flow::Continue)
    }

    /// Deadline for the current stage passed
    pub(crate) fn handle_timer_event(&mut self) -> FlipResult<Flow> {
        debug!(game = %self.md, stage = %self.stage_for_timeout, leader = self.is_leader, "timer fired");
        if self.is_leader && self.stage_for_timeout == Stage::Round1 {
            self.complete_commitments();
            return Ok(Flow::Continue);
        }

        if self.stage_for_timeout == Stage::Round2 {
            let absentees = self.absentees();
            if !absentees.is_empty() {
                return Err(FlipError::Absentees {
                    game: self.md.clone(),
                    absentees,
                });
            }
        }

        Err(FlipError::Timeout {
            game: self.md.clone(),
            stage: self.stage_for_timeout,
        })
    }

    fn complete_commitments(&mut self) {
        let mut players: Vec<UserDeviceCommitment> = self
            .players
            .values()
            .filter_map(|p| {
                p.commitment.map(|commitment| UserDeviceCommitment {
                    ud: p.ud.clone(),
                    commitment,
                })
            })
            .collect();
        players.sort_by(|a, b| a.ud.cmp(&b.ud));
        info!(game = %self.md, n_players = players.len(), "closing commitment round");
        self.stage_for_timeout = Stage::Round2;
        self.send_outgoing(GameMessageBody::CommitmentComplete(CommitmentComplete { players }));
    }

    fn absentees(&self) -> Vec<UserDevice> {
        let mut absent: Vec<UserDevice> = self
            .players
            .values()
            .filter(|p| p.included && p.secret.is_none())
            .map(|p| p.ud.clone())
            .collect();
        absent.sort();
        absent
    }

    fn finish_game(&mut self) -> FlipResult<()> {
        let mut xor = Secret::default();
        for ps in self.players.values().filter(|p| p.included) {
            match &ps.secret {
                Some(secret) => xor.xor(secret),
                None => {
                    return Err(FlipError::NoReveal {
                        game: self.md.clone(),
                        user: ps.ud.clone(),
                    })
                }
            }
        }

        self.stage = Stage::RoundCleanup;
        self.stage_for_timeout = Stage::RoundCleanup;
        let res = Prng::new(xor).and_then(|mut prng| self.do_flip(&mut prng));
        if let Ok(outcome) = &res {
            info!(game = %self.md, %outcome, "flip finished");
            self.outcome = Some(outcome.clone());
            self.publish(GameUpdate::Result(outcome.clone()));
        }
        self.send_outgoing(GameMessageBody::End);
        res.map(|_| ())
    }

    fn do_flip(&self, prng: &mut Prng) -> FlipResult<FlipOutcome> {
        let bad = || FlipError::BadFlipType { game: self.md.clone() };
        if !self.params.params.check() {
            return Err(bad());
        }
        let outcome = match &self.params.params {
            FlipParameters::Bool => FlipOutcome::Bool(prng.bool()),
            FlipParameters::Int(m) => FlipOutcome::Int(prng.int(*m)),
            FlipParameters::Big(bytes) => FlipOutcome::Big(prng.big(&BigInt::from_bytes_be(Sign::Plus, bytes))),
            FlipParameters::Shuffle(n) => FlipOutcome::Shuffle(prng.permutation(usize::try_from(*n).map_err(|_| bad())?)),
        };
        Ok(outcome)
    }

    fn publish(&self, update: GameUpdate) {
        let msg = GameStateUpdateMessage {
            metadata: self.md.clone(),
            update,
        };
        if self.updates.send(msg).is_err() {
            debug!(game = %self.md, "update receiver dropped");
        }
    }

    fn send_outgoing(&self, body: GameMessageBody) {
        let Some(outbox) = &self.outbox else { return };
        if let Err(e) = outbox.post(&self.md, None, body) {
            warn!(game = %self.md, error = %e, "failed to post outgoing message");
        }
    }
}

async fn sleep_until_opt(clock: &dyn Clock, deadline: Option<DateTime<Utc>>) {
    match deadline {
        Some(deadline) => clock.sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConversationId, GameId};
    use crate::wire::GameMessageV1;

    struct Fixture {
        md: GameMetadata,
        start: Start,
        players: Vec<PlayerControl>,
    }

    impl Fixture {
        fn new(n: usize, params: FlipParameters) -> Self {
            let leader = UserDevice::new(vec![1], vec![1]);
            let md = GameMetadata {
                initiator: leader,
                conversation_id: ConversationId::new(vec![0xcc; 8]),
                game_id: GameId::generate(),
            };
            let mut start = Start::with_bool(Utc::now(), n);
            start.params = params;
            let players = (0..n)
                .map(|i| {
                    let ud = UserDevice::new(vec![i as u8 + 1], vec![1]);
                    PlayerControl::new(ud, &md, &start).unwrap()
                })
                .collect();
            Self { md, start, players }
        }

        fn observer(&self) -> (Game, mpsc::UnboundedReceiver<GameStateUpdateMessage>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let game = Game::new(self.md.clone(), false, self.start.clone(), self.start.start_time(), None, tx, None);
            (game, rx)
        }

        fn wrap(&self, sender: &UserDevice, body: GameMessageBody) -> GameMessageWrapped {
            GameMessageWrapped {
                sender: sender.clone(),
                msg: GameMessageV1 { md: self.md.clone(), body },
                me: None,
                forward: false,
            }
        }

        fn now(&self) -> DateTime<Utc> {
            self.start.start_time() + chrono::Duration::milliseconds(10)
        }

        fn commitment_complete(&self) -> CommitmentComplete {
            let mut players: Vec<UserDeviceCommitment> = self
                .players
                .iter()
                .map(|p| UserDeviceCommitment {
                    ud: p.me.clone(),
                    commitment: p.commitment,
                })
                .collect();
            players.sort_by(|a, b| a.ud.cmp(&b.ud));
            CommitmentComplete { players }
        }

        fn reveal(&self, p: &PlayerControl) -> GameMessageWrapped {
            let cch = CommitmentCompleteHash::compute(&self.commitment_complete().players).unwrap();
            self.wrap(&p.me, GameMessageBody::Reveal(Reveal { secret: p.secret, cch }))
        }

        fn play_through_commitments(&self, game: &mut Game) {
            for p in &self.players {
                let msg = self.wrap(&p.me, GameMessageBody::Commitment(p.commitment));
                assert_eq!(game.handle_message(&msg, self.now()).unwrap(), Flow::Continue);
            }
            let leader = &self.players[0].me;
            let cc = self.wrap(leader, GameMessageBody::CommitmentComplete(self.commitment_complete()));
            game.handle_message(&cc, self.now()).unwrap();
        }
    }

    #[test]
    fn test_result_independent_of_reveal_order() {
        let fx = Fixture::new(4, FlipParameters::Int(1_000_000));

        let (mut forward, _rx1) = fx.observer();
        fx.play_through_commitments(&mut forward);
        for p in &fx.players {
            forward.handle_message(&fx.reveal(p), fx.now()).unwrap();
        }

        let (mut backward, _rx2) = fx.observer();
        fx.play_through_commitments(&mut backward);
        for p in fx.players.iter().rev() {
            backward.handle_message(&fx.reveal(p), fx.now()).unwrap();
        }

        assert!(forward.outcome().is_some());
        assert_eq!(forward.outcome(), backward.outcome());
        assert_eq!(forward.included_players().len(), 4);
    }

    #[test]
    fn test_updates_follow_protocol_order() {
        let fx = Fixture::new(2, FlipParameters::Bool);
        let (mut game, mut rx) = fx.observer();
        fx.play_through_commitments(&mut game);
        for p in &fx.players {
            game.handle_message(&fx.reveal(p), fx.now()).unwrap();
        }

        let mut kinds = Vec::new();
        while let Ok(update) = rx.try_recv() {
            kinds.push(match update.update {
                GameUpdate::Commitment(_) => "commitment",
                GameUpdate::CommitmentComplete(_) => "cc",
                GameUpdate::Reveal(_) => "reveal",
                GameUpdate::Result(_) => "result",
                GameUpdate::Err(_) => "error",
            });
        }
        assert_eq!(kinds, vec!["commitment", "commitment", "cc", "reveal", "reveal", "result"]);
    }

    #[test]
    fn test_bad_reveal_is_detected() {
        let fx = Fixture::new(3, FlipParameters::Bool);
        let (mut game, _rx) = fx.observer();
        fx.play_through_commitments(&mut game);

        let mut forged = fx.reveal(&fx.players[1]);
        if let GameMessageBody::Reveal(r) = &mut forged.msg.body {
            let mut bytes = *r.secret.as_bytes();
            bytes[0] ^= 0x01;
            r.secret = Secret::from_bytes(bytes);
        }
        let err = game.handle_message(&forged, fx.now()).unwrap_err();
        assert!(matches!(err, FlipError::BadReveal { ref user, .. } if *user == fx.players[1].me));
    }

    #[test]
    fn test_duplicate_registration_and_commitment() {
        let fx = Fixture::new(2, FlipParameters::Bool);
        let (mut game, _rx) = fx.observer();
        let p = &fx.players[0];
        let msg = fx.wrap(&p.me, GameMessageBody::Commitment(p.commitment));
        game.handle_message(&msg, fx.now()).unwrap();
        assert!(matches!(
            game.handle_message(&msg, fx.now()),
            Err(FlipError::DuplicateRegistration { .. })
        ));

        let copycat = fx.wrap(&fx.players[1].me, GameMessageBody::Commitment(p.commitment));
        assert!(matches!(
            game.handle_message(&copycat, fx.now()),
            Err(FlipError::DuplicateCommitment { .. })
        ));
    }

    #[test]
    fn test_commitment_complete_checks() {
        let fx = Fixture::new(3, FlipParameters::Bool);

        let (mut game, _rx) = fx.observer();
        let impostor = fx.wrap(&fx.players[2].me, GameMessageBody::CommitmentComplete(fx.commitment_complete()));
        assert!(matches!(
            game.handle_message(&impostor, fx.now()),
            Err(FlipError::WrongSender { .. })
        ));

        let mut unsorted = fx.commitment_complete();
        unsorted.players.reverse();
        let msg = fx.wrap(&fx.md.initiator, GameMessageBody::CommitmentComplete(unsorted));
        assert!(matches!(
            game.handle_message(&msg, fx.now()),
            Err(FlipError::CommitmentCompleteSort { .. })
        ));

        let mut lying = fx.commitment_complete();
        let p = &fx.players[1];
        game.handle_message(&fx.wrap(&p.me, GameMessageBody::Commitment(p.commitment)), fx.now())
            .unwrap();
        lying.players[1].commitment = Commitment::from_bytes([9; 32]);
        let msg = fx.wrap(&fx.md.initiator, GameMessageBody::CommitmentComplete(lying));
        assert!(matches!(
            game.handle_message(&msg, fx.now()),
            Err(FlipError::CommitmentMismatch { .. })
        ));
    }

    #[test]
    fn test_latecomer_adopts_leader_commitment() {
        let fx = Fixture::new(3, FlipParameters::Shuffle(5));
        let (mut game, _rx) = fx.observer();

        // Only the leader's commitment reached us before the commitment complete.
        let leader = &fx.players[0];
        game.handle_message(&fx.wrap(&leader.me, GameMessageBody::Commitment(leader.commitment)), fx.now())
            .unwrap();
        let cc = fx.wrap(&leader.me, GameMessageBody::CommitmentComplete(fx.commitment_complete()));
        game.handle_message(&cc, fx.now()).unwrap();

        let late = &fx.players[2];
        game.handle_message(&fx.wrap(&late.me, GameMessageBody::Commitment(late.commitment)), fx.now())
            .unwrap();
        for p in &fx.players {
            game.handle_message(&fx.reveal(p), fx.now()).unwrap();
        }
        assert!(matches!(game.outcome(), Some(FlipOutcome::Shuffle(p)) if p.len() == 5));
    }

    #[test]
    fn test_reveal_rules() {
        let fx = Fixture::new(2, FlipParameters::Bool);
        let (mut game, _rx) = fx.observer();

        let early = fx.reveal(&fx.players[0]);
        assert!(matches!(
            game.handle_message(&early, fx.now()),
            Err(FlipError::BadMessageForStage { stage: Stage::Round1, .. })
        ));

        fx.play_through_commitments(&mut game);

        let stranger = UserDevice::new(vec![0xee], vec![0xee]);
        let mut unknown = fx.reveal(&fx.players[0]);
        unknown.sender = stranger;
        let err = game.handle_message(&unknown, fx.now()).unwrap_err();
        assert!(err.is_recoverable());

        let mut wrong_cch = fx.reveal(&fx.players[0]);
        if let GameMessageBody::Reveal(r) = &mut wrong_cch.msg.body {
            r.cch = CommitmentCompleteHash::compute(&[]).unwrap();
        }
        assert!(matches!(
            game.handle_message(&wrong_cch, fx.now()),
            Err(FlipError::BadCommitmentCompleteHash { .. })
        ));

        game.handle_message(&fx.reveal(&fx.players[0]), fx.now()).unwrap();
        assert!(matches!(
            game.handle_message(&fx.reveal(&fx.players[0]), fx.now()),
            Err(FlipError::DuplicateReveal { .. })
        ));

        let too_late = fx.start.start_time() + fx.start.reveal_window_with_slack() + chrono::Duration::milliseconds(1);
        assert!(matches!(
            game.handle_message(&fx.reveal(&fx.players[1]), too_late),
            Err(FlipError::RevealTooLate { .. })
        ));
    }

    #[test]
    fn test_timeouts() {
        let fx = Fixture::new(3, FlipParameters::Bool);

        let (mut waiting, _rx) = fx.observer();
        assert!(matches!(
            waiting.handle_timer_event(),
            Err(FlipError::Timeout { stage: Stage::Round1, .. })
        ));

        let (mut game, _rx) = fx.observer();
        fx.play_through_commitments(&mut game);
        game.handle_message(&fx.reveal(&fx.players[0]), fx.now()).unwrap();
        match game.handle_timer_event() {
            Err(FlipError::Absentees { absentees, .. }) => {
                assert_eq!(absentees, vec![fx.players[1].me.clone(), fx.players[2].me.clone()]);
            }
            other => panic!("expected absentees, got {:?}", other),
        }
    }

    #[test]
    fn test_deadlines_depend_on_role() {
        let fx = Fixture::new(2, FlipParameters::Bool);
        let (tx, _rx) = mpsc::unbounded_channel();
        let leader = Game::new(fx.md.clone(), true, fx.start.clone(), fx.start.start_time(), None, tx, None);
        let (follower, _rx) = fx.observer();
        let t0 = fx.start.start_time();
        assert_eq!(leader.next_deadline(), Some(t0 + chrono::Duration::milliseconds(4_000)));
        assert_eq!(follower.next_deadline(), Some(t0 + chrono::Duration::milliseconds(5_000)));
    }

    #[test]
    fn test_end_and_start_messages() {
        let fx = Fixture::new(2, FlipParameters::Bool);
        let (mut game, _rx) = fx.observer();
        let start = fx.wrap(&fx.md.initiator, GameMessageBody::Start(fx.start.clone()));
        assert!(matches!(
            game.handle_message(&start, fx.now()),
            Err(FlipError::BadMessageForStage { message_type: MessageType::Start, .. })
        ));
        let end = fx.wrap(&fx.md.initiator, GameMessageBody::End);
        assert_eq!(game.handle_message(&end, fx.now()).unwrap(), Flow::Done);
    }

    #[test]
    fn test_windows_measured_from_local_start() {
        let fx = Fixture::new(2, FlipParameters::Bool);
        let (tx, _rx) = mpsc::unbounded_channel();
        // Our clock runs six seconds ahead of the leader's declared start.
        let received = fx.start.start_time() + chrono::Duration::seconds(6);
        let mut game = Game::new(fx.md.clone(), false, fx.start.clone(), received, None, tx, None);
        assert_eq!(game.next_deadline(), Some(received + chrono::Duration::milliseconds(5_000)));

        for p in &fx.players {
            let msg = fx.wrap(&p.me, GameMessageBody::Commitment(p.commitment));
            game.handle_message(&msg, received).unwrap();
        }
        let cc = fx.wrap(&fx.md.initiator, GameMessageBody::CommitmentComplete(fx.commitment_complete()));
        game.handle_message(&cc, received).unwrap();

        // Past the leader-anchored reveal deadline but inside ours.
        let later = fx.start.start_time() + fx.start.reveal_window_with_slack() + chrono::Duration::seconds(1);
        for p in &fx.players {
            game.handle_message(&fx.reveal(p), later).unwrap();
        }
        assert!(matches!(game.outcome(), Some(FlipOutcome::Bool(_))));
    }

    #[test]
    fn test_commitment_payload_names_the_leader() {
        let fx = Fixture::new(3, FlipParameters::Int(10));
        let (mut game, _rx) = fx.observer();

        // A follower that builds its own commitment from the game's leader and start.
        let follower = UserDevice::new(vec![2], vec![1]);
        let secret = Secret::generate();
        let commitment = secret.compute_commitment(&CommitmentPayload::new(&fx.md, &fx.start)).unwrap();
        let players = vec![
            UserDeviceCommitment {
                ud: fx.md.initiator.clone(),
                commitment: fx.players[0].commitment,
            },
            UserDeviceCommitment { ud: follower.clone(), commitment },
        ];
        let leader = &fx.players[0];
        let msg = fx.wrap(&leader.me, GameMessageBody::Commitment(leader.commitment));
        game.handle_message(&msg, fx.now()).unwrap();
        let msg = fx.wrap(&follower, GameMessageBody::Commitment(commitment));
        game.handle_message(&msg, fx.now()).unwrap();
        let cc = CommitmentComplete { players };
        let cch = CommitmentCompleteHash::compute(&cc.players).unwrap();
        game.handle_message(&fx.wrap(&fx.md.initiator, GameMessageBody::CommitmentComplete(cc)), fx.now())
            .unwrap();

        let reveal = fx.wrap(&follower, GameMessageBody::Reveal(Reveal { secret, cch }));
        game.handle_message(&reveal, fx.now()).unwrap();
        let leader_reveal = fx.wrap(&leader.me, GameMessageBody::Reveal(Reveal { secret: leader.secret, cch }));
        game.handle_message(&leader_reveal, fx.now()).unwrap();
        assert!(matches!(game.outcome(), Some(FlipOutcome::Int(_))));
    }
}
