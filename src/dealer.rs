//! Process-wide flip dealer
//!
//! The dealer owns every live [`Game`] in the process. Messages from the chat
//! (via [`Dealer::inject_incoming_chat`]) and messages generated locally (via
//! the [`Outbox`]) share one input queue. A single dispatch loop drains that
//! queue: a START creates a game after clock and replay checks, anything else
//! is routed to the game it names. Locally generated messages are relayed to
//! the chat once the local game has handled them.

use crate::config::DealerConfig;
use crate::errors::{FlipError, FlipResult};
use crate::game::{Game, PlayerControl};
use crate::helper::DealersHelper;
use crate::types::{
    ConversationId, GameId, GameIdKey, GameKey, GameMetadata, GameStateUpdateMessage, GameUpdate, Start, UserDevice,
};
use crate::wire::{GameMessageBody, GameMessageEncoded, GameMessageV1, GameMessageWrapped, GameMessageWrappedEncoded};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle games use to post their own messages into the dealer's input queue
#[derive(Clone)]
pub(crate) struct Outbox {
    me: UserDevice,
    tx: mpsc::UnboundedSender<GameMessageWrapped>,
}

impl Outbox {
    pub(crate) fn post(
        &self,
        md: &GameMetadata,
        me: Option<Arc<PlayerControl>>,
        body: GameMessageBody,
    ) -> FlipResult<()> {
        let mut msg = GameMessageWrapped {
            sender: self.me.clone(),
            msg: GameMessageV1 { md: md.clone(), body },
            me,
            forward: false,
        };
        msg.forward = msg.is_forwardable();
        self.tx.send(msg).map_err(|_| FlipError::DealerStopped)
    }
}

#[derive(Default)]
struct GameRegistry {
    games: HashMap<GameKey, mpsc::UnboundedSender<GameMessageWrapped>>,
    game_ids: HashMap<GameIdKey, GameMetadata>,
    // Loaded from chat history on the first START this dealer sees.
    previous_games: Option<HashSet<GameIdKey>>,
}

type SharedRegistry = Arc<Mutex<GameRegistry>>;

fn lock(registry: &SharedRegistry) -> MutexGuard<'_, GameRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Check the three clocks against each other and return the local skew
/// relative to the server.
pub(crate) fn compute_clock_skew(
    md: &GameMetadata,
    server_time: DateTime<Utc>,
    leader_time: DateTime<Utc>,
    my_now: DateTime<Utc>,
    max_skew: chrono::Duration,
) -> FlipResult<chrono::Duration> {
    let local_skew = my_now - server_time;
    if local_skew.abs() > max_skew {
        return Err(FlipError::BadLocalClock { game: md.clone() });
    }
    let leader_skew = leader_time - server_time;
    if leader_skew.abs() > max_skew {
        return Err(FlipError::BadLeaderClock { game: md.clone() });
    }
    Ok(local_skew)
}

pub struct Dealer {
    helper: Arc<dyn DealersHelper>,
    config: DealerConfig,
    registry: SharedRegistry,
    chat_input_tx: mpsc::UnboundedSender<GameMessageWrapped>,
    chat_input_rx: Mutex<Option<mpsc::UnboundedReceiver<GameMessageWrapped>>>,
    update_tx: mpsc::UnboundedSender<GameStateUpdateMessage>,
    update_rx: Mutex<Option<mpsc::UnboundedReceiver<GameStateUpdateMessage>>>,
    shutdown: CancellationToken,
}

impl Dealer {
    pub fn new(helper: Arc<dyn DealersHelper>, config: DealerConfig) -> Self {
        let (chat_input_tx, chat_input_rx) = mpsc::unbounded_channel();
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        Self {
            helper,
            config,
            registry: Arc::new(Mutex::new(GameRegistry::default())),
            chat_input_tx,
            chat_input_rx: Mutex::new(Some(chat_input_rx)),
            update_tx,
            update_rx: Mutex::new(Some(update_rx)),
            shutdown: CancellationToken::new(),
        }
    }

    /// The stream of game updates. Only the first caller gets it.
    pub fn update_ch(&self) -> Option<mpsc::UnboundedReceiver<GameStateUpdateMessage>> {
        self.update_rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Dispatch loop. Returns `Ok` after [`Dealer::stop`] and
    /// `Err(Cancelled)` when `cancel` fires first.
    pub async fn run(&self, cancel: CancellationToken) -> FlipResult<()> {
        let mut rx = self
            .chat_input_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(FlipError::DealerAlreadyRunning)?;
        let me = self.helper.me();
        info!(%me, "flip dealer running");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(%me, "flip dealer cancelled");
                    return Err(FlipError::Cancelled);
                }
                _ = self.shutdown.cancelled() => {
                    info!(%me, "flip dealer shut down");
                    return Ok(());
                }
                msg = rx.recv() => {
                    let Some(msg) = msg else { return Ok(()) };
                    if let Err(err) = self.handle_message(&cancel, msg).await {
                        debug!(%me, error = %err, "flip dealer: message not handled");
                    }
                }
            }
        }
    }

    /// Shut down every game and the dispatch loop. Safe to call more than once.
    pub fn stop(&self) {
        self.shutdown.cancel();
        let mut registry = lock(&self.registry);
        // Dropping the senders closes each game's input, which ends the game.
        for (key, _) in registry.games.drain() {
            debug!(game = %key, "closing game on dealer stop");
        }
        registry.game_ids.clear();
    }

    /// Start a flip as leader with a fresh game id
    pub fn start_flip(&self, start: Start, conversation_id: ConversationId) -> FlipResult<GameId> {
        let game_id = GameId::generate();
        self.start_flip_with_game_id(start, conversation_id, game_id)?;
        Ok(game_id)
    }

    pub fn start_flip_with_game_id(
        &self,
        start: Start,
        conversation_id: ConversationId,
        game_id: GameId,
    ) -> FlipResult<()> {
        let me = self.helper.me();
        let md = GameMetadata {
            initiator: me.clone(),
            conversation_id,
            game_id,
        };
        if !md.check() || !start.check() {
            return Err(FlipError::BadData);
        }
        let pc = Arc::new(PlayerControl::new(me, &md, &start)?);
        let commitment = pc.commitment;
        info!(game = %md, "starting flip as leader");

        let outbox = self.outbox();
        outbox.post(&md, Some(pc), GameMessageBody::Start(start))?;
        outbox.post(&md, None, GameMessageBody::Commitment(commitment))
    }

    /// Hand a message received from the chat to the dealer
    pub fn inject_incoming_chat(
        &self,
        sender: UserDevice,
        conversation_id: &ConversationId,
        body: GameMessageEncoded,
    ) -> FlipResult<()> {
        let msg = GameMessageWrappedEncoded { sender, body }.decode()?;
        if msg.msg.md.conversation_id != *conversation_id {
            return Err(FlipError::BadChannel {
                expected: conversation_id.clone(),
                actual: msg.msg.md.conversation_id.clone(),
            });
        }
        if !msg.is_forwardable() {
            return Err(FlipError::UnforwardableMessage(msg.msg.body.message_type()));
        }
        self.chat_input_tx.send(msg).map_err(|_| FlipError::DealerStopped)
    }

    /// Whether a game with this id is running in this conversation
    pub fn is_game_active(&self, conversation_id: &ConversationId, game_id: &GameId) -> bool {
        lock(&self.registry)
            .game_ids
            .get(&game_id.to_key())
            .map_or(false, |md| md.conversation_id == *conversation_id)
    }

    fn outbox(&self) -> Outbox {
        Outbox {
            me: self.helper.me(),
            tx: self.chat_input_tx.clone(),
        }
    }

    fn publish_error(&self, md: &GameMetadata, err: FlipError) {
        let _ = self.update_tx.send(GameStateUpdateMessage {
            metadata: md.clone(),
            update: GameUpdate::Err(err),
        });
    }

    async fn handle_message(&self, cancel: &CancellationToken, msg: GameMessageWrapped) -> FlipResult<()> {
        debug!(
            me = %self.helper.me(),
            sender = %msg.sender,
            game = %msg.msg.md,
            message_type = %msg.msg.body.message_type(),
            "flip dealer: incoming message"
        );

        match &msg.msg.body {
            GameMessageBody::Start(start) => {
                if let Err(err) = self.handle_message_start(cancel, &msg, start).await {
                    info!(game = %msg.msg.md, error = %err, "rejecting START");
                    self.publish_error(&msg.msg.md, err.clone());
                    return Err(err);
                }
            }
            _ => self.handle_message_others(&msg)?,
        }

        if !(msg.forward && msg.is_forwardable()) {
            return Ok(());
        }
        let encoded = msg.encode()?;
        self.helper
            .send_chat(&msg.msg.md.conversation_id, encoded)
            .await
            .map_err(FlipError::helper)
    }

    fn handle_message_others(&self, msg: &GameMessageWrapped) -> FlipResult<()> {
        let md = msg.metadata();
        let registry = lock(&self.registry);
        let Some(tx) = registry.games.get(&md.to_key()) else {
            return Err(FlipError::GameFinished { game: md.clone() });
        };
        tx.send(msg.clone()).map_err(|_| FlipError::GameFinished { game: md.clone() })
    }

    async fn handle_message_start(
        &self,
        cancel: &CancellationToken,
        msg: &GameMessageWrapped,
        start: &Start,
    ) -> FlipResult<()> {
        let md = msg.metadata().clone();
        let key = md.to_key();

        let running = lock(&self.registry).games.contains_key(&key);
        if running {
            return Err(FlipError::GameAlreadyStarted { game: md });
        }
        if msg.sender != md.initiator {
            return Err(FlipError::WrongSender {
                expected: md.initiator.clone(),
                actual: msg.sender.clone(),
                game: md,
            });
        }
        if !start.params.check() {
            return Err(FlipError::BadFlipType { game: md });
        }

        let clock = self.helper.clock();
        let server_time = self.helper.server_time().await.map_err(FlipError::helper)?;
        let max_skew = chrono::Duration::milliseconds(self.config.max_clock_skew_ms as i64);
        let received_at = clock.now();
        let clock_skew = compute_clock_skew(&md, server_time, start.start_time(), received_at, max_skew)?;
        debug!(game = %md, skew_ms = clock_skew.num_milliseconds(), "accepted start");

        self.load_previous_games(msg, received_at).await?;

        let is_leader = msg.me.is_some();
        let me = match &msg.me {
            Some(pc) => pc.clone(),
            None => Arc::new(PlayerControl::new(self.helper.me(), &md, start)?),
        };

        let (game_tx, game_rx) = mpsc::unbounded_channel();
        {
            let mut registry = lock(&self.registry);
            let game_id_key = md.game_id.to_key();
            let previous = registry.previous_games.get_or_insert_with(HashSet::new);
            if !previous.insert(game_id_key.clone()) {
                return Err(FlipError::GameReplay { game_id: md.game_id });
            }
            registry.games.insert(key, game_tx);
            registry.game_ids.insert(game_id_key, md.clone());
        }

        let game = Game::new(
            md.clone(),
            is_leader,
            start.clone(),
            received_at,
            Some(me.clone()),
            self.update_tx.clone(),
            Some(self.outbox()),
        );
        self.spawn_game(game, game_rx, cancel.child_token());

        if !is_leader {
            self.outbox().post(&md, None, GameMessageBody::Commitment(me.commitment))?;
        }
        Ok(())
    }

    // Game ids seen in recent history, excluding the START being handled now.
    async fn load_previous_games(&self, current: &GameMessageWrapped, now: DateTime<Utc>) -> FlipResult<()> {
        let loaded = lock(&self.registry).previous_games.is_some();
        if loaded {
            return Ok(());
        }

        let horizon = chrono::Duration::milliseconds(self.config.replay_horizon().as_millis() as i64);
        let history = self
            .helper
            .read_history(now - horizon)
            .await
            .map_err(FlipError::helper)?;

        let mut seen = HashSet::new();
        let mut skipped_current = false;
        for item in history {
            let Ok(wrapped) = item.decode() else {
                continue;
            };
            if !matches!(wrapped.msg.body, GameMessageBody::Start(_)) {
                continue;
            }
            if !skipped_current && wrapped.sender == current.sender && wrapped.msg == current.msg {
                skipped_current = true;
                continue;
            }
            seen.insert(wrapped.msg.md.game_id.to_key());
        }
        debug!(n_games = seen.len(), "loaded previous games from history");

        let mut registry = lock(&self.registry);
        if registry.previous_games.is_none() {
            registry.previous_games = Some(seen);
        }
        Ok(())
    }

    fn spawn_game(&self, mut game: Game, mut rx: mpsc::UnboundedReceiver<GameMessageWrapped>, cancel: CancellationToken) {
        let registry = self.registry.clone();
        let clock = self.helper.clock();
        let me = self.helper.me();

        tokio::spawn(async move {
            let res = game.run(&mut rx, clock, cancel).await;
            let md = game.metadata().clone();
            match &res {
                Ok(()) => debug!(%me, game = %md, "game ended"),
                Err(err) => info!(%me, game = %md, error = %err, "game ended with error"),
            }
            if matches!(res, Err(ref e) if e.is_shutdown()) {
                return;
            }

            {
                let mut registry = lock(&registry);
                if registry.games.remove(game.key()).is_some() {
                    registry.game_ids.remove(&md.game_id.to_key());
                }
            }

            rx.close();
            let mut drained = 0usize;
            while rx.try_recv().is_ok() {
                drained += 1;
            }
            if drained > 0 {
                warn!(%me, game = %md, drained, "dropped messages queued for finished game");
            }
        });
    }
}

impl Drop for Dealer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
