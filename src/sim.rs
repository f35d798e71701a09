//! In-memory chat for running several dealers against each other
//!
//! A [`ChatServer`] delivers every message to every client except its sender,
//! in the order received, and archives each one with the server's time. Each
//! [`ChatClient`] wraps a dealer whose helper talks to that server. Used by the
//! integration tests and by the `fairflip-sim` binary.

use crate::clock::{Clock, ManualClock};
use crate::config::DealerConfig;
use crate::dealer::Dealer;
use crate::errors::{FlipError, FlipResult};
use crate::helper::{DealersHelper, HelperResult};
use crate::replay::GameMessageReplayed;
use crate::types::{
    ConversationId, FlipOutcome, FlipParameters, GameId, GameIdKey, GameStateUpdateMessage, Start, UserDevice,
};
use crate::wire::{GameMessageEncoded, GameMessageWrappedEncoded};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Rewrites a message in flight, before it is archived or delivered
pub type Corruptor = Box<dyn Fn(GameMessageWrappedEncoded) -> GameMessageWrappedEncoded + Send + Sync>;

struct Inbound {
    conversation_id: ConversationId,
    msg: GameMessageWrappedEncoded,
}

struct Subscriber {
    me: UserDevice,
    conversation_id: ConversationId,
    tx: mpsc::UnboundedSender<GameMessageWrappedEncoded>,
}

#[derive(Default)]
struct Archive {
    all: Vec<GameMessageReplayed>,
    by_game: HashMap<GameIdKey, Vec<GameMessageReplayed>>,
}

struct ServerState {
    clock: ManualClock,
    archive_clock: Mutex<Option<Arc<dyn Clock>>>,
    subscribers: Mutex<Vec<Subscriber>>,
    archive: Mutex<Archive>,
    corruptor: Mutex<Option<Corruptor>>,
    input: mpsc::UnboundedSender<Inbound>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ServerState {
    fn archive_time(&self) -> DateTime<Utc> {
        match &*guard(&self.archive_clock) {
            Some(clock) => clock.now(),
            None => self.clock.now(),
        }
    }

    fn deliver(&self, inbound: Inbound) {
        let msg = match &*guard(&self.corruptor) {
            Some(corrupt) => corrupt(inbound.msg),
            None => inbound.msg,
        };

        let record = GameMessageReplayed {
            wrapped: msg.clone(),
            time: self.archive_time(),
        };
        {
            let mut archive = guard(&self.archive);
            if let Ok(decoded) = msg.body.decode() {
                archive
                    .by_game
                    .entry(decoded.md.game_id.to_key())
                    .or_default()
                    .push(record.clone());
            }
            archive.all.push(record);
        }

        for sub in guard(&self.subscribers).iter() {
            if sub.me == msg.sender || sub.conversation_id != inbound.conversation_id {
                continue;
            }
            let _ = sub.tx.send(msg.clone());
        }
    }
}

/// Broadcast chat server with a manually driven clock
pub struct ChatServer {
    state: Arc<ServerState>,
    cancel: CancellationToken,
    clients: Mutex<Vec<ClientHandle>>,
}

struct ClientHandle {
    dealer: Arc<Dealer>,
    cancel: CancellationToken,
}

impl ChatServer {
    /// Create the server and start its delivery loop
    pub fn start() -> Self {
        let (input, mut rx) = mpsc::unbounded_channel::<Inbound>();
        let state = Arc::new(ServerState {
            clock: ManualClock::new(),
            archive_clock: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            archive: Mutex::new(Archive::default()),
            corruptor: Mutex::new(None),
            input,
        });
        let cancel = CancellationToken::new();

        let loop_state = state.clone();
        let loop_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    inbound = rx.recv() => match inbound {
                        Some(inbound) => loop_state.deliver(inbound),
                        None => break,
                    },
                }
            }
            debug!("chat server stopped");
        });

        Self {
            state,
            cancel,
            clients: Mutex::new(Vec::new()),
        }
    }

    pub fn clock(&self) -> &ManualClock {
        &self.state.clock
    }

    /// Time-stamp the archive with `clock` instead of the server clock
    pub fn set_archive_clock(&self, clock: Arc<dyn Clock>) {
        *guard(&self.state.archive_clock) = Some(clock);
    }

    pub fn set_corruptor(&self, corruptor: Corruptor) {
        *guard(&self.state.corruptor) = Some(corruptor);
    }

    /// Archived messages for one game, oldest first
    pub fn history(&self, game_id: &GameId) -> Vec<GameMessageReplayed> {
        guard(&self.state.archive)
            .by_game
            .get(&game_id.to_key())
            .cloned()
            .unwrap_or_default()
    }

    /// Send the first archived message of a game through the server again
    pub fn rebroadcast_first(&self, conversation_id: &ConversationId, game_id: &GameId) -> bool {
        let Some(first) = self.history(game_id).into_iter().next() else {
            return false;
        };
        self.state
            .input
            .send(Inbound {
                conversation_id: conversation_id.clone(),
                msg: first.wrapped,
            })
            .is_ok()
    }

    /// Join a new client on the server clock
    pub fn new_client(&self, conversation_id: &ConversationId, config: DealerConfig) -> ChatClient {
        let clock: Arc<dyn Clock> = Arc::new(self.state.clock.clone());
        self.new_client_with_clock(conversation_id, config, clock)
    }

    /// Join a new client whose local clock may disagree with the server's
    pub fn new_client_with_clock(
        &self,
        conversation_id: &ConversationId,
        config: DealerConfig,
        clock: Arc<dyn Clock>,
    ) -> ChatClient {
        let me = random_user_device();
        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel();
        guard(&self.state.subscribers).push(Subscriber {
            me: me.clone(),
            conversation_id: conversation_id.clone(),
            tx: inbox_tx,
        });

        let helper = Arc::new(SimHelper {
            me: me.clone(),
            clock,
            server: self.state.clone(),
            conversation_id: conversation_id.clone(),
        });
        let dealer = Arc::new(Dealer::new(helper, config));
        let updates = dealer.update_ch().unwrap_or_else(|| mpsc::unbounded_channel().1);
        let cancel = self.cancel.child_token();

        let run_dealer = dealer.clone();
        let run_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = run_dealer.run(run_cancel).await {
                debug!(error = %e, "sim dealer exited");
            }
        });

        let pump_dealer = dealer.clone();
        let pump_cancel = cancel.clone();
        let pump_conversation = conversation_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    msg = inbox_rx.recv() => {
                        let Some(msg) = msg else { break };
                        if let Err(e) = pump_dealer.inject_incoming_chat(msg.sender, &pump_conversation, msg.body) {
                            debug!(error = %e, "sim client dropped incoming message");
                        }
                    }
                }
            }
        });

        guard(&self.clients).push(ClientHandle {
            dealer: dealer.clone(),
            cancel: cancel.clone(),
        });

        ChatClient {
            me,
            conversation_id: conversation_id.clone(),
            dealer,
            updates,
            cancel,
        }
    }

    /// Stop every client and the delivery loop
    pub fn stop(&self) {
        for client in guard(&self.clients).iter() {
            client.dealer.stop();
            client.cancel.cancel();
        }
        self.cancel.cancel();
    }
}

impl Drop for ChatServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One participant connected to a [`ChatServer`]
pub struct ChatClient {
    pub me: UserDevice,
    pub conversation_id: ConversationId,
    pub dealer: Arc<Dealer>,
    pub updates: mpsc::UnboundedReceiver<GameStateUpdateMessage>,
    cancel: CancellationToken,
}

impl ChatClient {
    /// Next update, or `None` if nothing arrives within `wait`
    pub async fn next_update(&mut self, wait: Duration) -> Option<GameStateUpdateMessage> {
        tokio::time::timeout(wait, self.updates.recv()).await.ok().flatten()
    }

    /// Disconnect: stop the dealer and ignore further chat traffic
    pub fn stop(&self) {
        self.dealer.stop();
        self.cancel.cancel();
    }
}

struct SimHelper {
    me: UserDevice,
    clock: Arc<dyn Clock>,
    server: Arc<ServerState>,
    conversation_id: ConversationId,
}

#[async_trait]
impl DealersHelper for SimHelper {
    fn me(&self) -> UserDevice {
        self.me.clone()
    }

    fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    async fn server_time(&self) -> HelperResult<DateTime<Utc>> {
        Ok(self.clock.now())
    }

    async fn read_history(&self, since: DateTime<Utc>) -> HelperResult<Vec<GameMessageWrappedEncoded>> {
        Ok(guard(&self.server.archive)
            .all
            .iter()
            .filter(|r| r.time >= since)
            .map(|r| r.wrapped.clone())
            .collect())
    }

    async fn send_chat(&self, conversation_id: &ConversationId, msg: GameMessageEncoded) -> HelperResult<()> {
        if *conversation_id != self.conversation_id {
            return Err(format!("client is not in conversation {}", conversation_id).into());
        }
        self.server
            .input
            .send(Inbound {
                conversation_id: conversation_id.clone(),
                msg: GameMessageWrappedEncoded {
                    sender: self.me.clone(),
                    body: msg,
                },
            })
            .map_err(|_| "chat server is gone".into())
    }
}

pub fn random_user_device() -> UserDevice {
    let mut user = vec![0u8; 16];
    let mut device = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut user);
    rand::thread_rng().fill_bytes(&mut device);
    UserDevice::new(user, device)
}

pub fn random_conversation_id() -> ConversationId {
    let mut bytes = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    ConversationId::new(bytes)
}

/// Outcome of one simulated flip as seen by each participant
#[derive(Debug, Clone)]
pub struct SimulatedFlip {
    pub game_id: GameId,
    pub outcomes: Vec<FlipOutcome>,
    pub history: Vec<GameMessageReplayed>,
}

/// Run a complete flip among `n_players` honest clients on a fresh server
pub async fn run_simulated_flip(
    n_players: usize,
    params: FlipParameters,
    config: DealerConfig,
    wait: Duration,
) -> FlipResult<SimulatedFlip> {
    if n_players == 0 {
        return Err(FlipError::BadData);
    }
    let server = ChatServer::start();
    let conversation_id = random_conversation_id();
    let mut clients: Vec<ChatClient> = (0..n_players)
        .map(|_| server.new_client(&conversation_id, config.clone()))
        .collect();

    let start = Start::with_inflation(
        server.clock().now(),
        n_players,
        params,
        &config.timing,
        config.inflate_after_players,
    );
    let close_round = start.commitment_window_with_slack(true) + chrono::Duration::milliseconds(1);
    let game_id = clients[0].dealer.start_flip(start, conversation_id.clone())?;

    for client in clients.iter_mut() {
        for _ in 0..n_players {
            expect_update(client, wait, |u| u.commitment().is_some()).await?;
        }
    }

    let advance = close_round.to_std().unwrap_or(Duration::ZERO);
    server.clock().advance(advance);

    let mut outcomes = Vec::with_capacity(n_players);
    for client in clients.iter_mut() {
        let update = expect_update(client, wait, |u| u.result().is_some()).await?;
        if let Some(outcome) = update.result() {
            outcomes.push(outcome.clone());
        }
    }

    let history = server.history(&game_id);
    server.stop();
    Ok(SimulatedFlip {
        game_id,
        outcomes,
        history,
    })
}

// Skip over intermediate updates until one matches; errors end the wait.
async fn expect_update<F>(client: &mut ChatClient, wait: Duration, wanted: F) -> FlipResult<GameStateUpdateMessage>
where
    F: Fn(&GameStateUpdateMessage) -> bool,
{
    loop {
        let Some(update) = client.next_update(wait).await else {
            warn!(me = %client.me, "no update from dealer in time");
            return Err(FlipError::Helper(format!("{} received no update in time", client.me)));
        };
        if let Some(err) = update.err() {
            return Err(err.clone());
        }
        if wanted(&update) {
            return Ok(update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_broadcasts_to_others_only() {
        let server = ChatServer::start();
        let conversation_id = random_conversation_id();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = random_user_device();
        let b = random_user_device();
        {
            let mut subs = guard(&server.state.subscribers);
            subs.push(Subscriber {
                me: a.clone(),
                conversation_id: conversation_id.clone(),
                tx: tx_a,
            });
            subs.push(Subscriber {
                me: b.clone(),
                conversation_id: conversation_id.clone(),
                tx: tx_b,
            });
        }

        server.state.deliver(Inbound {
            conversation_id: conversation_id.clone(),
            msg: GameMessageWrappedEncoded {
                sender: a.clone(),
                body: GameMessageEncoded::new("hello"),
            },
        });

        assert_eq!(rx_b.try_recv().unwrap().sender, a);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(guard(&server.state.archive).all.len(), 1);
    }

    #[tokio::test]
    async fn test_simulated_flip_agrees() {
        let flip = run_simulated_flip(3, FlipParameters::Int(100), DealerConfig::default(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(flip.outcomes.len(), 3);
        assert!(flip.outcomes.windows(2).all(|w| w[0] == w[1]));
        assert!(!flip.history.is_empty());
    }
}
