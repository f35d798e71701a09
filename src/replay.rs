//! Offline verification of a finished game
//!
//! Given the time-stamped messages a chat archived for one game, rebuild the
//! game as a silent observer and run it to completion. Archive times stand in
//! for both the local and the server clock, and deadlines that pass between
//! two archived messages fire exactly as they would have live.

use crate::config::DealerConfig;
use crate::dealer::compute_clock_skew;
use crate::errors::{FlipError, FlipResult};
use crate::game::{Flow, Game};
use crate::types::{FlipOutcome, GameMetadata, Start, UserDevice};
use crate::wire::{GameMessageBody, GameMessageWrappedEncoded};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// An archived message and the time the chat server recorded it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameMessageReplayed {
    pub wrapped: GameMessageWrappedEncoded,
    pub time: DateTime<Utc>,
}

/// What a successful game established
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GameSummary {
    pub metadata: GameMetadata,
    pub start: Start,
    pub players: Vec<UserDevice>,
    pub outcome: FlipOutcome,
}

/// Re-run a game from its archive and return its outcome, or the error the
/// live game would have ended with.
pub fn replay_game(history: &[GameMessageReplayed], config: &DealerConfig) -> FlipResult<GameSummary> {
    let (first, rest) = history.split_first().ok_or(FlipError::BadData)?;
    let start_msg = first.wrapped.decode()?;
    let md = start_msg.msg.md.clone();
    let GameMessageBody::Start(start) = &start_msg.msg.body else {
        return Err(FlipError::BadMessage { game: md });
    };
    if start_msg.sender != md.initiator {
        return Err(FlipError::WrongSender {
            expected: md.initiator.clone(),
            actual: start_msg.sender.clone(),
            game: md,
        });
    }

    let max_skew = chrono::Duration::milliseconds(config.max_clock_skew_ms as i64);
    compute_clock_skew(&md, first.time, start.start_time(), first.time, max_skew)?;

    let (updates, _drain) = mpsc::unbounded_channel();
    let mut game = Game::new(md.clone(), false, start.clone(), first.time, None, updates, None);

    let mut finished = false;
    for item in rest {
        fire_deadlines(&mut game, item.time)?;

        let msg = item.wrapped.decode()?;
        if msg.msg.md != md {
            debug!(game = %md, other = %msg.msg.md, "skipping message for another game");
            continue;
        }
        match game.handle_message(&msg, item.time) {
            Ok(Flow::Done) => {
                finished = true;
                break;
            }
            Ok(Flow::Continue) => {}
            Err(err) if err.is_recoverable() => debug!(game = %md, error = %err, "ignoring bad message"),
            Err(err) => return Err(err),
        }
        if game.outcome().is_some() {
            finished = true;
            break;
        }
    }

    // History ran out before the game resolved: the next deadline decides.
    if !finished {
        fire_deadlines(&mut game, DateTime::<Utc>::MAX_UTC)?;
    }

    let outcome = game.outcome().cloned().ok_or(FlipError::BadMessage { game: md.clone() })?;
    Ok(GameSummary {
        metadata: md,
        start: game.start().clone(),
        players: game.included_players(),
        outcome,
    })
}

fn fire_deadlines(game: &mut Game, until: DateTime<Utc>) -> FlipResult<()> {
    while let Some(deadline) = game.next_deadline() {
        if deadline >= until {
            break;
        }
        if game.outcome().is_some() {
            break;
        }
        // An observer is never the leader, so every deadline it reaches is fatal.
        game.handle_timer_event()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConversationId, GameId};
    use crate::wire::GameMessageV1;

    fn replayed(sender: &UserDevice, md: &GameMetadata, body: GameMessageBody, time: DateTime<Utc>) -> GameMessageReplayed {
        GameMessageReplayed {
            wrapped: GameMessageWrappedEncoded {
                sender: sender.clone(),
                body: GameMessageV1 { md: md.clone(), body }.encode().unwrap(),
            },
            time,
        }
    }

    fn game(leader: &UserDevice) -> GameMetadata {
        GameMetadata {
            initiator: leader.clone(),
            conversation_id: ConversationId::new(vec![4; 4]),
            game_id: GameId::generate(),
        }
    }

    #[test]
    fn test_empty_history_is_rejected() {
        assert!(matches!(replay_game(&[], &DealerConfig::default()), Err(FlipError::BadData)));
    }

    #[test]
    fn test_history_must_begin_with_start() {
        let leader = UserDevice::new(vec![1], vec![1]);
        let md = game(&leader);
        let history = vec![replayed(&leader, &md, GameMessageBody::End, Utc::now())];
        assert!(matches!(
            replay_game(&history, &DealerConfig::default()),
            Err(FlipError::BadMessage { .. })
        ));
    }

    #[test]
    fn test_skewed_leader_is_detected() {
        let leader = UserDevice::new(vec![1], vec![1]);
        let md = game(&leader);
        let archived_at = Utc::now();
        let start = Start::with_bool(archived_at - chrono::Duration::hours(2), 2);
        let history = vec![replayed(&leader, &md, GameMessageBody::Start(start), archived_at)];
        assert!(matches!(
            replay_game(&history, &DealerConfig::default()),
            Err(FlipError::BadLeaderClock { .. })
        ));
    }

    #[test]
    fn test_abandoned_game_times_out() {
        let leader = UserDevice::new(vec![1], vec![1]);
        let md = game(&leader);
        let now = Utc::now();
        let history = vec![replayed(&leader, &md, GameMessageBody::Start(Start::with_bool(now, 2)), now)];
        assert!(matches!(
            replay_game(&history, &DealerConfig::default()),
            Err(FlipError::Timeout { .. })
        ));
    }
}
