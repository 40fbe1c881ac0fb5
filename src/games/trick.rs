//! Compact trick-taking engine behind both portal game types.
//!
//! A 24-card deck (9 J Q K 10 A in four suits, 66-style point values), an
//! optional one-round auction, follow-suit trick play with trumps, and a
//! pending finalize step after every completed trick. Deals are reproducible
//! from the seed.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::engine::{action_kind, Action, EngineFactory, GameEngine, GameKind, PlayerId};
use crate::error::{Error, Result};

/// Strength order, weakest first. Ten outranks King.
const RANK_NAMES: [&str; 6] = ["9", "J", "Q", "K", "10", "A"];
const RANK_POINTS: [u32; 6] = [0, 2, 3, 4, 10, 11];
const SUIT_NAMES: [&str; 4] = ["clubs", "diamonds", "hearts", "spades"];

const LAST_TRICK_BONUS: u32 = 10;
const MIN_BID: i64 = 100;
const MAX_BID: i64 = 200;
const BID_STEP: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub suit: u8,
    pub rank: u8,
}

impl Card {
    fn points(&self) -> u32 {
        RANK_POINTS[self.rank as usize]
    }

    fn label(&self) -> String {
        format!(
            "{} of {}",
            RANK_NAMES[self.rank as usize], SUIT_NAMES[self.suit as usize]
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TrickPhase {
    Bidding,
    Playing,
    Finished,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrickState {
    players: Vec<PlayerId>,
    /// Whether this game opened with an auction.
    bidding: bool,
    phase: TrickPhase,
    hands: Vec<Vec<Card>>,
    /// `None` until the player acted; `Some(0)` is a pass.
    bids: Vec<Option<i64>>,
    current: usize,
    leader: usize,
    trump: u8,
    /// Plays of the trick in progress, in play order.
    trick: Vec<(usize, Card)>,
    points: Vec<u32>,
    tricks_won: Vec<u32>,
}

impl TrickState {
    fn player_index(&self, player: &PlayerId) -> Option<usize> {
        self.players.iter().position(|p| p == player)
    }

    fn trick_complete(&self) -> bool {
        !self.trick.is_empty() && self.trick.len() == self.players.len()
    }

    fn max_bid(&self) -> i64 {
        self.bids.iter().flatten().copied().max().unwrap_or(0)
    }

    /// Winner of the completed trick: best trump, else best card of the
    /// lead suit.
    fn trick_winner(&self) -> usize {
        let mut best = 0;
        for (i, (_, card)) in self.trick.iter().enumerate().skip(1) {
            let (_, best_card) = self.trick[best];
            let beats = if card.suit == best_card.suit {
                card.rank > best_card.rank
            } else {
                card.suit == self.trump && best_card.suit != self.trump
            };
            if beats {
                best = i;
            }
        }
        self.trick[best].0
    }
}

pub struct TrickEngine {
    state: TrickState,
}

impl TrickEngine {
    fn apply_bid(&mut self, idx: usize, action: &Action) -> Result<()> {
        let state = &mut self.state;
        if idx != state.current {
            return Err(Error::IllegalAction("not this player's turn to bid".into()));
        }
        let bid = match action.kind.as_str() {
            action_kind::PASS => 0,
            action_kind::BID => {
                let value = action
                    .payload
                    .get("value")
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| Error::IllegalAction("bid requires a value".into()))?;
                if value < MIN_BID
                    || value > MAX_BID
                    || value % BID_STEP != 0
                    || value <= state.max_bid()
                {
                    return Err(Error::IllegalAction(format!("cannot bid {}", value)));
                }
                value
            }
            other => {
                return Err(Error::IllegalAction(format!(
                    "{} is not a bidding action",
                    other
                )))
            }
        };
        state.bids[idx] = Some(bid);

        if let Some(next) = state.bids.iter().position(|b| b.is_none()) {
            state.current = next;
        } else {
            // Auction done: the highest bidder leads. All-pass keeps seat 0.
            let winner = state
                .bids
                .iter()
                .enumerate()
                .max_by_key(|(i, b)| (b.unwrap_or(0), std::cmp::Reverse(*i)))
                .map(|(i, _)| i)
                .unwrap_or(0);
            state.leader = winner;
            state.current = winner;
            state.phase = TrickPhase::Playing;
        }
        Ok(())
    }

    fn apply_play(&mut self, idx: usize, action: &Action) -> Result<()> {
        let state = &mut self.state;
        if state.trick_complete() {
            return Err(Error::IllegalAction(
                "trick must be finalized before the next play".into(),
            ));
        }
        if idx != state.current {
            return Err(Error::IllegalAction("not this player's turn".into()));
        }
        let card = card_from_payload(&action.payload)?;
        let hand = &state.hands[idx];
        if !hand.contains(&card) {
            return Err(Error::IllegalAction(format!("{} not in hand", card.label())));
        }
        if let Some((_, lead)) = state.trick.first() {
            let holds_lead_suit = hand.iter().any(|c| c.suit == lead.suit);
            if holds_lead_suit && card.suit != lead.suit {
                return Err(Error::IllegalAction(format!(
                    "must follow {}",
                    SUIT_NAMES[lead.suit as usize]
                )));
            }
        }

        state.hands[idx].retain(|c| *c != card);
        state.trick.push((idx, card));
        if !state.trick_complete() {
            state.current = (idx + 1) % state.players.len();
        }
        Ok(())
    }

    fn apply_finalize(&mut self) -> Result<()> {
        let state = &mut self.state;
        if !state.trick_complete() {
            return Err(Error::IllegalAction("no trick to finalize".into()));
        }
        let winner = state.trick_winner();
        let taken: u32 = state.trick.iter().map(|(_, c)| c.points()).sum();
        state.points[winner] += taken;
        state.tricks_won[winner] += 1;
        state.trick.clear();
        state.leader = winner;
        state.current = winner;

        if state.hands.iter().all(|h| h.is_empty()) {
            state.points[winner] += LAST_TRICK_BONUS;
            // A busted auction scores nothing.
            if state.bidding {
                for i in 0..state.players.len() {
                    if let Some(bid) = state.bids[i] {
                        if bid > 0 && (state.points[i] as i64) < bid {
                            state.points[i] = 0;
                        }
                    }
                }
            }
            state.phase = TrickPhase::Finished;
        }
        Ok(())
    }
}

impl GameEngine for TrickEngine {
    fn apply(&mut self, player: &PlayerId, action: &Action) -> Result<()> {
        let idx = self
            .state
            .player_index(player)
            .ok_or_else(|| Error::IllegalAction(format!("{} is not in this game", player)))?;
        match (self.state.phase, action.kind.as_str()) {
            (TrickPhase::Finished, _) => Err(Error::IllegalAction("game is over".into())),
            (_, action_kind::FINALIZE_TRICK) => self.apply_finalize(),
            (TrickPhase::Bidding, _) => self.apply_bid(idx, action),
            (TrickPhase::Playing, action_kind::PLAY_CARD) => self.apply_play(idx, action),
            (_, other) => Err(Error::IllegalAction(format!(
                "{} not allowed right now",
                other
            ))),
        }
    }

    fn legal_actions(&self, player: &PlayerId) -> Vec<Action> {
        let state = &self.state;
        let idx = match state.player_index(player) {
            Some(i) => i,
            None => return vec![],
        };
        if state.phase == TrickPhase::Finished || state.trick_complete() || idx != state.current {
            return vec![];
        }
        match state.phase {
            TrickPhase::Bidding => {
                let mut actions = vec![Action::pass()];
                let mut value = (state.max_bid() + BID_STEP).max(MIN_BID);
                while value <= MAX_BID {
                    actions.push(Action::new(
                        action_kind::BID,
                        serde_json::json!({ "value": value }),
                    ));
                    value += BID_STEP;
                }
                actions
            }
            TrickPhase::Playing => {
                let hand = &state.hands[idx];
                let playable: Vec<&Card> = match state.trick.first() {
                    Some((_, lead)) if hand.iter().any(|c| c.suit == lead.suit) => {
                        hand.iter().filter(|c| c.suit == lead.suit).collect()
                    }
                    _ => hand.iter().collect(),
                };
                playable
                    .into_iter()
                    .map(|c| {
                        Action::new(
                            action_kind::PLAY_CARD,
                            serde_json::json!({ "suit": c.suit, "rank": c.rank }),
                        )
                    })
                    .collect()
            }
            TrickPhase::Finished => vec![],
        }
    }

    fn view_for(&self, player: &PlayerId) -> serde_json::Value {
        let state = &self.state;
        let idx = state.player_index(player);
        serde_json::json!({
            "players": state.players,
            "phase": state.phase,
            "bidding": state.bidding,
            "bids": state.bids,
            "trump": SUIT_NAMES[state.trump as usize],
            "hand": idx.map(|i| state.hands[i].clone()),
            "hand_counts": state.hands.iter().map(|h| h.len()).collect::<Vec<_>>(),
            "trick": state.trick,
            "points": state.points,
            "tricks_won": state.tricks_won,
            "leader": state.leader,
            "current_player": self.current_player(),
        })
    }

    fn current_player(&self) -> Option<PlayerId> {
        let state = &self.state;
        if state.phase == TrickPhase::Finished || state.trick_complete() {
            None
        } else {
            state.players.get(state.current).cloned()
        }
    }

    fn is_terminal(&self) -> bool {
        self.state.phase == TrickPhase::Finished
    }

    fn outcome(&self) -> HashMap<PlayerId, f64> {
        let state = &self.state;
        if state.phase != TrickPhase::Finished {
            return HashMap::new();
        }
        let n = state.players.len();
        if n == 4 {
            // Fixed partnerships: even seats vs odd seats.
            let team_a: u32 = state.points[0] + state.points[2];
            let team_b: u32 = state.points[1] + state.points[3];
            let (a, b) = match team_a.cmp(&team_b) {
                std::cmp::Ordering::Greater => (1.0, 0.0),
                std::cmp::Ordering::Less => (0.0, 1.0),
                std::cmp::Ordering::Equal => (0.5, 0.5),
            };
            state
                .players
                .iter()
                .enumerate()
                .map(|(i, p)| (p.clone(), if i % 2 == 0 { a } else { b }))
                .collect()
        } else {
            // Pairwise: beaten opponents count 1, ties 0.5.
            state
                .players
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    let mut score = 0.0;
                    for j in 0..n {
                        if j == i {
                            continue;
                        }
                        match state.points[i].cmp(&state.points[j]) {
                            std::cmp::Ordering::Greater => score += 1.0,
                            std::cmp::Ordering::Equal => score += 0.5,
                            std::cmp::Ordering::Less => {}
                        }
                    }
                    (p.clone(), score / (n as f64 - 1.0))
                })
                .collect()
        }
    }

    fn pending_step(&self) -> Option<(PlayerId, Action)> {
        if self.state.phase != TrickPhase::Finished && self.state.trick_complete() {
            Some((
                self.state.players[self.state.leader].clone(),
                Action::finalize_trick(),
            ))
        } else {
            None
        }
    }

    fn clone_engine(&self) -> Box<dyn GameEngine> {
        Box::new(TrickEngine {
            state: self.state.clone(),
        })
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.state)
            .map_err(|e| Error::Store(format!("trick state not serializable: {}", e)))
    }
}

fn card_from_payload(payload: &serde_json::Value) -> Result<Card> {
    let suit = payload.get("suit").and_then(|v| v.as_u64());
    let rank = payload.get("rank").and_then(|v| v.as_u64());
    match (suit, rank) {
        (Some(s), Some(r)) if s < 4 && r < 6 => Ok(Card {
            suit: s as u8,
            rank: r as u8,
        }),
        _ => Err(Error::IllegalAction("malformed card payload".into())),
    }
}

pub struct TrickEngineFactory {
    kind: GameKind,
    display_name: &'static str,
    bidding: bool,
}

impl TrickEngineFactory {
    pub fn sixty_six() -> TrickEngineFactory {
        TrickEngineFactory {
            kind: GameKind::SixtySix,
            display_name: "66",
            bidding: false,
        }
    }

    pub fn thousand() -> TrickEngineFactory {
        TrickEngineFactory {
            kind: GameKind::Thousand,
            display_name: "Thousand",
            bidding: true,
        }
    }
}

impl EngineFactory for TrickEngineFactory {
    fn kind(&self) -> GameKind {
        self.kind
    }

    fn display_name(&self) -> &str {
        self.display_name
    }

    fn supported_modes(&self) -> &[usize] {
        &[2, 3, 4]
    }

    fn create(
        &self,
        players: &[PlayerId],
        variant: Option<&str>,
        seed: u64,
    ) -> Result<Box<dyn GameEngine>> {
        let n = players.len();
        if !self.supported_modes().contains(&n) {
            return Err(Error::Conflict(format!(
                "{} does not support {} players",
                self.display_name, n
            )));
        }
        let hand_size = match variant {
            Some("short") => 4,
            _ => 6,
        };

        let mut deck: Vec<Card> = (0..4u8)
            .flat_map(|suit| (0..6u8).map(move |rank| Card { suit, rank }))
            .collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        deck.shuffle(&mut rng);
        let trump = rng.gen_range(0..4u8);

        let hands: Vec<Vec<Card>> = (0..n)
            .map(|i| deck[i * hand_size..(i + 1) * hand_size].to_vec())
            .collect();

        let state = TrickState {
            players: players.to_vec(),
            bidding: self.bidding,
            phase: if self.bidding {
                TrickPhase::Bidding
            } else {
                TrickPhase::Playing
            },
            hands,
            bids: vec![None; n],
            current: 0,
            leader: 0,
            trump,
            trick: vec![],
            points: vec![0; n],
            tricks_won: vec![0; n],
        };
        Ok(Box::new(TrickEngine { state }))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Box<dyn GameEngine>> {
        let state: TrickState = serde_json::from_slice(bytes)
            .map_err(|e| Error::EngineCorrupt(format!("trick snapshot: {}", e)))?;
        if state.players.is_empty() || state.hands.len() != state.players.len() {
            return Err(Error::EngineCorrupt("trick snapshot: inconsistent seats".into()));
        }
        Ok(Box::new(TrickEngine { state }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    fn players(n: usize) -> Vec<PlayerId> {
        (0..n).map(|i| format!("p{}", i)).collect()
    }

    /// Play random legal actions (applying pending steps) until terminal.
    fn drive_to_end(engine: &mut Box<dyn GameEngine>) {
        let mut rng = rand::thread_rng();
        let mut guard = 500;
        while !engine.is_terminal() && guard > 0 {
            guard -= 1;
            if let Some((actor, step)) = engine.pending_step() {
                engine.apply(&actor, &step).unwrap();
                continue;
            }
            let player = engine.current_player().expect("someone must be on turn");
            let legal = engine.legal_actions(&player);
            let action = legal.choose(&mut rng).expect("legal action exists").clone();
            engine.apply(&player, &action).unwrap();
        }
        assert!(engine.is_terminal(), "game did not terminate");
    }

    #[test]
    fn deals_are_reproducible_from_seed() {
        let factory = TrickEngineFactory::sixty_six();
        let a = factory.create(&players(4), None, 7).unwrap();
        let b = factory.create(&players(4), None, 7).unwrap();
        assert_eq!(a.view_for(&"p0".into()), b.view_for(&"p0".into()));

        let c = factory.create(&players(4), None, 8).unwrap();
        assert_ne!(a.view_for(&"p0".into()), c.view_for(&"p0".into()));
    }

    #[test]
    fn auction_hands_the_lead_to_the_highest_bidder() {
        let factory = TrickEngineFactory::thousand();
        let mut engine = factory.create(&players(3), None, 1).unwrap();

        engine
            .apply(
                &"p0".into(),
                &Action::new(action_kind::BID, serde_json::json!({"value": 100})),
            )
            .unwrap();
        engine
            .apply(
                &"p1".into(),
                &Action::new(action_kind::BID, serde_json::json!({"value": 120})),
            )
            .unwrap();
        engine.apply(&"p2".into(), &Action::pass()).unwrap();

        assert_eq!(engine.current_player(), Some("p1".to_string()));
        let legal = engine.legal_actions(&"p1".into());
        assert!(legal.iter().all(|a| a.kind == action_kind::PLAY_CARD));
    }

    #[test]
    fn underbidding_is_rejected() {
        let factory = TrickEngineFactory::thousand();
        let mut engine = factory.create(&players(2), None, 1).unwrap();
        engine
            .apply(
                &"p0".into(),
                &Action::new(action_kind::BID, serde_json::json!({"value": 140})),
            )
            .unwrap();
        let err = engine
            .apply(
                &"p1".into(),
                &Action::new(action_kind::BID, serde_json::json!({"value": 140})),
            )
            .unwrap_err();
        assert!(matches!(err, Error::IllegalAction(_)));
    }

    #[test]
    fn follow_suit_is_enforced_via_legal_actions() {
        let factory = TrickEngineFactory::sixty_six();
        for seed in 0..20 {
            let mut engine = factory.create(&players(2), None, seed).unwrap();
            let leader = engine.current_player().unwrap();
            let lead = engine.legal_actions(&leader)[0].clone();
            let lead_suit = lead.payload["suit"].as_u64().unwrap();
            engine.apply(&leader, &lead).unwrap();

            let follower = engine.current_player().unwrap();
            let legal = engine.legal_actions(&follower);
            let suits: Vec<u64> = legal
                .iter()
                .map(|a| a.payload["suit"].as_u64().unwrap())
                .collect();
            // Either every option follows suit, or the follower is void in it.
            if suits.iter().any(|s| *s == lead_suit) {
                assert!(suits.iter().all(|s| *s == lead_suit));
            }
        }
    }

    #[test]
    fn completed_trick_suspends_turns_until_finalized() {
        let factory = TrickEngineFactory::sixty_six();
        let mut engine = factory.create(&players(2), None, 3).unwrap();

        for _ in 0..2 {
            let p = engine.current_player().unwrap();
            let a = engine.legal_actions(&p)[0].clone();
            engine.apply(&p, &a).unwrap();
        }
        assert_eq!(engine.current_player(), None);
        let (actor, step) = engine.pending_step().expect("trick awaits finalize");
        assert_eq!(step.kind, action_kind::FINALIZE_TRICK);

        engine.apply(&actor, &step).unwrap();
        assert!(engine.pending_step().is_none());
        assert!(engine.current_player().is_some());
    }

    #[test]
    fn outcomes_sum_to_half_the_table() {
        for n in [2usize, 3, 4] {
            let factory = TrickEngineFactory::sixty_six();
            let mut engine = factory.create(&players(n), None, 42 + n as u64).unwrap();
            drive_to_end(&mut engine);
            let outcome = engine.outcome();
            assert_eq!(outcome.len(), n);
            let total: f64 = outcome.values().sum();
            assert!((total - n as f64 / 2.0).abs() < 1e-9);
            assert!(outcome.values().all(|s| (0.0..=1.0).contains(s)));
        }
    }

    #[test]
    fn snapshot_round_trip_preserves_the_contract() {
        let factory = TrickEngineFactory::thousand();
        let mut engine = factory.create(&players(3), None, 9).unwrap();
        // Advance into mid-game so the snapshot is non-trivial.
        engine
            .apply(
                &"p0".into(),
                &Action::new(action_kind::BID, serde_json::json!({"value": 100})),
            )
            .unwrap();
        engine.apply(&"p1".into(), &Action::pass()).unwrap();
        engine.apply(&"p2".into(), &Action::pass()).unwrap();

        let bytes = engine.serialize().unwrap();
        let revived = factory.deserialize(&bytes).unwrap();

        assert_eq!(engine.current_player(), revived.current_player());
        assert_eq!(engine.is_terminal(), revived.is_terminal());
        for p in players(3) {
            assert_eq!(engine.legal_actions(&p), revived.legal_actions(&p));
            assert_eq!(engine.view_for(&p), revived.view_for(&p));
        }
    }

    #[test]
    fn garbage_snapshot_is_reported_corrupt() {
        let factory = TrickEngineFactory::sixty_six();
        let err = match factory.deserialize(b"not json") {
            Ok(_) => panic!("expected deserialize to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::EngineCorrupt(_)));
    }
}
