// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use tracing::{debug, info, warn};
use uno_common::{
    Card, CardCollection, CardOption, Color, LegalActions, MAX_SEATS, MatchResult, Notification,
    PLAYABLE_COLORS, ParticipantId, PlayerAction, Rank, RejectReason, SeatKind, SeatSummary,
    TableId, TableStatus, TableSummary, TableView,
};

use crate::{
    bot,
    notify::{Outbound, Recipient},
};

#[derive(Debug, Clone)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub kind: SeatKind,
    pub hand: CardCollection,
    pub last_active_at: DateTime<Utc>,
}

impl Participant {
    pub fn human(id: impl Into<ParticipantId>, now: DateTime<Utc>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            kind: SeatKind::Human,
            hand: CardCollection::new(),
            last_active_at: now,
        }
    }

    pub fn synthetic(
        id: impl Into<ParticipantId>,
        display_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            kind: SeatKind::Synthetic,
            hand: CardCollection::new(),
            last_active_at: now,
        }
    }

    pub fn is_human(&self) -> bool {
        self.kind == SeatKind::Human
    }

    pub fn recipient(&self) -> Recipient {
        Recipient {
            participant_id: self.id.clone(),
            kind: self.kind,
        }
    }
}

/// What moved the turn pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnAction {
    Start,
    Play,
    Draw,
    Kick,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    Continued,
    /// The acting human must pick a color before play continues.
    AwaitingColor(ParticipantId),
    Ended {
        winner: Option<ParticipantId>,
    },
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct IdleSweep {
    pub warned: Vec<ParticipantId>,
    pub evicted: Vec<ParticipantId>,
}

impl IdleSweep {
    pub fn is_empty(&self) -> bool {
        self.warned.is_empty() && self.evicted.is_empty()
    }
}

/// One Uno game. Mutated by a single writer at a time; notifications are
/// collected in an outbox and delivered by the caller after unlocking.
pub struct GameTable {
    id: TableId,
    players: Vec<Participant>,
    draw_pile: CardCollection,
    discard_pile: CardCollection,
    status: TableStatus,
    current: usize,
    pending_pickup: usize,
    pending_color: Option<ParticipantId>,
    winner: Option<ParticipantId>,
    forfeits: Vec<ParticipantId>,
    synthetic_fill: bool,
    hand_size: usize,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    outbox: Vec<Outbound>,
    rng: StdRng,
}

impl GameTable {
    pub fn new(
        id: impl Into<TableId>,
        humans: &[ParticipantId],
        synthetic_fill: bool,
        hand_size: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let rng = StdRng::from_rng(&mut rand::rng());
        Self::with_rng(id, humans, synthetic_fill, hand_size, now, rng)
    }

    pub fn with_rng(
        id: impl Into<TableId>,
        humans: &[ParticipantId],
        synthetic_fill: bool,
        hand_size: usize,
        now: DateTime<Utc>,
        rng: StdRng,
    ) -> Self {
        Self {
            id: id.into(),
            players: humans
                .iter()
                .map(|participant_id| Participant::human(participant_id.clone(), now))
                .collect(),
            draw_pile: CardCollection::new(),
            discard_pile: CardCollection::new(),
            status: TableStatus::Waiting,
            current: 0,
            pending_pickup: 0,
            pending_color: None,
            winner: None,
            forfeits: Vec::new(),
            synthetic_fill,
            hand_size,
            created_at: now,
            started_at: None,
            outbox: Vec::new(),
            rng,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> TableStatus {
        self.status
    }

    pub fn players(&self) -> &[Participant] {
        &self.players
    }

    pub fn winner(&self) -> Option<&str> {
        self.winner.as_deref()
    }

    pub fn awaiting_color_from(&self) -> Option<&str> {
        self.pending_color.as_deref()
    }

    pub fn current_participant(&self) -> Option<&Participant> {
        if self.status != TableStatus::Started {
            return None;
        }
        self.players.get(self.current)
    }

    pub fn current_participant_id(&self) -> Option<ParticipantId> {
        self.current_participant().map(|seat| seat.id.clone())
    }

    pub fn seat_of(&self, participant_id: &str) -> Option<usize> {
        self.players.iter().position(|seat| seat.id == participant_id)
    }

    pub fn roster(&self) -> Vec<Recipient> {
        self.players.iter().map(Participant::recipient).collect()
    }

    pub fn human_ids(&self) -> Vec<ParticipantId> {
        self.players
            .iter()
            .filter(|seat| seat.is_human())
            .map(|seat| seat.id.clone())
            .collect()
    }

    pub fn take_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// Builds and deals the deck. Only valid while waiting.
    pub fn setup(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != TableStatus::Waiting {
            return false;
        }
        self.status = TableStatus::Setup;

        self.draw_pile = CardCollection::standard_deck();
        self.draw_pile.shuffle(&mut self.rng);

        if self.synthetic_fill {
            let mut bot_no = 1;
            while self.players.len() < MAX_SEATS {
                self.players.push(Participant::synthetic(
                    format!("{}-bot-{bot_no}", self.id),
                    format!("Bot {bot_no}"),
                    now,
                ));
                bot_no += 1;
            }
        }
        self.players.shuffle(&mut self.rng);

        for _ in 0..self.hand_size {
            for seat in 0..self.players.len() {
                self.draw_into(seat);
            }
        }
        self.flip_onto_discard();

        self.status = TableStatus::Ready;
        let participants = self
            .players
            .iter()
            .map(|seat| seat.display_name.clone())
            .collect();
        self.outbox.push(Outbound::everyone(Notification::TableFormed {
            table_id: self.id.clone(),
            participants,
        }));
        info!(
            table_id = %self.id,
            seats = self.players.len(),
            humans = self.human_ids().len(),
            "table set up"
        );
        true
    }

    /// Begins play. The flipped card acts as if the last seat played it.
    pub fn start(&mut self, now: DateTime<Utc>) -> Option<Advance> {
        if self.status != TableStatus::Ready || self.players.is_empty() {
            return None;
        }
        self.players.shuffle(&mut self.rng);
        while self.discard_pile.top().is_some_and(Card::is_black) {
            if !self.flip_onto_discard() {
                warn!(table_id = %self.id, "draw pile exhausted while flipping start card");
                break;
            }
        }

        self.status = TableStatus::Started;
        self.started_at = Some(now);
        for seat in &mut self.players {
            seat.last_active_at = now;
        }
        self.outbox.push(Outbound::everyone(Notification::GameStarted {
            table_id: self.id.clone(),
        }));
        info!(table_id = %self.id, "game started");

        let actor = self.players.len() - 1;
        self.current = actor;
        Some(self.finish_turn(actor, TurnAction::Start, now))
    }

    /// Applies a participant action. Rejections leave the table untouched.
    pub fn submit(
        &mut self,
        participant_id: &str,
        action: PlayerAction,
        now: DateTime<Utc>,
    ) -> Result<Advance, RejectReason> {
        match self.status {
            TableStatus::Started => {}
            TableStatus::Ended | TableStatus::Cancelled => return Err(RejectReason::TableClosed),
            _ => return Err(RejectReason::TableNotStarted),
        }
        let seat = self
            .seat_of(participant_id)
            .ok_or(RejectReason::ParticipantNotSeated)?;
        if seat != self.current {
            return Err(RejectReason::NotYourTurn);
        }

        match action {
            PlayerAction::ChooseColor { color } => {
                if self.pending_color.is_none() {
                    return Err(RejectReason::NoColorPending);
                }
                if color.is_black() {
                    return Err(RejectReason::InvalidColor);
                }
                self.players[seat].last_active_at = now;
                self.pending_color = None;
                self.apply_color(seat, color);
                Ok(self.finish_turn(seat, TurnAction::Play, now))
            }
            _ if self.pending_color.is_some() => Err(RejectReason::AwaitingColor),
            PlayerAction::PlayCard { index } => {
                let card = self.players[seat]
                    .hand
                    .get(index)
                    .ok_or(RejectReason::CardIndexOutOfRange)?;
                if !self.is_legal(card) {
                    return Err(RejectReason::IllegalCard);
                }
                let Some(card) = self.players[seat].hand.remove_at(index) else {
                    return Err(RejectReason::CardIndexOutOfRange);
                };
                self.players[seat].last_active_at = now;
                Ok(self.play_card(seat, card, now))
            }
            PlayerAction::DrawCard => {
                self.players[seat].last_active_at = now;
                self.draw_into(seat);
                Ok(self.finish_turn(seat, TurnAction::Draw, now))
            }
        }
    }

    /// The action the bot policy takes when a synthetic seat holds the turn.
    pub fn synthetic_action(&self) -> Option<(ParticipantId, PlayerAction)> {
        if self.pending_color.is_some() {
            return None;
        }
        let seat = self.current_participant()?;
        if !seat.kind.is_synthetic() {
            return None;
        }
        Some((
            seat.id.clone(),
            bot::choose_action(&seat.hand, self.discard_pile.top()),
        ))
    }

    /// Removes a seat mid-game. Returns `None` when nothing changed.
    pub fn evict(&mut self, participant_id: &str, now: DateTime<Utc>) -> Option<Advance> {
        if self.status != TableStatus::Started {
            return None;
        }
        let mut seat = self.seat_of(participant_id)?;

        if self.pending_color.as_deref() == Some(participant_id) {
            self.pending_color = None;
            let color = self.random_color();
            self.apply_color(seat, color);
            if let ended @ Advance::Ended { .. } = self.finish_turn(seat, TurnAction::Play, now) {
                return Some(ended);
            }
            seat = self.seat_of(participant_id)?;
        }

        let holder = self.current_participant_id();
        let mut removed = self.players.remove(seat);
        if seat < self.current {
            self.current -= 1;
        }
        if self.current >= self.players.len() {
            self.current = 0;
        }
        for card in removed.hand.take_all() {
            self.draw_pile.insert_bottom(card);
        }
        if removed.is_human() {
            self.forfeits.push(removed.id.clone());
        }

        let kicked = Notification::Kicked {
            table_id: self.id.clone(),
            participant_id: removed.id.clone(),
            display_name: removed.display_name.clone(),
        };
        self.outbox.push(Outbound::everyone(kicked.clone()));
        self.outbox.push(Outbound::only(removed.recipient(), kicked));
        info!(
            table_id = %self.id,
            participant_id = %removed.id,
            remaining = self.players.len(),
            "participant evicted"
        );

        let humans_left = self.players.iter().filter(|seat| seat.is_human()).count();
        if self.players.len() <= 1 || humans_left == 0 {
            let winner = self.players.first().map(|seat| seat.id.clone());
            return Some(self.end_game(winner));
        }
        self.mark_turn_start(holder.as_deref(), now);
        Some(self.finish_turn(self.current, TurnAction::Kick, now))
    }

    /// Warns the human holding the turn once idle past `warn_after` and evicts
    /// them past `kick_after`. Seats waiting for their turn are never swept.
    pub fn sweep_idle(
        &mut self,
        now: DateTime<Utc>,
        warn_after: chrono::Duration,
        kick_after: chrono::Duration,
    ) -> IdleSweep {
        let mut sweep = IdleSweep::default();
        if self.status != TableStatus::Started {
            return sweep;
        }

        let Some((participant_id, idle_for)) = self
            .current_participant()
            .filter(|seat| seat.is_human())
            .map(|seat| (seat.id.clone(), now - seat.last_active_at))
        else {
            return sweep;
        };

        if idle_for >= kick_after {
            if self.evict(&participant_id, now).is_some() {
                sweep.evicted.push(participant_id);
            }
        } else if idle_for >= warn_after {
            let seconds_left = (kick_after - idle_for).num_seconds().max(0);
            self.outbox.push(Outbound::only(
                Recipient::human(participant_id.clone()),
                Notification::IdleWarning {
                    table_id: self.id.clone(),
                    seconds_left,
                },
            ));
            sweep.warned.push(participant_id);
        }
        sweep
    }

    /// Aborts a running game without a winner.
    pub fn cancel(&mut self, reason: &str) -> bool {
        if self.status != TableStatus::Started {
            return false;
        }
        self.status = TableStatus::Cancelled;
        self.pending_color = None;
        self.outbox.push(Outbound::everyone(Notification::GameCancelled {
            table_id: self.id.clone(),
            reason: reason.to_string(),
        }));
        info!(table_id = %self.id, reason = %reason, "game cancelled");
        true
    }

    /// Stats rows for a finished game. Synthetic seats are not recorded.
    pub fn results(&self) -> Vec<(ParticipantId, MatchResult)> {
        if self.status != TableStatus::Ended {
            return Vec::new();
        }
        let mut results: Vec<(ParticipantId, MatchResult)> = self
            .players
            .iter()
            .filter(|seat| seat.is_human())
            .map(|seat| {
                let result = if self.winner.as_deref() == Some(seat.id.as_str()) {
                    MatchResult::Win
                } else {
                    MatchResult::Loss
                };
                (seat.id.clone(), result)
            })
            .collect();
        results.extend(
            self.forfeits
                .iter()
                .map(|participant_id| (participant_id.clone(), MatchResult::Loss)),
        );
        results
    }

    pub fn summary(&self) -> TableSummary {
        let current = self.current_participant().map(|seat| seat.id.as_str());
        TableSummary {
            table_id: self.id.clone(),
            status: self.status,
            seats: self
                .players
                .iter()
                .map(|seat| SeatSummary {
                    participant_id: seat.id.clone(),
                    display_name: seat.display_name.clone(),
                    kind: seat.kind,
                    card_count: seat.hand.len(),
                    current: current == Some(seat.id.as_str()),
                })
                .collect(),
            draw_pile_size: self.draw_pile.len(),
            discard_pile_size: self.discard_pile.len(),
            top_card: self.discard_pile.top().cloned(),
            awaiting_color_from: self.awaiting_color_from().map(str::to_string),
            winner: self.winner.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
        }
    }

    /// Read model for one seated participant, including their hand.
    pub fn view(&self, participant_id: &str) -> Option<TableView> {
        let seat = self.seat_of(participant_id)?;
        let on_turn = self.status == TableStatus::Started && seat == self.current;
        let owes_color = self.pending_color.as_deref() == Some(participant_id);
        let can_act = on_turn && self.pending_color.is_none();

        let cards = self.players[seat]
            .hand
            .iter()
            .enumerate()
            .map(|(index, card)| CardOption {
                index,
                card: card.clone(),
                playable: can_act && self.is_legal(card),
            })
            .collect();

        Some(TableView {
            participant_id: participant_id.to_string(),
            summary: self.summary(),
            legal_actions: LegalActions {
                cards,
                can_draw: can_act,
                color_choices: if owes_color {
                    PLAYABLE_COLORS.to_vec()
                } else {
                    Vec::new()
                },
            },
        })
    }

    fn is_legal(&self, card: &Card) -> bool {
        self.discard_pile
            .top()
            .is_none_or(|top| card.can_play_on(top))
    }

    fn play_card(&mut self, seat: usize, mut card: Card, now: DateTime<Utc>) -> Advance {
        card.overridden_color = None;
        let is_black = card.is_black();
        if card.rank == Rank::WildDrawFour {
            self.pending_pickup += 4;
        }
        debug!(
            table_id = %self.id,
            participant_id = %self.players[seat].id,
            card = %card,
            "card played"
        );
        self.discard_pile.push(card);

        if is_black {
            let seat_ref = &self.players[seat];
            if seat_ref.kind.is_synthetic() || seat_ref.hand.is_empty() {
                let color = self.random_color();
                self.apply_color(seat, color);
            } else {
                let recipient = seat_ref.recipient();
                let participant_id = seat_ref.id.clone();
                self.pending_color = Some(participant_id.clone());
                self.outbox.push(Outbound::only(
                    recipient,
                    Notification::ChooseColor {
                        table_id: self.id.clone(),
                        choices: PLAYABLE_COLORS.to_vec(),
                    },
                ));
                return Advance::AwaitingColor(participant_id);
            }
        }
        self.finish_turn(seat, TurnAction::Play, now)
    }

    fn apply_color(&mut self, seat: usize, color: Color) {
        if let Some(top) = self.discard_pile.top_mut() {
            top.overridden_color = Some(color);
        }
        self.outbox.push(Outbound::everyone(Notification::ColorChosen {
            table_id: self.id.clone(),
            participant_id: self.players[seat].id.clone(),
            color,
        }));
    }

    fn random_color(&mut self) -> Color {
        PLAYABLE_COLORS[self.rng.random_range(0..PLAYABLE_COLORS.len())]
    }

    /// Moves the turn pointer, resolves the discard top's effect for plays,
    /// applies pending pickups and checks for a winner.
    fn finish_turn(&mut self, actor: usize, action: TurnAction, now: DateTime<Utc>) -> Advance {
        let seats = self.players.len();
        if seats == 0 {
            return self.end_game(None);
        }
        let holder = self.current_participant_id();

        match action {
            TurnAction::Kick => {}
            TurnAction::Draw => self.current = (actor + 1) % seats,
            TurnAction::Start | TurnAction::Play => {
                match self.discard_pile.top().map(|card| card.rank) {
                    Some(Rank::Skip) => {
                        let skipped = (actor + 1) % seats;
                        self.outbox.push(Outbound::everyone(Notification::Skipped {
                            table_id: self.id.clone(),
                            participant_id: self.players[skipped].id.clone(),
                        }));
                        self.current = (actor + 2) % seats;
                    }
                    Some(Rank::Reverse) => {
                        self.players.reverse();
                        let actor = seats - 1 - actor;
                        self.current = if seats == 2 {
                            actor
                        } else {
                            (actor + 1) % seats
                        };
                        self.outbox.push(Outbound::everyone(Notification::OrderReversed {
                            table_id: self.id.clone(),
                        }));
                    }
                    Some(Rank::DrawTwo) => {
                        self.pending_pickup += 2;
                        self.current = (actor + 1) % seats;
                    }
                    _ => self.current = (actor + 1) % seats,
                }
            }
        }

        // A wild+4 owner still choosing keeps the pickup for the seat after them.
        if self.pending_pickup > 0 && self.pending_color.is_none() {
            let count = std::mem::take(&mut self.pending_pickup);
            let victim = self.current;
            for _ in 0..count {
                self.draw_into(victim);
            }
            self.outbox.push(Outbound::everyone(Notification::PickedUp {
                table_id: self.id.clone(),
                participant_id: self.players[victim].id.clone(),
                count,
            }));
        }

        if let Some(winner) = self
            .players
            .iter()
            .find(|seat| seat.hand.is_empty())
            .map(|seat| seat.id.clone())
        {
            return self.end_game(Some(winner));
        }
        self.mark_turn_start(holder.as_deref(), now);
        Advance::Continued
    }

    /// Restarts the idle clock of the seat now holding the turn, if it changed hands.
    fn mark_turn_start(&mut self, previous: Option<&str>, now: DateTime<Utc>) {
        if let Some(seat) = self.players.get_mut(self.current)
            && previous != Some(seat.id.as_str())
        {
            seat.last_active_at = now;
        }
    }

    fn end_game(&mut self, winner: Option<ParticipantId>) -> Advance {
        self.status = TableStatus::Ended;
        self.pending_color = None;
        self.pending_pickup = 0;
        self.winner = winner.clone();
        let winner_name = winner.as_deref().and_then(|winner_id| {
            self.players
                .iter()
                .find(|seat| seat.id == winner_id)
                .map(|seat| seat.display_name.clone())
        });
        self.outbox.push(Outbound::everyone(Notification::GameEnded {
            table_id: self.id.clone(),
            winner: winner.clone(),
            winner_name,
        }));
        info!(table_id = %self.id, winner = ?winner, "game ended");
        Advance::Ended { winner }
    }

    fn flip_onto_discard(&mut self) -> bool {
        match self.draw_pile.pop() {
            Some(card) => {
                self.discard_pile.push(card);
                true
            }
            None => false,
        }
    }

    fn draw_into(&mut self, seat: usize) {
        if self.draw_pile.is_empty() {
            self.recycle_discard();
        }
        match self.draw_pile.pop() {
            Some(card) => self.players[seat].hand.push(card),
            None => warn!(table_id = %self.id, "both piles exhausted; draw skipped"),
        }
    }

    /// Everything under the discard top goes back into the draw pile.
    fn recycle_discard(&mut self) {
        let Some(top) = self.discard_pile.pop() else {
            return;
        };
        let mut recycled: CardCollection = self
            .discard_pile
            .take_all()
            .into_iter()
            .map(|mut card| {
                card.overridden_color = None;
                card
            })
            .collect();
        self.discard_pile.push(top);
        if recycled.is_empty() {
            return;
        }
        recycled.shuffle(&mut self.rng);
        self.draw_pile.extend(recycled.take_all());
        self.outbox.push(Outbound::everyone(Notification::DeckReshuffled {
            table_id: self.id.clone(),
        }));
        debug!(table_id = %self.id, draw_pile = self.draw_pile.len(), "discard pile recycled");
    }
}

#[cfg(test)]
impl GameTable {
    /// A started table with hands and piles laid out by the caller. Seat 0 is current.
    pub fn rigged(
        id: &str,
        players: Vec<Participant>,
        draw_pile: Vec<Card>,
        discard_pile: Vec<Card>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut table = Self::with_rng(id, &[], false, 0, now, StdRng::seed_from_u64(11));
        table.players = players;
        table.draw_pile = draw_pile.into_iter().collect();
        table.discard_pile = discard_pile.into_iter().collect();
        table.status = TableStatus::Started;
        table.started_at = Some(now);
        table
    }

    pub fn set_current(&mut self, seat: usize) {
        self.current = seat;
    }

    pub fn pending_pickup(&self) -> usize {
        self.pending_pickup
    }

    pub fn top_card(&self) -> Option<&Card> {
        self.discard_pile.top()
    }

    /// Cards across both piles and every hand.
    pub fn card_count(&self) -> usize {
        self.draw_pile.len()
            + self.discard_pile.len()
            + self.players.iter().map(|seat| seat.hand.len()).sum::<usize>()
    }
}
