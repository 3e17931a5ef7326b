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

use std::{fmt, sync::LazyLock};

use chrono::{DateTime, Utc};
use rand::{Rng, seq::SliceRandom};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DECK_SIZE: usize = 108;
pub const DEFAULT_HAND_SIZE: usize = 7;
pub const MAX_HAND_SIZE: usize = 14;
/// Seats at a table after synthetic fill.
pub const MAX_SEATS: usize = 7;
pub const MIN_HUMANS_PER_TABLE: usize = 2;
pub const DEFAULT_TABLE_SIZE: usize = 2;
pub const DEFAULT_LEADERBOARD_LIMIT: usize = 10;
/// Advertised wait per participant already in the queue.
pub const ESTIMATED_WAIT_PER_ENTRY_SECS: u64 = 5;

/// Colors a wild card may be switched to.
pub const PLAYABLE_COLORS: [Color; 4] = [Color::Red, Color::Yellow, Color::Green, Color::Blue];

pub type ParticipantId = String;
pub type TableId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Color {
    Red,
    Yellow,
    Green,
    Blue,
    Black,
}

impl Color {
    pub fn is_black(self) -> bool {
        self == Color::Black
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Color::Red => "red",
            Color::Yellow => "yellow",
            Color::Green => "green",
            Color::Blue => "blue",
            Color::Black => "black",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Rank {
    Number(u8),
    Skip,
    Reverse,
    DrawTwo,
    Wild,
    WildDrawFour,
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rank::Number(value) => write!(f, "{value}"),
            Rank::Skip => f.write_str("skip"),
            Rank::Reverse => f.write_str("reverse"),
            Rank::DrawTwo => f.write_str("+2"),
            Rank::Wild => f.write_str("wild"),
            Rank::WildDrawFour => f.write_str("wild+4"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Card {
    pub color: Color,
    pub rank: Rank,
    /// Set once when a black card is played.
    #[serde(default)]
    pub overridden_color: Option<Color>,
}

impl Card {
    pub fn new(color: Color, rank: Rank) -> Self {
        Self {
            color,
            rank,
            overridden_color: None,
        }
    }

    pub fn is_black(&self) -> bool {
        self.color.is_black()
    }

    /// The color legality checks compare against.
    pub fn effective_color(&self) -> Color {
        match self.overridden_color {
            Some(color) if self.is_black() => color,
            _ => self.color,
        }
    }

    /// Whether this card may be laid on `top`, ignoring whose turn it is.
    pub fn can_play_on(&self, top: &Card) -> bool {
        self.is_black() || self.color == top.effective_color() || self.rank == top.rank
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.effective_color(), self.rank)
    }
}

/// Ordered pile of cards. The end of the sequence is the top.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CardCollection {
    cards: Vec<Card>,
}

impl CardCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// The 108-card deck in a fixed, unshuffled order.
    pub fn standard_deck() -> Self {
        let mut cards = Vec::with_capacity(DECK_SIZE);
        for color in PLAYABLE_COLORS {
            cards.push(Card::new(color, Rank::Number(0)));
            for value in 1..=9 {
                cards.push(Card::new(color, Rank::Number(value)));
                cards.push(Card::new(color, Rank::Number(value)));
            }
            for rank in [Rank::Skip, Rank::Reverse, Rank::DrawTwo] {
                cards.push(Card::new(color, rank));
                cards.push(Card::new(color, rank));
            }
        }
        for _ in 0..4 {
            cards.push(Card::new(Color::Black, Rank::Wild));
            cards.push(Card::new(Color::Black, Rank::WildDrawFour));
        }
        Self { cards }
    }

    pub fn push(&mut self, card: Card) {
        self.cards.push(card);
    }

    pub fn pop(&mut self) -> Option<Card> {
        self.cards.pop()
    }

    /// Slides a card under the whole pile.
    pub fn insert_bottom(&mut self, card: Card) {
        self.cards.insert(0, card);
    }

    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.cards.shuffle(rng);
    }

    /// Removes the first card equal to `card`.
    pub fn remove(&mut self, card: &Card) -> bool {
        match self.cards.iter().position(|held| held == card) {
            Some(index) => {
                self.cards.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn remove_at(&mut self, index: usize) -> Option<Card> {
        (index < self.cards.len()).then(|| self.cards.remove(index))
    }

    pub fn contains(&self, card: &Card) -> bool {
        self.cards.contains(card)
    }

    pub fn get(&self, index: usize) -> Option<&Card> {
        self.cards.get(index)
    }

    pub fn top(&self) -> Option<&Card> {
        self.cards.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Card> {
        self.cards.last_mut()
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Card> {
        self.cards.iter()
    }

    /// Empties the pile, returning its cards bottom first.
    pub fn take_all(&mut self) -> Vec<Card> {
        std::mem::take(&mut self.cards)
    }

    pub fn extend(&mut self, cards: impl IntoIterator<Item = Card>) {
        self.cards.extend(cards);
    }
}

impl<'a> IntoIterator for &'a CardCollection {
    type Item = &'a Card;
    type IntoIter = std::slice::Iter<'a, Card>;

    fn into_iter(self) -> Self::IntoIter {
        self.cards.iter()
    }
}

impl FromIterator<Card> for CardCollection {
    fn from_iter<I: IntoIterator<Item = Card>>(iter: I) -> Self {
        Self {
            cards: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SeatKind {
    Human,
    Synthetic,
}

impl SeatKind {
    pub fn is_synthetic(self) -> bool {
        self == SeatKind::Synthetic
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableStatus {
    Waiting,
    Setup,
    Ready,
    Started,
    Ended,
    Cancelled,
}

impl TableStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TableStatus::Ended | TableStatus::Cancelled)
    }
}

/// Actions a seated participant may submit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerAction {
    PlayCard { index: usize },
    DrawCard,
    ChooseColor { color: Color },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    TableNotFound,
    TableNotStarted,
    TableClosed,
    ParticipantNotSeated,
    NotYourTurn,
    AwaitingColor,
    NoColorPending,
    InvalidColor,
    CardIndexOutOfRange,
    IllegalCard,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RejectReason::TableNotFound => "TABLE_NOT_FOUND",
            RejectReason::TableNotStarted => "TABLE_NOT_STARTED",
            RejectReason::TableClosed => "TABLE_CLOSED",
            RejectReason::ParticipantNotSeated => "PARTICIPANT_NOT_SEATED",
            RejectReason::NotYourTurn => "NOT_YOUR_TURN",
            RejectReason::AwaitingColor => "AWAITING_COLOR",
            RejectReason::NoColorPending => "NO_COLOR_PENDING",
            RejectReason::InvalidColor => "INVALID_COLOR",
            RejectReason::CardIndexOutOfRange => "CARD_INDEX_OUT_OF_RANGE",
            RejectReason::IllegalCard => "ILLEGAL_CARD",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitActionRequest {
    pub participant_id: ParticipantId,
    pub action: PlayerAction,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionResponse {
    pub accepted: bool,
    pub reason: Option<RejectReason>,
    pub status: Option<TableStatus>,
    pub current_participant_id: Option<ParticipantId>,
}

impl ActionResponse {
    pub fn rejected(reason: RejectReason) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
            status: None,
            current_participant_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeatSummary {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub kind: SeatKind,
    pub card_count: usize,
    pub current: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSummary {
    pub table_id: TableId,
    pub status: TableStatus,
    pub seats: Vec<SeatSummary>,
    pub draw_pile_size: usize,
    pub discard_pile_size: usize,
    pub top_card: Option<Card>,
    pub awaiting_color_from: Option<ParticipantId>,
    pub winner: Option<ParticipantId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CardOption {
    pub index: usize,
    pub card: Card,
    pub playable: bool,
}

/// What the viewer may do right now. Everything is disabled unless the
/// viewer holds the current seat.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LegalActions {
    pub cards: Vec<CardOption>,
    pub can_draw: bool,
    pub color_choices: Vec<Color>,
}

impl LegalActions {
    pub fn playable_indices(&self) -> Vec<usize> {
        self.cards
            .iter()
            .filter(|option| option.playable)
            .map(|option| option.index)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableView {
    pub participant_id: ParticipantId,
    pub summary: TableSummary,
    pub legal_actions: LegalActions,
}

/// Messages pushed to participants through the notifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// Sent before queueing to confirm the participant can be reached.
    DeliveryCheck,
    QueueExpired {
        waited_seconds: i64,
    },
    TableFormed {
        table_id: TableId,
        participants: Vec<String>,
    },
    GameStarted {
        table_id: TableId,
    },
    TableUpdate {
        view: Box<TableView>,
    },
    ChooseColor {
        table_id: TableId,
        choices: Vec<Color>,
    },
    ColorChosen {
        table_id: TableId,
        participant_id: ParticipantId,
        color: Color,
    },
    Skipped {
        table_id: TableId,
        participant_id: ParticipantId,
    },
    OrderReversed {
        table_id: TableId,
    },
    PickedUp {
        table_id: TableId,
        participant_id: ParticipantId,
        count: usize,
    },
    DeckReshuffled {
        table_id: TableId,
    },
    IdleWarning {
        table_id: TableId,
        seconds_left: i64,
    },
    Kicked {
        table_id: TableId,
        participant_id: ParticipantId,
        display_name: String,
    },
    GameEnded {
        table_id: TableId,
        winner: Option<ParticipantId>,
        winner_name: Option<String>,
    },
    GameCancelled {
        table_id: TableId,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueEntry {
    pub participant_id: ParticipantId,
    pub wants_bot_fill: bool,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub participant_id: ParticipantId,
    /// Defaults to true, matching the search command's default.
    #[serde(default)]
    pub wants_bot_fill: Option<bool>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JoinOutcome {
    Joined,
    Left,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueStatus {
    pub waiting: usize,
    pub estimated_wait_secs: u64,
}

impl QueueStatus {
    pub fn for_waiting(waiting: usize) -> Self {
        Self {
            waiting,
            estimated_wait_secs: waiting as u64 * ESTIMATED_WAIT_PER_ENTRY_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinResponse {
    pub participant_id: ParticipantId,
    pub outcome: JoinOutcome,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchResult {
    Win,
    Loss,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerStats {
    pub participant_id: ParticipantId,
    pub wins: u64,
    pub losses: u64,
}

impl PlayerStats {
    pub fn empty(participant_id: impl Into<ParticipantId>) -> Self {
        Self {
            participant_id: participant_id.into(),
            wins: 0,
            losses: 0,
        }
    }

    pub fn games_played(&self) -> u64 {
        self.wins + self.losses
    }

    /// Laplace-smoothed win/loss ratio; never divides by zero.
    pub fn ratio(&self) -> f64 {
        (self.wins as f64 + 1.0) / (self.losses as f64 + 1.0)
    }

    pub fn win_percentage(&self) -> Option<f64> {
        let played = self.games_played();
        (played > 0).then(|| self.wins as f64 * 100.0 / played as f64)
    }
}

/// Matchmaking rank for a participant; missing stats rank as a fresh player.
pub fn ranking_ratio(stats: Option<&PlayerStats>) -> f64 {
    stats.map(PlayerStats::ratio).unwrap_or(1.0)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsResponse {
    pub participant_id: ParticipantId,
    pub wins: u64,
    pub losses: u64,
    pub games_played: u64,
    pub win_ratio: f64,
    pub win_percentage: Option<f64>,
}

impl From<PlayerStats> for StatsResponse {
    fn from(stats: PlayerStats) -> Self {
        Self {
            games_played: stats.games_played(),
            win_ratio: stats.ratio(),
            win_percentage: stats.win_percentage(),
            participant_id: stats.participant_id,
            wins: stats.wins,
            losses: stats.losses,
        }
    }
}

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is a valid regex")
});

/// Replace `${VAR_NAME}` patterns in a string with values from environment variables.
/// Unknown or unset variables are replaced with an empty string.
pub fn expand_env_vars(input: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .into_owned()
}
