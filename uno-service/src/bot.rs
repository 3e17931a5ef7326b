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

use std::time::Duration;

use rand::Rng;
use uno_common::{Card, CardCollection, PlayerAction};

/// First legal card in hand order, otherwise draw.
pub fn choose_action(hand: &CardCollection, top: Option<&Card>) -> PlayerAction {
    let Some(top) = top else {
        return PlayerAction::DrawCard;
    };
    hand.iter()
        .position(|card| card.can_play_on(top))
        .map(|index| PlayerAction::PlayCard { index })
        .unwrap_or(PlayerAction::DrawCard)
}

/// Pause before a synthetic seat acts so humans can follow the table.
pub fn think_delay(min_ms: u64, max_ms: u64) -> Duration {
    if max_ms <= min_ms {
        return Duration::from_millis(min_ms);
    }
    Duration::from_millis(rand::rng().random_range(min_ms..=max_ms))
}
