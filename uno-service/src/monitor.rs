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

use std::sync::Arc;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use uno_common::TableStatus;

use crate::{
    AppState,
    session::{self, TableHandle},
};

/// Per-table idle check. Exits once the table is finished or stopped.
pub async fn run_inactivity_monitor(state: AppState, handle: Arc<TableHandle>) {
    let mut stop_rx = handle.subscribe_stop();
    let mut ticker = tokio::time::interval(state.settings.inactivity_check_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    debug!(table_id = %handle.id(), "inactivity monitor started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_rx.changed() => break,
        }

        let (sweep, terminal) = {
            let mut table = handle.table.lock().await;
            let sweep = table.sweep_idle(
                Utc::now(),
                state.settings.idle_warn(),
                state.settings.idle_kick(),
            );
            (sweep, table.status().is_terminal())
        };

        if !sweep.is_empty() {
            info!(
                table_id = %handle.id(),
                warned = sweep.warned.len(),
                evicted = ?sweep.evicted,
                "inactivity sweep"
            );
            session::after_transition(&state, &handle).await;
        }
        if terminal {
            break;
        }
    }
    debug!(table_id = %handle.id(), "inactivity monitor stopped");
}

/// Re-sends every human's view on a fixed cadence while the game runs.
pub async fn run_refresh_loop(state: AppState, handle: Arc<TableHandle>) {
    let mut stop_rx = handle.subscribe_stop();
    let mut ticker = tokio::time::interval(state.settings.refresh_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_rx.changed() => break,
        }

        let status = handle.table.lock().await.status();
        match status {
            TableStatus::Started => session::publish(&state, &handle).await,
            status if status.is_terminal() => break,
            _ => {}
        }
    }
    debug!(table_id = %handle.id(), "refresh loop stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        settings::Settings,
        table::{GameTable, Participant},
    };
    use uno_common::{Card, Color, Notification, Rank};

    /// Humans all idle for `idle_for`, with the first one holding the turn.
    fn idle_table(id: &str, names: &[&str], idle_for: chrono::Duration) -> GameTable {
        let long_ago = Utc::now() - idle_for;
        let mut players = Vec::new();
        for &name in names {
            let mut participant = Participant::human(name, long_ago);
            participant.hand = vec![Card::new(Color::Yellow, Rank::Number(3)); 3]
                .into_iter()
                .collect();
            players.push(participant);
        }
        GameTable::rigged(
            id,
            players,
            vec![Card::new(Color::Yellow, Rank::Number(4)); 5],
            vec![Card::new(Color::Red, Rank::Number(5))],
            long_ago,
        )
    }

    fn quick_settings() -> Settings {
        Settings {
            inactivity_check_secs: 1,
            refresh_interval_secs: 1,
            ..Settings::instant()
        }
    }

    #[tokio::test]
    async fn monitor_evicts_stalling_turn_holder_and_concludes() {
        let (state, recorder) = AppState::for_tests(quick_settings());
        let handle = TableHandle::new(idle_table(
            "idle",
            &["alice", "bob"],
            chrono::Duration::seconds(120),
        ));
        state.registry.insert(handle.clone()).await;

        let monitor = tokio::spawn(run_inactivity_monitor(state.clone(), handle.clone()));
        tokio::time::timeout(Duration::from_secs(5), monitor)
            .await
            .expect("monitor exits once the table ends")
            .unwrap();

        let table = handle.table.lock().await;
        assert_eq!(table.status(), TableStatus::Ended);
        assert_eq!(table.players().len(), 1);
        assert_eq!(table.winner(), Some("bob"));
        assert!(state.registry.get("idle").await.is_none());

        let kicked = recorder.sent_to("alice");
        assert!(kicked.iter().any(|n| matches!(
            n,
            Notification::Kicked { participant_id, .. } if participant_id == "alice"
        )));
    }

    #[tokio::test]
    async fn monitor_warns_before_kicking() {
        let (state, recorder) = AppState::for_tests(quick_settings());
        let handle = TableHandle::new(idle_table(
            "warn",
            &["alice", "bob", "carol"],
            chrono::Duration::seconds(70),
        ));
        state.registry.insert(handle.clone()).await;

        let monitor = tokio::spawn(run_inactivity_monitor(state.clone(), handle.clone()));
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(handle.table.lock().await.status(), TableStatus::Started);
        assert!(recorder
            .sent_to("alice")
            .iter()
            .any(|n| matches!(n, Notification::IdleWarning { .. })));
        assert!(!recorder
            .sent_to("bob")
            .iter()
            .any(|n| matches!(n, Notification::IdleWarning { .. })));

        handle.table.lock().await.cancel("test over");
        session::conclude(&state, &handle).await;
        tokio::time::timeout(Duration::from_secs(5), monitor)
            .await
            .expect("monitor exits once the table is stopped")
            .unwrap();
    }

    #[tokio::test]
    async fn refresh_loop_pushes_views_until_stopped() {
        let (state, recorder) = AppState::for_tests(quick_settings());
        let handle = TableHandle::new(idle_table(
            "refresh",
            &["alice", "bob", "carol"],
            chrono::Duration::zero(),
        ));
        state.registry.insert(handle.clone()).await;

        let refresher = tokio::spawn(run_refresh_loop(state.clone(), handle.clone()));
        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert!(recorder
            .sent_to("carol")
            .iter()
            .any(|n| matches!(n, Notification::TableUpdate { .. })));

        handle.table.lock().await.cancel("test over");
        tokio::time::timeout(Duration::from_secs(3), refresher)
            .await
            .expect("refresh loop exits on terminal table")
            .unwrap();
    }
}
