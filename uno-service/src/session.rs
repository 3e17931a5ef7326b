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

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::Utc;
use tokio::{
    sync::{Mutex, RwLock, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uno_common::{
    ActionResponse, Notification, ParticipantId, PlayerAction, RejectReason, TableId, TableStatus,
    TableSummary, TableView,
};

use crate::{
    AppState, bot,
    monitor::{run_inactivity_monitor, run_refresh_loop},
    notify::Recipient,
    table::{Advance, GameTable},
};

/// A live table plus the background tasks attached to it.
pub struct TableHandle {
    id: TableId,
    pub table: Mutex<GameTable>,
    /// Set while a task is playing synthetic turns. Only flipped under the table lock.
    bots_driving: AtomicBool,
    /// True once end-of-game stats are committed.
    bookkeeping: Mutex<bool>,
    stop_tx: watch::Sender<bool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl TableHandle {
    pub fn new(table: GameTable) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            id: table.id().to_string(),
            table: Mutex::new(table),
            bots_driving: AtomicBool::new(false),
            bookkeeping: Mutex::new(false),
            stop_tx,
            monitor: Mutex::new(None),
            refresher: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Starts the inactivity monitor unless one is already attached.
    pub async fn ensure_monitor(self: &Arc<Self>, state: &AppState) {
        let mut slot = self.monitor.lock().await;
        if slot.is_none() && !self.is_stopped() {
            *slot = Some(tokio::spawn(run_inactivity_monitor(
                state.clone(),
                Arc::clone(self),
            )));
        }
    }

    pub async fn ensure_refresher(self: &Arc<Self>, state: &AppState) {
        let mut slot = self.refresher.lock().await;
        if slot.is_none() && !self.is_stopped() {
            *slot = Some(tokio::spawn(run_refresh_loop(state.clone(), Arc::clone(self))));
        }
    }

    /// Signals every loop on this table to exit, then aborts them.
    async fn stop(&self) {
        self.stop_tx.send_replace(true);
        for slot in [&self.monitor, &self.refresher] {
            if let Some(join) = slot.lock().await.take() {
                join.abort();
            }
        }
    }
}

/// Live tables keyed by id.
#[derive(Default)]
pub struct SessionRegistry {
    tables: RwLock<HashMap<TableId, Arc<TableHandle>>>,
}

impl SessionRegistry {
    pub async fn insert(&self, handle: Arc<TableHandle>) {
        self.tables
            .write()
            .await
            .insert(handle.id().to_string(), handle);
    }

    pub async fn get(&self, table_id: &str) -> Option<Arc<TableHandle>> {
        self.tables.read().await.get(table_id).cloned()
    }

    pub async fn remove(&self, table_id: &str) -> Option<Arc<TableHandle>> {
        self.tables.write().await.remove(table_id)
    }

    pub async fn handles(&self) -> Vec<Arc<TableHandle>> {
        self.tables.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.len()
    }

    /// Humans seated at a table that has not finished.
    pub async fn seated_participants(&self) -> HashSet<ParticipantId> {
        let mut seated = HashSet::new();
        for handle in self.handles().await {
            let table = handle.table.lock().await;
            if !table.status().is_terminal() {
                seated.extend(table.human_ids());
            }
        }
        seated
    }

    pub async fn summaries(&self) -> Vec<TableSummary> {
        let mut summaries = Vec::new();
        for handle in self.handles().await {
            summaries.push(handle.table.lock().await.summary());
        }
        summaries.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.table_id.cmp(&right.table_id))
        });
        summaries
    }
}

/// Runs a freshly set-up table: announce, wait the start delay, start.
pub fn launch(state: &AppState, handle: Arc<TableHandle>) {
    let state = state.clone();
    tokio::spawn(async move {
        let mut stop_rx = handle.subscribe_stop();
        handle.ensure_monitor(&state).await;
        publish(&state, &handle).await;

        tokio::select! {
            _ = tokio::time::sleep(state.settings.start_delay()) => {}
            _ = stop_rx.changed() => {
                debug!(table_id = %handle.id(), "table stopped before start");
                return;
            }
        }

        let started = handle.table.lock().await.start(Utc::now()).is_some();
        if !started {
            warn!(table_id = %handle.id(), "table was not ready to start");
            return;
        }
        handle.ensure_refresher(&state).await;
        after_transition(&state, &handle).await;
    });
}

/// Delivers the outbox and pushes fresh views to every seated human.
pub async fn publish(state: &AppState, handle: &TableHandle) {
    let (roster, outbox, views) = {
        let mut table = handle.table.lock().await;
        let outbox = table.take_outbox();
        let views: Vec<TableView> = if table.status() == TableStatus::Started {
            table
                .human_ids()
                .iter()
                .filter_map(|participant_id| table.view(participant_id))
                .collect()
        } else {
            Vec::new()
        };
        (table.roster(), outbox, views)
    };

    state.courier.dispatch(&roster, outbox).await;
    for view in views {
        let recipient = Recipient::human(view.participant_id.clone());
        state
            .courier
            .deliver(
                &recipient,
                &Notification::TableUpdate {
                    view: Box::new(view),
                },
            )
            .await;
    }
}

/// Follow-up after any state change: publish, then either conclude the game
/// or hand the turn to synthetic seats.
pub async fn after_transition(state: &AppState, handle: &Arc<TableHandle>) {
    publish(state, handle).await;

    let (terminal, spawn_driver) = {
        let table = handle.table.lock().await;
        let terminal = table.status().is_terminal();
        let spawn_driver = !terminal
            && table.synthetic_action().is_some()
            && !handle.bots_driving.swap(true, Ordering::SeqCst);
        (terminal, spawn_driver)
    };

    if terminal {
        conclude(state, handle).await;
    } else if spawn_driver {
        tokio::spawn(drive_synthetic_turns(state.clone(), Arc::clone(handle)));
    }
}

/// Plays consecutive synthetic turns until a human holds the turn or the game ends.
async fn drive_synthetic_turns(state: AppState, handle: Arc<TableHandle>) {
    let mut stop_rx = handle.subscribe_stop();
    loop {
        let delay = bot::think_delay(
            state.settings.bot_think_min_ms,
            state.settings.bot_think_max_ms,
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop_rx.changed() => {
                handle.bots_driving.store(false, Ordering::SeqCst);
                return;
            }
        }

        let advance = {
            let mut table = handle.table.lock().await;
            let Some((actor, action)) = table.synthetic_action() else {
                handle.bots_driving.store(false, Ordering::SeqCst);
                return;
            };
            match table.submit(&actor, action, Utc::now()) {
                Ok(advance) => advance,
                Err(reason) => {
                    warn!(
                        table_id = %handle.id(),
                        participant_id = %actor,
                        reason = %reason,
                        "synthetic action rejected"
                    );
                    handle.bots_driving.store(false, Ordering::SeqCst);
                    return;
                }
            }
        };

        publish(&state, &handle).await;
        if let Advance::Ended { .. } = advance {
            handle.bots_driving.store(false, Ordering::SeqCst);
            conclude(&state, &handle).await;
            return;
        }
    }
}

pub async fn submit_action(
    state: &AppState,
    table_id: &str,
    participant_id: &str,
    action: PlayerAction,
) -> ActionResponse {
    let Some(handle) = state.registry.get(table_id).await else {
        return ActionResponse::rejected(RejectReason::TableNotFound);
    };

    let outcome = {
        let mut table = handle.table.lock().await;
        table
            .submit(participant_id, action, Utc::now())
            .map(|advance| (advance, table.status(), table.current_participant_id()))
    };

    match outcome {
        Ok((advance, status, current_participant_id)) => {
            debug!(
                table_id = %table_id,
                participant_id = %participant_id,
                advance = ?advance,
                "action applied"
            );
            after_transition(state, &handle).await;
            ActionResponse {
                accepted: true,
                reason: None,
                status: Some(status),
                current_participant_id,
            }
        }
        Err(reason) => {
            debug!(
                table_id = %table_id,
                participant_id = %participant_id,
                reason = %reason,
                "action rejected"
            );
            ActionResponse::rejected(reason)
        }
    }
}

pub async fn render(
    state: &AppState,
    table_id: &str,
    participant_id: &str,
) -> Result<TableView, RejectReason> {
    let handle = state
        .registry
        .get(table_id)
        .await
        .ok_or(RejectReason::TableNotFound)?;
    let table = handle.table.lock().await;
    table
        .view(participant_id)
        .ok_or(RejectReason::ParticipantNotSeated)
}

/// End-of-game bookkeeping. Returns false while stats could not be written;
/// the matchmaking reap retries those tables.
pub async fn conclude(state: &AppState, handle: &Arc<TableHandle>) -> bool {
    {
        let mut recorded = handle.bookkeeping.lock().await;
        if !*recorded {
            let (status, results, winner) = {
                let table = handle.table.lock().await;
                (
                    table.status(),
                    table.results(),
                    table.winner().map(str::to_string),
                )
            };
            if !status.is_terminal() {
                return false;
            }
            if !results.is_empty()
                && let Err(error) = state.stats.record_results(&results).await
            {
                warn!(
                    table_id = %handle.id(),
                    error = %error,
                    "failed to record game results; will retry"
                );
                return false;
            }
            *recorded = true;
            info!(
                table_id = %handle.id(),
                status = ?status,
                winner = ?winner,
                recorded = results.len(),
                "table concluded"
            );
        }
    }

    state.registry.remove(handle.id()).await;
    handle.stop().await;
    true
}

/// Cancels every running table. Called once the server stops accepting requests.
pub async fn shutdown(state: &AppState) {
    for handle in state.registry.handles().await {
        let cancelled = handle.table.lock().await.cancel("service shutting down");
        if cancelled {
            after_transition(state, &handle).await;
        } else {
            handle.stop().await;
        }
    }
    info!("all tables stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        settings::Settings,
        store::{StatsStore, testing::FlakyStatsStore},
        table::Participant,
    };
    use uno_common::{Card, Color, Rank};

    fn num(color: Color, value: u8) -> Card {
        Card::new(color, Rank::Number(value))
    }

    fn hand(cards: Vec<Card>) -> uno_common::CardCollection {
        cards.into_iter().collect()
    }

    fn two_humans(id: &str, alice: Vec<Card>, bob: Vec<Card>) -> GameTable {
        seated(id, [("alice", alice), ("bob", bob)])
    }

    fn seated<const N: usize>(id: &str, seats: [(&str, Vec<Card>); N]) -> GameTable {
        let now = Utc::now();
        let players = seats
            .into_iter()
            .map(|(participant_id, cards)| {
                let mut participant = Participant::human(participant_id, now);
                participant.hand = hand(cards);
                participant
            })
            .collect();
        GameTable::rigged(
            id,
            players,
            vec![num(Color::Yellow, 1); 10],
            vec![num(Color::Red, 5)],
            now,
        )
    }

    async fn wait_for<F>(handle: &TableHandle, mut done: F)
    where
        F: FnMut(&GameTable) -> bool,
    {
        for _ in 0..500 {
            if done(&*handle.table.lock().await) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("table {} never reached expected state", handle.id());
    }

    #[tokio::test]
    async fn launched_table_announces_then_starts() {
        let (state, recorder) = AppState::for_tests(Settings::instant());
        let mut table = GameTable::new(
            "launch",
            &["alice".to_string(), "bob".to_string()],
            false,
            7,
            Utc::now(),
        );
        table.setup(Utc::now());
        let handle = TableHandle::new(table);
        state.registry.insert(handle.clone()).await;

        launch(&state, handle.clone());
        wait_for(&handle, |table| table.status() == TableStatus::Started).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let alice = recorder.sent_to("alice");
        assert!(matches!(alice[0], Notification::TableFormed { .. }));
        assert!(alice.iter().any(|n| matches!(n, Notification::GameStarted { .. })));
        assert!(alice.iter().any(|n| matches!(n, Notification::TableUpdate { .. })));
        assert!(handle.monitor.lock().await.is_some());
        assert!(handle.refresher.lock().await.is_some());
    }

    #[tokio::test]
    async fn synthetic_turns_chain_until_a_human_acts() {
        let (state, _recorder) = AppState::for_tests(Settings::instant());
        let mut table = GameTable::new("chain", &["solo".to_string()], true, 7, Utc::now());
        table.setup(Utc::now());
        let handle = TableHandle::new(table);
        state.registry.insert(handle.clone()).await;

        launch(&state, handle.clone());
        wait_for(&handle, |table| {
            table.status().is_terminal()
                || (table.status() == TableStatus::Started
                    && table
                        .current_participant()
                        .is_some_and(|seat| seat.is_human()))
        })
        .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let table = handle.table.lock().await;
        assert!(table.status().is_terminal() || !handle.bots_driving.load(Ordering::SeqCst));
        assert!(table.status().is_terminal() || table.awaiting_color_from().is_none());
    }

    #[tokio::test]
    async fn submit_and_render_report_lookup_failures() {
        let (state, _recorder) = AppState::for_tests(Settings::instant());
        let response = submit_action(&state, "missing", "alice", PlayerAction::DrawCard).await;
        assert!(!response.accepted);
        assert_eq!(response.reason, Some(RejectReason::TableNotFound));

        let handle = TableHandle::new(two_humans(
            "t",
            vec![num(Color::Red, 1)],
            vec![num(Color::Blue, 2)],
        ));
        state.registry.insert(handle).await;
        assert_eq!(
            render(&state, "t", "ghost").await.unwrap_err(),
            RejectReason::ParticipantNotSeated
        );
        assert_eq!(
            render(&state, "t", "alice").await.unwrap().legal_actions.playable_indices(),
            vec![0]
        );
    }

    #[tokio::test]
    async fn accepted_action_reports_next_participant() {
        let (state, recorder) = AppState::for_tests(Settings::instant());
        let handle = TableHandle::new(two_humans(
            "t",
            vec![num(Color::Red, 1), num(Color::Red, 2)],
            vec![num(Color::Blue, 1)],
        ));
        state.registry.insert(handle).await;

        let response =
            submit_action(&state, "t", "alice", PlayerAction::PlayCard { index: 0 }).await;
        assert!(response.accepted);
        assert_eq!(response.status, Some(TableStatus::Started));
        assert_eq!(response.current_participant_id.as_deref(), Some("bob"));
        assert!(recorder
            .sent_to("bob")
            .iter()
            .any(|n| matches!(n, Notification::TableUpdate { .. })));

        let rejected = submit_action(&state, "t", "alice", PlayerAction::DrawCard).await;
        assert_eq!(rejected.reason, Some(RejectReason::NotYourTurn));
    }

    #[tokio::test]
    async fn winning_play_records_stats_and_unregisters() {
        let (state, recorder) = AppState::for_tests(Settings::instant());
        let handle = TableHandle::new(two_humans(
            "t",
            vec![num(Color::Red, 1)],
            vec![num(Color::Blue, 1)],
        ));
        state.registry.insert(handle.clone()).await;

        let response =
            submit_action(&state, "t", "alice", PlayerAction::PlayCard { index: 0 }).await;
        assert_eq!(response.status, Some(TableStatus::Ended));
        assert!(state.registry.get("t").await.is_none());
        assert!(handle.is_stopped());

        let alice = state.stats.get("alice").await.unwrap();
        let bob = state.stats.get("bob").await.unwrap();
        assert_eq!((alice.wins, alice.losses), (1, 0));
        assert_eq!((bob.wins, bob.losses), (0, 1));
        assert!(recorder
            .sent_to("bob")
            .iter()
            .any(|n| matches!(n, Notification::GameEnded { winner: Some(w), .. } if w == "alice")));
    }

    #[tokio::test]
    async fn failed_stats_write_keeps_table_for_retry() {
        let stats = Arc::new(FlakyStatsStore::default());
        stats.fail_writes.store(true, Ordering::SeqCst);
        let (mut state, _recorder) = AppState::for_tests(Settings::instant());
        state.stats = stats.clone();

        let handle = TableHandle::new(two_humans(
            "t",
            vec![num(Color::Red, 1)],
            vec![num(Color::Blue, 1)],
        ));
        state.registry.insert(handle.clone()).await;
        submit_action(&state, "t", "alice", PlayerAction::PlayCard { index: 0 }).await;

        assert!(state.registry.get("t").await.is_some());
        assert!(!conclude(&state, &handle).await);

        stats.fail_writes.store(false, Ordering::SeqCst);
        assert!(conclude(&state, &handle).await);
        assert!(state.registry.get("t").await.is_none());
        assert!(conclude(&state, &handle).await);

        let alice = state.stats.get("alice").await.unwrap();
        assert_eq!((alice.wins, alice.losses), (1, 0));
    }

    #[tokio::test]
    async fn shutdown_cancels_running_tables() {
        let (state, recorder) = AppState::for_tests(Settings::instant());
        let handle = TableHandle::new(two_humans(
            "t",
            vec![num(Color::Red, 1)],
            vec![num(Color::Blue, 2)],
        ));
        state.registry.insert(handle.clone()).await;

        shutdown(&state).await;

        assert_eq!(handle.table.lock().await.status(), TableStatus::Cancelled);
        assert_eq!(state.registry.len().await, 0);
        assert!(recorder
            .sent_to("alice")
            .iter()
            .any(|n| matches!(n, Notification::GameCancelled { .. })));
        let alice = state.stats.get("alice").await.unwrap();
        assert_eq!(alice.games_played(), 0);
    }

    #[tokio::test]
    async fn seated_participants_skip_finished_tables() {
        let (state, _recorder) = AppState::for_tests(Settings::instant());
        state
            .registry
            .insert(TableHandle::new(two_humans(
                "live",
                vec![num(Color::Red, 1)],
                vec![num(Color::Blue, 2)],
            )))
            .await;
        let finished = TableHandle::new(two_humans(
            "done",
            vec![num(Color::Red, 1)],
            vec![num(Color::Blue, 2)],
        ));
        finished.table.lock().await.cancel("test");
        state.registry.insert(finished).await;

        let participants = state.registry.seated_participants().await;
        assert_eq!(participants.len(), 2);
        assert!(participants.contains("alice"));
        assert!(!participants.contains("carol"));
        assert_eq!(state.registry.summaries().await.len(), 2);
    }
}
