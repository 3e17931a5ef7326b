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

use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{debug, info, warn};
use uno_common::{
    MIN_HUMANS_PER_TABLE, Notification, ParticipantId, PlayerStats, QueueEntry, TableId,
    ranking_ratio,
};
use uuid::Uuid;

use crate::{
    AppState,
    notify::Recipient,
    session::{self, TableHandle},
    table::GameTable,
};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub reaped: usize,
    pub expired: Vec<ParticipantId>,
    pub deduplicated: Vec<ParticipantId>,
    pub tables_created: Vec<TableId>,
}

pub async fn run_matchmaking_loop(state: AppState, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(state.settings.matchmaking_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        interval_secs = state.settings.matchmaking_interval_secs,
        table_size = state.settings.table_size,
        "matchmaking loop started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_rx.changed() => break,
        }

        match matchmaking_tick(&state, Utc::now()).await {
            Ok(report) if report != TickReport::default() => {
                let live_tables = state.registry.len().await;
                info!(
                    live_tables,
                    reaped = report.reaped,
                    expired = report.expired.len(),
                    deduplicated = report.deduplicated.len(),
                    tables_created = ?report.tables_created,
                    "matchmaking tick"
                );
            }
            Ok(_) => {}
            Err(error) => warn!(error = %format!("{error:#}"), "matchmaking tick failed"),
        }
    }
    info!("matchmaking loop stopped");
}

/// One scheduling pass: reap finished tables, expire and de-duplicate the
/// queue, then form at most one table per partition.
pub async fn matchmaking_tick(state: &AppState, now: DateTime<Utc>) -> anyhow::Result<TickReport> {
    let mut report = TickReport {
        reaped: reap_finished_tables(state).await,
        ..TickReport::default()
    };

    let entries = state
        .queue
        .entries()
        .await
        .context("failed to read matchmaking queue")?;

    let stale_after = state.settings.queue_stale_after();
    let seated = state.registry.seated_participants().await;
    let mut waiting = Vec::new();
    let mut stale = Vec::new();
    for entry in entries {
        if now - entry.joined_at > stale_after {
            stale.push(entry);
        } else if seated.contains(&entry.participant_id) {
            report.deduplicated.push(entry.participant_id);
        } else {
            waiting.push(entry);
        }
    }

    let waiting_ids: Vec<ParticipantId> = waiting
        .iter()
        .map(|entry| entry.participant_id.clone())
        .collect();
    let groups = match state.stats.get_many(&waiting_ids).await {
        Ok(stats) => form_groups(
            waiting,
            &stats,
            state.settings.table_size,
            state.settings.solo_participant_id.as_deref(),
        ),
        Err(error) => {
            warn!(error = %error, "failed to read stats; skipping table formation");
            Vec::new()
        }
    };

    let mut removals: Vec<ParticipantId> = stale
        .iter()
        .map(|entry| entry.participant_id.clone())
        .chain(report.deduplicated.iter().cloned())
        .collect();
    let mut created = Vec::with_capacity(groups.len());
    for (humans, synthetic_fill) in groups {
        let table_id = Uuid::new_v4().to_string();
        let mut table = GameTable::new(
            table_id.clone(),
            &humans,
            synthetic_fill,
            state.settings.hand_size,
            now,
        );
        table.setup(now);
        let handle = TableHandle::new(table);
        state.registry.insert(Arc::clone(&handle)).await;
        info!(
            table_id = %table_id,
            humans = ?humans,
            synthetic_fill,
            "table formed"
        );
        removals.extend(humans);
        report.tables_created.push(table_id);
        created.push(handle);
    }

    let mut removed = true;
    if !removals.is_empty()
        && let Err(error) = state.queue.remove(&removals).await
    {
        removed = false;
        warn!(
            error = %error,
            pending = removals.len(),
            "failed to remove queue entries; next tick will retry"
        );
    }

    if removed {
        for entry in &stale {
            let waited_seconds = (now - entry.joined_at).num_seconds();
            state
                .courier
                .deliver(
                    &Recipient::human(entry.participant_id.clone()),
                    &Notification::QueueExpired { waited_seconds },
                )
                .await;
            report.expired.push(entry.participant_id.clone());
        }
    }

    for handle in created {
        session::launch(state, handle);
    }
    Ok(report)
}

/// Splits the queue into bot-fill and humans-only lines, ranks each by win
/// ratio and takes one group per line.
fn form_groups(
    waiting: Vec<QueueEntry>,
    stats: &HashMap<ParticipantId, PlayerStats>,
    table_size: usize,
    solo_participant_id: Option<&str>,
) -> Vec<(Vec<ParticipantId>, bool)> {
    let (mut with_fill, mut humans_only): (Vec<(QueueEntry, f64)>, Vec<(QueueEntry, f64)>) =
        waiting
            .into_iter()
            .map(|entry| {
                let ratio = ranking_ratio(stats.get(&entry.participant_id));
                (entry, ratio)
            })
            .partition(|(entry, _)| entry.wants_bot_fill);
    with_fill.sort_by(|left, right| left.1.total_cmp(&right.1));
    humans_only.sort_by(|left, right| left.1.total_cmp(&right.1));

    let mut groups = Vec::new();
    if let Some(group) = select_group(&with_fill, table_size, solo_participant_id) {
        groups.push((group, true));
    }
    if let Some(group) = select_group(&humans_only, table_size, None) {
        groups.push((group, false));
    }
    groups
}

fn select_group(
    ranked: &[(QueueEntry, f64)],
    table_size: usize,
    solo_participant_id: Option<&str>,
) -> Option<Vec<ParticipantId>> {
    let picked: Vec<ParticipantId> = ranked
        .iter()
        .take(table_size)
        .map(|(entry, _)| entry.participant_id.clone())
        .collect();
    let solo_allowed = picked.len() == 1
        && solo_participant_id.is_some_and(|solo| picked[0] == solo);
    (picked.len() >= MIN_HUMANS_PER_TABLE || solo_allowed).then_some(picked)
}

/// Concludes terminal tables, retrying any whose stats write failed earlier.
async fn reap_finished_tables(state: &AppState) -> usize {
    let mut reaped = 0;
    for handle in state.registry.handles().await {
        let terminal = handle.table.lock().await.status().is_terminal();
        if terminal && session::conclude(state, &handle).await {
            debug!(table_id = %handle.id(), "reaped finished table");
            reaped += 1;
        }
    }
    reaped
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        settings::Settings,
        store::{
            QueueStore, StatsStore,
            testing::{FlakyQueueStore, FlakyStatsStore},
        },
        table::Participant,
    };
    use chrono::Duration;
    use uno_common::{Card, Color, MAX_SEATS, MatchResult, Rank, SeatKind, TableStatus};

    /// Tables formed in these tests stay `Ready` for the whole test.
    fn settings() -> Settings {
        Settings {
            start_delay_secs: 600,
            ..Settings::instant()
        }
    }

    async fn enqueue(state: &AppState, participant_id: &str, fill: bool, joined_at: DateTime<Utc>) {
        state
            .queue
            .toggle(participant_id, fill, joined_at)
            .await
            .unwrap();
    }

    async fn queued_ids(state: &AppState) -> Vec<String> {
        state
            .queue
            .entries()
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.participant_id)
            .collect()
    }

    async fn table_seats(state: &AppState, table_id: &str) -> Vec<(String, SeatKind)> {
        let handle = state.registry.get(table_id).await.unwrap();
        let table = handle.table.lock().await;
        table
            .players()
            .iter()
            .map(|seat| (seat.id.clone(), seat.kind))
            .collect()
    }

    #[tokio::test]
    async fn two_fill_seekers_get_a_seven_seat_table() {
        let (state, recorder) = AppState::for_tests(settings());
        let now = Utc::now();
        enqueue(&state, "alice", true, now - Duration::seconds(5)).await;
        enqueue(&state, "bob", true, now - Duration::seconds(3)).await;

        let report = matchmaking_tick(&state, now).await.unwrap();

        assert_eq!(report.tables_created.len(), 1);
        let seats = table_seats(&state, &report.tables_created[0]).await;
        assert_eq!(seats.len(), MAX_SEATS);
        let humans = seats
            .iter()
            .filter(|(_, kind)| *kind == SeatKind::Human)
            .count();
        assert_eq!(humans, 2);
        assert!(queued_ids(&state).await.is_empty());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(recorder
            .sent_to("alice")
            .iter()
            .any(|n| matches!(n, Notification::TableFormed { .. })));
    }

    #[tokio::test]
    async fn humans_only_table_has_no_synthetic_seats() {
        let (state, _recorder) = AppState::for_tests(settings());
        let now = Utc::now();
        enqueue(&state, "alice", false, now).await;
        enqueue(&state, "bob", false, now).await;

        let report = matchmaking_tick(&state, now).await.unwrap();
        let seats = table_seats(&state, &report.tables_created[0]).await;
        assert_eq!(seats.len(), 2);
        assert!(seats.iter().all(|(_, kind)| *kind == SeatKind::Human));
    }

    #[tokio::test]
    async fn lone_participant_waits_unless_solo_allowed() {
        let (state, _recorder) = AppState::for_tests(settings());
        let now = Utc::now();
        enqueue(&state, "alice", true, now).await;
        let report = matchmaking_tick(&state, now).await.unwrap();
        assert!(report.tables_created.is_empty());
        assert_eq!(queued_ids(&state).await, vec!["alice".to_string()]);

        let (state, _recorder) = AppState::for_tests(Settings {
            solo_participant_id: Some("admin".to_string()),
            ..settings()
        });
        enqueue(&state, "admin", true, now).await;
        let report = matchmaking_tick(&state, now).await.unwrap();
        assert_eq!(report.tables_created.len(), 1);
        let seats = table_seats(&state, &report.tables_created[0]).await;
        assert_eq!(seats.len(), MAX_SEATS);

        enqueue(&state, "admin", false, now).await;
        let report = matchmaking_tick(&state, now).await.unwrap();
        assert!(report.deduplicated.contains(&"admin".to_string()));
        assert!(report.tables_created.is_empty());
    }

    #[tokio::test]
    async fn lowest_ratios_are_seated_first() {
        let (state, _recorder) = AppState::for_tests(settings());
        state
            .stats
            .record_results(&[
                ("alice".to_string(), MatchResult::Win),
                ("alice".to_string(), MatchResult::Win),
                ("alice".to_string(), MatchResult::Win),
                ("carol".to_string(), MatchResult::Loss),
                ("carol".to_string(), MatchResult::Loss),
            ])
            .await
            .unwrap();
        let now = Utc::now();
        enqueue(&state, "alice", true, now - Duration::seconds(9)).await;
        enqueue(&state, "bob", true, now - Duration::seconds(8)).await;
        enqueue(&state, "carol", true, now - Duration::seconds(7)).await;

        let report = matchmaking_tick(&state, now).await.unwrap();
        let humans: Vec<String> = table_seats(&state, &report.tables_created[0])
            .await
            .into_iter()
            .filter(|(_, kind)| *kind == SeatKind::Human)
            .map(|(id, _)| id)
            .collect();
        assert_eq!(humans.len(), 2);
        assert!(humans.contains(&"bob".to_string()));
        assert!(humans.contains(&"carol".to_string()));
        assert_eq!(queued_ids(&state).await, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn stale_entries_expire_with_notice() {
        let (state, recorder) = AppState::for_tests(settings());
        let now = Utc::now();
        enqueue(&state, "alice", true, now - Duration::seconds(301)).await;
        enqueue(&state, "bob", true, now - Duration::seconds(10)).await;

        let report = matchmaking_tick(&state, now).await.unwrap();

        assert_eq!(report.expired, vec!["alice".to_string()]);
        assert!(report.tables_created.is_empty());
        assert_eq!(queued_ids(&state).await, vec!["bob".to_string()]);
        assert_eq!(
            recorder.sent_to("alice"),
            vec![Notification::QueueExpired {
                waited_seconds: 301
            }]
        );
    }

    #[tokio::test]
    async fn seated_participants_are_removed_from_queue() {
        let (state, _recorder) = AppState::for_tests(settings());
        let now = Utc::now();
        let table = GameTable::rigged(
            "live",
            vec![
                Participant::human("alice", now),
                Participant::human("bob", now),
            ],
            Vec::new(),
            vec![Card::new(Color::Red, Rank::Number(1))],
            now,
        );
        state.registry.insert(TableHandle::new(table)).await;
        enqueue(&state, "alice", true, now).await;
        enqueue(&state, "carol", true, now).await;

        let report = matchmaking_tick(&state, now).await.unwrap();

        assert_eq!(report.deduplicated, vec!["alice".to_string()]);
        assert!(report.tables_created.is_empty());
        assert_eq!(queued_ids(&state).await, vec!["carol".to_string()]);
    }

    #[tokio::test]
    async fn failed_queue_removal_is_deduplicated_next_tick() {
        let queue = Arc::new(FlakyQueueStore::default());
        queue.fail_remove.store(true, Ordering::SeqCst);
        let (mut state, _recorder) = AppState::for_tests(settings());
        state.queue = queue.clone();
        let now = Utc::now();
        enqueue(&state, "alice", false, now).await;
        enqueue(&state, "bob", false, now).await;

        let report = matchmaking_tick(&state, now).await.unwrap();
        assert_eq!(report.tables_created.len(), 1);
        assert_eq!(state.registry.len().await, 1);
        assert_eq!(queued_ids(&state).await.len(), 2);

        queue.fail_remove.store(false, Ordering::SeqCst);
        let report = matchmaking_tick(&state, now).await.unwrap();
        assert!(report.tables_created.is_empty());
        assert_eq!(report.deduplicated.len(), 2);
        assert!(queued_ids(&state).await.is_empty());
        assert_eq!(state.registry.len().await, 1);
    }

    #[tokio::test]
    async fn reap_retries_unrecorded_results() {
        let stats = Arc::new(FlakyStatsStore::default());
        stats.fail_writes.store(true, Ordering::SeqCst);
        let (mut state, _recorder) = AppState::for_tests(settings());
        state.stats = stats.clone();
        let now = Utc::now();

        let mut winner = Participant::human("alice", now);
        winner.hand = vec![Card::new(Color::Red, Rank::Number(2))].into_iter().collect();
        let mut loser = Participant::human("bob", now);
        loser.hand = vec![Card::new(Color::Blue, Rank::Number(7))].into_iter().collect();
        let handle = TableHandle::new(GameTable::rigged(
            "done",
            vec![winner, loser],
            Vec::new(),
            vec![Card::new(Color::Red, Rank::Number(1))],
            now,
        ));
        state.registry.insert(handle.clone()).await;
        session::submit_action(
            &state,
            "done",
            "alice",
            uno_common::PlayerAction::PlayCard { index: 0 },
        )
        .await;
        assert_eq!(handle.table.lock().await.status(), TableStatus::Ended);

        let report = matchmaking_tick(&state, now).await.unwrap();
        assert_eq!(report.reaped, 0);
        assert_eq!(state.registry.len().await, 1);

        stats.fail_writes.store(false, Ordering::SeqCst);
        let report = matchmaking_tick(&state, now).await.unwrap();
        assert_eq!(report.reaped, 1);
        assert_eq!(state.registry.len().await, 0);
        assert_eq!(stats.get("alice").await.unwrap().wins, 1);
    }

    #[test]
    fn groups_never_exceed_table_size() {
        let now = Utc::now();
        let waiting: Vec<QueueEntry> = (0..10)
            .map(|i| QueueEntry {
                participant_id: format!("p{i}"),
                wants_bot_fill: i % 2 == 0,
                joined_at: now,
            })
            .collect();
        let groups = form_groups(waiting, &HashMap::new(), 3, None);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, vec!["p0", "p2", "p4"]);
        assert!(groups[0].1);
        assert_eq!(groups[1].0, vec!["p1", "p3", "p5"]);
        assert!(!groups[1].1);
    }
}
