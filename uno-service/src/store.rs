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

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use uno_common::{JoinOutcome, MatchResult, ParticipantId, PlayerStats, QueueEntry};

/// Waiting participants, one entry per participant.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Adds the participant, or removes them when already queued.
    async fn toggle(
        &self,
        participant_id: &str,
        wants_bot_fill: bool,
        now: DateTime<Utc>,
    ) -> anyhow::Result<JoinOutcome>;

    /// All entries, oldest first.
    async fn entries(&self) -> anyhow::Result<Vec<QueueEntry>>;

    /// Removes every listed participant in one call. Unknown ids are ignored.
    async fn remove(&self, participant_ids: &[ParticipantId]) -> anyhow::Result<()>;
}

/// Per-participant win/loss counters.
#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Zeroed stats for unknown participants.
    async fn get(&self, participant_id: &str) -> anyhow::Result<PlayerStats>;

    async fn get_many(
        &self,
        participant_ids: &[ParticipantId],
    ) -> anyhow::Result<HashMap<ParticipantId, PlayerStats>>;

    /// Applies all results of one game atomically.
    async fn record_results(
        &self,
        results: &[(ParticipantId, MatchResult)],
    ) -> anyhow::Result<()>;

    /// Most wins first, fewer losses breaking ties.
    async fn leaderboard(&self, limit: usize) -> anyhow::Result<Vec<PlayerStats>>;
}

#[derive(Default)]
pub struct InMemoryQueueStore {
    entries: Mutex<HashMap<ParticipantId, QueueEntry>>,
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn toggle(
        &self,
        participant_id: &str,
        wants_bot_fill: bool,
        now: DateTime<Utc>,
    ) -> anyhow::Result<JoinOutcome> {
        let mut entries = self.entries.lock().await;
        if entries.remove(participant_id).is_some() {
            return Ok(JoinOutcome::Left);
        }
        entries.insert(
            participant_id.to_string(),
            QueueEntry {
                participant_id: participant_id.to_string(),
                wants_bot_fill,
                joined_at: now,
            },
        );
        Ok(JoinOutcome::Joined)
    }

    async fn entries(&self) -> anyhow::Result<Vec<QueueEntry>> {
        let entries = self.entries.lock().await;
        let mut listed: Vec<QueueEntry> = entries.values().cloned().collect();
        listed.sort_by(|left, right| {
            left.joined_at
                .cmp(&right.joined_at)
                .then_with(|| left.participant_id.cmp(&right.participant_id))
        });
        Ok(listed)
    }

    async fn remove(&self, participant_ids: &[ParticipantId]) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        for participant_id in participant_ids {
            entries.remove(participant_id);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryStatsStore {
    rows: RwLock<HashMap<ParticipantId, PlayerStats>>,
}

#[async_trait]
impl StatsStore for InMemoryStatsStore {
    async fn get(&self, participant_id: &str) -> anyhow::Result<PlayerStats> {
        let rows = self.rows.read().await;
        Ok(rows
            .get(participant_id)
            .cloned()
            .unwrap_or_else(|| PlayerStats::empty(participant_id)))
    }

    async fn get_many(
        &self,
        participant_ids: &[ParticipantId],
    ) -> anyhow::Result<HashMap<ParticipantId, PlayerStats>> {
        let rows = self.rows.read().await;
        Ok(participant_ids
            .iter()
            .filter_map(|id| rows.get(id).map(|stats| (id.clone(), stats.clone())))
            .collect())
    }

    async fn record_results(
        &self,
        results: &[(ParticipantId, MatchResult)],
    ) -> anyhow::Result<()> {
        let mut rows = self.rows.write().await;
        for (participant_id, result) in results {
            let row = rows
                .entry(participant_id.clone())
                .or_insert_with(|| PlayerStats::empty(participant_id.clone()));
            match result {
                MatchResult::Win => row.wins += 1,
                MatchResult::Loss => row.losses += 1,
            }
        }
        Ok(())
    }

    async fn leaderboard(&self, limit: usize) -> anyhow::Result<Vec<PlayerStats>> {
        let rows = self.rows.read().await;
        let mut board: Vec<PlayerStats> = rows.values().cloned().collect();
        board.sort_by(|left, right| {
            right
                .wins
                .cmp(&left.wins)
                .then_with(|| left.losses.cmp(&right.losses))
                .then_with(|| left.participant_id.cmp(&right.participant_id))
        });
        board.truncate(limit);
        Ok(board)
    }
}

#[cfg(test)]
pub mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    /// Queue store whose `remove` can be switched to fail.
    #[derive(Default)]
    pub struct FlakyQueueStore {
        pub inner: InMemoryQueueStore,
        pub fail_remove: AtomicBool,
    }

    #[async_trait]
    impl QueueStore for FlakyQueueStore {
        async fn toggle(
            &self,
            participant_id: &str,
            wants_bot_fill: bool,
            now: DateTime<Utc>,
        ) -> anyhow::Result<JoinOutcome> {
            self.inner.toggle(participant_id, wants_bot_fill, now).await
        }

        async fn entries(&self) -> anyhow::Result<Vec<QueueEntry>> {
            self.inner.entries().await
        }

        async fn remove(&self, participant_ids: &[ParticipantId]) -> anyhow::Result<()> {
            if self.fail_remove.load(Ordering::SeqCst) {
                anyhow::bail!("queue store unavailable");
            }
            self.inner.remove(participant_ids).await
        }
    }

    /// Stats store whose writes can be switched to fail.
    #[derive(Default)]
    pub struct FlakyStatsStore {
        pub inner: InMemoryStatsStore,
        pub fail_writes: AtomicBool,
    }

    #[async_trait]
    impl StatsStore for FlakyStatsStore {
        async fn get(&self, participant_id: &str) -> anyhow::Result<PlayerStats> {
            self.inner.get(participant_id).await
        }

        async fn get_many(
            &self,
            participant_ids: &[ParticipantId],
        ) -> anyhow::Result<HashMap<ParticipantId, PlayerStats>> {
            self.inner.get_many(participant_ids).await
        }

        async fn record_results(
            &self,
            results: &[(ParticipantId, MatchResult)],
        ) -> anyhow::Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                anyhow::bail!("stats store unavailable");
            }
            self.inner.record_results(results).await
        }

        async fn leaderboard(&self, limit: usize) -> anyhow::Result<Vec<PlayerStats>> {
            self.inner.leaderboard(limit).await
        }
    }
}
