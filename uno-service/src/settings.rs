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

use serde::Deserialize;
use tracing::{info, warn};
use uno_common::{
    DEFAULT_HAND_SIZE, DEFAULT_TABLE_SIZE, MAX_HAND_SIZE, MAX_SEATS, MIN_HUMANS_PER_TABLE,
    ParticipantId, expand_env_vars,
};

/// Longest accepted value for any of the `*_secs` fields.
const MAX_SECS: u64 = 86_400;
/// Longest accepted bot thinking time.
const MAX_BOT_THINK_MS: u64 = 60_000;

/// Tunables for matchmaking and table pacing. Every field can be set from
/// the YAML file or overridden by the `UNO_<FIELD>` environment variable.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub table_size: usize,
    pub hand_size: usize,
    pub matchmaking_interval_secs: u64,
    pub queue_stale_after_secs: u64,
    pub start_delay_secs: u64,
    pub refresh_interval_secs: u64,
    pub inactivity_check_secs: u64,
    pub idle_warn_secs: u64,
    pub idle_kick_secs: u64,
    pub bot_think_min_ms: u64,
    pub bot_think_max_ms: u64,
    /// Participant allowed to start a bot-filled table alone.
    pub solo_participant_id: Option<ParticipantId>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            table_size: DEFAULT_TABLE_SIZE,
            hand_size: DEFAULT_HAND_SIZE,
            matchmaking_interval_secs: 10,
            queue_stale_after_secs: 300,
            start_delay_secs: 10,
            refresh_interval_secs: 10,
            inactivity_check_secs: 10,
            idle_warn_secs: 60,
            idle_kick_secs: 90,
            bot_think_min_ms: 400,
            bot_think_max_ms: 1200,
            solo_participant_id: None,
        }
    }
}

impl Settings {
    /// YAML file at `UNO_SETTINGS_PATH` (optional), then env overrides.
    pub fn load() -> Self {
        let base = load_settings_file().unwrap_or_default();
        let settings = base
            .with_overrides(|name| std::env::var(name).ok())
            .normalized();
        info!(
            table_size = settings.table_size,
            hand_size = settings.hand_size,
            matchmaking_interval_secs = settings.matchmaking_interval_secs,
            idle_kick_secs = settings.idle_kick_secs,
            solo_configured = settings.solo_participant_id.is_some(),
            "loaded uno-service settings"
        );
        settings
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |name: &str| {
            lookup(name).and_then(|value| value.trim().parse::<u64>().ok())
        };
        let numeric_fields = [
            ("UNO_MATCHMAKING_INTERVAL_SECS", &mut self.matchmaking_interval_secs),
            ("UNO_QUEUE_STALE_AFTER_SECS", &mut self.queue_stale_after_secs),
            ("UNO_START_DELAY_SECS", &mut self.start_delay_secs),
            ("UNO_REFRESH_INTERVAL_SECS", &mut self.refresh_interval_secs),
            ("UNO_INACTIVITY_CHECK_SECS", &mut self.inactivity_check_secs),
            ("UNO_IDLE_WARN_SECS", &mut self.idle_warn_secs),
            ("UNO_IDLE_KICK_SECS", &mut self.idle_kick_secs),
            ("UNO_BOT_THINK_MIN_MS", &mut self.bot_think_min_ms),
            ("UNO_BOT_THINK_MAX_MS", &mut self.bot_think_max_ms),
        ];
        for (name, field) in numeric_fields {
            if let Some(value) = number(name) {
                *field = value;
            }
        }
        if let Some(value) = number("UNO_TABLE_SIZE") {
            self.table_size = value as usize;
        }
        if let Some(value) = number("UNO_HAND_SIZE") {
            self.hand_size = value as usize;
        }
        if let Some(solo) = lookup("UNO_SOLO_PARTICIPANT_ID")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
        {
            self.solo_participant_id = Some(solo);
        }
        self
    }

    /// Clamps every field into a range the engine can run with.
    pub fn normalized(mut self) -> Self {
        self.table_size = self.table_size.clamp(MIN_HUMANS_PER_TABLE, MAX_SEATS);
        self.hand_size = self.hand_size.clamp(1, MAX_HAND_SIZE);
        self.matchmaking_interval_secs = self.matchmaking_interval_secs.clamp(1, MAX_SECS);
        self.queue_stale_after_secs = self.queue_stale_after_secs.clamp(1, MAX_SECS);
        self.start_delay_secs = self.start_delay_secs.min(MAX_SECS);
        self.refresh_interval_secs = self.refresh_interval_secs.clamp(1, MAX_SECS);
        self.inactivity_check_secs = self.inactivity_check_secs.clamp(1, MAX_SECS);
        self.idle_warn_secs = self.idle_warn_secs.clamp(1, MAX_SECS);
        self.idle_kick_secs = self.idle_kick_secs.clamp(self.idle_warn_secs, MAX_SECS);
        self.bot_think_min_ms = self.bot_think_min_ms.min(MAX_BOT_THINK_MS);
        self.bot_think_max_ms = self
            .bot_think_max_ms
            .clamp(self.bot_think_min_ms, MAX_BOT_THINK_MS);
        self.solo_participant_id = self
            .solo_participant_id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        self
    }

    pub fn matchmaking_interval(&self) -> Duration {
        Duration::from_secs(self.matchmaking_interval_secs)
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_secs(self.start_delay_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn inactivity_check_interval(&self) -> Duration {
        Duration::from_secs(self.inactivity_check_secs)
    }

    pub fn idle_warn(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_warn_secs as i64)
    }

    pub fn idle_kick(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_kick_secs as i64)
    }

    pub fn queue_stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.queue_stale_after_secs as i64)
    }
}

fn load_settings_file() -> Option<Settings> {
    let path = std::env::var("UNO_SETTINGS_PATH")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())?;

    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(path = %path, error = %error, "failed to read settings file");
            return None;
        }
    };

    match parse_settings_yaml(&raw) {
        Ok(settings) => Some(settings),
        Err(error) => {
            warn!(path = %path, error = %error, "failed to parse settings yaml");
            None
        }
    }
}

fn parse_settings_yaml(raw: &str) -> Result<Settings, serde_yaml::Error> {
    if raw.trim().is_empty() {
        return Ok(Settings::default());
    }
    serde_yaml::from_str::<Settings>(&expand_env_vars(raw))
}

#[cfg(test)]
impl Settings {
    /// No start delay and no bot thinking time.
    pub fn instant() -> Self {
        Self {
            start_delay_secs: 0,
            bot_think_min_ms: 0,
            bot_think_max_ms: 0,
            ..Self::default()
        }
    }
}
