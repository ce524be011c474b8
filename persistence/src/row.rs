//! Storage-side shape of a statistics record.
//!
//! Counters are stored as signed integers so that out-of-range values written
//! by older builds or by hand survive the round trip and are caught when the
//! row is converted back into a [`StatisticsRecord`].

use player_stats::{RecordError, StatField, StatisticsRecord};
use serde::{Deserialize, Serialize};

/// One persisted row, keyed by `external_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsRow {
    pub external_id: String,
    pub display_name: String,

    pub kills: i64,
    pub deaths: i64,
    pub bases_captured: i64,
    pub bases_lost: i64,
    pub experience: i64,
    pub rank: i64,
    pub supplies_delivered: i64,
    pub supply_deliveries: i64,
    pub ai_kills: i64,
    pub vehicle_kills: i64,
    pub air_kills: i64,

    pub connection_time: f64,
    pub last_session_duration: f64,
    pub total_playtime: f64,

    pub killed_by: Vec<String>,
    pub killed_by_weapon: Vec<String>,
    pub killed_by_team: Vec<String>,

    pub created_at: u64,
    pub updated_at: u64,
}

impl StatsRow {
    pub fn from_record(
        external_id: &str,
        display_name: &str,
        record: &StatisticsRecord,
        created_at: u64,
        updated_at: u64,
    ) -> Self {
        Self {
            external_id: external_id.to_string(),
            display_name: display_name.to_string(),
            kills: record.kills.into(),
            deaths: record.deaths.into(),
            bases_captured: record.bases_captured.into(),
            bases_lost: record.bases_lost.into(),
            experience: record.experience.into(),
            rank: record.rank.into(),
            supplies_delivered: record.supplies_delivered.into(),
            supply_deliveries: record.supply_deliveries.into(),
            ai_kills: record.ai_kills.into(),
            vehicle_kills: record.vehicle_kills.into(),
            air_kills: record.air_kills.into(),
            connection_time: record.connection_time,
            last_session_duration: record.last_session_duration,
            total_playtime: record.total_playtime,
            killed_by: record.killed_by.clone(),
            killed_by_weapon: record.killed_by_weapon.clone(),
            killed_by_team: record.killed_by_team.clone(),
            created_at,
            updated_at,
        }
    }

    /// Convert back into the domain record. Fails on any counter that does
    /// not fit an unsigned 32-bit value.
    pub fn to_record(&self) -> Result<StatisticsRecord, RecordError> {
        Ok(StatisticsRecord {
            kills: counter("kills", self.kills)?,
            deaths: counter("deaths", self.deaths)?,
            bases_captured: counter("bases_captured", self.bases_captured)?,
            bases_lost: counter("bases_lost", self.bases_lost)?,
            experience: counter("experience", self.experience)?,
            rank: counter("rank", self.rank)?,
            supplies_delivered: counter("supplies_delivered", self.supplies_delivered)?,
            supply_deliveries: counter("supply_deliveries", self.supply_deliveries)?,
            ai_kills: counter("ai_kills", self.ai_kills)?,
            vehicle_kills: counter("vehicle_kills", self.vehicle_kills)?,
            air_kills: counter("air_kills", self.air_kills)?,
            connection_time: self.connection_time,
            last_session_duration: self.last_session_duration,
            total_playtime: self.total_playtime,
            killed_by: self.killed_by.clone(),
            killed_by_weapon: self.killed_by_weapon.clone(),
            killed_by_team: self.killed_by_team.clone(),
        })
    }

    /// Raw sort key for leaderboard queries.
    pub fn sort_value(&self, field: StatField) -> f64 {
        match field {
            StatField::Kills => self.kills as f64,
            StatField::Deaths => self.deaths as f64,
            StatField::BasesCaptured => self.bases_captured as f64,
            StatField::BasesLost => self.bases_lost as f64,
            StatField::Experience => self.experience as f64,
            StatField::Rank => self.rank as f64,
            StatField::SuppliesDelivered => self.supplies_delivered as f64,
            StatField::SupplyDeliveries => self.supply_deliveries as f64,
            StatField::AiKills => self.ai_kills as f64,
            StatField::VehicleKills => self.vehicle_kills as f64,
            StatField::AirKills => self.air_kills as f64,
            StatField::TotalPlaytime => self.total_playtime,
        }
    }
}

fn counter(field: &'static str, value: i64) -> Result<u32, RecordError> {
    if value < 0 {
        return Err(RecordError::Negative { field, value });
    }
    // Anything past u32::MAX is far beyond every sanity ceiling anyway.
    Ok(u32::try_from(value).unwrap_or(u32::MAX))
}

/// A validated record together with its identity, as returned by bulk reads.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsEntry {
    pub external_id: String,
    pub display_name: String,
    pub record: StatisticsRecord,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Sort rows descending by `field`, ties broken by external id, and keep the
/// first `limit`. Shared by backends that sort in memory.
pub(crate) fn top_rows(mut rows: Vec<StatsRow>, field: StatField, limit: usize) -> Vec<StatsRow> {
    rows.sort_by(|a, b| {
        b.sort_value(field)
            .total_cmp(&a.sort_value(field))
            .then_with(|| a.external_id.cmp(&b.external_id))
    });
    rows.truncate(limit);
    rows
}

#[cfg(test)]
pub(crate) fn sample_row(id: &str, kills: i64) -> StatsRow {
    StatsRow {
        kills,
        ..StatsRow::from_record(id, &format!("Player {id}"), &StatisticsRecord::fresh(), 100, 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrip() {
        let mut record = StatisticsRecord {
            kills: 42,
            experience: 9_000,
            total_playtime: 12.5,
            ..Default::default()
        };
        record.record_death("Gunner", "PKM", "USSR");
        let row = StatsRow::from_record("steam_1", "Alice", &record, 10, 20);
        assert_eq!(row.to_record().unwrap(), record);
        assert_eq!(row.created_at, 10);
        assert_eq!(row.updated_at, 20);
    }

    #[test]
    fn negative_counter_fails_conversion() {
        let row = sample_row("p1", -1);
        assert_eq!(
            row.to_record(),
            Err(RecordError::Negative {
                field: "kills",
                value: -1
            })
        );
    }

    #[test]
    fn top_rows_sorts_descending_with_stable_ties() {
        let rows = vec![
            sample_row("b", 5),
            sample_row("a", 5),
            sample_row("c", 9),
            sample_row("d", 1),
        ];
        let top = top_rows(rows, StatField::Kills, 3);
        let ids: Vec<&str> = top.iter().map(|r| r.external_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }
}
