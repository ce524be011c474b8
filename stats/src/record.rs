use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Statistics tracked for one player identity.
///
/// The three `killed_by*` sequences are parallel: entry `i` of each describes
/// the same death. Use [`StatisticsRecord::record_death`] to keep them aligned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsRecord {
    pub kills: u32,
    pub deaths: u32,
    pub bases_captured: u32,
    pub bases_lost: u32,
    pub experience: u32,
    pub rank: u32,
    pub supplies_delivered: u32,
    pub supply_deliveries: u32,
    pub ai_kills: u32,
    pub vehicle_kills: u32,
    pub air_kills: u32,

    /// Unix seconds at which the current session started.
    pub connection_time: f64,
    /// Length of the last completed session, in seconds.
    pub last_session_duration: f64,
    /// Cumulative playtime, in seconds.
    pub total_playtime: f64,

    pub killed_by: Vec<String>,
    pub killed_by_weapon: Vec<String>,
    pub killed_by_team: Vec<String>,
}

impl StatisticsRecord {
    /// An empty record, as handed to first-time players.
    pub fn fresh() -> Self {
        Self::default()
    }

    /// True when every counter is zero and no deaths are recorded.
    pub fn is_fresh(&self) -> bool {
        *self == Self::default()
    }

    /// Append one death, keeping the parallel sequences the same length.
    pub fn record_death(
        &mut self,
        killer: impl Into<String>,
        weapon: impl Into<String>,
        team: impl Into<String>,
    ) {
        self.deaths = self.deaths.saturating_add(1);
        self.killed_by.push(killer.into());
        self.killed_by_weapon.push(weapon.into());
        self.killed_by_team.push(team.into());
    }

    /// Close the current session at `now` (unix seconds), folding its length
    /// into the cumulative playtime.
    pub fn end_session(&mut self, now: f64) {
        if self.connection_time <= 0.0 || now < self.connection_time {
            return;
        }
        let duration = now - self.connection_time;
        self.last_session_duration = duration;
        self.total_playtime += duration;
        self.connection_time = 0.0;
    }

    /// Numeric value of a sortable field.
    pub fn value_of(&self, field: StatField) -> f64 {
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

/// Fields a leaderboard can be sorted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatField {
    Kills,
    Deaths,
    BasesCaptured,
    BasesLost,
    Experience,
    Rank,
    SuppliesDelivered,
    SupplyDeliveries,
    AiKills,
    VehicleKills,
    AirKills,
    TotalPlaytime,
}

impl StatField {
    pub const ALL: [StatField; 12] = [
        StatField::Kills,
        StatField::Deaths,
        StatField::BasesCaptured,
        StatField::BasesLost,
        StatField::Experience,
        StatField::Rank,
        StatField::SuppliesDelivered,
        StatField::SupplyDeliveries,
        StatField::AiKills,
        StatField::VehicleKills,
        StatField::AirKills,
        StatField::TotalPlaytime,
    ];

    /// Column name used by storage backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatField::Kills => "kills",
            StatField::Deaths => "deaths",
            StatField::BasesCaptured => "bases_captured",
            StatField::BasesLost => "bases_lost",
            StatField::Experience => "experience",
            StatField::Rank => "rank",
            StatField::SuppliesDelivered => "supplies_delivered",
            StatField::SupplyDeliveries => "supply_deliveries",
            StatField::AiKills => "ai_kills",
            StatField::VehicleKills => "vehicle_kills",
            StatField::AirKills => "air_kills",
            StatField::TotalPlaytime => "total_playtime",
        }
    }
}

impl fmt::Display for StatField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        StatField::ALL
            .into_iter()
            .find(|field| field.as_str() == wanted)
            .ok_or_else(|| format!("unknown stat field: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_record_is_all_zero() {
        let record = StatisticsRecord::fresh();
        assert!(record.is_fresh());
        assert_eq!(record.kills, 0);
        assert!(record.killed_by.is_empty());
        assert!(record.killed_by_weapon.is_empty());
        assert!(record.killed_by_team.is_empty());
    }

    #[test]
    fn record_death_keeps_sequences_aligned() {
        let mut record = StatisticsRecord::fresh();
        record.record_death("Sniper", "M21", "US");
        record.record_death("Gunner", "PKM", "USSR");
        assert_eq!(record.deaths, 2);
        assert_eq!(record.killed_by.len(), 2);
        assert_eq!(record.killed_by_weapon.len(), 2);
        assert_eq!(record.killed_by_team, vec!["US", "USSR"]);
        assert!(!record.is_fresh());
    }

    #[test]
    fn end_session_accumulates_playtime() {
        let mut record = StatisticsRecord {
            connection_time: 1_000.0,
            total_playtime: 50.0,
            ..Default::default()
        };
        record.end_session(1_600.0);
        assert_eq!(record.last_session_duration, 600.0);
        assert_eq!(record.total_playtime, 650.0);
        assert_eq!(record.connection_time, 0.0);

        // No open session: nothing changes.
        record.end_session(2_000.0);
        assert_eq!(record.total_playtime, 650.0);
    }

    #[test]
    fn stat_field_parses_column_names() {
        for field in StatField::ALL {
            assert_eq!(field.as_str().parse::<StatField>().unwrap(), field);
        }
        assert_eq!("bases-captured".parse::<StatField>().unwrap(), StatField::BasesCaptured);
        assert_eq!(" KILLS ".parse::<StatField>().unwrap(), StatField::Kills);
        assert!("headshots".parse::<StatField>().is_err());
    }

    #[test]
    fn missing_fields_deserialize_to_defaults() {
        let record: StatisticsRecord = serde_json::from_str(r#"{"kills": 4}"#).unwrap();
        assert_eq!(record.kills, 4);
        assert_eq!(record.deaths, 0);
        assert!(record.killed_by.is_empty());
    }
}
