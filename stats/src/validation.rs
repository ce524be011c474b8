//! Sanity rules for [`StatisticsRecord`].
//!
//! A record that breaks any rule is treated as untrusted: writers reject it,
//! readers replace it with a fresh record.

use crate::record::StatisticsRecord;

pub const MAX_KILLS: u32 = 10_000;
pub const MAX_DEATHS: u32 = 10_000;
pub const MAX_BASES_CAPTURED: u32 = 10_000;
pub const MAX_EXPERIENCE: u32 = 1_000_000;

/// Longest plausible single session: 30 days, in seconds.
pub const MAX_SESSION_SECONDS: f64 = 30.0 * 24.0 * 60.0 * 60.0;

/// Why a record was judged invalid.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecordError {
    #[error("{field} = {value} exceeds ceiling {max}")]
    CeilingExceeded {
        field: &'static str,
        value: u32,
        max: u32,
    },
    #[error("{field} is negative ({value})")]
    Negative { field: &'static str, value: i64 },
    #[error("{field} is not a finite number of seconds ({value})")]
    InvalidDuration { field: &'static str, value: f64 },
    #[error("session length {0}s exceeds 30 days")]
    SessionTooLong(f64),
    #[error("killed-by sequences differ in length (names {names}, weapons {weapons}, teams {teams})")]
    KilledByMismatch {
        names: usize,
        weapons: usize,
        teams: usize,
    },
}

/// Check a record against the sanity rules. Pure: the same record always
/// yields the same verdict.
pub fn validate(record: &StatisticsRecord) -> Result<(), RecordError> {
    check_ceiling("kills", record.kills, MAX_KILLS)?;
    check_ceiling("deaths", record.deaths, MAX_DEATHS)?;
    check_ceiling("bases_captured", record.bases_captured, MAX_BASES_CAPTURED)?;
    check_ceiling("experience", record.experience, MAX_EXPERIENCE)?;

    check_duration("connection_time", record.connection_time)?;
    check_duration("last_session_duration", record.last_session_duration)?;
    check_duration("total_playtime", record.total_playtime)?;
    if record.last_session_duration > MAX_SESSION_SECONDS {
        return Err(RecordError::SessionTooLong(record.last_session_duration));
    }

    let (names, weapons, teams) = (
        record.killed_by.len(),
        record.killed_by_weapon.len(),
        record.killed_by_team.len(),
    );
    if names != weapons || names != teams {
        return Err(RecordError::KilledByMismatch {
            names,
            weapons,
            teams,
        });
    }

    Ok(())
}

fn check_ceiling(field: &'static str, value: u32, max: u32) -> Result<(), RecordError> {
    if value > max {
        return Err(RecordError::CeilingExceeded { field, value, max });
    }
    Ok(())
}

fn check_duration(field: &'static str, value: f64) -> Result<(), RecordError> {
    if !value.is_finite() || value < 0.0 {
        return Err(RecordError::InvalidDuration { field, value });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn valid_record() -> StatisticsRecord {
        let mut record = StatisticsRecord {
            kills: 120,
            experience: 4_500,
            rank: 3,
            bases_captured: 7,
            total_playtime: 36_000.0,
            last_session_duration: 3_600.0,
            ..Default::default()
        };
        record.record_death("Sniper", "M21", "US");
        record
    }

    #[test]
    fn accepts_valid_record() {
        assert_eq!(validate(&valid_record()), Ok(()));
        assert_eq!(validate(&StatisticsRecord::fresh()), Ok(()));
    }

    #[test]
    fn ceilings_are_inclusive() {
        let mut record = valid_record();
        record.kills = MAX_KILLS;
        record.experience = MAX_EXPERIENCE;
        assert!(validate(&record).is_ok());

        record.kills = MAX_KILLS + 1;
        assert!(matches!(
            validate(&record),
            Err(RecordError::CeilingExceeded { field: "kills", .. })
        ));
    }

    #[test]
    fn rejects_excess_experience_and_captures() {
        let mut record = valid_record();
        record.experience = MAX_EXPERIENCE + 1;
        assert!(validate(&record).is_err());

        let mut record = valid_record();
        record.bases_captured = MAX_BASES_CAPTURED + 1;
        assert!(validate(&record).is_err());

        let mut record = valid_record();
        record.deaths = MAX_DEATHS + 1;
        assert!(validate(&record).is_err());
    }

    #[test]
    fn rejects_bad_durations() {
        let mut record = valid_record();
        record.total_playtime = -1.0;
        assert!(matches!(
            validate(&record),
            Err(RecordError::InvalidDuration { field: "total_playtime", .. })
        ));

        let mut record = valid_record();
        record.connection_time = f64::NAN;
        assert!(validate(&record).is_err());

        let mut record = valid_record();
        record.last_session_duration = MAX_SESSION_SECONDS + 1.0;
        assert!(matches!(validate(&record), Err(RecordError::SessionTooLong(_))));
    }

    #[test]
    fn rejects_misaligned_killed_by() {
        let mut record = valid_record();
        record.killed_by_weapon.push("RPG".to_string());
        assert_eq!(
            validate(&record),
            Err(RecordError::KilledByMismatch {
                names: 1,
                weapons: 2,
                teams: 1
            })
        );
    }

    proptest! {
        #[test]
        fn validation_is_pure(
            kills in 0u32..20_000,
            experience in 0u32..2_000_000,
            session in -10.0f64..3_000_000.0,
            extra_weapons in 0usize..2,
        ) {
            let mut record = valid_record();
            record.kills = kills;
            record.experience = experience;
            record.last_session_duration = session;
            for _ in 0..extra_weapons {
                record.killed_by_weapon.push("Knife".to_string());
            }
            let first = validate(&record);
            let second = validate(&record);
            prop_assert_eq!(first, second);
        }
    }
}
