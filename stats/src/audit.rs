//! Detection of changes large enough to deserve an audit log line.

use crate::record::StatisticsRecord;

/// Kill increase per save that is worth auditing.
pub const KILL_SPIKE_THRESHOLD: u32 = 10;
/// Experience swing (either direction) per save that is worth auditing.
pub const SCORE_SWING_THRESHOLD: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotableChange {
    KillSpike { gained: u32 },
    ScoreSwing { before: u32, after: u32 },
    RankUp { from: u32, to: u32 },
}

/// Compare the stored record with the one about to replace it.
pub fn notable_changes(before: &StatisticsRecord, after: &StatisticsRecord) -> Vec<NotableChange> {
    let mut changes = Vec::new();

    let gained = after.kills.saturating_sub(before.kills);
    if gained >= KILL_SPIKE_THRESHOLD {
        changes.push(NotableChange::KillSpike { gained });
    }

    if before.experience.abs_diff(after.experience) >= SCORE_SWING_THRESHOLD {
        changes.push(NotableChange::ScoreSwing {
            before: before.experience,
            after: after.experience,
        });
    }

    if after.rank > before.rank {
        changes.push(NotableChange::RankUp {
            from: before.rank,
            to: after.rank,
        });
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_save_has_no_changes() {
        let before = StatisticsRecord {
            kills: 5,
            experience: 100,
            ..Default::default()
        };
        let after = StatisticsRecord {
            kills: 9,
            experience: 400,
            ..Default::default()
        };
        assert!(notable_changes(&before, &after).is_empty());
    }

    #[test]
    fn detects_every_kind() {
        let before = StatisticsRecord {
            kills: 5,
            experience: 1_000,
            rank: 1,
            ..Default::default()
        };
        let after = StatisticsRecord {
            kills: 15,
            experience: 400,
            rank: 2,
            ..Default::default()
        };
        assert_eq!(
            notable_changes(&before, &after),
            vec![
                NotableChange::KillSpike { gained: 10 },
                NotableChange::ScoreSwing {
                    before: 1_000,
                    after: 400
                },
                NotableChange::RankUp { from: 1, to: 2 },
            ]
        );
    }

    #[test]
    fn rank_loss_is_not_reported() {
        let before = StatisticsRecord {
            rank: 4,
            ..Default::default()
        };
        let after = StatisticsRecord {
            rank: 3,
            ..Default::default()
        };
        assert!(notable_changes(&before, &after).is_empty());
    }
}
