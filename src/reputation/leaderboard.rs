//! Leaderboard Ranker
//!
//! Ranks users by XP for a time window. Order is total: XP descending, then
//! verified count descending, then user id ascending. Results are cached per
//! window until the engine's generation changes or the window rolls over.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::issues::models::UserId;
use crate::reputation::{AwardKind, ReputationEngine, ReputationRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaderboardWindow {
    #[default]
    AllTime,
    ThisMonth,
    ThisWeek,
}

impl LeaderboardWindow {
    /// Inclusive start of the window, `None` for all time. Weeks start on
    /// Monday 00:00 UTC, months on the 1st.
    pub fn start(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = now.date_naive();
        let first_day = match self {
            LeaderboardWindow::AllTime => return None,
            LeaderboardWindow::ThisMonth => today - Duration::days(today.day0() as i64),
            LeaderboardWindow::ThisWeek => {
                today - Duration::days(today.weekday().num_days_from_monday() as i64)
            }
        };
        Some(first_day.and_time(NaiveTime::MIN).and_utc())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub user_id: UserId,
    /// XP earned inside the window
    pub xp: u64,
    /// Level from all-time XP
    pub level: u32,
    pub verified_count: u32,
    pub report_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Leaderboard {
    pub window: LeaderboardWindow,
    pub window_start: Option<DateTime<Utc>>,
    pub entries: Vec<LeaderboardEntry>,
}

impl IntoIterator for Leaderboard {
    type Item = LeaderboardEntry;
    type IntoIter = std::vec::IntoIter<LeaderboardEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

struct CachedRanking {
    generation: u64,
    window_start: Option<DateTime<Utc>>,
    entries: Arc<Vec<LeaderboardEntry>>,
}

pub struct LeaderboardRanker {
    engine: Arc<ReputationEngine>,
    /// One slot per window
    cache: RwLock<HashMap<LeaderboardWindow, CachedRanking>>,
}

impl LeaderboardRanker {
    pub fn new(engine: Arc<ReputationEngine>) -> Self {
        Self {
            engine,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn rank(&self, window: LeaderboardWindow, limit: Option<usize>) -> Leaderboard {
        self.rank_at(window, Utc::now(), limit).await
    }

    /// Rank as of `now`
    pub async fn rank_at(
        &self,
        window: LeaderboardWindow,
        now: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Leaderboard {
        let window_start = window.start(now);
        let generation = self.engine.generation().await;

        let cached = {
            let cache = self.cache.read().await;
            cache
                .get(&window)
                .filter(|c| c.generation == generation && c.window_start == window_start)
                .map(|c| c.entries.clone())
        };

        let entries = match cached {
            Some(entries) => entries,
            None => {
                let snapshot = self.engine.snapshot().await;
                let entries = Arc::new(compute_ranking(
                    &snapshot.records,
                    window_start,
                    |xp| self.engine.level_for(xp),
                ));
                debug!(
                    window = ?window,
                    generation = snapshot.generation,
                    users = entries.len(),
                    "Recomputed leaderboard"
                );
                self.cache.write().await.insert(
                    window,
                    CachedRanking {
                        generation: snapshot.generation,
                        window_start,
                        entries: entries.clone(),
                    },
                );
                entries
            }
        };

        let take = limit.unwrap_or(entries.len());
        Leaderboard {
            window,
            window_start,
            entries: entries.iter().take(take).cloned().collect(),
        }
    }
}

/// Aggregate awards at or after `since` and sort. Users without awards in the
/// window are left out.
fn compute_ranking(
    records: &[ReputationRecord],
    since: Option<DateTime<Utc>>,
    level_for: impl Fn(u64) -> u32,
) -> Vec<LeaderboardEntry> {
    let mut rows: Vec<LeaderboardEntry> = records
        .iter()
        .filter_map(|record| {
            let mut xp = 0u64;
            let mut verified_count = 0u32;
            let mut report_count = 0u32;
            let mut any = false;

            for award in record
                .awards
                .iter()
                .filter(|a| since.is_none_or(|start| a.awarded_at >= start))
            {
                any = true;
                xp = xp.saturating_add(award.xp);
                match award.kind {
                    AwardKind::Submitted => report_count += 1,
                    AwardKind::Verified => verified_count += 1,
                    _ => {}
                }
            }

            any.then(|| LeaderboardEntry {
                rank: 0,
                user_id: record.user_id.clone(),
                xp,
                level: level_for(record.xp),
                verified_count,
                report_count,
            })
        })
        .collect();

    rows.sort_by(|a, b| {
        b.xp.cmp(&a.xp)
            .then_with(|| b.verified_count.cmp(&a.verified_count))
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    for (i, row) in rows.iter_mut().enumerate() {
        row.rank = i + 1;
    }
    rows
}
