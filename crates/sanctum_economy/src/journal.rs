//! # Transaction Journal
//!
//! Append-only audit trail. Exactly one entry (or one per summoned unit,
//! see [`SummonGranularity`]) is written per committed mutation, inside the
//! store commit, so a rolled-back operation leaves no trace.
//!
//! Entries are indexed by player and by `(player, kind)` for history scans.
//! The only deletion path is [`TransactionJournal::purge_expired`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::account::PlayerId;
use crate::config::Tunables;
use crate::currency::CurrencyKind;
use crate::error::{EconomyError, EconomyResult};
use crate::journal_file::JournalFile;

/// Default retention window.
pub const DEFAULT_RETENTION_DAYS: u64 = 90;

const SECONDS_PER_DAY: u64 = 86_400;

/// Journal entry identifier, assigned in insertion order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry:{}", self.0)
    }
}

/// Operation kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    /// Currency or collectible granted.
    Grant,
    /// Currency consumed.
    Consume,
    /// A fusion attempt, successful or not.
    FusionAttempt,
    /// A summon (batch or unit).
    SummonAttempt,
    /// Currency moved between players. One entry per side.
    Transfer,
}

/// An entry waiting for commit.
#[derive(Clone, Debug, PartialEq)]
pub struct JournalDraft {
    /// Player affected.
    pub player: PlayerId,
    /// Operation kind.
    pub kind: JournalKind,
    /// Signed balance changes.
    pub deltas: BTreeMap<CurrencyKind, i64>,
    /// Structured context (tier rolled, success flag, reason).
    pub context: serde_json::Value,
}

impl JournalDraft {
    /// New draft with no deltas and a null context.
    #[must_use]
    pub fn new(player: PlayerId, kind: JournalKind) -> Self {
        Self {
            player,
            kind,
            deltas: BTreeMap::new(),
            context: serde_json::Value::Null,
        }
    }

    /// Adds a delta. Zero deltas are skipped.
    #[must_use]
    pub fn with_delta(mut self, kind: CurrencyKind, delta: i64) -> Self {
        if delta != 0 {
            *self.deltas.entry(kind).or_insert(0) += delta;
        }
        self
    }

    /// Sets the context payload.
    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// An immutable committed record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Unique id.
    pub id: EntryId,
    /// Player affected.
    pub player: PlayerId,
    /// Operation kind.
    pub kind: JournalKind,
    /// Signed balance changes.
    pub deltas: BTreeMap<CurrencyKind, i64>,
    /// Structured context.
    pub context: serde_json::Value,
    /// Server-assigned commit time.
    pub created_at: SystemTime,
}

/// How summon batches are journaled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SummonGranularity {
    /// One entry per batch, listing every unit.
    #[default]
    Batch,
    /// One entry per unit; the cost is carried by the first.
    Unit,
}

/// Journal tunables for one operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JournalSettings {
    /// Summon audit granularity.
    pub summon_granularity: SummonGranularity,
    /// Retention window.
    pub retention: Duration,
}

impl JournalSettings {
    /// Reads `journal.summon_granularity` and `journal.retention_days`.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` on unknown granularity or malformed retention.
    pub fn load(tunables: &Tunables<'_>) -> EconomyResult<Self> {
        let granularity = match tunables.text_or("journal.summon_granularity", "batch")?.as_str() {
            "batch" => SummonGranularity::Batch,
            "unit" => SummonGranularity::Unit,
            other => {
                return Err(EconomyError::InvalidConfig(format!(
                    "journal.summon_granularity: unknown value '{other}'"
                )))
            }
        };
        let days = tunables.unsigned_or("journal.retention_days", DEFAULT_RETENTION_DAYS)?;
        Ok(Self {
            summon_granularity: granularity,
            retention: Duration::from_secs(days.saturating_mul(SECONDS_PER_DAY)),
        })
    }
}

#[derive(Default)]
struct JournalInner {
    entries: BTreeMap<EntryId, JournalEntry>,
    by_player: HashMap<PlayerId, Vec<EntryId>>,
    by_player_kind: HashMap<(PlayerId, JournalKind), Vec<EntryId>>,
    next_id: u64,
}

impl JournalInner {
    fn index(&mut self, entry: JournalEntry) {
        self.by_player.entry(entry.player).or_default().push(entry.id);
        self.by_player_kind
            .entry((entry.player, entry.kind))
            .or_default()
            .push(entry.id);
        self.next_id = self.next_id.max(entry.id.0 + 1);
        self.entries.insert(entry.id, entry);
    }

    fn collect(&self, ids: Option<&Vec<EntryId>>) -> Vec<JournalEntry> {
        ids.map(|ids| ids.iter().filter_map(|id| self.entries.get(id).cloned()).collect())
            .unwrap_or_default()
    }
}

/// The append-only journal.
pub struct TransactionJournal {
    inner: RwLock<JournalInner>,
    file: Option<Mutex<JournalFile>>,
}

impl Default for TransactionJournal {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl TransactionJournal {
    /// Journal held only in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(JournalInner {
                next_id: 1,
                ..JournalInner::default()
            }),
            file: None,
        }
    }

    /// Journal backed by a file, replaying what it already holds.
    ///
    /// # Errors
    ///
    /// `Storage` if the file cannot be opened or has a bad header.
    pub fn open(path: impl AsRef<Path>) -> EconomyResult<Self> {
        let (file, replayed) = JournalFile::open(path)?;
        let mut inner = JournalInner {
            next_id: 1,
            ..JournalInner::default()
        };
        let count = replayed.len();
        for entry in replayed {
            inner.index(entry);
        }
        info!(replayed = count, next_id = inner.next_id, "journal recovered");
        Ok(Self {
            inner: RwLock::new(inner),
            file: Some(Mutex::new(file)),
        })
    }

    /// Appends drafts as one unit. Either all become entries or none do.
    ///
    /// # Errors
    ///
    /// `Storage` if the durable sink fails; nothing is recorded then.
    pub fn append(&self, drafts: Vec<JournalDraft>) -> EconomyResult<Vec<JournalEntry>> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }
        let mut inner = self.inner.write();
        let created_at = SystemTime::now();
        let entries: Vec<JournalEntry> = drafts
            .into_iter()
            .zip(inner.next_id..)
            .map(|(draft, id)| JournalEntry {
                id: EntryId(id),
                player: draft.player,
                kind: draft.kind,
                deltas: draft.deltas,
                context: draft.context,
                created_at,
            })
            .collect();

        if let Some(file) = &self.file {
            file.lock().append(&entries)?;
        }
        for entry in &entries {
            debug!(entry_id = entry.id.0, player = entry.player.0, kind = ?entry.kind, "journaled");
            inner.index(entry.clone());
        }
        Ok(entries)
    }

    /// Every entry for a player, oldest first.
    #[must_use]
    pub fn entries_for_player(&self, player: PlayerId) -> Vec<JournalEntry> {
        let inner = self.inner.read();
        inner.collect(inner.by_player.get(&player))
    }

    /// Entries of one kind for a player, oldest first.
    #[must_use]
    pub fn entries_for_player_kind(&self, player: PlayerId, kind: JournalKind) -> Vec<JournalEntry> {
        let inner = self.inner.read();
        inner.collect(inner.by_player_kind.get(&(player, kind)))
    }

    /// Entries of one kind across all players, oldest first.
    #[must_use]
    pub fn entries_of_kind(&self, kind: JournalKind) -> Vec<JournalEntry> {
        self.inner
            .read()
            .entries
            .values()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// One entry by id.
    #[must_use]
    pub fn entry(&self, id: EntryId) -> Option<JournalEntry> {
        self.inner.read().entries.get(&id).cloned()
    }

    /// Net currency movement recorded for a player.
    #[must_use]
    pub fn net_deltas(&self, player: PlayerId) -> BTreeMap<CurrencyKind, i64> {
        let mut totals = BTreeMap::new();
        for entry in self.entries_for_player(player) {
            for (kind, delta) in entry.deltas {
                *totals.entry(kind).or_insert(0) += delta;
            }
        }
        totals
    }

    /// Number of entries held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// True if no entries are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Removes entries older than `retention` as of `now`, compacting the
    /// file if there is one. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// `Storage` if compaction fails; memory is left untouched then.
    pub fn purge_expired(&self, now: SystemTime, retention: Duration) -> EconomyResult<usize> {
        let Some(cutoff) = now.checked_sub(retention) else {
            return Ok(0);
        };
        let mut inner = self.inner.write();
        let expired: Vec<EntryId> = inner
            .entries
            .values()
            .filter(|e| e.created_at < cutoff)
            .map(|e| e.id)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        if let Some(file) = &self.file {
            let kept: Vec<JournalEntry> = inner
                .entries
                .values()
                .filter(|e| e.created_at >= cutoff)
                .cloned()
                .collect();
            file.lock().compact(&kept)?;
        }

        for id in &expired {
            inner.entries.remove(id);
        }
        let JournalInner {
            entries,
            by_player,
            by_player_kind,
            ..
        } = &mut *inner;
        for ids in by_player.values_mut() {
            ids.retain(|id| entries.contains_key(id));
        }
        for ids in by_player_kind.values_mut() {
            ids.retain(|id| entries.contains_key(id));
        }
        by_player.retain(|_, ids| !ids.is_empty());
        by_player_kind.retain(|_, ids| !ids.is_empty());

        info!(purged = expired.len(), "journal retention applied");
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn grant(player: u64, lumees: i64) -> JournalDraft {
        JournalDraft::new(PlayerId(player), JournalKind::Grant)
            .with_delta(CurrencyKind::Lumees, lumees)
            .with_context(json!({ "reason": "test" }))
    }

    #[test]
    fn test_ids_are_sequential() {
        let journal = TransactionJournal::in_memory();
        let first = journal.append(vec![grant(1, 10), grant(2, 20)]).unwrap();
        let second = journal.append(vec![grant(1, 5)]).unwrap();
        assert_eq!(first[0].id, EntryId(1));
        assert_eq!(first[1].id, EntryId(2));
        assert_eq!(second[0].id, EntryId(3));
        assert_eq!(journal.len(), 3);
    }

    #[test]
    fn test_queries_by_player_and_kind() {
        let journal = TransactionJournal::in_memory();
        journal.append(vec![grant(1, 100)]).unwrap();
        journal
            .append(vec![JournalDraft::new(PlayerId(1), JournalKind::Consume)
                .with_delta(CurrencyKind::Lumees, -40)])
            .unwrap();
        journal.append(vec![grant(2, 7)]).unwrap();

        assert_eq!(journal.entries_for_player(PlayerId(1)).len(), 2);
        assert_eq!(
            journal
                .entries_for_player_kind(PlayerId(1), JournalKind::Consume)
                .len(),
            1
        );
        assert_eq!(journal.entries_of_kind(JournalKind::Grant).len(), 2);
        assert_eq!(journal.net_deltas(PlayerId(1))[&CurrencyKind::Lumees], 60);
    }

    #[test]
    fn test_zero_deltas_skipped() {
        let draft = JournalDraft::new(PlayerId(1), JournalKind::Grant).with_delta(CurrencyKind::Gems, 0);
        assert!(draft.deltas.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let journal = TransactionJournal::in_memory();
        journal.append(vec![grant(1, 1), grant(1, 2)]).unwrap();

        let retention = Duration::from_secs(90 * SECONDS_PER_DAY);
        assert_eq!(journal.purge_expired(SystemTime::now(), retention).unwrap(), 0);

        let later = SystemTime::now() + retention + Duration::from_secs(1);
        assert_eq!(journal.purge_expired(later, retention).unwrap(), 2);
        assert!(journal.is_empty());
        assert!(journal.entries_for_player(PlayerId(1)).is_empty());

        // Ids keep counting after a purge.
        let next = journal.append(vec![grant(1, 3)]).unwrap();
        assert_eq!(next[0].id, EntryId(3));
    }

    #[test]
    fn test_settings_defaults() {
        let config = crate::config::StaticConfig::new();
        let settings = JournalSettings::load(&Tunables::new(&config)).unwrap();
        assert_eq!(settings.summon_granularity, SummonGranularity::Batch);
        assert_eq!(settings.retention, Duration::from_secs(90 * SECONDS_PER_DAY));
    }
}
