//! Lernplan domain library: recurrence-date computation, capacity-constrained
//! day buckets, series lifecycle, the subject hierarchy with scheduling links,
//! and restorable calendar archives.
//! The core stays pure and synchronous; persistence is a thin JSON boundary
//! the planner writes through, and the in-memory state stays authoritative
//! for the running session.

pub mod core {
    //! Shared domain model: identifiers, calendar entries, repeat rules, the
    //! scheduling-link state machine, and the errors the stores raise.

    use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Weekday};
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    /* ------------------------------- Limits ------------------------------- */

    /// A day never holds more than four position-based blocks.
    pub const MAX_BLOCKS_PER_DAY: usize = 4;
    /// Sessions shorter than this are rejected as input mistakes.
    pub const MIN_SESSION_MINUTES: i64 = 15;
    /// Upper bound on the occurrence count of a repeat rule.
    pub const MAX_REPEAT_COUNT: u32 = 100;
    /// Hard bound on generator iterations so that a malformed end date still
    /// terminates.
    pub const REPEAT_ITERATION_CAP: u32 = 365;

    /* ------------------------------- IDs ------------------------------- */

    /// Id of a calendar entry (block or session).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct EntryId(pub Uuid);

    impl EntryId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl std::fmt::Display for EntryId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    /// Grouping key shared by every occurrence generated from one rule.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct SeriesId(pub Uuid);

    impl SeriesId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl std::fmt::Display for SeriesId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    /// Id of a node in the subject hierarchy (any level) or a to-do item.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct NodeId(pub Uuid);

    impl NodeId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl std::fmt::Display for NodeId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    /// Id of a topic-hierarchy root.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct PlanId(pub Uuid);

    impl PlanId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl std::fmt::Display for PlanId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    /// Id of an archived calendar snapshot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ArchiveId(pub Uuid);

    impl ArchiveId {
        pub fn new() -> Self {
            Self(Uuid::new_v4())
        }
    }

    impl std::fmt::Display for ArchiveId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            self.0.fmt(f)
        }
    }

    /* ------------------------------ Repeat rules ------------------------------ */

    /// How follow-up dates are derived from the original date.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "lowercase")]
    pub enum RepeatPattern {
        Daily,
        Weekly,
        Monthly,
        /// Walk forward day by day, keeping the dates whose weekday is in the
        /// set.
        Custom { weekdays: Vec<Weekday> },
    }

    /// Exactly one termination criterion exists per rule.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum RepeatEnd {
        /// Total number of occurrences, the original included.
        Count(u32),
        /// Last date (inclusive) an occurrence may fall on.
        Until(NaiveDate),
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RepeatRule {
        pub pattern: RepeatPattern,
        pub end: RepeatEnd,
    }

    impl RepeatRule {
        /// Validating constructor; the expression parser and every caller go
        /// through here.
        pub fn new(pattern: RepeatPattern, end: RepeatEnd) -> Result<Self, RuleError> {
            if let RepeatPattern::Custom { weekdays } = &pattern {
                if weekdays.is_empty() {
                    return Err(RuleError::EmptyWeekdaySet);
                }
            }
            if let RepeatEnd::Count(n) = end {
                if n == 0 || n > MAX_REPEAT_COUNT {
                    return Err(RuleError::CountOutOfRange(n));
                }
            }
            Ok(Self { pattern, end })
        }
    }

    /* ------------------------------ Calendar entries ------------------------------ */

    /// Category of a calendar entry; drives styling upstream and the archive
    /// projection here.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum BlockKind {
        #[default]
        Lernblock,
        Wiederholung,
        Klausur,
        Privat,
    }

    impl BlockKind {
        pub fn as_str(&self) -> &'static str {
            match self {
                BlockKind::Lernblock => "lernblock",
                BlockKind::Wiederholung => "wiederholung",
                BlockKind::Klausur => "klausur",
                BlockKind::Privat => "privat",
            }
        }
    }

    /// Which subject-tree slot a block's content came from. Free-form text;
    /// the hierarchy references the calendar by id, never the other way
    /// around.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BlockContent {
        pub title: String,
        pub rechtsgebiet: Option<String>,
        pub unterrechtsgebiet: Option<String>,
        pub thema: Option<String>,
    }

    /// A checklist line inside a block.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BlockTask {
        pub text: String,
        #[serde(default)]
        pub done: bool,
    }

    /// Membership tag carried by every occurrence of a series, so a single
    /// entry can render "occurrence k of n" without consulting the rest of
    /// the group.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SeriesMembership {
        pub series_id: SeriesId,
        /// 1-based; the original occurrence is 1.
        pub index: u32,
        /// Original plus the generated occurrences that were actually placed.
        pub total: u32,
    }

    /// One occupied position on one day. `date` plus `position` is unique
    /// within the block store.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BlockAllocation {
        pub id: EntryId,
        pub date: NaiveDate,
        /// 1..=4.
        pub position: u8,
        pub kind: BlockKind,
        pub content: BlockContent,
        #[serde(default)]
        pub tasks: Vec<BlockTask>,
        pub series: Option<SeriesMembership>,
        /// Only the original occurrence of a series carries the rule.
        pub repeat: Option<RepeatRule>,
    }

    /// A time-ranged entry without a position ceiling. `end_date` is set only
    /// for spans that cross midnight.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Session {
        pub id: EntryId,
        pub date: NaiveDate,
        pub end_date: Option<NaiveDate>,
        pub start_time: NaiveTime,
        pub end_time: NaiveTime,
        pub kind: BlockKind,
        pub title: String,
        pub series: Option<SeriesMembership>,
        pub repeat: Option<RepeatRule>,
    }

    impl Session {
        pub fn last_date(&self) -> NaiveDate {
            self.end_date.unwrap_or(self.date)
        }

        /// Whether the closed interval `[date, end_date]` touches `day`.
        pub fn covers(&self, day: NaiveDate) -> bool {
            self.date <= day && day <= self.last_date()
        }

        pub fn starts_at(&self) -> NaiveDateTime {
            NaiveDateTime::new(self.date, self.start_time)
        }

        pub fn ends_at(&self) -> NaiveDateTime {
            NaiveDateTime::new(self.last_date(), self.end_time)
        }
    }

    /// Outcome of a (possibly repeating) insert. Skipped dates are the full
    /// days a generated occurrence could not be placed on; the rest of the
    /// series is written regardless.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct SeriesCreation {
        pub original: EntryId,
        pub series_id: Option<SeriesId>,
        pub created_dates: Vec<NaiveDate>,
        pub skipped_dates: Vec<NaiveDate>,
    }

    /* --------------------------- Scheduling links --------------------------- */

    /// Occupancy marker connecting a hierarchy leaf or to-do to a calendar
    /// entry. An explicit state rather than an optional field: consumers can
    /// always tell "never scheduled" from "link present but possibly stale".
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(tag = "state", rename_all = "lowercase")]
    pub enum ScheduleState {
        #[default]
        Unscheduled,
        Scheduled(ScheduleLink),
    }

    impl ScheduleState {
        pub fn link(&self) -> Option<&ScheduleLink> {
            match self {
                ScheduleState::Scheduled(link) => Some(link),
                ScheduleState::Unscheduled => None,
            }
        }

        pub fn is_scheduled(&self) -> bool {
            matches!(self, ScheduleState::Scheduled(_))
        }
    }

    /// The link payload. The referenced block may be deleted later without
    /// the link being invalidated eagerly; the cleanup sweep is the only
    /// proactive invalidation.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ScheduleLink {
        pub block_id: EntryId,
        pub date: NaiveDate,
        pub block_title: String,
        pub scheduled_at: NaiveDateTime,
    }

    /* ------------------------------ Plan metadata ------------------------------ */

    /// Wizard defaults captured when a plan is generated; archived and
    /// restored together with the calendar.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct WizardSettings {
        pub blocks_per_day: u8,
        pub default_kind: BlockKind,
    }

    impl Default for WizardSettings {
        fn default() -> Self {
            Self {
                blocks_per_day: 2,
                default_kind: BlockKind::Lernblock,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PlannerSettings {
        /// When off, chapters collapse into one hidden container per
        /// sub-area.
        pub has_kapitel: bool,
        #[serde(default)]
        pub wizard: WizardSettings,
    }

    impl Default for PlannerSettings {
        fn default() -> Self {
            Self {
                has_kapitel: true,
                wizard: WizardSettings::default(),
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PlanMeta {
        pub name: String,
        pub exam_date: Option<NaiveDate>,
        pub created_at: NaiveDateTime,
        /// Stamped when this state came back out of the archive.
        pub restored_at: Option<NaiveDateTime>,
    }

    impl PlanMeta {
        pub fn new(name: impl Into<String>, now: NaiveDateTime) -> Self {
            Self {
                name: name.into(),
                exam_date: None,
                created_at: now,
                restored_at: None,
            }
        }
    }

    /* ------------------------------ Errors ------------------------------ */

    #[derive(Debug, PartialEq, Eq, thiserror::Error)]
    pub enum StoreError {
        #[error("{date} already holds 4 blocks")]
        CapacityExceeded { date: NaiveDate },
        #[error("requested slot on {date} is not free")]
        InsufficientCapacity { date: NaiveDate },
        #[error("end time must lie at least 15 minutes after the start")]
        InvalidTimeRange,
        #[error("entry {0} not found")]
        EntryNotFound(EntryId),
        #[error("hierarchy node not found")]
        NodeNotFound,
        #[error("archive {0} not found")]
        ArchiveNotFound(ArchiveId),
    }

    #[derive(Debug, PartialEq, Eq, thiserror::Error)]
    pub enum RuleError {
        #[error("a custom repeat needs at least one weekday")]
        EmptyWeekdaySet,
        #[error("repeat count {0} is out of range (1..=100)")]
        CountOutOfRange(u32),
    }
}

pub mod recur {
    //! Pure recurrence-date computation. Given the original date and a rule,
    //! produce the ordered follow-up dates; the original itself is never part
    //! of the output.

    use crate::core::{
        MAX_REPEAT_COUNT, REPEAT_ITERATION_CAP, RepeatEnd, RepeatPattern, RepeatRule,
    };
    use chrono::{Datelike as _, Days, Months, NaiveDate, Weekday};

    /// Ordered dates generated by `rule` after `start`.
    ///
    /// Under `RepeatEnd::Count(n)` the result holds `n - 1` dates, so the
    /// original plus the generated ones add up to `n`. Under
    /// `RepeatEnd::Until(d)` emission stops once a candidate passes `d`; the
    /// iteration cap bounds the walk even when the end date lies in the past
    /// or the weekday set never matches.
    pub fn generated_dates(start: NaiveDate, rule: &RepeatRule) -> Vec<NaiveDate> {
        match &rule.pattern {
            RepeatPattern::Daily => stepped(start, rule.end, |s, i| {
                s.checked_add_days(Days::new(u64::from(i)))
            }),
            RepeatPattern::Weekly => stepped(start, rule.end, |s, i| {
                s.checked_add_days(Days::new(u64::from(i) * 7))
            }),
            // Calendar month arithmetic; the day of month is clamped by
            // chrono when the target month is shorter.
            RepeatPattern::Monthly => stepped(start, rule.end, |s, i| {
                s.checked_add_months(Months::new(i))
            }),
            RepeatPattern::Custom { weekdays } => custom_walk(start, rule.end, weekdays),
        }
    }

    /// How many dates the generator still owes, given the termination mode.
    fn wanted(end: RepeatEnd) -> u32 {
        match end {
            // The count includes the original occurrence.
            RepeatEnd::Count(n) => n.min(MAX_REPEAT_COUNT).saturating_sub(1),
            RepeatEnd::Until(_) => REPEAT_ITERATION_CAP,
        }
    }

    fn stepped(
        start: NaiveDate,
        end: RepeatEnd,
        step: impl Fn(NaiveDate, u32) -> Option<NaiveDate>,
    ) -> Vec<NaiveDate> {
        let wanted = wanted(end);
        let mut out = Vec::new();
        for i in 1..=wanted {
            let Some(candidate) = step(start, i) else {
                break;
            };
            if let RepeatEnd::Until(last) = end {
                if candidate > last {
                    break;
                }
            }
            out.push(candidate);
        }
        out
    }

    fn custom_walk(start: NaiveDate, end: RepeatEnd, weekdays: &[Weekday]) -> Vec<NaiveDate> {
        if weekdays.is_empty() {
            // Rejected at rule construction; degrade to "no dates" if such a
            // rule slips through anyway.
            return Vec::new();
        }
        let wanted = wanted(end);
        // A non-empty set matches at least once per week, so count mode is
        // bounded by wanted * 7 days; until mode falls under the global cap.
        let day_budget = match end {
            RepeatEnd::Count(_) => wanted * 7 + 7,
            RepeatEnd::Until(_) => REPEAT_ITERATION_CAP,
        };
        let mut out = Vec::new();
        let mut cursor = start;
        for _ in 0..day_budget {
            let Some(next) = cursor.succ_opt() else {
                break;
            };
            cursor = next;
            if let RepeatEnd::Until(last) = end {
                if cursor > last {
                    break;
                }
            }
            if !weekdays.contains(&cursor.weekday()) {
                continue;
            }
            out.push(cursor);
            if out.len() as u32 >= wanted {
                break;
            }
        }
        out
    }

}

pub mod blocks {
    //! Capacity-constrained day buckets for position-based blocks. Four
    //! positions per day, never duplicated; empty day keys are dropped
    //! eagerly so the store never accumulates dangling buckets.

    use crate::core::{
        BlockAllocation, BlockContent, BlockKind, BlockTask, EntryId, MAX_BLOCKS_PER_DAY,
        RepeatRule, SeriesCreation, SeriesId, SeriesMembership, StoreError,
    };
    use crate::recur::generated_dates;
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use serde_with::{DisplayFromStr, serde_as};
    use std::collections::BTreeMap;
    use tracing::debug;

    /// What a new block looks like before the store assigns id and position.
    #[derive(Debug, Clone, Default)]
    pub struct BlockDraft {
        pub kind: BlockKind,
        pub content: BlockContent,
        pub tasks: Vec<BlockTask>,
    }

    /// Patch for `update`; `None` fields stay untouched.
    #[derive(Debug, Clone, Default)]
    pub struct BlockPatch {
        pub kind: Option<BlockKind>,
        pub content: Option<BlockContent>,
        pub tasks: Option<Vec<BlockTask>>,
        /// Requesting a different position re-derives the free slots first.
        pub position: Option<u8>,
    }

    #[serde_as]
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BlockStore {
        #[serde_as(as = "BTreeMap<DisplayFromStr, _>")]
        days: BTreeMap<NaiveDate, Vec<BlockAllocation>>,
    }

    impl BlockStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn from_days(days: BTreeMap<NaiveDate, Vec<BlockAllocation>>) -> Self {
            let mut store = Self { days };
            store.days.retain(|_, entries| !entries.is_empty());
            store
        }

        pub fn days(&self) -> &BTreeMap<NaiveDate, Vec<BlockAllocation>> {
            &self.days
        }

        pub fn into_days(self) -> BTreeMap<NaiveDate, Vec<BlockAllocation>> {
            self.days
        }

        pub fn blocks_on(&self, date: NaiveDate) -> &[BlockAllocation] {
            self.days.get(&date).map(Vec::as_slice).unwrap_or(&[])
        }

        pub fn len(&self) -> usize {
            self.days.values().map(Vec::len).sum()
        }

        pub fn is_empty(&self) -> bool {
            self.days.is_empty()
        }

        pub fn find(&self, id: EntryId) -> Option<&BlockAllocation> {
            self.days.values().flatten().find(|b| b.id == id)
        }

        /// Lowest unoccupied position on `date`, if any.
        fn free_position(&self, date: NaiveDate) -> Option<u8> {
            let taken: Vec<u8> = self.blocks_on(date).iter().map(|b| b.position).collect();
            (1..=MAX_BLOCKS_PER_DAY as u8).find(|p| !taken.contains(p))
        }

        /// Insert the original occurrence and, when a rule is present, its
        /// generated series. A full start day rejects the whole call with no
        /// writes; a full generated day is skipped and reported while the
        /// remaining dates are still written. Everything lands in memory at
        /// once so the caller can persist it as one batch.
        pub fn add_original_and_series(
            &mut self,
            date: NaiveDate,
            draft: BlockDraft,
            repeat: Option<RepeatRule>,
        ) -> Result<SeriesCreation, StoreError> {
            let Some(position) = self.free_position(date) else {
                return Err(StoreError::CapacityExceeded { date });
            };

            let Some(rule) = repeat else {
                let id = self.place(date, position, &draft, None, None);
                return Ok(SeriesCreation {
                    original: id,
                    series_id: None,
                    created_dates: vec![],
                    skipped_dates: vec![],
                });
            };

            // Capacity is checked independently per generated date; one
            // occupied day must not invalidate the whole series.
            let mut open = Vec::new();
            let mut skipped = Vec::new();
            for gen_date in generated_dates(date, &rule) {
                if self.free_position(gen_date).is_some() {
                    open.push(gen_date);
                } else {
                    skipped.push(gen_date);
                }
            }

            let series_id = SeriesId::new();
            let total = 1 + open.len() as u32;
            let original = self.place(
                date,
                position,
                &draft,
                Some(SeriesMembership {
                    series_id,
                    index: 1,
                    total,
                }),
                Some(rule),
            );
            for (offset, gen_date) in open.iter().enumerate() {
                if let Some(gen_position) = self.free_position(*gen_date) {
                    self.place(
                        *gen_date,
                        gen_position,
                        &draft,
                        Some(SeriesMembership {
                            series_id,
                            index: offset as u32 + 2,
                            total,
                        }),
                        None,
                    );
                }
            }
            debug!(
                %series_id,
                created = open.len(),
                skipped = skipped.len(),
                "created block series"
            );
            Ok(SeriesCreation {
                original,
                series_id: Some(series_id),
                created_dates: open,
                skipped_dates: skipped,
            })
        }

        fn place(
            &mut self,
            date: NaiveDate,
            position: u8,
            draft: &BlockDraft,
            series: Option<SeriesMembership>,
            repeat: Option<RepeatRule>,
        ) -> EntryId {
            let alloc = BlockAllocation {
                id: EntryId::new(),
                date,
                position,
                kind: draft.kind,
                content: draft.content.clone(),
                tasks: draft.tasks.clone(),
                series,
                repeat,
            };
            let id = alloc.id;
            self.days.entry(date).or_default().push(alloc);
            id
        }

        /// Remove one entry; deleting the last entry of a day drops the day
        /// key itself.
        pub fn delete(&mut self, date: NaiveDate, id: EntryId) -> Result<BlockAllocation, StoreError> {
            let entries = self
                .days
                .get_mut(&date)
                .ok_or(StoreError::EntryNotFound(id))?;
            let idx = entries
                .iter()
                .position(|b| b.id == id)
                .ok_or(StoreError::EntryNotFound(id))?;
            let removed = entries.remove(idx);
            if entries.is_empty() {
                self.days.remove(&date);
            }
            Ok(removed)
        }

        /// Remove every entry matching `pred`; emptied day keys go with them.
        pub fn remove_where(
            &mut self,
            mut pred: impl FnMut(&BlockAllocation) -> bool,
        ) -> Vec<BlockAllocation> {
            let mut removed = Vec::new();
            self.days.retain(|_, entries| {
                let mut kept = Vec::with_capacity(entries.len());
                for entry in entries.drain(..) {
                    if pred(&entry) {
                        removed.push(entry);
                    } else {
                        kept.push(entry);
                    }
                }
                *entries = kept;
                !entries.is_empty()
            });
            removed
        }

        /// Apply a patch. A position change re-derives the free slots and
        /// fails with `InsufficientCapacity` before anything is written, so a
        /// failed resize leaves the old allocation untouched.
        pub fn update(
            &mut self,
            date: NaiveDate,
            id: EntryId,
            patch: BlockPatch,
        ) -> Result<(), StoreError> {
            if let Some(new_pos) = patch.position {
                let in_range = (1..=MAX_BLOCKS_PER_DAY as u8).contains(&new_pos);
                let taken_by_other = self
                    .blocks_on(date)
                    .iter()
                    .any(|b| b.position == new_pos && b.id != id);
                if !in_range || taken_by_other {
                    return Err(StoreError::InsufficientCapacity { date });
                }
            }
            let entries = self
                .days
                .get_mut(&date)
                .ok_or(StoreError::EntryNotFound(id))?;
            let block = entries
                .iter_mut()
                .find(|b| b.id == id)
                .ok_or(StoreError::EntryNotFound(id))?;
            if let Some(kind) = patch.kind {
                block.kind = kind;
            }
            if let Some(content) = patch.content {
                block.content = content;
            }
            if let Some(tasks) = patch.tasks {
                block.tasks = tasks;
            }
            if let Some(position) = patch.position {
                block.position = position;
            }
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::{RepeatEnd, RepeatPattern};

        fn d(y: i32, m: u32, day: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, day).unwrap()
        }

        fn draft(title: &str) -> BlockDraft {
            BlockDraft {
                kind: BlockKind::Lernblock,
                content: BlockContent {
                    title: title.into(),
                    ..BlockContent::default()
                },
                tasks: vec![],
            }
        }

        fn fill_day(store: &mut BlockStore, date: NaiveDate) {
            for i in 0..MAX_BLOCKS_PER_DAY {
                store
                    .add_original_and_series(date, draft(&format!("filler {i}")), None)
                    .unwrap();
            }
        }

        #[test]
        fn fifth_block_on_a_day_is_rejected_without_writes() {
            let mut store = BlockStore::new();
            let date = d(2026, 2, 2);
            fill_day(&mut store, date);
            let err = store
                .add_original_and_series(date, draft("overflow"), None)
                .unwrap_err();
            assert_eq!(err, StoreError::CapacityExceeded { date });
            assert_eq!(store.blocks_on(date).len(), MAX_BLOCKS_PER_DAY);
        }

        #[test]
        fn positions_are_unique_and_within_bounds() {
            let mut store = BlockStore::new();
            let date = d(2026, 2, 2);
            fill_day(&mut store, date);
            let mut positions: Vec<u8> =
                store.blocks_on(date).iter().map(|b| b.position).collect();
            positions.sort_unstable();
            assert_eq!(positions, vec![1, 2, 3, 4]);
        }

        #[test]
        fn deleting_frees_the_position_for_reuse() {
            let mut store = BlockStore::new();
            let date = d(2026, 2, 2);
            let first = store
                .add_original_and_series(date, draft("a"), None)
                .unwrap();
            store
                .add_original_and_series(date, draft("b"), None)
                .unwrap();
            store.delete(date, first.original).unwrap();
            let again = store
                .add_original_and_series(date, draft("c"), None)
                .unwrap();
            let block = store.find(again.original).unwrap();
            assert_eq!(block.position, 1);
        }

        #[test]
        fn deleting_the_last_entry_drops_the_day_key() {
            let mut store = BlockStore::new();
            let date = d(2026, 2, 2);
            let created = store
                .add_original_and_series(date, draft("only"), None)
                .unwrap();
            store.delete(date, created.original).unwrap();
            assert!(!store.days().contains_key(&date));
        }

        #[test]
        fn full_generated_dates_are_skipped_not_fatal() {
            let mut store = BlockStore::new();
            let monday = d(2026, 1, 5);
            let friday = d(2026, 1, 9);
            fill_day(&mut store, friday);

            let rule = RepeatRule::new(RepeatPattern::Daily, RepeatEnd::Count(5)).unwrap();
            let outcome = store
                .add_original_and_series(monday, draft("lernen"), Some(rule))
                .unwrap();

            assert_eq!(outcome.skipped_dates, vec![friday]);
            assert_eq!(
                outcome.created_dates,
                vec![d(2026, 1, 6), d(2026, 1, 7), d(2026, 1, 8)]
            );
            // Monday through Thursday hold the series; Friday only the
            // fillers.
            for day in [monday, d(2026, 1, 6), d(2026, 1, 7), d(2026, 1, 8)] {
                assert_eq!(store.blocks_on(day).iter().filter(|b| b.series.is_some()).count(), 1);
            }
            assert!(store.blocks_on(friday).iter().all(|b| b.series.is_none()));
        }

        #[test]
        fn only_the_original_carries_the_rule() {
            let mut store = BlockStore::new();
            let rule = RepeatRule::new(RepeatPattern::Weekly, RepeatEnd::Count(3)).unwrap();
            let outcome = store
                .add_original_and_series(d(2026, 1, 5), draft("serie"), Some(rule))
                .unwrap();
            let with_rule: Vec<_> = store
                .days()
                .values()
                .flatten()
                .filter(|b| b.repeat.is_some())
                .collect();
            assert_eq!(with_rule.len(), 1);
            assert_eq!(with_rule[0].id, outcome.original);
            let membership = with_rule[0].series.unwrap();
            assert_eq!((membership.index, membership.total), (1, 3));
        }

        #[test]
        fn series_indices_are_consecutive_and_dated_in_order() {
            let mut store = BlockStore::new();
            let rule = RepeatRule::new(RepeatPattern::Daily, RepeatEnd::Count(4)).unwrap();
            store
                .add_original_and_series(d(2026, 1, 5), draft("serie"), Some(rule))
                .unwrap();
            let mut tagged: Vec<(NaiveDate, u32)> = store
                .days()
                .values()
                .flatten()
                .filter_map(|b| b.series.map(|m| (b.date, m.index)))
                .collect();
            tagged.sort();
            assert_eq!(
                tagged,
                vec![
                    (d(2026, 1, 5), 1),
                    (d(2026, 1, 6), 2),
                    (d(2026, 1, 7), 3),
                    (d(2026, 1, 8), 4)
                ]
            );
        }

        #[test]
        fn update_to_an_occupied_position_leaves_the_block_untouched() {
            let mut store = BlockStore::new();
            let date = d(2026, 2, 2);
            let first = store
                .add_original_and_series(date, draft("a"), None)
                .unwrap();
            let second = store
                .add_original_and_series(date, draft("b"), None)
                .unwrap();
            let err = store
                .update(
                    date,
                    second.original,
                    BlockPatch {
                        position: Some(1),
                        ..BlockPatch::default()
                    },
                )
                .unwrap_err();
            assert_eq!(err, StoreError::InsufficientCapacity { date });
            assert_eq!(store.find(second.original).unwrap().position, 2);
            assert_eq!(store.find(first.original).unwrap().position, 1);
        }

        #[test]
        fn update_moves_to_a_free_position() {
            let mut store = BlockStore::new();
            let date = d(2026, 2, 2);
            let created = store
                .add_original_and_series(date, draft("a"), None)
                .unwrap();
            store
                .update(
                    date,
                    created.original,
                    BlockPatch {
                        position: Some(3),
                        ..BlockPatch::default()
                    },
                )
                .unwrap();
            assert_eq!(store.find(created.original).unwrap().position, 3);
        }
    }
}

pub mod sessions {
    //! Free-form, time-ranged entries. No position ceiling; writes are gated
    //! only by time-range sanity. Multi-day sessions are keyed by their start
    //! date and resolved per day at query time.

    use crate::core::{
        BlockKind, EntryId, MIN_SESSION_MINUTES, RepeatRule, SeriesCreation, Session, SeriesId,
        SeriesMembership, StoreError,
    };
    use crate::recur::generated_dates;
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use serde::{Deserialize, Serialize};
    use serde_with::{DisplayFromStr, serde_as};
    use std::collections::BTreeMap;
    use tracing::debug;

    /// What a new session looks like before the store assigns an id.
    #[derive(Debug, Clone)]
    pub struct SessionDraft {
        pub title: String,
        pub kind: BlockKind,
        pub start_time: NaiveTime,
        pub end_time: NaiveTime,
        /// Set only when the span crosses midnight.
        pub end_date: Option<NaiveDate>,
    }

    /// Patch for `update`; `None` fields stay untouched. The combined time
    /// range is re-validated before anything is written.
    #[derive(Debug, Clone, Default)]
    pub struct SessionPatch {
        pub title: Option<String>,
        pub kind: Option<BlockKind>,
        pub start_time: Option<NaiveTime>,
        pub end_time: Option<NaiveTime>,
        pub end_date: Option<Option<NaiveDate>>,
    }

    #[serde_as]
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SessionStore {
        #[serde_as(as = "BTreeMap<DisplayFromStr, _>")]
        days: BTreeMap<NaiveDate, Vec<Session>>,
    }

    impl SessionStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn from_days(days: BTreeMap<NaiveDate, Vec<Session>>) -> Self {
            let mut store = Self { days };
            store.days.retain(|_, entries| !entries.is_empty());
            store
        }

        pub fn days(&self) -> &BTreeMap<NaiveDate, Vec<Session>> {
            &self.days
        }

        pub fn into_days(self) -> BTreeMap<NaiveDate, Vec<Session>> {
            self.days
        }

        pub fn len(&self) -> usize {
            self.days.values().map(Vec::len).sum()
        }

        pub fn is_empty(&self) -> bool {
            self.days.is_empty()
        }

        pub fn find(&self, id: EntryId) -> Option<&Session> {
            self.days.values().flatten().find(|s| s.id == id)
        }

        /// Every session whose closed interval touches `date`, multi-day
        /// spans included.
        pub fn sessions_on(&self, date: NaiveDate) -> Vec<&Session> {
            self.days
                .range(..=date)
                .flat_map(|(_, entries)| entries)
                .filter(|s| s.covers(date))
                .collect()
        }

        fn validate(date: NaiveDate, start_time: NaiveTime, end_time: NaiveTime, end_date: Option<NaiveDate>) -> Result<(), StoreError> {
            let last = end_date.unwrap_or(date);
            if last < date {
                return Err(StoreError::InvalidTimeRange);
            }
            let start = NaiveDateTime::new(date, start_time);
            let end = NaiveDateTime::new(last, end_time);
            if (end - start).num_minutes() < MIN_SESSION_MINUTES {
                return Err(StoreError::InvalidTimeRange);
            }
            Ok(())
        }

        /// Same contract as the block store, minus the capacity ceiling:
        /// there is nothing to skip, so a repeating insert creates every
        /// generated date. Generated occurrences keep the day-span length of
        /// the original.
        pub fn add_original_and_series(
            &mut self,
            date: NaiveDate,
            draft: SessionDraft,
            repeat: Option<RepeatRule>,
        ) -> Result<SeriesCreation, StoreError> {
            Self::validate(date, draft.start_time, draft.end_time, draft.end_date)?;

            let Some(rule) = repeat else {
                let id = self.place(date, &draft, None, None);
                return Ok(SeriesCreation {
                    original: id,
                    series_id: None,
                    created_dates: vec![],
                    skipped_dates: vec![],
                });
            };

            let span = draft.end_date.map(|last| last - date);
            let created = generated_dates(date, &rule);
            let series_id = SeriesId::new();
            let total = 1 + created.len() as u32;
            let original = self.place(
                date,
                &draft,
                Some(SeriesMembership {
                    series_id,
                    index: 1,
                    total,
                }),
                Some(rule),
            );
            for (offset, gen_date) in created.iter().enumerate() {
                let shifted = SessionDraft {
                    end_date: span.map(|days| *gen_date + days),
                    ..draft.clone()
                };
                self.place(
                    *gen_date,
                    &shifted,
                    Some(SeriesMembership {
                        series_id,
                        index: offset as u32 + 2,
                        total,
                    }),
                    None,
                );
            }
            debug!(%series_id, created = created.len(), "created session series");
            Ok(SeriesCreation {
                original,
                series_id: Some(series_id),
                created_dates: created,
                skipped_dates: vec![],
            })
        }

        fn place(
            &mut self,
            date: NaiveDate,
            draft: &SessionDraft,
            series: Option<SeriesMembership>,
            repeat: Option<RepeatRule>,
        ) -> EntryId {
            let session = Session {
                id: EntryId::new(),
                date,
                end_date: draft.end_date,
                start_time: draft.start_time,
                end_time: draft.end_time,
                kind: draft.kind,
                title: draft.title.clone(),
                series,
                repeat,
            };
            let id = session.id;
            self.days.entry(date).or_default().push(session);
            id
        }

        /// Remove one entry; deleting the last entry of a day drops the day
        /// key itself.
        pub fn delete(&mut self, date: NaiveDate, id: EntryId) -> Result<Session, StoreError> {
            let entries = self
                .days
                .get_mut(&date)
                .ok_or(StoreError::EntryNotFound(id))?;
            let idx = entries
                .iter()
                .position(|s| s.id == id)
                .ok_or(StoreError::EntryNotFound(id))?;
            let removed = entries.remove(idx);
            if entries.is_empty() {
                self.days.remove(&date);
            }
            Ok(removed)
        }

        /// Remove every entry matching `pred`; emptied day keys go with them.
        pub fn remove_where(&mut self, mut pred: impl FnMut(&Session) -> bool) -> Vec<Session> {
            let mut removed = Vec::new();
            self.days.retain(|_, entries| {
                let mut kept = Vec::with_capacity(entries.len());
                for entry in entries.drain(..) {
                    if pred(&entry) {
                        removed.push(entry);
                    } else {
                        kept.push(entry);
                    }
                }
                *entries = kept;
                !entries.is_empty()
            });
            removed
        }

        /// Apply a patch; the resulting time range is validated first and a
        /// rejected patch leaves the session untouched.
        pub fn update(
            &mut self,
            date: NaiveDate,
            id: EntryId,
            patch: SessionPatch,
        ) -> Result<(), StoreError> {
            let entries = self
                .days
                .get_mut(&date)
                .ok_or(StoreError::EntryNotFound(id))?;
            let session = entries
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or(StoreError::EntryNotFound(id))?;

            let start_time = patch.start_time.unwrap_or(session.start_time);
            let end_time = patch.end_time.unwrap_or(session.end_time);
            let end_date = patch.end_date.unwrap_or(session.end_date);
            Self::validate(date, start_time, end_time, end_date)?;

            if let Some(title) = patch.title {
                session.title = title;
            }
            if let Some(kind) = patch.kind {
                session.kind = kind;
            }
            session.start_time = start_time;
            session.end_time = end_time;
            session.end_date = end_date;
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::{RepeatEnd, RepeatPattern};

        fn d(y: i32, m: u32, day: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, day).unwrap()
        }

        fn t(h: u32, m: u32) -> NaiveTime {
            NaiveTime::from_hms_opt(h, m, 0).unwrap()
        }

        fn draft(start: NaiveTime, end: NaiveTime) -> SessionDraft {
            SessionDraft {
                title: "Privat".into(),
                kind: BlockKind::Privat,
                start_time: start,
                end_time: end,
                end_date: None,
            }
        }

        #[test]
        fn backwards_range_is_rejected() {
            let mut store = SessionStore::new();
            let err = store
                .add_original_and_series(d(2026, 1, 5), draft(t(10, 0), t(9, 0)), None)
                .unwrap_err();
            assert_eq!(err, StoreError::InvalidTimeRange);
            assert!(store.is_empty());
        }

        #[test]
        fn too_short_range_is_rejected_not_clamped() {
            let mut store = SessionStore::new();
            let err = store
                .add_original_and_series(d(2026, 1, 5), draft(t(9, 0), t(9, 10)), None)
                .unwrap_err();
            assert_eq!(err, StoreError::InvalidTimeRange);
        }

        #[test]
        fn fifteen_minutes_is_the_accepted_floor() {
            let mut store = SessionStore::new();
            store
                .add_original_and_series(d(2026, 1, 5), draft(t(9, 0), t(9, 15)), None)
                .unwrap();
            assert_eq!(store.len(), 1);
        }

        #[test]
        fn no_position_ceiling_applies() {
            let mut store = SessionStore::new();
            let date = d(2026, 1, 5);
            for i in 0..6 {
                store
                    .add_original_and_series(date, draft(t(8 + i, 0), t(8 + i, 45)), None)
                    .unwrap();
            }
            assert_eq!(store.sessions_on(date).len(), 6);
        }

        #[test]
        fn multi_day_session_is_visible_on_every_covered_day() {
            let mut store = SessionStore::new();
            let start = d(2026, 1, 5);
            let session = SessionDraft {
                end_date: Some(d(2026, 1, 7)),
                ..draft(t(22, 0), t(6, 0))
            };
            store.add_original_and_series(start, session, None).unwrap();
            for day in [start, d(2026, 1, 6), d(2026, 1, 7)] {
                assert_eq!(store.sessions_on(day).len(), 1, "missing on {day}");
            }
            assert!(store.sessions_on(d(2026, 1, 8)).is_empty());
            assert!(store.sessions_on(d(2026, 1, 4)).is_empty());
        }

        #[test]
        fn overnight_span_waives_the_same_day_floor() {
            let mut store = SessionStore::new();
            let session = SessionDraft {
                end_date: Some(d(2026, 1, 6)),
                ..draft(t(23, 50), t(0, 10))
            };
            store
                .add_original_and_series(d(2026, 1, 5), session, None)
                .unwrap();
            assert_eq!(store.len(), 1);
        }

        #[test]
        fn weekly_series_shifts_the_span_per_occurrence() {
            let mut store = SessionStore::new();
            let rule = RepeatRule::new(RepeatPattern::Weekly, RepeatEnd::Count(3)).unwrap();
            let session = SessionDraft {
                end_date: Some(d(2026, 1, 6)),
                ..draft(t(22, 0), t(6, 0))
            };
            let outcome = store
                .add_original_and_series(d(2026, 1, 5), session, Some(rule))
                .unwrap();
            assert_eq!(outcome.created_dates, vec![d(2026, 1, 12), d(2026, 1, 19)]);
            assert!(outcome.skipped_dates.is_empty());
            let second = store
                .days()
                .get(&d(2026, 1, 12))
                .and_then(|v| v.first())
                .unwrap();
            assert_eq!(second.end_date, Some(d(2026, 1, 13)));
            assert_eq!(second.series.unwrap().index, 2);
        }

        #[test]
        fn rejected_update_leaves_the_session_untouched() {
            let mut store = SessionStore::new();
            let date = d(2026, 1, 5);
            let created = store
                .add_original_and_series(date, draft(t(9, 0), t(10, 0)), None)
                .unwrap();
            let err = store
                .update(
                    date,
                    created.original,
                    SessionPatch {
                        end_time: Some(t(9, 5)),
                        ..SessionPatch::default()
                    },
                )
                .unwrap_err();
            assert_eq!(err, StoreError::InvalidTimeRange);
            assert_eq!(store.find(created.original).unwrap().end_time, t(10, 0));
        }
    }
}

pub mod series {
    //! Series lifecycle across both stores. Creation is owned by the stores
    //! themselves; this layer groups the cross-store operations: wholesale
    //! deletion and the rebuild strategies applied when an edit changes the
    //! repeat settings. Membership is never diffed incrementally.

    use crate::blocks::{BlockDraft, BlockStore};
    use crate::core::{
        EntryId, RepeatRule, SeriesCreation, SeriesId, SeriesMembership, StoreError,
    };
    use crate::sessions::{SessionDraft, SessionStore};
    use chrono::NaiveDate;
    use tracing::debug;

    /// How an edit to repeat settings is realized.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum RepeatEditStrategy {
        /// Repeat settings did not change shape; a plain field edit suffices.
        KeepAsIs,
        /// A standalone entry gained a rule: delete it, create a fresh
        /// series.
        PromoteToSeries,
        /// A series member lost the rule: delete the whole series, keep one
        /// plain entry.
        CollapseToSingle,
        /// A series member changed the rule: delete the old series, create a
        /// new one.
        Regenerate,
    }

    pub fn edit_strategy(in_series: bool, has_new_rule: bool) -> RepeatEditStrategy {
        match (in_series, has_new_rule) {
            (false, false) => RepeatEditStrategy::KeepAsIs,
            (false, true) => RepeatEditStrategy::PromoteToSeries,
            (true, false) => RepeatEditStrategy::CollapseToSingle,
            (true, true) => RepeatEditStrategy::Regenerate,
        }
    }

    fn in_series(membership: &Option<SeriesMembership>, series_id: SeriesId) -> bool {
        membership.as_ref().is_some_and(|m| m.series_id == series_id)
    }

    /// Remove every occurrence tagged with `series_id` from both stores in
    /// one pass over the in-memory snapshot. An unknown id is a no-op, not an
    /// error, and the call is idempotent.
    pub fn delete_series(
        blocks: &mut BlockStore,
        sessions: &mut SessionStore,
        series_id: SeriesId,
    ) -> usize {
        let removed = blocks.remove_where(|b| in_series(&b.series, series_id)).len()
            + sessions.remove_where(|s| in_series(&s.series, series_id)).len();
        if removed > 0 {
            debug!(%series_id, removed, "deleted series");
        }
        removed
    }

    /// Re-shape a block's series when an edit toggles repeat on or off or
    /// changes the rule. The old occurrences are always deleted and rebuilt;
    /// the edited occurrence's date and content seed the replacement.
    pub fn convert_block_repeat(
        blocks: &mut BlockStore,
        sessions: &mut SessionStore,
        date: NaiveDate,
        id: EntryId,
        new_rule: Option<RepeatRule>,
    ) -> Result<SeriesCreation, StoreError> {
        let existing = blocks.find(id).ok_or(StoreError::EntryNotFound(id))?;
        let old_series = existing.series.map(|m| m.series_id);
        let draft = BlockDraft {
            kind: existing.kind,
            content: existing.content.clone(),
            tasks: existing.tasks.clone(),
        };
        match (old_series, new_rule) {
            (None, None) => Ok(SeriesCreation {
                original: id,
                series_id: None,
                created_dates: vec![],
                skipped_dates: vec![],
            }),
            (None, Some(rule)) => {
                blocks.delete(date, id)?;
                blocks.add_original_and_series(date, draft, Some(rule))
            }
            (Some(series_id), new_rule) => {
                delete_series(blocks, sessions, series_id);
                blocks.add_original_and_series(date, draft, new_rule)
            }
        }
    }

    /// Session counterpart of `convert_block_repeat`.
    pub fn convert_session_repeat(
        blocks: &mut BlockStore,
        sessions: &mut SessionStore,
        date: NaiveDate,
        id: EntryId,
        new_rule: Option<RepeatRule>,
    ) -> Result<SeriesCreation, StoreError> {
        let existing = sessions.find(id).ok_or(StoreError::EntryNotFound(id))?;
        let old_series = existing.series.map(|m| m.series_id);
        let span = existing.end_date.map(|last| last - existing.date);
        let draft = SessionDraft {
            title: existing.title.clone(),
            kind: existing.kind,
            start_time: existing.start_time,
            end_time: existing.end_time,
            end_date: span.map(|days| date + days),
        };
        match (old_series, new_rule) {
            (None, None) => Ok(SeriesCreation {
                original: id,
                series_id: None,
                created_dates: vec![],
                skipped_dates: vec![],
            }),
            (None, Some(rule)) => {
                sessions.delete(date, id)?;
                sessions.add_original_and_series(date, draft, Some(rule))
            }
            (Some(series_id), new_rule) => {
                delete_series(blocks, sessions, series_id);
                sessions.add_original_and_series(date, draft, new_rule)
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::{BlockContent, BlockKind, RepeatEnd, RepeatPattern};

        fn d(y: i32, m: u32, day: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, day).unwrap()
        }

        fn draft(title: &str) -> BlockDraft {
            BlockDraft {
                kind: BlockKind::Lernblock,
                content: BlockContent {
                    title: title.into(),
                    ..BlockContent::default()
                },
                tasks: vec![],
            }
        }

        fn weekly(count: u32) -> RepeatRule {
            RepeatRule::new(RepeatPattern::Weekly, RepeatEnd::Count(count)).unwrap()
        }

        #[test]
        fn delete_series_clears_every_occurrence_and_is_idempotent() {
            let mut blocks = BlockStore::new();
            let mut sessions = SessionStore::new();
            let outcome = blocks
                .add_original_and_series(d(2026, 1, 5), draft("serie"), Some(weekly(4)))
                .unwrap();
            let series_id = outcome.series_id.unwrap();
            assert_eq!(blocks.len(), 4);

            assert_eq!(delete_series(&mut blocks, &mut sessions, series_id), 4);
            let survivors = blocks
                .days()
                .values()
                .flatten()
                .filter(|b| in_series(&b.series, series_id))
                .count();
            assert_eq!(survivors, 0);
            assert!(blocks.is_empty());

            // Second pass is a no-op, not an error.
            assert_eq!(delete_series(&mut blocks, &mut sessions, series_id), 0);
        }

        #[test]
        fn delete_series_leaves_unrelated_entries_alone() {
            let mut blocks = BlockStore::new();
            let mut sessions = SessionStore::new();
            let kept = blocks
                .add_original_and_series(d(2026, 1, 5), draft("einzeln"), None)
                .unwrap();
            let doomed = blocks
                .add_original_and_series(d(2026, 1, 5), draft("serie"), Some(weekly(3)))
                .unwrap();
            delete_series(&mut blocks, &mut sessions, doomed.series_id.unwrap());
            assert!(blocks.find(kept.original).is_some());
            assert_eq!(blocks.len(), 1);
        }

        #[test]
        fn promoting_a_standalone_entry_builds_a_fresh_series() {
            let mut blocks = BlockStore::new();
            let mut sessions = SessionStore::new();
            let date = d(2026, 1, 5);
            let single = blocks
                .add_original_and_series(date, draft("einzeln"), None)
                .unwrap();
            let outcome =
                convert_block_repeat(&mut blocks, &mut sessions, date, single.original, Some(weekly(3)))
                    .unwrap();
            assert!(outcome.series_id.is_some());
            assert_eq!(blocks.len(), 3);
            // The old standalone entry is gone.
            assert!(blocks.find(single.original).is_none());
        }

        #[test]
        fn collapsing_a_series_keeps_one_plain_entry() {
            let mut blocks = BlockStore::new();
            let mut sessions = SessionStore::new();
            let date = d(2026, 1, 5);
            let outcome = blocks
                .add_original_and_series(date, draft("serie"), Some(weekly(4)))
                .unwrap();
            let collapsed =
                convert_block_repeat(&mut blocks, &mut sessions, date, outcome.original, None)
                    .unwrap();
            assert!(collapsed.series_id.is_none());
            assert_eq!(blocks.len(), 1);
            let survivor = blocks.find(collapsed.original).unwrap();
            assert!(survivor.series.is_none());
            assert!(survivor.repeat.is_none());
        }

        #[test]
        fn regenerating_replaces_the_whole_series() {
            let mut blocks = BlockStore::new();
            let mut sessions = SessionStore::new();
            let date = d(2026, 1, 5);
            let old = blocks
                .add_original_and_series(date, draft("serie"), Some(weekly(4)))
                .unwrap();
            let new = convert_block_repeat(
                &mut blocks,
                &mut sessions,
                date,
                old.original,
                Some(RepeatRule::new(RepeatPattern::Daily, RepeatEnd::Count(2)).unwrap()),
            )
            .unwrap();
            assert_ne!(old.series_id, new.series_id);
            assert_eq!(blocks.len(), 2);
            let old_id = old.series_id.unwrap();
            assert!(
                blocks
                    .days()
                    .values()
                    .flatten()
                    .all(|b| !in_series(&b.series, old_id))
            );
        }

        #[test]
        fn strategy_table_matches_the_four_cases() {
            assert_eq!(edit_strategy(false, false), RepeatEditStrategy::KeepAsIs);
            assert_eq!(edit_strategy(false, true), RepeatEditStrategy::PromoteToSeries);
            assert_eq!(edit_strategy(true, false), RepeatEditStrategy::CollapseToSingle);
            assert_eq!(edit_strategy(true, true), RepeatEditStrategy::Regenerate);
        }
    }
}

pub mod hierarchy {
    //! The subject tree: Rechtsgebiet → Unterrechtsgebiet → Kapitel → Thema,
    //! with Aufgaben as leaves. Every mutation routes through one path-step
    //! helper per level instead of hand-written nesting, and sibling branches
    //! are never touched.

    use crate::core::{NodeId, PlanId, ScheduleState, StoreError};
    use serde::{Deserialize, Serialize};

    /* ------------------------------- Nodes ------------------------------- */

    /// A dateless topic tree: the template/archival artifact as well as the
    /// live hierarchy backing a plan.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Themenliste {
        pub id: PlanId,
        pub name: String,
        #[serde(default)]
        pub rechtsgebiete: Vec<Rechtsgebiet>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Rechtsgebiet {
        pub id: NodeId,
        pub name: String,
        #[serde(default)]
        pub unterrechtsgebiete: Vec<Unterrechtsgebiet>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Unterrechtsgebiet {
        pub id: NodeId,
        pub name: String,
        #[serde(default)]
        pub kapitel: Vec<Kapitel>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Kapitel {
        pub id: NodeId,
        pub name: String,
        /// Synthetic container created by flattening; UIs skip the title.
        #[serde(default)]
        pub hidden: bool,
        #[serde(default)]
        pub themen: Vec<Thema>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Thema {
        pub id: NodeId,
        pub name: String,
        #[serde(default)]
        pub aufgaben: Vec<Aufgabe>,
        #[serde(default)]
        pub schedule: ScheduleState,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Aufgabe {
        pub id: NodeId,
        pub text: String,
        #[serde(default)]
        pub completed: bool,
        #[serde(default)]
        pub schedule: ScheduleState,
    }

    impl Themenliste {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                id: PlanId::new(),
                name: name.into(),
                rechtsgebiete: vec![],
            }
        }
    }

    impl Rechtsgebiet {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                id: NodeId::new(),
                name: name.into(),
                unterrechtsgebiete: vec![],
            }
        }
    }

    impl Unterrechtsgebiet {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                id: NodeId::new(),
                name: name.into(),
                kapitel: vec![],
            }
        }
    }

    impl Kapitel {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                id: NodeId::new(),
                name: name.into(),
                hidden: false,
                themen: vec![],
            }
        }
    }

    impl Thema {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                id: NodeId::new(),
                name: name.into(),
                aufgaben: vec![],
                schedule: ScheduleState::Unscheduled,
            }
        }

        /// A Thema counts as completed once it has Aufgaben and all of them
        /// are done.
        pub fn is_completed(&self) -> bool {
            !self.aufgaben.is_empty() && self.aufgaben.iter().all(|a| a.completed)
        }
    }

    impl Aufgabe {
        pub fn new(text: impl Into<String>) -> Self {
            Self {
                id: NodeId::new(),
                text: text.into(),
                completed: false,
                schedule: ScheduleState::Unscheduled,
            }
        }
    }

    /* ------------------------------- Paths ------------------------------- */

    /// Id chains addressing one branch of the tree. Each level extends the
    /// one above; mutations walk, they never rebuild siblings.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UrgPath {
        pub rechtsgebiet: NodeId,
        pub unterrechtsgebiet: NodeId,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KapitelPath {
        pub rechtsgebiet: NodeId,
        pub unterrechtsgebiet: NodeId,
        pub kapitel: NodeId,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThemaPath {
        pub rechtsgebiet: NodeId,
        pub unterrechtsgebiet: NodeId,
        pub kapitel: NodeId,
        pub thema: NodeId,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AufgabePath {
        pub rechtsgebiet: NodeId,
        pub unterrechtsgebiet: NodeId,
        pub kapitel: NodeId,
        pub thema: NodeId,
        pub aufgabe: NodeId,
    }

    impl UrgPath {
        pub fn kapitel(self, kapitel: NodeId) -> KapitelPath {
            KapitelPath {
                rechtsgebiet: self.rechtsgebiet,
                unterrechtsgebiet: self.unterrechtsgebiet,
                kapitel,
            }
        }
    }

    impl KapitelPath {
        pub fn thema(self, thema: NodeId) -> ThemaPath {
            ThemaPath {
                rechtsgebiet: self.rechtsgebiet,
                unterrechtsgebiet: self.unterrechtsgebiet,
                kapitel: self.kapitel,
                thema,
            }
        }
    }

    impl ThemaPath {
        pub fn aufgabe(self, aufgabe: NodeId) -> AufgabePath {
            AufgabePath {
                rechtsgebiet: self.rechtsgebiet,
                unterrechtsgebiet: self.unterrechtsgebiet,
                kapitel: self.kapitel,
                thema: self.thema,
                aufgabe,
            }
        }
    }

    /// The single path-step every level reuses.
    fn child_mut<T>(
        items: &mut [T],
        id: NodeId,
        ident: impl Fn(&T) -> NodeId,
    ) -> Result<&mut T, StoreError> {
        items
            .iter_mut()
            .find(|n| ident(n) == id)
            .ok_or(StoreError::NodeNotFound)
    }

    fn remove_child<T>(
        items: &mut Vec<T>,
        id: NodeId,
        ident: impl Fn(&T) -> NodeId,
    ) -> Result<T, StoreError> {
        let idx = items
            .iter()
            .position(|n| ident(n) == id)
            .ok_or(StoreError::NodeNotFound)?;
        Ok(items.remove(idx))
    }

    /* ------------------------------ Operations ------------------------------ */

    impl Themenliste {
        pub fn rechtsgebiet_mut(&mut self, id: NodeId) -> Result<&mut Rechtsgebiet, StoreError> {
            child_mut(&mut self.rechtsgebiete, id, |n| n.id)
        }

        pub fn unterrechtsgebiet_mut(
            &mut self,
            path: UrgPath,
        ) -> Result<&mut Unterrechtsgebiet, StoreError> {
            child_mut(
                &mut self.rechtsgebiet_mut(path.rechtsgebiet)?.unterrechtsgebiete,
                path.unterrechtsgebiet,
                |n| n.id,
            )
        }

        pub fn kapitel_mut(&mut self, path: KapitelPath) -> Result<&mut Kapitel, StoreError> {
            let parent = UrgPath {
                rechtsgebiet: path.rechtsgebiet,
                unterrechtsgebiet: path.unterrechtsgebiet,
            };
            child_mut(
                &mut self.unterrechtsgebiet_mut(parent)?.kapitel,
                path.kapitel,
                |n| n.id,
            )
        }

        pub fn thema_mut(&mut self, path: ThemaPath) -> Result<&mut Thema, StoreError> {
            let parent = KapitelPath {
                rechtsgebiet: path.rechtsgebiet,
                unterrechtsgebiet: path.unterrechtsgebiet,
                kapitel: path.kapitel,
            };
            child_mut(&mut self.kapitel_mut(parent)?.themen, path.thema, |n| n.id)
        }

        pub fn aufgabe_mut(&mut self, path: AufgabePath) -> Result<&mut Aufgabe, StoreError> {
            let parent = ThemaPath {
                rechtsgebiet: path.rechtsgebiet,
                unterrechtsgebiet: path.unterrechtsgebiet,
                kapitel: path.kapitel,
                thema: path.thema,
            };
            child_mut(&mut self.thema_mut(parent)?.aufgaben, path.aufgabe, |n| n.id)
        }

        /* ----------------------------- Rechtsgebiet ----------------------------- */

        pub fn add_rechtsgebiet(&mut self, name: impl Into<String>) -> NodeId {
            let node = Rechtsgebiet::new(name);
            let id = node.id;
            self.rechtsgebiete.push(node);
            id
        }

        pub fn rename_rechtsgebiet(
            &mut self,
            id: NodeId,
            name: impl Into<String>,
        ) -> Result<(), StoreError> {
            self.rechtsgebiet_mut(id)?.name = name.into();
            Ok(())
        }

        pub fn delete_rechtsgebiet(&mut self, id: NodeId) -> Result<Rechtsgebiet, StoreError> {
            remove_child(&mut self.rechtsgebiete, id, |n| n.id)
        }

        /* --------------------------- Unterrechtsgebiet --------------------------- */

        pub fn add_unterrechtsgebiet(
            &mut self,
            rechtsgebiet: NodeId,
            name: impl Into<String>,
        ) -> Result<NodeId, StoreError> {
            let node = Unterrechtsgebiet::new(name);
            let id = node.id;
            self.rechtsgebiet_mut(rechtsgebiet)?
                .unterrechtsgebiete
                .push(node);
            Ok(id)
        }

        pub fn rename_unterrechtsgebiet(
            &mut self,
            path: UrgPath,
            name: impl Into<String>,
        ) -> Result<(), StoreError> {
            self.unterrechtsgebiet_mut(path)?.name = name.into();
            Ok(())
        }

        pub fn delete_unterrechtsgebiet(
            &mut self,
            path: UrgPath,
        ) -> Result<Unterrechtsgebiet, StoreError> {
            let parent = self.rechtsgebiet_mut(path.rechtsgebiet)?;
            remove_child(&mut parent.unterrechtsgebiete, path.unterrechtsgebiet, |n| n.id)
        }

        /* ------------------------------- Kapitel ------------------------------- */

        pub fn add_kapitel(
            &mut self,
            path: UrgPath,
            name: impl Into<String>,
        ) -> Result<NodeId, StoreError> {
            let node = Kapitel::new(name);
            let id = node.id;
            self.unterrechtsgebiet_mut(path)?.kapitel.push(node);
            Ok(id)
        }

        pub fn rename_kapitel(
            &mut self,
            path: KapitelPath,
            name: impl Into<String>,
        ) -> Result<(), StoreError> {
            self.kapitel_mut(path)?.name = name.into();
            Ok(())
        }

        pub fn delete_kapitel(&mut self, path: KapitelPath) -> Result<Kapitel, StoreError> {
            let parent = UrgPath {
                rechtsgebiet: path.rechtsgebiet,
                unterrechtsgebiet: path.unterrechtsgebiet,
            };
            let urg = self.unterrechtsgebiet_mut(parent)?;
            remove_child(&mut urg.kapitel, path.kapitel, |n| n.id)
        }

        /* -------------------------------- Thema -------------------------------- */

        pub fn add_thema(
            &mut self,
            path: KapitelPath,
            name: impl Into<String>,
        ) -> Result<NodeId, StoreError> {
            let node = Thema::new(name);
            let id = node.id;
            self.kapitel_mut(path)?.themen.push(node);
            Ok(id)
        }

        pub fn rename_thema(
            &mut self,
            path: ThemaPath,
            name: impl Into<String>,
        ) -> Result<(), StoreError> {
            self.thema_mut(path)?.name = name.into();
            Ok(())
        }

        pub fn delete_thema(&mut self, path: ThemaPath) -> Result<Thema, StoreError> {
            let parent = KapitelPath {
                rechtsgebiet: path.rechtsgebiet,
                unterrechtsgebiet: path.unterrechtsgebiet,
                kapitel: path.kapitel,
            };
            let kapitel = self.kapitel_mut(parent)?;
            remove_child(&mut kapitel.themen, path.thema, |n| n.id)
        }

        /* ------------------------------- Aufgabe ------------------------------- */

        pub fn add_aufgabe(
            &mut self,
            path: ThemaPath,
            text: impl Into<String>,
        ) -> Result<NodeId, StoreError> {
            let node = Aufgabe::new(text);
            let id = node.id;
            self.thema_mut(path)?.aufgaben.push(node);
            Ok(id)
        }

        pub fn update_aufgabe(
            &mut self,
            path: AufgabePath,
            text: Option<String>,
            completed: Option<bool>,
        ) -> Result<(), StoreError> {
            let aufgabe = self.aufgabe_mut(path)?;
            if let Some(text) = text {
                aufgabe.text = text;
            }
            if let Some(completed) = completed {
                aufgabe.completed = completed;
            }
            Ok(())
        }

        pub fn delete_aufgabe(&mut self, path: AufgabePath) -> Result<Aufgabe, StoreError> {
            let parent = ThemaPath {
                rechtsgebiet: path.rechtsgebiet,
                unterrechtsgebiet: path.unterrechtsgebiet,
                kapitel: path.kapitel,
                thema: path.thema,
            };
            let thema = self.thema_mut(parent)?;
            remove_child(&mut thema.aufgaben, path.aufgabe, |n| n.id)
        }

        /* ---------------------------- Bulk transforms ---------------------------- */

        /// Collapse every sub-area's chapters into one synthetic hidden
        /// chapter holding all Themen in order. Chapter titles are lost on
        /// purpose; running twice is a no-op.
        pub fn flatten_all_kapitel(&mut self) {
            for rechtsgebiet in &mut self.rechtsgebiete {
                for urg in &mut rechtsgebiet.unterrechtsgebiete {
                    if urg.kapitel.is_empty() {
                        continue;
                    }
                    if urg.kapitel.len() == 1 && urg.kapitel[0].hidden {
                        continue;
                    }
                    let themen: Vec<Thema> = urg
                        .kapitel
                        .drain(..)
                        .flat_map(|k| k.themen)
                        .collect();
                    urg.kapitel.push(Kapitel {
                        id: NodeId::new(),
                        name: String::new(),
                        hidden: true,
                        themen,
                    });
                }
            }
        }

        /// Graft donor subtrees with every id regenerated, so importing the
        /// same template twice yields disjoint nodes. Schedule links and
        /// completion flags are reset; a template describes work to do, not
        /// work done.
        pub fn import_template(&mut self, donors: Vec<Rechtsgebiet>) -> Vec<NodeId> {
            donors
                .into_iter()
                .map(|mut rechtsgebiet| {
                    refresh_ids(&mut rechtsgebiet);
                    let id = rechtsgebiet.id;
                    self.rechtsgebiete.push(rechtsgebiet);
                    id
                })
                .collect()
        }
    }

    fn refresh_ids(rechtsgebiet: &mut Rechtsgebiet) {
        rechtsgebiet.id = NodeId::new();
        for urg in &mut rechtsgebiet.unterrechtsgebiete {
            urg.id = NodeId::new();
            for kapitel in &mut urg.kapitel {
                kapitel.id = NodeId::new();
                for thema in &mut kapitel.themen {
                    thema.id = NodeId::new();
                    thema.schedule = ScheduleState::Unscheduled;
                    for aufgabe in &mut thema.aufgaben {
                        aufgabe.id = NodeId::new();
                        aufgabe.completed = false;
                        aufgabe.schedule = ScheduleState::Unscheduled;
                    }
                }
            }
        }
    }

    /* ------------------------- OCR candidate trees ------------------------- */

    /// Candidate tree as returned by the external structuring service. Only
    /// names and task strings are consumed; `lines` and `raw_text` ride along
    /// for display.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct OcrPayload {
        pub fach: String,
        #[serde(default)]
        pub kapitel: Vec<OcrKapitel>,
        #[serde(default)]
        pub themen: Vec<OcrThema>,
        #[serde(default)]
        pub lines: Vec<String>,
        #[serde(default)]
        pub raw_text: String,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct OcrKapitel {
        pub name: String,
        #[serde(default)]
        pub themen: Vec<OcrThema>,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct OcrThema {
        pub name: String,
        #[serde(default)]
        pub aufgaben: Vec<String>,
    }

    impl OcrPayload {
        /// Shape the payload into one subject subtree ready for
        /// `import_template`. Loose Themen arriving outside any chapter land
        /// in a trailing default chapter.
        pub fn candidate_tree(&self) -> Rechtsgebiet {
            let mut urg = Unterrechtsgebiet::new(&self.fach);
            for kapitel in &self.kapitel {
                urg.kapitel.push(make_kapitel(&kapitel.name, &kapitel.themen));
            }
            if !self.themen.is_empty() {
                urg.kapitel.push(make_kapitel("Weitere Themen", &self.themen));
            }
            let mut rechtsgebiet = Rechtsgebiet::new(&self.fach);
            rechtsgebiet.unterrechtsgebiete.push(urg);
            rechtsgebiet
        }
    }

    fn make_kapitel(name: &str, themen: &[OcrThema]) -> Kapitel {
        let mut kapitel = Kapitel::new(name);
        for thema in themen {
            let mut node = Thema::new(&thema.name);
            for aufgabe in &thema.aufgaben {
                node.aufgaben.push(Aufgabe::new(aufgabe));
            }
            kapitel.themen.push(node);
        }
        kapitel
    }

}

pub mod links {
    //! Transitions of the scheduling-link state machine and the expiry sweep.
    //! Links reference calendar entries by id and date only; nothing points
    //! back, so consumers treat a dangling link as unscheduled and the sweep
    //! here is the only proactive invalidation.

    use crate::core::{NodeId, ScheduleLink, ScheduleState};
    use crate::hierarchy::{Thema, Themenliste};
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use tracing::info;

    /// A to-do item outside the subject tree that can still occupy a slot.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TodoItem {
        pub id: NodeId,
        pub text: String,
        #[serde(default)]
        pub completed: bool,
        #[serde(default)]
        pub schedule: ScheduleState,
    }

    impl TodoItem {
        pub fn new(text: impl Into<String>) -> Self {
            Self {
                id: NodeId::new(),
                text: text.into(),
                completed: false,
                schedule: ScheduleState::Unscheduled,
            }
        }
    }

    /// Link a Thema and cascade the same link onto every child Aufgabe, so
    /// topic- and task-level occupancy agree at assignment time. A later
    /// individual unschedule does not cascade back; the two views may
    /// diverge afterwards.
    pub fn schedule_thema(thema: &mut Thema, link: ScheduleLink) {
        for aufgabe in &mut thema.aufgaben {
            aufgabe.schedule = ScheduleState::Scheduled(link.clone());
        }
        thema.schedule = ScheduleState::Scheduled(link);
    }

    /// Unlink a Thema together with its Aufgaben (the mirror of
    /// `schedule_thema`).
    pub fn unschedule_thema(thema: &mut Thema) {
        for aufgabe in &mut thema.aufgaben {
            aufgabe.schedule = ScheduleState::Unscheduled;
        }
        thema.schedule = ScheduleState::Unscheduled;
    }

    /// Clear every link whose date lies before `today` on leaves that are
    /// not completed. Completed leaves keep their link as a historical
    /// record. Runs once at startup, not continuously.
    pub fn cleanup_expired(
        hierarchy: Option<&mut Themenliste>,
        todos: &mut [TodoItem],
        today: NaiveDate,
    ) -> usize {
        let mut cleared = 0;
        if let Some(plan) = hierarchy {
            for rechtsgebiet in &mut plan.rechtsgebiete {
                for urg in &mut rechtsgebiet.unterrechtsgebiete {
                    for kapitel in &mut urg.kapitel {
                        for thema in &mut kapitel.themen {
                            let thema_done = thema.is_completed();
                            if expire(&mut thema.schedule, thema_done, today) {
                                cleared += 1;
                            }
                            for aufgabe in &mut thema.aufgaben {
                                if expire(&mut aufgabe.schedule, aufgabe.completed, today) {
                                    cleared += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        for todo in todos {
            if expire(&mut todo.schedule, todo.completed, today) {
                cleared += 1;
            }
        }
        if cleared > 0 {
            info!(cleared, "expired stale schedule links");
        }
        cleared
    }

    fn expire(state: &mut ScheduleState, completed: bool, today: NaiveDate) -> bool {
        let stale = state.link().is_some_and(|link| link.date < today);
        if stale && !completed {
            *state = ScheduleState::Unscheduled;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::core::EntryId;
        use chrono::{NaiveDate, NaiveTime};

        fn d(y: i32, m: u32, day: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, day).unwrap()
        }

        fn link_on(date: NaiveDate) -> ScheduleLink {
            ScheduleLink {
                block_id: EntryId::new(),
                date,
                block_title: "Lernblock".into(),
                scheduled_at: date.and_time(NaiveTime::from_hms_opt(8, 0, 0).unwrap()),
            }
        }

        #[test]
        fn scheduling_a_thema_cascades_onto_every_aufgabe() {
            let mut thema = Thema::new("Mängelrechte");
            thema.aufgaben.push(crate::hierarchy::Aufgabe::new("a"));
            thema.aufgaben.push(crate::hierarchy::Aufgabe::new("b"));
            schedule_thema(&mut thema, link_on(d(2026, 3, 2)));
            assert!(thema.schedule.is_scheduled());
            assert!(thema.aufgaben.iter().all(|a| a.schedule.is_scheduled()));
        }

        #[test]
        fn individual_unschedule_leaves_the_thema_link_in_place() {
            let mut thema = Thema::new("Mängelrechte");
            thema.aufgaben.push(crate::hierarchy::Aufgabe::new("a"));
            schedule_thema(&mut thema, link_on(d(2026, 3, 2)));
            thema.aufgaben[0].schedule = ScheduleState::Unscheduled;
            // The divergence is accepted; nothing re-cascades.
            assert!(thema.schedule.is_scheduled());
            assert!(!thema.aufgaben[0].schedule.is_scheduled());
        }

        #[test]
        fn expired_link_on_an_open_todo_is_cleared() {
            let today = d(2026, 3, 3);
            let mut todo = TodoItem::new("BGB AT wiederholen");
            todo.schedule = ScheduleState::Scheduled(link_on(d(2026, 3, 2)));
            let cleared = cleanup_expired(None, std::slice::from_mut(&mut todo), today);
            assert_eq!(cleared, 1);
            assert_eq!(todo.schedule, ScheduleState::Unscheduled);
        }

        #[test]
        fn expired_link_on_a_completed_todo_is_kept_as_history() {
            let today = d(2026, 3, 3);
            let mut todo = TodoItem::new("BGB AT wiederholen");
            todo.completed = true;
            todo.schedule = ScheduleState::Scheduled(link_on(d(2026, 3, 2)));
            let cleared = cleanup_expired(None, std::slice::from_mut(&mut todo), today);
            assert_eq!(cleared, 0);
            assert!(todo.schedule.is_scheduled());
        }

        #[test]
        fn todays_link_is_not_expired() {
            let today = d(2026, 3, 3);
            let mut todo = TodoItem::new("heute");
            todo.schedule = ScheduleState::Scheduled(link_on(today));
            assert_eq!(cleanup_expired(None, std::slice::from_mut(&mut todo), today), 0);
            assert!(todo.schedule.is_scheduled());
        }

        #[test]
        fn sweep_walks_the_whole_hierarchy() {
            let mut plan = Themenliste::new("Examen");
            let rg = plan.add_rechtsgebiet("Zivilrecht");
            let urg = plan.add_unterrechtsgebiet(rg, "Schuldrecht").unwrap();
            let urg_path = crate::hierarchy::UrgPath {
                rechtsgebiet: rg,
                unterrechtsgebiet: urg,
            };
            let kapitel = plan.add_kapitel(urg_path, "Kaufrecht").unwrap();
            let kapitel_path = urg_path.kapitel(kapitel);
            let thema_id = plan.add_thema(kapitel_path, "Mängelrechte").unwrap();
            let thema_path = kapitel_path.thema(thema_id);
            plan.add_aufgabe(thema_path, "Fälle lesen").unwrap();

            let yesterday = d(2026, 3, 2);
            let thema = plan.thema_mut(thema_path).unwrap();
            schedule_thema(thema, link_on(yesterday));

            let cleared = cleanup_expired(Some(&mut plan), &mut [], d(2026, 3, 3));
            // Thema plus its one Aufgabe.
            assert_eq!(cleared, 2);
            let thema = plan.thema_mut(thema_path).unwrap();
            assert!(!thema.schedule.is_scheduled());
            assert!(!thema.aufgaben[0].schedule.is_scheduled());
        }
    }
}

pub mod archive {
    //! Restorable snapshots of the whole calendar state. Snapshots are
    //! immutable once taken; restore consumes them.

    use crate::blocks::BlockStore;
    use crate::core::{ArchiveId, PlanMeta, PlannerSettings, StoreError};
    use crate::sessions::SessionStore;
    use chrono::NaiveDateTime;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};

    /// Everything that lives while a plan is active. The hierarchy and the
    /// to-do list are independent trees and stay out of calendar snapshots.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct LiveState {
        pub blocks: BlockStore,
        pub sessions: SessionStore,
        pub meta: PlanMeta,
        pub settings: PlannerSettings,
    }

    /// Immutable snapshot of a whole calendar. Created by `archive`, consumed
    /// by restore or by the lossy topic-list projection.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ArchivedPlan {
        pub id: ArchiveId,
        pub name: String,
        pub state: LiveState,
        pub archived_at: NaiveDateTime,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct ArchiveManager {
        archives: IndexMap<ArchiveId, ArchivedPlan>,
    }

    impl ArchiveManager {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn from_archives(archives: Vec<ArchivedPlan>) -> Self {
            Self {
                archives: archives.into_iter().map(|a| (a.id, a)).collect(),
            }
        }

        pub fn len(&self) -> usize {
            self.archives.len()
        }

        pub fn is_empty(&self) -> bool {
            self.archives.is_empty()
        }

        pub fn get(&self, id: ArchiveId) -> Option<&ArchivedPlan> {
            self.archives.get(&id)
        }

        pub fn list(&self) -> impl Iterator<Item = &ArchivedPlan> {
            self.archives.values()
        }

        /// Snapshot `live` under a fresh id. The caller replaces its live
        /// state afterwards; the manager never clears anything it does not
        /// own.
        pub fn archive(&mut self, live: LiveState, now: NaiveDateTime) -> ArchiveId {
            let id = ArchiveId::new();
            let name = live.meta.name.clone();
            self.archives.insert(
                id,
                ArchivedPlan {
                    id,
                    name,
                    state: live,
                    archived_at: now,
                },
            );
            id
        }

        /// Remove and return a snapshot so it can be re-materialized as live
        /// state. Taking it first means a later failure cannot leave the same
        /// state live and archived at once.
        pub fn take_snapshot(&mut self, id: ArchiveId) -> Result<ArchivedPlan, StoreError> {
            self.archives
                .shift_remove(&id)
                .ok_or(StoreError::ArchiveNotFound(id))
        }

        /// Swap `current` for the chosen snapshot: the current state is
        /// archived first so restore never destroys unarchived work, the
        /// consumed snapshot leaves the archive, and the returned state
        /// carries a `restored_at` stamp instead of an `archived_at` one.
        pub fn restore(
            &mut self,
            id: ArchiveId,
            current: LiveState,
            now: NaiveDateTime,
        ) -> Result<LiveState, StoreError> {
            let snapshot = self.take_snapshot(id)?;
            self.archive(current, now);
            let mut state = snapshot.state;
            state.meta.restored_at = Some(now);
            Ok(state)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::blocks::BlockDraft;
        use crate::core::{BlockContent, BlockKind, PlanMeta, PlannerSettings};
        use chrono::NaiveDate;

        fn d(y: i32, m: u32, day: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, day).unwrap()
        }

        fn now() -> NaiveDateTime {
            d(2026, 3, 1).and_hms_opt(12, 0, 0).unwrap()
        }

        fn populated_state(name: &str) -> LiveState {
            let mut blocks = BlockStore::new();
            blocks
                .add_original_and_series(
                    d(2026, 3, 2),
                    BlockDraft {
                        kind: BlockKind::Lernblock,
                        content: BlockContent {
                            title: "Sachenrecht".into(),
                            ..BlockContent::default()
                        },
                        tasks: vec![],
                    },
                    None,
                )
                .unwrap();
            LiveState {
                blocks,
                sessions: SessionStore::new(),
                meta: PlanMeta::new(name, now()),
                settings: PlannerSettings::default(),
            }
        }

        #[test]
        fn archive_then_restore_round_trips_except_the_stamp() {
            let mut manager = ArchiveManager::new();
            let original = populated_state("Examensplan");
            let expected = original.clone();

            let id = manager.archive(original, now());
            let fresh = LiveState {
                blocks: BlockStore::new(),
                sessions: SessionStore::new(),
                meta: PlanMeta::new("Examensplan", now()),
                settings: PlannerSettings::default(),
            };
            let restored = manager.restore(id, fresh, now()).unwrap();

            assert_eq!(restored.blocks, expected.blocks);
            assert_eq!(restored.sessions, expected.sessions);
            assert_eq!(restored.meta.restored_at, Some(now()));
            // Everything else on the metadata survives unchanged.
            assert_eq!(restored.meta.name, expected.meta.name);
            assert_eq!(restored.meta.created_at, expected.meta.created_at);
        }

        #[test]
        fn restore_archives_the_current_state_first() {
            let mut manager = ArchiveManager::new();
            let id = manager.archive(populated_state("alt"), now());
            let current = populated_state("aktuell");
            manager.restore(id, current, now()).unwrap();

            // The consumed snapshot is gone, the auto-archived current state
            // took its place.
            assert_eq!(manager.len(), 1);
            let kept = manager.list().next().unwrap();
            assert_eq!(kept.name, "aktuell");
        }

        #[test]
        fn restoring_an_unknown_id_fails_without_touching_anything() {
            let mut manager = ArchiveManager::new();
            manager.archive(populated_state("alt"), now());
            let bogus = ArchiveId::new();
            assert_eq!(
                manager.take_snapshot(bogus).unwrap_err(),
                StoreError::ArchiveNotFound(bogus)
            );
            assert_eq!(manager.len(), 1);
        }
    }
}

pub mod storage {
    //! Persistence boundary. Collections load fully into memory at startup;
    //! mutations write through. A multi-date series operation is computed
    //! against the in-memory snapshot and saved as one batch — never as N
    //! sequential read-then-writes, which is exactly the stale-read bug
    //! class this layer exists to rule out.

    use crate::archive::ArchivedPlan;
    use crate::blocks::BlockStore;
    use crate::core::{ArchiveId, BlockAllocation, PlanMeta, PlannerSettings, Session};
    use crate::hierarchy::Themenliste;
    use crate::links::TodoItem;
    use crate::sessions::SessionStore;
    use anyhow::{Context, Result};
    use chrono::NaiveDate;
    use serde::Serialize;
    use serde::de::DeserializeOwned;
    use std::cell::RefCell;
    use std::fs;
    use std::path::PathBuf;
    use tracing::debug;

    /// Everything the planner persists, collection by collection. Whole-map
    /// saves are the batched write for multi-date operations; the per-day
    /// variants cover single-bucket mutations.
    pub trait PlannerStorage {
        fn load_blocks(&self) -> Result<BlockStore>;
        fn save_blocks(&self, blocks: &BlockStore) -> Result<()>;
        fn save_blocks_day(&self, date: NaiveDate, entries: &[BlockAllocation]) -> Result<()>;

        fn load_sessions(&self) -> Result<SessionStore>;
        fn save_sessions(&self, sessions: &SessionStore) -> Result<()>;
        fn save_sessions_day(&self, date: NaiveDate, entries: &[Session]) -> Result<()>;

        fn load_hierarchy(&self) -> Result<Option<Themenliste>>;
        fn save_hierarchy(&self, plan: &Themenliste) -> Result<()>;

        fn load_todos(&self) -> Result<Vec<TodoItem>>;
        fn save_todos(&self, todos: &[TodoItem]) -> Result<()>;

        fn load_meta(&self) -> Result<Option<PlanMeta>>;
        fn save_meta(&self, meta: &PlanMeta) -> Result<()>;

        fn load_settings(&self) -> Result<PlannerSettings>;
        fn save_settings(&self, settings: &PlannerSettings) -> Result<()>;

        fn load_archives(&self) -> Result<Vec<ArchivedPlan>>;
        fn save_archive(&self, plan: &ArchivedPlan) -> Result<()>;
        fn remove_archive(&self, id: ArchiveId) -> Result<()>;
    }

    /* ----------------------------- JSON directory ----------------------------- */

    /// A directory of JSON documents: the synchronous local cache that stays
    /// authoritative for the running session. One file per collection, one
    /// file per archived plan.
    pub struct JsonDirStore {
        root: PathBuf,
    }

    impl JsonDirStore {
        pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
            let root = root.into();
            fs::create_dir_all(root.join("archives"))
                .with_context(|| format!("creating data directory {:?}", root))?;
            Ok(Self { root })
        }

        pub fn root(&self) -> &PathBuf {
            &self.root
        }

        fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
            let path = self.root.join(name);
            if !path.exists() {
                return Ok(None);
            }
            let text =
                fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
            let value =
                serde_json::from_str(&text).with_context(|| format!("decoding {:?}", path))?;
            Ok(Some(value))
        }

        fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
            let path = self.root.join(name);
            let text = serde_json::to_string_pretty(value)?;
            fs::write(&path, text).with_context(|| format!("writing {:?}", path))?;
            debug!(?path, "wrote collection");
            Ok(())
        }
    }

    impl PlannerStorage for JsonDirStore {
        fn load_blocks(&self) -> Result<BlockStore> {
            Ok(self.read_json("blocks.json")?.unwrap_or_default())
        }

        fn save_blocks(&self, blocks: &BlockStore) -> Result<()> {
            self.write_json("blocks.json", blocks)
        }

        fn save_blocks_day(&self, date: NaiveDate, entries: &[BlockAllocation]) -> Result<()> {
            let mut days = self.load_blocks()?.into_days();
            if entries.is_empty() {
                days.remove(&date);
            } else {
                days.insert(date, entries.to_vec());
            }
            self.write_json("blocks.json", &BlockStore::from_days(days))
        }

        fn load_sessions(&self) -> Result<SessionStore> {
            Ok(self.read_json("sessions.json")?.unwrap_or_default())
        }

        fn save_sessions(&self, sessions: &SessionStore) -> Result<()> {
            self.write_json("sessions.json", sessions)
        }

        fn save_sessions_day(&self, date: NaiveDate, entries: &[Session]) -> Result<()> {
            let mut days = self.load_sessions()?.into_days();
            if entries.is_empty() {
                days.remove(&date);
            } else {
                days.insert(date, entries.to_vec());
            }
            self.write_json("sessions.json", &SessionStore::from_days(days))
        }

        fn load_hierarchy(&self) -> Result<Option<Themenliste>> {
            self.read_json("hierarchy.json")
        }

        fn save_hierarchy(&self, plan: &Themenliste) -> Result<()> {
            self.write_json("hierarchy.json", plan)
        }

        fn load_todos(&self) -> Result<Vec<TodoItem>> {
            Ok(self.read_json("todos.json")?.unwrap_or_default())
        }

        fn save_todos(&self, todos: &[TodoItem]) -> Result<()> {
            self.write_json("todos.json", &todos)
        }

        fn load_meta(&self) -> Result<Option<PlanMeta>> {
            self.read_json("meta.json")
        }

        fn save_meta(&self, meta: &PlanMeta) -> Result<()> {
            self.write_json("meta.json", meta)
        }

        fn load_settings(&self) -> Result<PlannerSettings> {
            Ok(self.read_json("settings.json")?.unwrap_or_default())
        }

        fn save_settings(&self, settings: &PlannerSettings) -> Result<()> {
            self.write_json("settings.json", settings)
        }

        fn load_archives(&self) -> Result<Vec<ArchivedPlan>> {
            let dir = self.root.join("archives");
            let mut archives = Vec::new();
            for entry in fs::read_dir(&dir).with_context(|| format!("listing {:?}", dir))? {
                let path = entry?.path();
                if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                    let text = fs::read_to_string(&path)
                        .with_context(|| format!("reading {:?}", path))?;
                    let plan: ArchivedPlan = serde_json::from_str(&text)
                        .with_context(|| format!("decoding {:?}", path))?;
                    archives.push(plan);
                }
            }
            archives.sort_by_key(|a| a.archived_at);
            Ok(archives)
        }

        fn save_archive(&self, plan: &ArchivedPlan) -> Result<()> {
            self.write_json(&format!("archives/{}.json", plan.id), plan)
        }

        fn remove_archive(&self, id: ArchiveId) -> Result<()> {
            let path = self.root.join(format!("archives/{id}.json"));
            if path.exists() {
                fs::remove_file(&path).with_context(|| format!("removing {:?}", path))?;
            }
            Ok(())
        }
    }

    /* ------------------------------- In-memory ------------------------------- */

    /// In-memory stand-in used by tests and as the degraded mode when no
    /// directory is writable. Interior mutability is fine here; the whole
    /// design is single-threaded.
    #[derive(Debug, Default)]
    pub struct MemoryStorage {
        inner: RefCell<MemoryInner>,
    }

    #[derive(Debug, Default)]
    struct MemoryInner {
        blocks: BlockStore,
        sessions: SessionStore,
        hierarchy: Option<Themenliste>,
        todos: Vec<TodoItem>,
        meta: Option<PlanMeta>,
        settings: Option<PlannerSettings>,
        archives: Vec<ArchivedPlan>,
    }

    impl MemoryStorage {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl PlannerStorage for MemoryStorage {
        fn load_blocks(&self) -> Result<BlockStore> {
            Ok(self.inner.borrow().blocks.clone())
        }

        fn save_blocks(&self, blocks: &BlockStore) -> Result<()> {
            self.inner.borrow_mut().blocks = blocks.clone();
            Ok(())
        }

        fn save_blocks_day(&self, date: NaiveDate, entries: &[BlockAllocation]) -> Result<()> {
            let mut days = self.inner.borrow().blocks.clone().into_days();
            if entries.is_empty() {
                days.remove(&date);
            } else {
                days.insert(date, entries.to_vec());
            }
            self.inner.borrow_mut().blocks = BlockStore::from_days(days);
            Ok(())
        }

        fn load_sessions(&self) -> Result<SessionStore> {
            Ok(self.inner.borrow().sessions.clone())
        }

        fn save_sessions(&self, sessions: &SessionStore) -> Result<()> {
            self.inner.borrow_mut().sessions = sessions.clone();
            Ok(())
        }

        fn save_sessions_day(&self, date: NaiveDate, entries: &[Session]) -> Result<()> {
            let mut days = self.inner.borrow().sessions.clone().into_days();
            if entries.is_empty() {
                days.remove(&date);
            } else {
                days.insert(date, entries.to_vec());
            }
            self.inner.borrow_mut().sessions = SessionStore::from_days(days);
            Ok(())
        }

        fn load_hierarchy(&self) -> Result<Option<Themenliste>> {
            Ok(self.inner.borrow().hierarchy.clone())
        }

        fn save_hierarchy(&self, plan: &Themenliste) -> Result<()> {
            self.inner.borrow_mut().hierarchy = Some(plan.clone());
            Ok(())
        }

        fn load_todos(&self) -> Result<Vec<TodoItem>> {
            Ok(self.inner.borrow().todos.clone())
        }

        fn save_todos(&self, todos: &[TodoItem]) -> Result<()> {
            self.inner.borrow_mut().todos = todos.to_vec();
            Ok(())
        }

        fn load_meta(&self) -> Result<Option<PlanMeta>> {
            Ok(self.inner.borrow().meta.clone())
        }

        fn save_meta(&self, meta: &PlanMeta) -> Result<()> {
            self.inner.borrow_mut().meta = Some(meta.clone());
            Ok(())
        }

        fn load_settings(&self) -> Result<PlannerSettings> {
            Ok(self.inner.borrow().settings.clone().unwrap_or_default())
        }

        fn save_settings(&self, settings: &PlannerSettings) -> Result<()> {
            self.inner.borrow_mut().settings = Some(settings.clone());
            Ok(())
        }

        fn load_archives(&self) -> Result<Vec<ArchivedPlan>> {
            Ok(self.inner.borrow().archives.clone())
        }

        fn save_archive(&self, plan: &ArchivedPlan) -> Result<()> {
            let mut inner = self.inner.borrow_mut();
            inner.archives.retain(|a| a.id != plan.id);
            inner.archives.push(plan.clone());
            Ok(())
        }

        fn remove_archive(&self, id: ArchiveId) -> Result<()> {
            self.inner.borrow_mut().archives.retain(|a| a.id != id);
            Ok(())
        }
    }

}

pub mod parser {
    //! Parsers for the small text expressions the CLI accepts: repeat rules
    //! like `daily*5`, `weekly until 2026-09-01` or `custom[mo,mi]*8`, and
    //! `HH:MM-HH:MM` time ranges. Built on `nom` with verbose errors so a
    //! typo points at the offending spot.

    use crate::core::{RepeatEnd, RepeatPattern, RepeatRule};
    use anyhow::{Result, anyhow};
    use chrono::{NaiveDate, NaiveTime, Weekday};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while1, take_while_m_n},
        character::complete::{char, space1},
        combinator::{all_consuming, map, map_res},
        error::{VerboseError, convert_error},
        multi::separated_list1,
        sequence::{delimited, preceded, separated_pair, tuple},
    };

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// Parse a complete repeat expression. The rule constructor re-validates,
    /// so out-of-range counts fail here as well.
    pub fn parse_repeat_expr(input: &str) -> Result<RepeatRule> {
        let (_, (pattern, end)) =
            all_consuming(tuple((parse_pattern, parse_end)))(input.trim())
                .map_err(|e| pretty(input, e))?;
        RepeatRule::new(pattern, end).map_err(anyhow::Error::from)
    }

    /// Parse `HH:MM-HH:MM` into a start/end pair. Range sanity (ordering,
    /// minimum duration) is the session store's job, not the parser's.
    pub fn parse_time_range(input: &str) -> Result<(NaiveTime, NaiveTime)> {
        let (_, pair) =
            all_consuming(separated_pair(parse_time, char('-'), parse_time))(input.trim())
                .map_err(|e| pretty(input, e))?;
        Ok(pair)
    }

    fn pretty(input: &str, err: nom::Err<VerboseError<&str>>) -> anyhow::Error {
        match err {
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                anyhow!("invalid expression {:?}: {}", input, convert_error(input.trim(), e))
            }
            nom::Err::Incomplete(_) => anyhow!("invalid expression {:?}: incomplete input", input),
        }
    }

    fn parse_pattern(i: &str) -> PResult<'_, RepeatPattern> {
        alt((
            map(tag("daily"), |_| RepeatPattern::Daily),
            map(tag("weekly"), |_| RepeatPattern::Weekly),
            map(tag("monthly"), |_| RepeatPattern::Monthly),
            map(
                preceded(
                    tag("custom"),
                    delimited(
                        char('['),
                        separated_list1(char(','), parse_weekday),
                        char(']'),
                    ),
                ),
                |weekdays| RepeatPattern::Custom { weekdays },
            ),
        ))(i)
    }

    /// English three-letter or German two-letter weekday names.
    fn parse_weekday(i: &str) -> PResult<'_, Weekday> {
        map_res(
            take_while1(|c: char| c.is_alphabetic()),
            |s: &str| match s.to_ascii_lowercase().as_str() {
                "mon" | "mo" => Ok(Weekday::Mon),
                "tue" | "di" => Ok(Weekday::Tue),
                "wed" | "mi" => Ok(Weekday::Wed),
                "thu" | "do" => Ok(Weekday::Thu),
                "fri" | "fr" => Ok(Weekday::Fri),
                "sat" | "sa" => Ok(Weekday::Sat),
                "sun" | "so" => Ok(Weekday::Sun),
                _ => Err("unknown weekday"),
            },
        )(i)
    }

    fn parse_end(i: &str) -> PResult<'_, RepeatEnd> {
        alt((
            map(preceded(char('*'), parse_u32), RepeatEnd::Count),
            map(
                preceded(tuple((space1, tag("until"), space1)), parse_date),
                RepeatEnd::Until,
            ),
        ))(i)
    }

    fn parse_u32(i: &str) -> PResult<'_, u32> {
        map_res(take_while1(char_is_digit), |s: &str| s.parse::<u32>())(i)
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(take_while_m_n(4, 4, char_is_digit), |s: &str| {
                    s.parse::<i32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn parse_time(i: &str) -> PResult<'_, NaiveTime> {
        map_res(
            tuple((
                map_res(take_while_m_n(1, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char(':'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(h, _, m)| NaiveTime::from_hms_opt(h, m, 0).ok_or("invalid time"),
        )(i)
    }

    fn char_is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

}

pub mod planner {
    //! Composition root: one service object per concern, wired together over
    //! an injected storage implementation. Every mutation goes through the
    //! in-memory state first and is then written through; a failed write is
    //! logged and the session keeps running on the in-memory copy, which
    //! stays authoritative until exit.

    use crate::archive::{ArchiveManager, LiveState};
    use crate::blocks::{BlockDraft, BlockPatch, BlockStore};
    use crate::core::{
        ArchiveId, EntryId, NodeId, PlanMeta, PlannerSettings, RepeatRule, ScheduleLink,
        ScheduleState, SeriesCreation, SeriesId, StoreError,
    };
    use crate::hierarchy::{OcrPayload, Themenliste, ThemaPath};
    use crate::links::{self, TodoItem};
    use crate::projectors::agenda_projector::{self, AgendaDay};
    use crate::series;
    use crate::sessions::{SessionDraft, SessionPatch, SessionStore};
    use crate::storage::PlannerStorage;
    use anyhow::Result;
    use chrono::{NaiveDate, NaiveDateTime};
    use tracing::warn;

    pub struct StudyPlanner<S: PlannerStorage> {
        storage: S,
        pub blocks: BlockStore,
        pub sessions: SessionStore,
        pub hierarchy: Option<Themenliste>,
        pub todos: Vec<TodoItem>,
        pub meta: PlanMeta,
        pub settings: PlannerSettings,
        pub archives: ArchiveManager,
    }

    impl<S: PlannerStorage> StudyPlanner<S> {
        /// Load every collection and run the one-time expiry sweep over the
        /// scheduling links.
        pub fn load(storage: S, today: NaiveDate, now: NaiveDateTime) -> Result<Self> {
            let blocks = storage.load_blocks()?;
            let sessions = storage.load_sessions()?;
            let hierarchy = storage.load_hierarchy()?;
            let todos = storage.load_todos()?;
            let meta = storage
                .load_meta()?
                .unwrap_or_else(|| PlanMeta::new("Lernplan", now));
            let settings = storage.load_settings()?;
            let archives = ArchiveManager::from_archives(storage.load_archives()?);

            let mut planner = Self {
                storage,
                blocks,
                sessions,
                hierarchy,
                todos,
                meta,
                settings,
                archives,
            };
            if links::cleanup_expired(planner.hierarchy.as_mut(), &mut planner.todos, today) > 0 {
                planner.persist_links();
            }
            Ok(planner)
        }

        pub fn storage(&self) -> &S {
            &self.storage
        }

        /* ----------------------------- Write-through ----------------------------- */

        fn log_write_failure(what: &str, err: anyhow::Error) {
            warn!(what, ?err, "write-through failed; in-memory state stays authoritative");
        }

        fn persist_blocks_batch(&self) {
            if let Err(err) = self.storage.save_blocks(&self.blocks) {
                Self::log_write_failure("blocks", err);
            }
        }

        fn persist_blocks_day(&self, date: NaiveDate) {
            if let Err(err) = self.storage.save_blocks_day(date, self.blocks.blocks_on(date)) {
                Self::log_write_failure("blocks", err);
            }
        }

        fn persist_sessions_batch(&self) {
            if let Err(err) = self.storage.save_sessions(&self.sessions) {
                Self::log_write_failure("sessions", err);
            }
        }

        fn persist_sessions_day(&self, date: NaiveDate) {
            let entries: Vec<_> = self
                .sessions
                .days()
                .get(&date)
                .cloned()
                .unwrap_or_default();
            if let Err(err) = self.storage.save_sessions_day(date, &entries) {
                Self::log_write_failure("sessions", err);
            }
        }

        fn persist_links(&self) {
            if let Some(plan) = &self.hierarchy {
                if let Err(err) = self.storage.save_hierarchy(plan) {
                    Self::log_write_failure("hierarchy", err);
                }
            }
            if let Err(err) = self.storage.save_todos(&self.todos) {
                Self::log_write_failure("todos", err);
            }
        }

        fn persist_meta(&self) {
            if let Err(err) = self.storage.save_meta(&self.meta) {
                Self::log_write_failure("meta", err);
            }
        }

        fn persist_settings(&self) {
            if let Err(err) = self.storage.save_settings(&self.settings) {
                Self::log_write_failure("settings", err);
            }
        }

        /* ------------------------------- Calendar ------------------------------- */

        /// Add a block, with its generated series when a rule is given. A
        /// series lands as one batched write; a single block only touches its
        /// day.
        pub fn add_block(
            &mut self,
            date: NaiveDate,
            draft: BlockDraft,
            repeat: Option<RepeatRule>,
        ) -> Result<SeriesCreation, StoreError> {
            let outcome = self.blocks.add_original_and_series(date, draft, repeat)?;
            if outcome.series_id.is_some() {
                self.persist_blocks_batch();
            } else {
                self.persist_blocks_day(date);
            }
            Ok(outcome)
        }

        pub fn add_session(
            &mut self,
            date: NaiveDate,
            draft: SessionDraft,
            repeat: Option<RepeatRule>,
        ) -> Result<SeriesCreation, StoreError> {
            let outcome = self.sessions.add_original_and_series(date, draft, repeat)?;
            if outcome.series_id.is_some() {
                self.persist_sessions_batch();
            } else {
                self.persist_sessions_day(date);
            }
            Ok(outcome)
        }

        /// Delete one calendar entry, whichever store holds it.
        pub fn delete_entry(&mut self, date: NaiveDate, id: EntryId) -> Result<(), StoreError> {
            if self.blocks.delete(date, id).is_ok() {
                self.persist_blocks_day(date);
                return Ok(());
            }
            self.sessions.delete(date, id)?;
            self.persist_sessions_day(date);
            Ok(())
        }

        /// Delete every occurrence of a series across both stores; the
        /// removals are persisted as one batch per store.
        pub fn delete_series(&mut self, series_id: SeriesId) -> usize {
            let removed = series::delete_series(&mut self.blocks, &mut self.sessions, series_id);
            if removed > 0 {
                self.persist_blocks_batch();
                self.persist_sessions_batch();
            }
            removed
        }

        pub fn update_block(
            &mut self,
            date: NaiveDate,
            id: EntryId,
            patch: BlockPatch,
        ) -> Result<(), StoreError> {
            self.blocks.update(date, id, patch)?;
            self.persist_blocks_day(date);
            Ok(())
        }

        pub fn update_session(
            &mut self,
            date: NaiveDate,
            id: EntryId,
            patch: SessionPatch,
        ) -> Result<(), StoreError> {
            self.sessions.update(date, id, patch)?;
            self.persist_sessions_day(date);
            Ok(())
        }

        /// Toggle or change a block's repeat rule; the series is rebuilt per
        /// the conversion strategies and written as one batch.
        pub fn change_block_repeat(
            &mut self,
            date: NaiveDate,
            id: EntryId,
            new_rule: Option<RepeatRule>,
        ) -> Result<SeriesCreation, StoreError> {
            let outcome =
                series::convert_block_repeat(&mut self.blocks, &mut self.sessions, date, id, new_rule)?;
            self.persist_blocks_batch();
            self.persist_sessions_batch();
            Ok(outcome)
        }

        pub fn change_session_repeat(
            &mut self,
            date: NaiveDate,
            id: EntryId,
            new_rule: Option<RepeatRule>,
        ) -> Result<SeriesCreation, StoreError> {
            let outcome = series::convert_session_repeat(
                &mut self.blocks,
                &mut self.sessions,
                date,
                id,
                new_rule,
            )?;
            self.persist_blocks_batch();
            self.persist_sessions_batch();
            Ok(outcome)
        }

        pub fn agenda(&self, from: NaiveDate, to: NaiveDate) -> Vec<AgendaDay> {
            agenda_projector::project_range(&self.blocks, &self.sessions, from, to)
        }

        /* ------------------------------ Hierarchy ------------------------------ */

        /// The live hierarchy, created on first use.
        pub fn hierarchy_mut(&mut self) -> &mut Themenliste {
            let name = self.meta.name.clone();
            self.hierarchy.get_or_insert_with(|| Themenliste::new(name))
        }

        pub fn save_hierarchy(&mut self) {
            self.persist_links();
        }

        /// Import an OCR candidate tree as a fresh subtree.
        pub fn import_ocr(&mut self, payload: &OcrPayload) -> Vec<NodeId> {
            let tree = payload.candidate_tree();
            let ids = self.hierarchy_mut().import_template(vec![tree]);
            self.persist_links();
            ids
        }

        /// Switch the chapter feature; turning it off collapses every
        /// sub-area's chapters into one hidden container.
        pub fn set_has_kapitel(&mut self, on: bool) {
            self.settings.has_kapitel = on;
            if !on {
                if let Some(plan) = &mut self.hierarchy {
                    plan.flatten_all_kapitel();
                }
                self.persist_links();
            }
            self.persist_settings();
        }

        /* --------------------------- Scheduling links --------------------------- */

        pub fn add_todo(&mut self, text: impl Into<String>) -> NodeId {
            let todo = TodoItem::new(text);
            let id = todo.id;
            self.todos.push(todo);
            self.persist_links();
            id
        }

        pub fn set_todo_completed(&mut self, id: NodeId, completed: bool) -> Result<(), StoreError> {
            let todo = self
                .todos
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or(StoreError::NodeNotFound)?;
            todo.completed = completed;
            self.persist_links();
            Ok(())
        }

        fn link_for_block(&self, block_id: EntryId, now: NaiveDateTime) -> Result<ScheduleLink, StoreError> {
            let block = self
                .blocks
                .find(block_id)
                .ok_or(StoreError::EntryNotFound(block_id))?;
            Ok(ScheduleLink {
                block_id,
                date: block.date,
                block_title: block.content.title.clone(),
                scheduled_at: now,
            })
        }

        /// Put a standalone to-do onto the calendar slot of `block_id`.
        pub fn schedule_todo(
            &mut self,
            todo_id: NodeId,
            block_id: EntryId,
            now: NaiveDateTime,
        ) -> Result<(), StoreError> {
            let link = self.link_for_block(block_id, now)?;
            let todo = self
                .todos
                .iter_mut()
                .find(|t| t.id == todo_id)
                .ok_or(StoreError::NodeNotFound)?;
            todo.schedule = ScheduleState::Scheduled(link);
            self.persist_links();
            Ok(())
        }

        pub fn unschedule_todo(&mut self, todo_id: NodeId) -> Result<(), StoreError> {
            let todo = self
                .todos
                .iter_mut()
                .find(|t| t.id == todo_id)
                .ok_or(StoreError::NodeNotFound)?;
            todo.schedule = ScheduleState::Unscheduled;
            self.persist_links();
            Ok(())
        }

        /// Put a Thema (and, cascading, its Aufgaben) onto a calendar slot.
        pub fn schedule_thema(
            &mut self,
            path: ThemaPath,
            block_id: EntryId,
            now: NaiveDateTime,
        ) -> Result<(), StoreError> {
            let link = self.link_for_block(block_id, now)?;
            let plan = self.hierarchy.as_mut().ok_or(StoreError::NodeNotFound)?;
            links::schedule_thema(plan.thema_mut(path)?, link);
            self.persist_links();
            Ok(())
        }

        pub fn unschedule_thema(&mut self, path: ThemaPath) -> Result<(), StoreError> {
            let plan = self.hierarchy.as_mut().ok_or(StoreError::NodeNotFound)?;
            links::unschedule_thema(plan.thema_mut(path)?);
            self.persist_links();
            Ok(())
        }

        /// Manual trigger for the expiry sweep (the load path runs it once
        /// automatically).
        pub fn run_cleanup(&mut self, today: NaiveDate) -> usize {
            let cleared = links::cleanup_expired(self.hierarchy.as_mut(), &mut self.todos, today);
            if cleared > 0 {
                self.persist_links();
            }
            cleared
        }

        /* -------------------------------- Archive -------------------------------- */

        fn take_live(&mut self, now: NaiveDateTime) -> LiveState {
            let name = self.meta.name.clone();
            LiveState {
                blocks: std::mem::take(&mut self.blocks),
                sessions: std::mem::take(&mut self.sessions),
                meta: std::mem::replace(&mut self.meta, PlanMeta::new(name, now)),
                settings: self.settings.clone(),
            }
        }

        fn install_live(&mut self, state: LiveState) {
            self.blocks = state.blocks;
            self.sessions = state.sessions;
            self.meta = state.meta;
            self.settings = state.settings;
        }

        fn persist_live(&self) {
            self.persist_blocks_batch();
            self.persist_sessions_batch();
            self.persist_meta();
            self.persist_settings();
        }

        /// Snapshot the whole calendar into the archive and clear live
        /// state.
        pub fn archive_current(&mut self, now: NaiveDateTime) -> ArchiveId {
            let live = self.take_live(now);
            let id = self.archives.archive(live, now);
            if let Some(plan) = self.archives.get(id) {
                if let Err(err) = self.storage.save_archive(plan) {
                    Self::log_write_failure("archive", err);
                }
            }
            self.persist_live();
            id
        }

        /// Bring an archived calendar back. Whatever is live right now is
        /// archived first, so restore never silently destroys unarchived
        /// work; the consumed snapshot is deleted.
        pub fn restore_archive(&mut self, id: ArchiveId, now: NaiveDateTime) -> Result<(), StoreError> {
            if self.archives.get(id).is_none() {
                return Err(StoreError::ArchiveNotFound(id));
            }
            let current = self.take_live(now);
            let state = self.archives.restore(id, current, now)?;
            self.install_live(state);

            if let Err(err) = self.storage.remove_archive(id) {
                Self::log_write_failure("archive", err);
            }
            // The auto-archived previous state is the newest entry.
            if let Some(plan) = self.archives.list().last() {
                if let Err(err) = self.storage.save_archive(plan) {
                    Self::log_write_failure("archive", err);
                }
            }
            self.persist_live();
            Ok(())
        }

        /// Lossy projection of the live calendar into a dateless topic list.
        pub fn themenliste_from_calendar(&self) -> Themenliste {
            crate::projectors::themenliste_projector::project(&self.blocks, &self.meta.name)
        }
    }

}

pub mod projectors {
    //! Pure read models derived from the stores.

    pub mod agenda_projector {
        use crate::blocks::BlockStore;
        use crate::core::{BlockAllocation, Session};
        use crate::sessions::SessionStore;
        use chrono::NaiveDate;
        use serde::Serialize;

        /// One calendar day with its occupied positions and the sessions
        /// whose interval covers it; empty days are omitted.
        #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
        pub struct AgendaDay {
            pub date: NaiveDate,
            pub blocks: Vec<BlockAllocation>,
            pub sessions: Vec<Session>,
        }

        pub fn project_range(
            blocks: &BlockStore,
            sessions: &SessionStore,
            from: NaiveDate,
            to: NaiveDate,
        ) -> Vec<AgendaDay> {
            let mut out = Vec::new();
            let mut day = from;
            while day <= to {
                let mut day_blocks: Vec<BlockAllocation> = blocks.blocks_on(day).to_vec();
                day_blocks.sort_by_key(|b| b.position);
                let mut day_sessions: Vec<Session> =
                    sessions.sessions_on(day).into_iter().cloned().collect();
                day_sessions.sort_by_key(|s| (s.start_time, s.end_time));
                if !day_blocks.is_empty() || !day_sessions.is_empty() {
                    out.push(AgendaDay {
                        date: day,
                        blocks: day_blocks,
                        sessions: day_sessions,
                    });
                }
                let Some(next) = day.succ_opt() else {
                    break;
                };
                day = next;
            }
            out
        }

    }

    pub mod themenliste_projector {
        //! One-way, lossy projection of an occupied calendar into a topic
        //! list. Time and position information is discarded; only topic and
        //! task text plus completion survive. Blocks without subject
        //! information land under a catch-all area.

        use crate::blocks::BlockStore;
        use crate::hierarchy::{Aufgabe, Kapitel, Thema, Themenliste, Unterrechtsgebiet};
        use indexmap::IndexMap;

        const FALLBACK_AREA: &str = "Allgemein";
        /// Name of the single synthetic chapter each sub-area receives.
        const PROJECTED_KAPITEL: &str = "Lernplan";

        pub fn project(blocks: &BlockStore, name: &str) -> Themenliste {
            // rechtsgebiet → unterrechtsgebiet → thema → tasks, deduplicated
            // by topic identity on the way in.
            type Tasks = Vec<(String, bool)>;
            let mut grouped: IndexMap<String, IndexMap<String, IndexMap<String, Tasks>>> =
                IndexMap::new();

            for alloc in blocks.days().values().flatten() {
                let area = alloc
                    .content
                    .rechtsgebiet
                    .clone()
                    .unwrap_or_else(|| FALLBACK_AREA.to_string());
                let sub_area = alloc
                    .content
                    .unterrechtsgebiet
                    .clone()
                    .unwrap_or_else(|| area.clone());
                let topic = alloc
                    .content
                    .thema
                    .clone()
                    .unwrap_or_else(|| alloc.content.title.clone());
                if topic.is_empty() {
                    continue;
                }
                let tasks = grouped
                    .entry(area)
                    .or_default()
                    .entry(sub_area)
                    .or_default()
                    .entry(topic)
                    .or_default();
                for task in &alloc.tasks {
                    if !tasks.iter().any(|(text, _)| text == &task.text) {
                        tasks.push((task.text.clone(), task.done));
                    }
                }
            }

            let mut plan = Themenliste::new(name);
            for (area, sub_areas) in grouped {
                let rg_id = plan.add_rechtsgebiet(area);
                for (sub_area, topics) in sub_areas {
                    let mut urg = Unterrechtsgebiet::new(sub_area);
                    let mut kapitel = Kapitel::new(PROJECTED_KAPITEL);
                    for (topic, tasks) in topics {
                        let mut thema = Thema::new(topic);
                        for (text, done) in tasks {
                            let mut aufgabe = Aufgabe::new(text);
                            aufgabe.completed = done;
                            thema.aufgaben.push(aufgabe);
                        }
                        kapitel.themen.push(thema);
                    }
                    urg.kapitel.push(kapitel);
                    if let Ok(rechtsgebiet) = plan.rechtsgebiet_mut(rg_id) {
                        rechtsgebiet.unterrechtsgebiete.push(urg);
                    }
                }
            }
            plan
        }

        #[cfg(test)]
        mod tests {
            use super::*;
            use crate::blocks::BlockDraft;
            use crate::core::{BlockContent, BlockKind, BlockTask};
            use chrono::NaiveDate;

            fn d(y: i32, m: u32, day: u32) -> NaiveDate {
                NaiveDate::from_ymd_opt(y, m, day).unwrap()
            }

            fn subject_draft(thema: &str, task: &str, done: bool) -> BlockDraft {
                BlockDraft {
                    kind: BlockKind::Lernblock,
                    content: BlockContent {
                        title: thema.into(),
                        rechtsgebiet: Some("Zivilrecht".into()),
                        unterrechtsgebiet: Some("Schuldrecht".into()),
                        thema: Some(thema.into()),
                    },
                    tasks: vec![BlockTask {
                        text: task.into(),
                        done,
                    }],
                }
            }

            #[test]
            fn repeated_topics_are_deduplicated() {
                let mut blocks = BlockStore::new();
                blocks
                    .add_original_and_series(
                        d(2026, 3, 2),
                        subject_draft("Mängelrechte", "Fälle lesen", false),
                        None,
                    )
                    .unwrap();
                blocks
                    .add_original_and_series(
                        d(2026, 3, 3),
                        subject_draft("Mängelrechte", "Schema lernen", true),
                        None,
                    )
                    .unwrap();

                let plan = project(&blocks, "Projektion");
                assert_eq!(plan.rechtsgebiete.len(), 1);
                let urg = &plan.rechtsgebiete[0].unterrechtsgebiete[0];
                assert_eq!(urg.kapitel.len(), 1);
                let themen = &urg.kapitel[0].themen;
                assert_eq!(themen.len(), 1);
                // Tasks from both occurrences merged, completion kept.
                let texte: Vec<(&str, bool)> = themen[0]
                    .aufgaben
                    .iter()
                    .map(|a| (a.text.as_str(), a.completed))
                    .collect();
                assert_eq!(
                    texte,
                    vec![("Fälle lesen", false), ("Schema lernen", true)]
                );
            }

            #[test]
            fn blocks_without_subject_land_in_the_fallback_area() {
                let mut blocks = BlockStore::new();
                blocks
                    .add_original_and_series(
                        d(2026, 3, 2),
                        BlockDraft {
                            kind: BlockKind::Privat,
                            content: BlockContent {
                                title: "Arzttermin".into(),
                                ..BlockContent::default()
                            },
                            tasks: vec![],
                        },
                        None,
                    )
                    .unwrap();
                let plan = project(&blocks, "Projektion");
                assert_eq!(plan.rechtsgebiete[0].name, FALLBACK_AREA);
                let thema =
                    &plan.rechtsgebiete[0].unterrechtsgebiete[0].kapitel[0].themen[0];
                assert_eq!(thema.name, "Arzttermin");
            }

            #[test]
            fn time_and_position_do_not_survive() {
                let mut blocks = BlockStore::new();
                blocks
                    .add_original_and_series(
                        d(2026, 3, 2),
                        subject_draft("Mängelrechte", "Fälle lesen", false),
                        None,
                    )
                    .unwrap();
                let plan = project(&blocks, "Projektion");
                let json = serde_json::to_string(&plan).unwrap();
                assert!(!json.contains("2026-03-02"));
                assert!(!json.contains("position"));
            }
        }
    }
}

pub use parser::{parse_repeat_expr, parse_time_range};
pub use planner::StudyPlanner;
