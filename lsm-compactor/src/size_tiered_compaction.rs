use std::cmp::min;
use std::collections::{HashMap, HashSet, VecDeque};
use std::iter::Peekable;
use std::slice::Iter;

use crate::compactor::{CompactionScheduler, CompactionSchedulerSupplier};
use crate::compactor_state::{Compaction, CompactorState, SourceId};
use crate::config::{CompactorOptions, SizeTieredCompactionSchedulerOptions};
use crate::db_state::CoreDbState;

#[derive(Clone)]
struct CompactionSource {
    source: SourceId,
    size: u64,
}

/// Checks a candidate compaction to make sure that it does not conflict
/// with any other ongoing compactions. A compaction conflicts if it uses a
/// source (table or sorted run) or a destination that a running compaction uses.
struct ConflictChecker {
    sources_used: HashSet<SourceId>,
}

impl ConflictChecker {
    fn new(compactions: &[Compaction]) -> Self {
        let mut checker = Self {
            sources_used: HashSet::new(),
        };
        for compaction in compactions.iter() {
            checker.add_compaction(compaction);
        }
        checker
    }

    fn check_compaction(&self, sources: &VecDeque<CompactionSource>, dst: u32) -> bool {
        if sources
            .iter()
            .any(|source| self.sources_used.contains(&source.source))
        {
            return false;
        }
        !self.sources_used.contains(&SourceId::SortedRun(dst))
    }

    fn add_compaction(&mut self, compaction: &Compaction) {
        self.sources_used.extend(compaction.sources.iter().copied());
        self.sources_used
            .insert(SourceId::SortedRun(compaction.destination));
    }
}

/// Keeps the scheduler from producing runs faster than they can be merged further
/// down. The output size of a candidate is estimated as the sum of its sources. If
/// the next older run is small enough to be compacted with that output, and there
/// are already `max_compaction_sources` similarly sized runs lined up there, the
/// candidate is rejected until those runs have been compacted.
struct BackpressureChecker {
    include_size_threshold: f32,
    max_compaction_sources: usize,
    longest_compactable_runs_by_sr: HashMap<u32, VecDeque<CompactionSource>>,
}

impl BackpressureChecker {
    fn new(
        include_size_threshold: f32,
        max_compaction_sources: usize,
        srs: &[CompactionSource],
    ) -> Self {
        let mut longest_compactable_runs_by_sr = HashMap::new();
        let mut srs_iter = srs.iter().peekable();
        while let Some(sr) = srs_iter.peek() {
            if let Some(sr_id) = sr.source.maybe_unwrap_sorted_run() {
                let compactable_run = SizeTieredCompactionScheduler::build_compactable_run(
                    include_size_threshold,
                    srs_iter.clone(),
                    None,
                );
                longest_compactable_runs_by_sr.insert(sr_id, compactable_run);
            }
            srs_iter.next();
        }
        Self {
            include_size_threshold,
            max_compaction_sources,
            longest_compactable_runs_by_sr,
        }
    }

    fn check_compaction(
        &self,
        sources: &VecDeque<CompactionSource>,
        next_sr: Option<&CompactionSource>,
    ) -> bool {
        let estimated_result_size: u64 = sources.iter().map(|src| src.size).sum();
        let Some(next_sr) = next_sr else {
            return true;
        };
        if next_sr.size > ((estimated_result_size as f32) * self.include_size_threshold) as u64 {
            return true;
        }
        let lined_up = next_sr
            .source
            .maybe_unwrap_sorted_run()
            .and_then(|id| self.longest_compactable_runs_by_sr.get(&id))
            .map_or(0, |r| r.len());
        lined_up < self.max_compaction_sources
    }
}

struct CompactionChecker {
    conflict_checker: ConflictChecker,
    backpressure_checker: BackpressureChecker,
}

impl CompactionChecker {
    fn check_compaction(
        &self,
        sources: &VecDeque<CompactionSource>,
        dst: u32,
        next_sr: Option<&CompactionSource>,
    ) -> bool {
        self.conflict_checker.check_compaction(sources, dst)
            && self.backpressure_checker.check_compaction(sources, next_sr)
    }
}

/// Implements a size-tiered compaction scheduler. The scheduler proposes one of:
/// - between `min_compaction_sources` and `max_compaction_sources` of the oldest
///   L0 tables, compacted into a new sorted run
/// - a series of at least `min_compaction_sources` adjacent sorted runs where the
///   largest run is at most `include_size_threshold` times the smallest one,
///   compacted into the oldest run of the series
///
/// Candidates that fail the conflict or backpressure checks are skipped.
pub(crate) struct SizeTieredCompactionScheduler {
    options: SizeTieredCompactionSchedulerOptions,
    max_in_flight: usize,
}

impl CompactionScheduler for SizeTieredCompactionScheduler {
    fn maybe_schedule_compaction(&self, state: &CompactorState) -> Vec<Compaction> {
        let mut compactions = Vec::new();

        let (l0, srs) = self.compaction_sources(state.db_state());
        let next_run_id = state
            .db_state()
            .compacted
            .iter()
            .map(|sr| sr.id)
            .max()
            .map_or(0, |id| id + 1);

        let active = state.compactions();
        let mut checker = CompactionChecker {
            conflict_checker: ConflictChecker::new(&active),
            backpressure_checker: BackpressureChecker::new(
                self.options.include_size_threshold,
                self.options.max_compaction_sources,
                &srs,
            ),
        };

        while active.len() + compactions.len() < self.max_in_flight {
            let Some(compaction) = self.pick_next_compaction(&l0, &srs, next_run_id, &checker)
            else {
                break;
            };
            checker.conflict_checker.add_compaction(&compaction);
            compactions.push(compaction);
        }

        compactions
    }
}

impl SizeTieredCompactionScheduler {
    pub(crate) fn new(options: SizeTieredCompactionSchedulerOptions, max_in_flight: usize) -> Self {
        Self {
            options,
            max_in_flight,
        }
    }

    fn pick_next_compaction(
        &self,
        l0: &[CompactionSource],
        srs: &[CompactionSource],
        next_run_id: u32,
        checker: &CompactionChecker,
    ) -> Option<Compaction> {
        // compact l0s if required
        let l0_candidates: VecDeque<_> = l0.iter().cloned().collect();
        if let Some(l0_candidates) = self.clamp_min(l0_candidates) {
            let l0_candidates = self.clamp_max(l0_candidates);
            if checker.check_compaction(&l0_candidates, next_run_id, srs.first()) {
                return Some(self.create_compaction(l0_candidates, next_run_id));
            }
        }

        // try to compact the lower levels
        let mut srs_iter = srs.iter().peekable();
        while srs_iter.peek().is_some() {
            let compactable_run = Self::build_compactable_run(
                self.options.include_size_threshold,
                srs_iter.clone(),
                Some(checker),
            );
            if let Some(compactable_run) = self.clamp_min(compactable_run) {
                let compactable_run = self.clamp_max(compactable_run);
                if let Some(dst) = compactable_run
                    .back()
                    .and_then(|src| src.source.maybe_unwrap_sorted_run())
                {
                    return Some(self.create_compaction(compactable_run, dst));
                }
            }
            srs_iter.next();
        }
        None
    }

    fn clamp_min(&self, sources: VecDeque<CompactionSource>) -> Option<VecDeque<CompactionSource>> {
        if sources.len() < self.options.min_compaction_sources {
            return None;
        }
        Some(sources)
    }

    // drops the newest sources first so that the oldest ones are compacted
    fn clamp_max(&self, mut sources: VecDeque<CompactionSource>) -> VecDeque<CompactionSource> {
        while sources.len() > self.options.max_compaction_sources {
            sources.pop_front();
        }
        sources
    }

    fn create_compaction(&self, sources: VecDeque<CompactionSource>, dst: u32) -> Compaction {
        let sources: Vec<SourceId> = sources.iter().map(|src| src.source).collect();
        Compaction::new(sources, dst)
    }

    // looks for a series of sorted runs with similar sizes, newest first,
    // optionally validating the resulting series
    fn build_compactable_run(
        size_threshold: f32,
        mut sources: Peekable<Iter<CompactionSource>>,
        checker: Option<&CompactionChecker>,
    ) -> VecDeque<CompactionSource> {
        let mut compactable_runs = VecDeque::new();
        let mut maybe_min_sz = None;
        while let Some(src) = sources.next() {
            if let Some(min_sz) = maybe_min_sz {
                if src.size > ((min_sz as f32) * size_threshold) as u64 {
                    break;
                }
                maybe_min_sz = Some(min(min_sz, src.size));
            } else {
                maybe_min_sz = Some(src.size);
            }
            compactable_runs.push_back(src.clone());
            if let (Some(checker), Some(dst)) = (checker, src.source.maybe_unwrap_sorted_run()) {
                let next_sr = sources.peek().cloned();
                if !checker.check_compaction(&compactable_runs, dst, next_sr) {
                    compactable_runs.pop_back();
                    break;
                }
            }
        }
        compactable_runs
    }

    // l0 newest first, sorted runs newest first
    fn compaction_sources(
        &self,
        db_state: &CoreDbState,
    ) -> (Vec<CompactionSource>, Vec<CompactionSource>) {
        (
            db_state
                .l0
                .iter()
                .filter_map(|l0| {
                    l0.compacted_id().map(|id| CompactionSource {
                        source: SourceId::Sst(id),
                        size: l0.estimate_size(),
                    })
                })
                .collect(),
            db_state
                .compacted
                .iter()
                .rev()
                .map(|sr| CompactionSource {
                    source: SourceId::SortedRun(sr.id),
                    size: sr.estimate_size(),
                })
                .collect(),
        )
    }
}

/// Supplies [`SizeTieredCompactionScheduler`]s configured with the given options.
pub struct SizeTieredCompactionSchedulerSupplier {
    options: SizeTieredCompactionSchedulerOptions,
}

impl SizeTieredCompactionSchedulerSupplier {
    pub const fn new(options: SizeTieredCompactionSchedulerOptions) -> Self {
        Self { options }
    }
}

impl CompactionSchedulerSupplier for SizeTieredCompactionSchedulerSupplier {
    fn compaction_scheduler(
        &self,
        options: &CompactorOptions,
    ) -> Box<dyn CompactionScheduler + Send + Sync> {
        Box::new(SizeTieredCompactionScheduler::new(
            self.options.clone(),
            options.max_concurrent_compactions,
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use crate::compactor::CompactionScheduler;
    use crate::compactor_state::{Compaction, CompactorState, SourceId};
    use crate::config::SizeTieredCompactionSchedulerOptions;
    use crate::db_state::{CoreDbState, SortedRun, SsTableHandle, SsTableId, SsTableInfo};
    use crate::size_tiered_compaction::SizeTieredCompactionScheduler;

    fn scheduler() -> SizeTieredCompactionScheduler {
        SizeTieredCompactionScheduler::new(SizeTieredCompactionSchedulerOptions::default(), 4)
    }

    #[test]
    fn test_should_compact_l0s_to_first_sr() {
        // given:
        let l0 = vec![create_sst(1), create_sst(1), create_sst(1), create_sst(1)];
        let state =
            create_compactor_state(create_db_state(l0.iter().cloned().collect(), Vec::new()));

        // when:
        let compactions = scheduler().maybe_schedule_compaction(&state);

        // then:
        assert_eq!(compactions.len(), 1);
        assert_eq!(compactions[0], create_l0_compaction(&l0, 0));
    }

    #[test]
    fn test_should_compact_l0s_to_new_sr() {
        // given:
        let l0 = vec![create_sst(1), create_sst(1), create_sst(1), create_sst(1)];
        let state = create_compactor_state(create_db_state(
            l0.iter().cloned().collect(),
            vec![create_sr2(0, 2), create_sr2(10, 2)],
        ));

        // when:
        let compactions = scheduler().maybe_schedule_compaction(&state);

        // then:
        assert_eq!(compactions.len(), 1);
        assert_eq!(compactions[0].destination, 11);
    }

    #[test]
    fn test_should_compact_oldest_l0s_when_over_max() {
        // given:
        let l0: Vec<SsTableHandle> = (0..10).map(|_| create_sst(1)).collect();
        let state =
            create_compactor_state(create_db_state(l0.iter().cloned().collect(), Vec::new()));

        // when:
        let compactions = scheduler().maybe_schedule_compaction(&state);

        // then:
        assert_eq!(compactions.len(), 1);
        assert_eq!(compactions[0], create_l0_compaction(&l0[2..], 0));
    }

    #[test]
    fn test_should_not_compact_l0s_if_fewer_than_min_threshold() {
        // given:
        let l0 = [create_sst(1), create_sst(1), create_sst(1)];
        let state = create_compactor_state(create_db_state(l0.iter().cloned().collect(), vec![]));

        // when:
        let compactions = scheduler().maybe_schedule_compaction(&state);

        // then:
        assert!(compactions.is_empty());
    }

    #[test]
    fn test_should_not_schedule_l0_compaction_while_one_is_running() {
        // given:
        let l0 = vec![create_sst(1), create_sst(1), create_sst(1), create_sst(1)];
        let mut db_state = create_db_state(l0.iter().cloned().collect(), vec![]);
        let mut state = create_compactor_state(db_state.clone());
        state
            .submit_compaction(create_l0_compaction(&l0, 0))
            .unwrap();
        for _ in 0..4 {
            db_state.l0.push_front(create_sst(1));
        }
        state.refresh_db_state(&db_state).unwrap();

        // when:
        let compactions = scheduler().maybe_schedule_compaction(&state);

        // then:
        assert!(compactions.is_empty());
    }

    #[test]
    fn test_should_compact_srs_if_enough_with_similar_size() {
        // given:
        let state = create_compactor_state(create_db_state(
            VecDeque::new(),
            vec![
                create_sr2(0, 2),
                create_sr2(1, 2),
                create_sr2(2, 2),
                create_sr2(3, 2),
                create_sr2(4, 2),
            ],
        ));

        // when:
        let compactions = scheduler().maybe_schedule_compaction(&state);

        // then:
        assert_eq!(compactions.len(), 1);
        assert_eq!(compactions[0], create_sr_compaction(vec![4, 3, 2, 1, 0]));
    }

    #[test]
    fn test_should_only_include_srs_if_with_similar_size() {
        // given:
        let state = create_compactor_state(create_db_state(
            VecDeque::new(),
            vec![
                create_sr2(0, 10),
                create_sr2(1, 2),
                create_sr2(2, 2),
                create_sr2(3, 2),
                create_sr2(4, 2),
            ],
        ));

        // when:
        let compactions = scheduler().maybe_schedule_compaction(&state);

        // then:
        assert_eq!(compactions.len(), 1);
        assert_eq!(compactions[0], create_sr_compaction(vec![4, 3, 2, 1]));
    }

    #[test]
    fn test_should_not_schedule_compaction_for_source_that_is_already_compacting() {
        // given:
        let mut state = create_compactor_state(create_db_state(
            VecDeque::new(),
            vec![
                create_sr2(0, 2),
                create_sr2(1, 2),
                create_sr2(2, 2),
                create_sr2(3, 2),
                create_sr2(4, 2),
            ],
        ));
        state
            .submit_compaction(create_sr_compaction(vec![3, 2, 1, 0]))
            .unwrap();

        // when:
        let compactions = scheduler().maybe_schedule_compaction(&state);

        // then:
        assert!(compactions.is_empty());
    }

    #[test]
    fn test_should_not_compact_srs_if_fewer_than_min_threshold() {
        // given:
        let state = create_compactor_state(create_db_state(
            VecDeque::new(),
            vec![create_sr4(0, 2), create_sr2(1, 2), create_sr2(2, 2)],
        ));

        // when:
        let compactions = scheduler().maybe_schedule_compaction(&state);

        // then:
        assert!(compactions.is_empty());
    }

    #[test]
    fn test_should_clamp_compaction_size() {
        // given:
        let state =
            create_compactor_state(create_db_state(VecDeque::new(), create_equal_srs(12)));

        // when:
        let compactions = scheduler().maybe_schedule_compaction(&state);

        // then:
        assert_eq!(compactions.len(), 1);
        assert_eq!(
            compactions[0],
            create_sr_compaction(vec![7, 6, 5, 4, 3, 2, 1, 0])
        );
    }

    #[test]
    fn test_should_apply_backpressure() {
        // given:
        let mut state =
            create_compactor_state(create_db_state(VecDeque::new(), create_equal_srs(12)));
        state
            .submit_compaction(create_sr_compaction(vec![7, 6, 5, 4, 3, 2, 1, 0]))
            .unwrap();

        // when:
        let compactions = scheduler().maybe_schedule_compaction(&state);

        // then:
        assert!(compactions.is_empty());
    }

    #[test]
    fn test_should_apply_backpressure_for_l0s() {
        // given:
        let l0 = vec![create_sst(1), create_sst(1), create_sst(1), create_sst(1)];
        let mut state = create_compactor_state(create_db_state(
            l0.iter().cloned().collect(),
            create_equal_srs(8),
        ));
        state
            .submit_compaction(create_sr_compaction(vec![7, 6, 5, 4, 3, 2, 1, 0]))
            .unwrap();

        // when:
        let compactions = scheduler().maybe_schedule_compaction(&state);

        // then:
        assert!(compactions.is_empty());
    }

    #[test]
    fn test_should_return_multiple_compactions() {
        // given:
        let l0 = vec![create_sst(1), create_sst(1), create_sst(1), create_sst(1)];
        let state = create_compactor_state(create_db_state(
            l0.iter().cloned().collect(),
            vec![
                create_sr4(0, 16),
                create_sr4(1, 16),
                create_sr4(2, 16),
                create_sr4(3, 16),
                create_sr2(7, 2),
                create_sr2(8, 2),
                create_sr2(9, 2),
                create_sr2(10, 2),
            ],
        ));

        // when:
        let compactions = scheduler().maybe_schedule_compaction(&state);

        // then:
        assert_eq!(compactions.len(), 3);
        assert_eq!(compactions[0], create_l0_compaction(&l0, 11));
        assert_eq!(compactions[1], create_sr_compaction(vec![10, 9, 8, 7]));
        assert_eq!(compactions[2], create_sr_compaction(vec![3, 2, 1, 0]));
    }

    #[test]
    fn test_should_respect_max_in_flight() {
        // given:
        let l0 = vec![create_sst(1), create_sst(1), create_sst(1), create_sst(1)];
        let state = create_compactor_state(create_db_state(
            l0.iter().cloned().collect(),
            create_equal_srs(4),
        ));
        let scheduler =
            SizeTieredCompactionScheduler::new(SizeTieredCompactionSchedulerOptions::default(), 1);

        // when:
        let compactions = scheduler.maybe_schedule_compaction(&state);

        // then:
        assert_eq!(compactions.len(), 1);
    }

    #[test]
    fn test_scheduled_compactions_should_be_accepted_by_state() {
        // given:
        let l0 = vec![create_sst(1), create_sst(1), create_sst(1), create_sst(1)];
        let mut state = create_compactor_state(create_db_state(
            l0.iter().cloned().collect(),
            create_equal_srs(4),
        ));

        // when:
        let compactions = scheduler().maybe_schedule_compaction(&state);

        // then:
        assert_eq!(compactions.len(), 2);
        for compaction in compactions {
            state.submit_compaction(compaction).unwrap();
        }
        assert_eq!(state.num_compactions(), 2);
    }

    fn create_sst(size: u64) -> SsTableHandle {
        let info = SsTableInfo {
            first_key: None,
            index_offset: size,
            index_len: 0,
            filter_offset: 0,
            filter_len: 0,
        };
        SsTableHandle::new(SsTableId::Compacted(ulid::Ulid::new()), info)
    }

    fn create_sr2(id: u32, size: u64) -> SortedRun {
        create_sr(id, size / 2, 2)
    }

    fn create_sr4(id: u32, size: u64) -> SortedRun {
        create_sr(id, size / 4, 4)
    }

    fn create_sr(id: u32, sst_size: u64, num_ssts: usize) -> SortedRun {
        let ssts: Vec<SsTableHandle> = (0..num_ssts).map(|_| create_sst(sst_size)).collect();
        SortedRun::new(id, ssts)
    }

    // oldest run is a four-table run, the rest are two-table runs of the same size
    fn create_equal_srs(count: u32) -> Vec<SortedRun> {
        (0..count)
            .map(|id| {
                if id == 0 {
                    create_sr4(id, 2)
                } else {
                    create_sr2(id, 2)
                }
            })
            .collect()
    }

    fn create_db_state(l0: VecDeque<SsTableHandle>, srs: Vec<SortedRun>) -> CoreDbState {
        CoreDbState {
            l0_last_compacted: None,
            l0,
            compacted: srs,
            next_wal_sst_id: 0,
            last_compacted_wal_sst_id: 0,
        }
    }

    fn create_compactor_state(db_state: CoreDbState) -> CompactorState {
        CompactorState::new(db_state)
    }

    fn create_l0_compaction(l0: &[SsTableHandle], dst: u32) -> Compaction {
        Compaction::new(
            l0.iter()
                .map(|h| SourceId::Sst(h.compacted_id().unwrap()))
                .collect(),
            dst,
        )
    }

    fn create_sr_compaction(srs: Vec<u32>) -> Compaction {
        Compaction::new(
            srs.iter().map(|sr| SourceId::SortedRun(*sr)).collect(),
            *srs.last().unwrap(),
        )
    }
}
