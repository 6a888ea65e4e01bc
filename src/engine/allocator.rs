use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::debug;

use crate::limits::DEFAULT_MAX_REALLOCATION_DEPTH;
use crate::model::*;

use super::calendar::{add_occupancy, clear_range, contiguous_span, free_run_length};
use super::registry::RunRegistry;
use super::{Board, EngineError, UnresolvedReason};

/// Bounds on the displacement chain of one top-level allocation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationBudget {
    /// Displacement generations (a party evicted by a rehomed party is depth 2).
    pub max_depth: u32,
    /// Displacements processed per call. `None` means total runs × stay length.
    pub max_displacements: Option<usize>,
}

impl Default for AllocationBudget {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_REALLOCATION_DEPTH,
            max_displacements: None,
        }
    }
}

impl AllocationBudget {
    pub fn displacement_limit(&self, run_count: usize, days: u32) -> usize {
        self.max_displacements
            .unwrap_or_else(|| run_count.max(1) * days.max(1) as usize)
    }
}

/// Pets of one booking and one species that must share a run over `range`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Party {
    pub booking: BookingNo,
    pub pets: BTreeSet<PetNo>,
    pub group: GroupKey,
    pub range: DayRange,
}

/// Undo log and journal of one top-level call.
///
/// A run's calendar is saved the first time the call touches it; rollback
/// restores those calendars and recounts every vacancy cell the call patched.
#[derive(Debug, Default)]
pub struct Transaction {
    saved: BTreeMap<RunNo, BTreeMap<Day, Vec<OccupancyEntry>>>,
    touched: BTreeSet<(GroupKey, Day)>,
    events: Vec<Event>,
}

impl Transaction {
    fn save(&mut self, rs: &RunState) {
        self.saved
            .entry(rs.run.no)
            .or_insert_with(|| rs.occupancy.clone());
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn touched_runs(&self) -> impl Iterator<Item = RunNo> + '_ {
        self.saved.keys().copied()
    }

    pub fn rollback(self, board: &mut Board) {
        for (no, occupancy) in self.saved {
            if let Some(rs) = board.registry.get_mut(no) {
                rs.occupancy = occupancy;
            }
        }
        for (group, date) in self.touched {
            board.vacancy.recount(&board.registry, date, group);
        }
    }
}

/// Result of a successful call. The caller commits by dropping `txn` or
/// undoes it with `txn.rollback`.
#[derive(Debug)]
pub struct Allocation {
    pub report: AllocationReport,
    pub txn: Transaction,
}

struct Displacement {
    party: Party,
    displaced_by: BookingNo,
    depth: u32,
}

/// Place `parties` (one per species of a booking), then rehome everyone they
/// evict, first evicted first. Any error leaves `board` as it was.
pub fn allocate(
    board: &mut Board,
    parties: Vec<Party>,
    budget: AllocationBudget,
) -> Result<Allocation, EngineError> {
    let Some(root) = parties.first().map(|p| p.booking) else {
        return Ok(Allocation {
            report: AllocationReport::default(),
            txn: Transaction::default(),
        });
    };
    let days = parties.iter().map(|p| p.range.days).max().unwrap_or(1);
    let limit = budget.displacement_limit(board.registry.run_count(), days);

    let mut pass = Pass {
        board,
        txn: Transaction::default(),
        report: AllocationReport::default(),
        queue: VecDeque::new(),
        root,
    };
    match pass.run(parties, budget.max_depth, limit) {
        Ok(()) => Ok(Allocation {
            report: pass.report,
            txn: pass.txn,
        }),
        Err(e) => {
            pass.txn.rollback(pass.board);
            Err(e)
        }
    }
}

/// Best fit: longest vacant stretch from the start day, ascending run id on
/// ties. A displaced party skips runs still holding its displacer.
fn select_run(registry: &RunRegistry, party: &Party, displacer: Option<BookingNo>) -> Option<RunNo> {
    let mut ranked: Vec<(RunNo, u32)> = registry
        .group(party.group)
        .iter()
        .filter_map(|no| registry.get(*no))
        .map(|rs| (rs.run.no, free_run_length(rs, party.range.start, party.range.days)))
        .collect();
    // stable sort keeps the ascending run id order among equals
    ranked.sort_by_key(|&(_, free)| Reverse(free));
    ranked.into_iter().map(|(no, _)| no).find(|no| match displacer {
        None => true,
        Some(by) => registry
            .get(*no)
            .is_some_and(|rs| party.range.dates().all(|d| rs.entry(d, by).is_none())),
    })
}

struct Pass<'a> {
    board: &'a mut Board,
    txn: Transaction,
    report: AllocationReport,
    queue: VecDeque<Displacement>,
    root: BookingNo,
}

impl Pass<'_> {
    fn unresolved(&self, reason: UnresolvedReason) -> EngineError {
        EngineError::AllocationUnresolved {
            booking: self.root,
            reason,
        }
    }

    fn run(&mut self, parties: Vec<Party>, max_depth: u32, limit: usize) -> Result<(), EngineError> {
        for party in &parties {
            self.place(party, None, 0)?;
        }
        let mut processed = 0usize;
        while let Some(d) = self.queue.pop_front() {
            processed += 1;
            if processed > limit {
                return Err(self.unresolved(UnresolvedReason::BudgetExhausted(limit)));
            }
            if d.depth > max_depth {
                return Err(self.unresolved(UnresolvedReason::DepthExceeded(max_depth)));
            }
            self.place(&d.party, Some(d.displaced_by), d.depth)?;
        }
        Ok(())
    }

    fn place(&mut self, party: &Party, displacer: Option<BookingNo>, depth: u32) -> Result<(), EngineError> {
        self.board.vacancy.check_range(&party.range)?;
        if self.board.registry.group(party.group).is_empty() {
            return Err(EngineError::NoRunsOfType(party.group));
        }
        let run_no = select_run(&self.board.registry, party, displacer).ok_or_else(|| {
            self.unresolved(UnresolvedReason::Cycle {
                displaced: party.booking,
                displacer: displacer.unwrap_or(party.booking),
            })
        })?;

        self.evict(run_no, party, depth)?;

        let Board { registry, vacancy } = &mut *self.board;
        let rs = registry.run_mut(run_no)?;
        self.txn.save(rs);
        for date in party.range.dates() {
            let was_free = rs.is_free(date);
            for &pet in &party.pets {
                if add_occupancy(rs, party.booking, pet, date, None) {
                    self.txn.events.push(Event::OccupancyAdded {
                        run: run_no,
                        booking: party.booking,
                        pet,
                        date,
                        kind: None,
                    });
                }
            }
            if was_free && !rs.is_free(date) {
                vacancy.occupy(date, party.group);
                self.txn.touched.insert((party.group, date));
            }
        }
        debug!(
            "placed booking {} ({} pets) in run {run_no} from {} for {} days",
            party.booking,
            party.pets.len(),
            party.range.start,
            party.range.days
        );
        self.report.placements.push(Placement {
            booking: party.booking,
            run: run_no,
            pets: party.pets.iter().copied().collect(),
            start: party.range.start,
            days: party.range.days,
        });
        Ok(())
    }

    /// Clear every other booking out of `run_no` over the party's range,
    /// queueing each cleared stretch for rehoming.
    fn evict(&mut self, run_no: RunNo, party: &Party, depth: u32) -> Result<(), EngineError> {
        let Board { registry, vacancy } = &mut *self.board;
        let rs = registry.run_mut(run_no)?;
        let group = rs.run.group();
        for date in party.range.dates() {
            for other in rs.bookings_on(date) {
                if other == party.booking {
                    continue;
                }
                let days = contiguous_span(rs, date, other);
                let Some(pets) = rs.entry(date, other).map(|e| e.pets.clone()) else {
                    continue;
                };
                if days == 0 {
                    continue;
                }
                self.txn.save(rs);
                if clear_range(rs, other, date, days).is_err() {
                    continue;
                }
                let cleared = DayRange::new(date, days);
                for day in cleared.dates() {
                    if rs.is_free(day) {
                        vacancy.vacate(day, group);
                        self.txn.touched.insert((group, day));
                    }
                }
                self.txn.events.push(Event::OccupancyCleared {
                    run: run_no,
                    booking: other,
                    start: date,
                    days,
                });
                debug!(
                    "evicted booking {other} from run {run_no} from {date} for {days} days (displaced by {})",
                    party.booking
                );
                self.report.evictions.push(Eviction {
                    booking: other,
                    from_run: run_no,
                    pets: pets.iter().copied().collect(),
                    start: date,
                    days,
                    displaced_by: party.booking,
                });
                self.queue.push_back(Displacement {
                    party: Party {
                        booking: other,
                        pets,
                        group,
                        range: cleared,
                    },
                    displaced_by: party.booking,
                    depth: depth + 1,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::vacancy::VacancyIndex;
    use chrono::NaiveDate;

    fn d(day: u32) -> Day {
        NaiveDate::from_ymd_opt(2025, 1, day).unwrap()
    }

    const DOG: GroupKey = GroupKey {
        species: Species::Dog,
        run_type: RunType::Standard,
    };

    fn board(runs: &[RunNo]) -> Board {
        let mut registry = RunRegistry::new();
        for &no in runs {
            registry
                .insert_run(Run {
                    no,
                    code: format!("K{no}"),
                    species: Species::Dog,
                    run_type: RunType::Standard,
                })
                .unwrap();
        }
        let vacancy = VacancyIndex::build(&registry, d(1), d(31)).unwrap();
        Board { registry, vacancy }
    }

    /// Write history straight into a calendar, then rebuild vacancy.
    fn seed(b: &mut Board, run: RunNo, booking: BookingNo, pets: &[PetNo], from: u32, days: u32) {
        let rs = b.registry.get_mut(run).unwrap();
        for date in DayRange::new(d(from), days).dates() {
            for &pet in pets {
                add_occupancy(rs, booking, pet, date, None);
            }
        }
        b.vacancy = VacancyIndex::build(&b.registry, d(1), d(31)).unwrap();
    }

    fn party(booking: BookingNo, pets: &[PetNo], from: u32, days: u32) -> Party {
        Party {
            booking,
            pets: pets.iter().copied().collect(),
            group: DOG,
            range: DayRange::new(d(from), days),
        }
    }

    fn commit(b: &mut Board, p: Party) -> AllocationReport {
        allocate(b, vec![p], AllocationBudget::default()).unwrap().report
    }

    fn assert_consistent(b: &Board) {
        for rs in b.registry.runs() {
            for (date, entries) in &rs.occupancy {
                assert!(!entries.is_empty(), "empty date kept on run {}", rs.run.no);
                let first = entries[0].booking;
                assert!(
                    entries.iter().all(|e| e.booking == first),
                    "run {} shared on {date}",
                    rs.run.no
                );
            }
        }
        assert_eq!(b.vacancy, VacancyIndex::build(&b.registry, d(1), d(31)).unwrap());
    }

    #[test]
    fn picks_longest_free_run() {
        let mut b = board(&[1, 2, 3]);
        seed(&mut b, 1, 10, &[100], 3, 1);
        seed(&mut b, 2, 11, &[101], 5, 1);
        let report = commit(&mut b, party(12, &[102], 1, 5));
        assert_eq!(report.placements[0].run, 3);
        assert!(report.evictions.is_empty());
        assert_consistent(&b);
    }

    #[test]
    fn ties_go_to_lowest_run_no() {
        let mut b = board(&[4, 2, 9]);
        let report = commit(&mut b, party(10, &[100], 1, 3));
        assert_eq!(report.placements[0].run, 2);
        assert!(report.evictions.is_empty());
    }

    #[test]
    fn displaced_booking_moves_to_other_run() {
        let mut b = board(&[1, 2, 3]);
        seed(&mut b, 1, 10, &[100], 3, 1);
        seed(&mut b, 2, 11, &[101], 2, 2);
        seed(&mut b, 3, 13, &[103], 1, 1);

        let report = commit(&mut b, party(12, &[102], 1, 3));
        let placed: Vec<_> = report.placements.iter().map(|p| (p.booking, p.run)).collect();
        assert_eq!(placed, vec![(12, 1), (10, 3)]);
        assert_eq!(
            report.evictions,
            vec![Eviction {
                booking: 10,
                from_run: 1,
                pets: vec![100],
                start: d(3),
                days: 1,
                displaced_by: 12,
            }]
        );
        assert_eq!(b.registry.get(3).unwrap().bookings_on(d(3)), vec![10]);
        assert_consistent(&b);
    }

    #[test]
    fn one_run_two_overlapping_bookings_is_unresolved() {
        let mut b = board(&[1]);
        commit(&mut b, party(10, &[100], 1, 5));
        let before = b.clone();
        let err = allocate(&mut b, vec![party(11, &[101], 3, 2)], AllocationBudget::default())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::AllocationUnresolved {
                booking: 11,
                reason: UnresolvedReason::Cycle {
                    displaced: 10,
                    displacer: 11
                }
            }
        ));
        assert_eq!(b, before);
    }

    #[test]
    fn eviction_takes_rest_of_stay() {
        let mut b = board(&[1, 2, 3]);
        seed(&mut b, 1, 10, &[100], 1, 5);
        seed(&mut b, 2, 11, &[101], 4, 3);
        seed(&mut b, 3, 13, &[103], 3, 1);

        let report = commit(&mut b, party(12, &[102], 3, 2));
        assert_eq!(report.placements[0].run, 2);
        let ev = &report.evictions[0];
        assert_eq!((ev.booking, ev.from_run, ev.start, ev.days), (11, 2, d(4), 3));
        // 12 only needs days 3–4 but booking 11 leaves run 2 for good
        let run2 = b.registry.get(2).unwrap();
        assert!(run2.is_free(d(5)) && run2.is_free(d(6)));
        let run3 = b.registry.get(3).unwrap();
        assert_eq!(run3.bookings_on(d(4)), vec![11]);
        assert_eq!(run3.bookings_on(d(6)), vec![11]);
        assert_consistent(&b);
    }

    #[test]
    fn fifo_rehoming_order() {
        let mut b = board(&[1, 2, 3]);
        seed(&mut b, 1, 10, &[100], 2, 2);
        seed(&mut b, 1, 12, &[102], 4, 2);
        seed(&mut b, 2, 11, &[101], 1, 1);
        seed(&mut b, 3, 13, &[103], 1, 1);

        let report = commit(&mut b, party(14, &[104], 1, 5));
        let evicted: Vec<_> = report.evictions.iter().map(|e| e.booking).collect();
        assert_eq!(evicted, vec![10, 12]);
        let placed: Vec<_> = report.placements.iter().map(|p| (p.booking, p.run)).collect();
        assert_eq!(placed, vec![(14, 1), (10, 2), (12, 2)]);
        assert_consistent(&b);
    }

    #[test]
    fn ping_pong_exhausts_budget_and_rolls_back() {
        let mut b = board(&[1, 2]);
        seed(&mut b, 1, 10, &[100], 1, 5);
        seed(&mut b, 2, 11, &[101], 1, 2);
        let before = b.clone();
        let err = allocate(&mut b, vec![party(12, &[102], 1, 5)], AllocationBudget::default())
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::AllocationUnresolved {
                booking: 12,
                reason: UnresolvedReason::BudgetExhausted(10)
            }
        ));
        assert_eq!(b, before);
    }

    #[test]
    fn budget_exhaustion_rolls_back() {
        let mut b = board(&[1, 2]);
        commit(&mut b, party(10, &[100], 1, 4));
        commit(&mut b, party(11, &[101], 1, 4));
        let before = b.clone();
        let budget = AllocationBudget {
            max_depth: 16,
            max_displacements: Some(0),
        };
        let err = allocate(&mut b, vec![party(12, &[102], 1, 4)], budget).unwrap_err();
        assert!(matches!(
            err,
            EngineError::AllocationUnresolved {
                reason: UnresolvedReason::BudgetExhausted(0),
                ..
            }
        ));
        assert_eq!(b, before);
    }

    #[test]
    fn depth_limit_rolls_back() {
        let mut b = board(&[1, 2]);
        commit(&mut b, party(10, &[100], 1, 4));
        let budget = AllocationBudget {
            max_depth: 0,
            max_displacements: None,
        };
        // run 2 is free, so nothing is displaced
        allocate(&mut b.clone(), vec![party(11, &[101], 1, 4)], budget).unwrap();

        commit(&mut b, party(11, &[101], 1, 4));
        let before = b.clone();
        let err = allocate(&mut b, vec![party(12, &[102], 1, 4)], budget).unwrap_err();
        assert!(matches!(
            err,
            EngineError::AllocationUnresolved {
                reason: UnresolvedReason::DepthExceeded(0),
                ..
            }
        ));
        assert_eq!(b, before);
    }

    #[test]
    fn out_of_span_range_is_rejected_untouched() {
        let mut b = board(&[1]);
        let before = b.clone();
        let err = allocate(&mut b, vec![party(10, &[100], 30, 5)], AllocationBudget::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::DateOutOfVacancyRange { .. }));
        assert_eq!(b, before);
    }

    #[test]
    fn missing_group_is_rejected() {
        let mut b = board(&[1]);
        let mut p = party(10, &[100], 1, 2);
        p.group = GroupKey::new(Species::Dog, RunType::Deluxe);
        assert!(matches!(
            allocate(&mut b, vec![p], AllocationBudget::default()),
            Err(EngineError::NoRunsOfType(_))
        ));
    }

    #[test]
    fn second_party_failure_undoes_first() {
        let mut b = board(&[1]);
        let before = b.clone();
        let mut cats = party(10, &[200], 1, 2);
        cats.group = GroupKey::new(Species::Cat, RunType::Standard);
        let err = allocate(&mut b, vec![party(10, &[100], 1, 2), cats], AllocationBudget::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::NoRunsOfType(_)));
        assert_eq!(b, before);
    }

    #[test]
    fn journal_events_describe_the_change() {
        let mut b = board(&[1]);
        let alloc = allocate(&mut b, vec![party(10, &[100, 101], 2, 2)], AllocationBudget::default())
            .unwrap();
        let events = alloc.txn.events();
        assert_eq!(events.len(), 4);
        assert!(events
            .iter()
            .all(|e| matches!(e, Event::OccupancyAdded { run: 1, booking: 10, .. })));
        assert_eq!(alloc.txn.touched_runs().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn rollback_restores_committed_call() {
        let mut b = board(&[1, 2, 3]);
        seed(&mut b, 1, 10, &[100], 3, 1);
        seed(&mut b, 2, 11, &[101], 2, 2);
        seed(&mut b, 3, 13, &[103], 1, 1);
        let before = b.clone();
        let alloc = allocate(&mut b, vec![party(12, &[102], 1, 3)], AllocationBudget::default())
            .unwrap();
        assert!(!alloc.report.evictions.is_empty());
        assert_ne!(b, before);
        alloc.txn.rollback(&mut b);
        assert_eq!(b, before);
    }

    #[test]
    fn empty_request_is_noop() {
        let mut b = board(&[1]);
        let alloc = allocate(&mut b, Vec::new(), AllocationBudget::default()).unwrap();
        assert!(alloc.report.placements.is_empty());
        assert!(alloc.txn.events().is_empty());
    }

    #[test]
    fn budget_default_scales_with_runs_and_stay() {
        let budget = AllocationBudget::default();
        assert_eq!(budget.displacement_limit(4, 7), 28);
        assert_eq!(budget.displacement_limit(0, 0), 1);
        let fixed = AllocationBudget {
            max_depth: 3,
            max_displacements: Some(5),
        };
        assert_eq!(fixed.displacement_limit(100, 100), 5);
    }
}
