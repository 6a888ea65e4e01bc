use std::collections::BTreeMap;

use chrono::Days;

use crate::limits::MAX_VACANCY_SPAN_DAYS;
use crate::model::*;

use super::registry::RunRegistry;
use super::EngineError;

/// Per day, per `(species, run type)`: how many runs have no occupants.
///
/// Built in one pass over the registry, then kept current by `occupy` /
/// `vacate` as the allocator mutates calendars. `build` over the same span
/// always yields an equal index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VacancyIndex {
    min_date: Option<Day>,
    cells: Vec<BTreeMap<GroupKey, u32>>,
}

/// Runs in `group` with an empty calendar on `date`.
fn count_vacant(registry: &RunRegistry, date: Day, group: GroupKey) -> u32 {
    registry
        .group(group)
        .iter()
        .filter_map(|no| registry.get(*no))
        .filter(|rs| rs.is_free(date))
        .count() as u32
}

impl VacancyIndex {
    /// An index with no span; every lookup is out of range.
    pub fn empty() -> Self {
        Self::default()
    }

    /// O(days × runs) scan of `[min_date, max_date]`.
    pub fn build(registry: &RunRegistry, min_date: Day, max_date: Day) -> Result<Self, EngineError> {
        let days = max_date.signed_duration_since(min_date).num_days() + 1;
        if days < 1 {
            return Err(EngineError::InvalidStay("vacancy span ends before it starts"));
        }
        if days > MAX_VACANCY_SPAN_DAYS {
            return Err(EngineError::LimitExceeded("vacancy span too wide"));
        }
        let keys: Vec<GroupKey> = registry.group_keys().collect();
        let cells = (0..days as u64)
            .map(|i| {
                let date = min_date + Days::new(i);
                keys.iter()
                    .map(|&key| (key, count_vacant(registry, date, key)))
                    .collect()
            })
            .collect();
        Ok(Self {
            min_date: Some(min_date),
            cells,
        })
    }

    /// Inclusive `(min, max)` of the built span.
    pub fn span(&self) -> Option<(Day, Day)> {
        let min = self.min_date?;
        let last = self.cells.len().checked_sub(1)?;
        Some((min, min + Days::new(last as u64)))
    }

    fn offset(&self, date: Day) -> Result<usize, EngineError> {
        let out_of_range = || EngineError::DateOutOfVacancyRange {
            date,
            span: self.span(),
        };
        let min = self.min_date.ok_or_else(out_of_range)?;
        let off = date.signed_duration_since(min).num_days();
        if off < 0 || off as usize >= self.cells.len() {
            return Err(out_of_range());
        }
        Ok(off as usize)
    }

    pub fn get(&self, date: Day, group: GroupKey) -> Result<u32, EngineError> {
        let off = self.offset(date)?;
        Ok(self.cells[off].get(&group).copied().unwrap_or(0))
    }

    /// Every day of `range` lies inside the span.
    pub fn check_range(&self, range: &DayRange) -> Result<(), EngineError> {
        self.offset(range.start)?;
        self.offset(range.last_day())?;
        Ok(())
    }

    /// A run of `group` went from vacant to occupied on `date`.
    pub fn occupy(&mut self, date: Day, group: GroupKey) {
        if let Ok(off) = self.offset(date)
            && let Some(cell) = self.cells[off].get_mut(&group)
        {
            *cell = cell.saturating_sub(1);
        }
    }

    /// A run of `group` went from occupied to vacant on `date`.
    pub fn vacate(&mut self, date: Day, group: GroupKey) {
        if let Ok(off) = self.offset(date)
            && let Some(cell) = self.cells[off].get_mut(&group)
        {
            *cell += 1;
        }
    }

    /// Recompute one cell from the registry.
    pub fn recount(&mut self, registry: &RunRegistry, date: Day, group: GroupKey) {
        if let Ok(off) = self.offset(date) {
            self.cells[off].insert(group, count_vacant(registry, date, group));
        }
    }

    /// Widen the span to cover `[min_date, max_date]`, recounting everything.
    pub fn extend(&mut self, registry: &RunRegistry, min_date: Day, max_date: Day) -> Result<(), EngineError> {
        let (lo, hi) = match self.span() {
            Some((lo, hi)) => (lo.min(min_date), hi.max(max_date)),
            None => (min_date, max_date),
        };
        *self = Self::build(registry, lo, hi)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::calendar::add_occupancy;
    use chrono::NaiveDate;

    fn d(day: u32) -> Day {
        NaiveDate::from_ymd_opt(2024, 8, day).unwrap()
    }

    const CAT: GroupKey = GroupKey {
        species: Species::Cat,
        run_type: RunType::Standard,
    };
    const DOG: GroupKey = GroupKey {
        species: Species::Dog,
        run_type: RunType::Standard,
    };

    fn registry() -> RunRegistry {
        let mut reg = RunRegistry::new();
        for (no, species) in [(1, Species::Cat), (2, Species::Cat), (3, Species::Dog)] {
            reg.insert_run(Run {
                no,
                code: format!("R{no}"),
                species,
                run_type: RunType::Standard,
            })
            .unwrap();
        }
        reg
    }

    #[test]
    fn build_counts_empty_runs() {
        let mut reg = registry();
        add_occupancy(reg.get_mut(1).unwrap(), 10, 100, d(2), None);
        add_occupancy(reg.get_mut(3).unwrap(), 11, 101, d(2), None);
        let idx = VacancyIndex::build(&reg, d(1), d(3)).unwrap();
        assert_eq!(idx.get(d(1), CAT).unwrap(), 2);
        assert_eq!(idx.get(d(2), CAT).unwrap(), 1);
        assert_eq!(idx.get(d(2), DOG).unwrap(), 0);
        assert_eq!(idx.get(d(3), DOG).unwrap(), 1);
        assert_eq!(idx.span(), Some((d(1), d(3))));
    }

    #[test]
    fn two_bookings_in_one_run_count_once() {
        let mut reg = registry();
        add_occupancy(reg.get_mut(1).unwrap(), 10, 100, d(2), None);
        add_occupancy(reg.get_mut(1).unwrap(), 12, 102, d(2), None);
        let idx = VacancyIndex::build(&reg, d(2), d(2)).unwrap();
        assert_eq!(idx.get(d(2), CAT).unwrap(), 1);
    }

    #[test]
    fn unknown_group_reads_zero() {
        let reg = registry();
        let idx = VacancyIndex::build(&reg, d(1), d(1)).unwrap();
        let deluxe = GroupKey::new(Species::Dog, RunType::Deluxe);
        assert_eq!(idx.get(d(1), deluxe).unwrap(), 0);
    }

    #[test]
    fn out_of_range_dates() {
        let reg = registry();
        let idx = VacancyIndex::build(&reg, d(5), d(6)).unwrap();
        assert!(matches!(
            idx.get(d(4), CAT),
            Err(EngineError::DateOutOfVacancyRange { .. })
        ));
        assert!(idx.get(d(7), CAT).is_err());
        assert!(idx.check_range(&DayRange::new(d(5), 3)).is_err());
        assert!(idx.check_range(&DayRange::new(d(5), 2)).is_ok());
    }

    #[test]
    fn empty_index_rejects_everything() {
        let idx = VacancyIndex::empty();
        assert_eq!(idx.span(), None);
        assert!(matches!(
            idx.get(d(1), CAT),
            Err(EngineError::DateOutOfVacancyRange { span: None, .. })
        ));
    }

    #[test]
    fn build_rejects_inverted_and_huge_spans() {
        let reg = registry();
        assert!(VacancyIndex::build(&reg, d(3), d(2)).is_err());
        let far = NaiveDate::from_ymd_opt(2060, 1, 1).unwrap();
        assert!(matches!(
            VacancyIndex::build(&reg, d(1), far),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn patching_matches_rebuild() {
        let mut reg = registry();
        let mut idx = VacancyIndex::build(&reg, d(1), d(4)).unwrap();

        add_occupancy(reg.get_mut(2).unwrap(), 10, 100, d(3), None);
        idx.occupy(d(3), CAT);
        assert_eq!(idx, VacancyIndex::build(&reg, d(1), d(4)).unwrap());

        reg.get_mut(2).unwrap().remove_entry(d(3), 10);
        idx.vacate(d(3), CAT);
        assert_eq!(idx, VacancyIndex::build(&reg, d(1), d(4)).unwrap());
    }

    #[test]
    fn recount_repairs_a_cell() {
        let mut reg = registry();
        let mut idx = VacancyIndex::build(&reg, d(1), d(2)).unwrap();
        add_occupancy(reg.get_mut(3).unwrap(), 10, 100, d(1), None);
        idx.recount(&reg, d(1), DOG);
        assert_eq!(idx.get(d(1), DOG).unwrap(), 0);
    }

    #[test]
    fn extend_keeps_counts_and_widens() {
        let mut reg = registry();
        add_occupancy(reg.get_mut(1).unwrap(), 10, 100, d(2), None);
        let mut idx = VacancyIndex::build(&reg, d(2), d(2)).unwrap();
        idx.extend(&reg, d(2), d(10)).unwrap();
        assert_eq!(idx.span(), Some((d(2), d(10))));
        assert_eq!(idx.get(d(2), CAT).unwrap(), 1);
        assert_eq!(idx.get(d(10), CAT).unwrap(), 2);
    }
}
