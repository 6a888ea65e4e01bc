use crate::model::*;

use super::registry::RunRegistry;
use super::vacancy::VacancyIndex;
use super::EngineError;

// ── Availability ───────────────────────────────────────────────────

/// True if every day in `[from, to]` has at least `run_count` wholly vacant
/// runs of `group`.
///
/// A run counts as available for a day only if nobody is in it at any time
/// that day, so a leaver and an arriver sharing a run on changeover day do
/// not count as space. The whole range is validated against the vacancy span
/// before scanning; the scan stops at the first short day.
pub fn check_availability(
    registry: &RunRegistry,
    vacancy: &VacancyIndex,
    from: Day,
    to: Day,
    group: GroupKey,
    run_count: u32,
) -> Result<bool, EngineError> {
    let range = DayRange::inclusive(from, to)
        .ok_or(EngineError::InvalidStay("availability range ends before it starts"))?;
    if registry.group(group).is_empty() {
        return Err(EngineError::NoRunsOfType(group));
    }
    vacancy.check_range(&range)?;
    for day in range.dates() {
        if vacancy.get(day, group)? < run_count {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Vacant-run count per day of `[from, to]`, for occupancy reports.
pub fn vacancy_series(
    vacancy: &VacancyIndex,
    from: Day,
    to: Day,
    group: GroupKey,
) -> Result<Vec<(Day, u32)>, EngineError> {
    let range = DayRange::inclusive(from, to)
        .ok_or(EngineError::InvalidStay("range ends before it starts"))?;
    vacancy.check_range(&range)?;
    range
        .dates()
        .map(|day| Ok((day, vacancy.get(day, group)?)))
        .collect()
}
