use tracing::warn;

use crate::model::*;

use super::EngineError;

/// Put `pet` into `booking`'s entry for `date`, creating the entry if needed.
/// Returns `false` when the pet is already there (duplicates are dropped).
pub fn add_occupancy(
    rs: &mut RunState,
    booking: BookingNo,
    pet: PetNo,
    date: Day,
    kind: Option<String>,
) -> bool {
    if let Some(entry) = rs.entry_mut(date, booking) {
        return entry.pets.insert(pet);
    }
    rs.push_entry(
        date,
        OccupancyEntry {
            booking,
            pets: [pet].into_iter().collect(),
            kind,
        },
    );
    true
}

/// Consecutive vacant days starting at `date`, capped at `max_length`.
/// Zero if `date` itself is occupied.
pub fn free_run_length(rs: &RunState, date: Day, max_length: u32) -> u32 {
    let range = DayRange { start: date, days: max_length };
    let mut n = 0;
    for day in range.dates() {
        if !rs.is_free(day) {
            break;
        }
        n += 1;
    }
    n
}

/// Consecutive days from `date` on which `booking` holds the same pet set it
/// holds on `date`. Zero (with a warning) if it holds nothing on `date`.
pub fn contiguous_span(rs: &RunState, date: Day, booking: BookingNo) -> u32 {
    let Some(first) = rs.entry(date, booking) else {
        warn!(
            "{}",
            EngineError::InconsistentOccupancy {
                run: rs.run.no,
                booking,
                date,
            }
        );
        return 0;
    };
    let mut n = 1;
    loop {
        let next = DayRange::new(date, n + 1).last_day();
        match rs.entry(next, booking) {
            Some(e) if e.pets == first.pets => n += 1,
            _ => return n,
        }
    }
}

/// Remove `booking`'s entries over `days` days from `date`. All-or-nothing:
/// if any day lacks an entry nothing is removed and the gap is reported.
pub fn clear_range(
    rs: &mut RunState,
    booking: BookingNo,
    date: Day,
    days: u32,
) -> Result<Vec<OccupancyEntry>, EngineError> {
    let range = DayRange::new(date, days);
    if let Some(missing) = range.dates().find(|d| rs.entry(*d, booking).is_none()) {
        let err = EngineError::InconsistentOccupancy {
            run: rs.run.no,
            booking,
            date: missing,
        };
        warn!("clear_range skipped: {err}");
        return Err(err);
    }
    Ok(range
        .dates()
        .filter_map(|d| rs.remove_entry(d, booking))
        .collect())
}
