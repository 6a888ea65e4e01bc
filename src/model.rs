use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

/// Calendar day, the only time type. Occupancy is tracked per whole day.
pub type Day = NaiveDate;

pub type RunNo = u32;
pub type BookingNo = u32;
pub type PetNo = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Species {
    Cat,
    Dog,
}

impl Species {
    /// Partition order used by the allocator.
    pub const ALL: [Species; 2] = [Species::Cat, Species::Dog];

    pub fn as_str(&self) -> &'static str {
        match self {
            Species::Cat => "Cat",
            Species::Dog => "Dog",
        }
    }
}

impl fmt::Display for Species {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Species {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cat" => Ok(Species::Cat),
            "dog" => Ok(Species::Dog),
            _ => Err(format!("unknown species: {s}")),
        }
    }
}

/// Run tier. Cats only ever use `Standard`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RunType {
    Standard,
    Deluxe,
    Double,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Standard => "Standard",
            RunType::Deluxe => "Deluxe",
            RunType::Double => "Double",
        }
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(RunType::Standard),
            "deluxe" => Ok(RunType::Deluxe),
            "double" => Ok(RunType::Double),
            _ => Err(format!("unknown run type: {s}")),
        }
    }
}

/// Immutable `(species, run type)` key used by the registry and the vacancy table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub species: Species,
    pub run_type: RunType,
}

impl GroupKey {
    pub fn new(species: Species, run_type: RunType) -> Self {
        Self { species, run_type }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.species, self.run_type)
    }
}

/// `days` consecutive days starting at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayRange {
    pub start: Day,
    pub days: u32,
}

impl DayRange {
    pub fn new(start: Day, days: u32) -> Self {
        debug_assert!(days > 0, "DayRange must cover at least one day");
        Self { start, days }
    }

    /// Both ends inclusive, as bookings store them. `None` if `last < first`.
    pub fn inclusive(first: Day, last: Day) -> Option<Self> {
        let days = last.signed_duration_since(first).num_days() + 1;
        if days < 1 {
            return None;
        }
        Some(Self::new(first, u32::try_from(days).ok()?))
    }

    /// Day at offset `i` from the start.
    pub fn nth(&self, i: u32) -> Day {
        self.start + Days::new(u64::from(i))
    }

    pub fn last_day(&self) -> Day {
        self.nth(self.days - 1)
    }

    pub fn contains(&self, day: Day) -> bool {
        day >= self.start && day <= self.last_day()
    }

    pub fn dates(&self) -> impl Iterator<Item = Day> + '_ {
        (0..self.days).map(|i| self.nth(i))
    }
}

/// A kennel or cattery pen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub no: RunNo,
    pub code: String,
    pub species: Species,
    pub run_type: RunType,
}

impl Run {
    pub fn group(&self) -> GroupKey {
        GroupKey::new(self.species, self.run_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pet {
    pub no: PetNo,
    #[serde(default)]
    pub name: String,
    pub species: Species,
}

/// Booking as supplied by the booking repository. Never mutated by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub no: BookingNo,
    pub start_date: Day,
    /// Inclusive.
    pub end_date: Day,
    pub pets: Vec<PetNo>,
    #[serde(default)]
    pub status: String,
}

impl Booking {
    pub fn stay(&self) -> Option<DayRange> {
        DayRange::inclusive(self.start_date, self.end_date)
    }
}

/// One booking's pets in one run on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyEntry {
    pub booking: BookingNo,
    pub pets: BTreeSet<PetNo>,
    pub kind: Option<String>,
}

/// A run plus its calendar: date → entries in insertion order.
/// An absent date means the run is vacant that day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    pub run: Run,
    pub occupancy: BTreeMap<Day, Vec<OccupancyEntry>>,
}

impl RunState {
    pub fn new(run: Run) -> Self {
        Self {
            run,
            occupancy: BTreeMap::new(),
        }
    }

    pub fn entries(&self, date: Day) -> &[OccupancyEntry] {
        self.occupancy.get(&date).map_or(&[], Vec::as_slice)
    }

    pub fn is_free(&self, date: Day) -> bool {
        self.entries(date).is_empty()
    }

    pub fn entry(&self, date: Day, booking: BookingNo) -> Option<&OccupancyEntry> {
        self.entries(date).iter().find(|e| e.booking == booking)
    }

    pub fn entry_mut(&mut self, date: Day, booking: BookingNo) -> Option<&mut OccupancyEntry> {
        self.occupancy
            .get_mut(&date)?
            .iter_mut()
            .find(|e| e.booking == booking)
    }

    pub fn push_entry(&mut self, date: Day, entry: OccupancyEntry) {
        self.occupancy.entry(date).or_default().push(entry);
    }

    /// Remove one booking's entry; drops the date once nothing is left on it.
    pub fn remove_entry(&mut self, date: Day, booking: BookingNo) -> Option<OccupancyEntry> {
        let entries = self.occupancy.get_mut(&date)?;
        let pos = entries.iter().position(|e| e.booking == booking)?;
        let removed = entries.remove(pos);
        if entries.is_empty() {
            self.occupancy.remove(&date);
        }
        Some(removed)
    }

    /// Distinct bookings on `date`, in entry order.
    pub fn bookings_on(&self, date: Day) -> Vec<BookingNo> {
        let mut seen = Vec::new();
        for e in self.entries(date) {
            if !seen.contains(&e.booking) {
                seen.push(e.booking);
            }
        }
        seen
    }
}

/// The journal record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    OccupancyAdded {
        run: RunNo,
        booking: BookingNo,
        pet: PetNo,
        date: Day,
        kind: Option<String>,
    },
    OccupancyCleared {
        run: RunNo,
        booking: BookingNo,
        start: Day,
        days: u32,
    },
}

impl Event {
    pub fn run(&self) -> RunNo {
        match self {
            Event::OccupancyAdded { run, .. } | Event::OccupancyCleared { run, .. } => *run,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    pub no: RunNo,
    pub code: String,
    pub species: Species,
    pub run_type: RunType,
}

impl From<&Run> for RunInfo {
    fn from(run: &Run) -> Self {
        Self {
            no: run.no,
            code: run.code.clone(),
            species: run.species,
            run_type: run.run_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyInfo {
    pub run: RunNo,
    pub date: Day,
    pub booking: BookingNo,
    pub pets: Vec<PetNo>,
    pub kind: Option<String>,
}

/// Where a party ended up after an allocation call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub booking: BookingNo,
    pub run: RunNo,
    pub pets: Vec<PetNo>,
    pub start: Day,
    pub days: u32,
}

/// A party evicted during an allocation call, before it was rehomed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Eviction {
    pub booking: BookingNo,
    pub from_run: RunNo,
    pub pets: Vec<PetNo>,
    pub start: Day,
    pub days: u32,
    pub displaced_by: BookingNo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationReport {
    pub placements: Vec<Placement>,
    pub evictions: Vec<Eviction>,
}

/// Parameters of one top-level allocation. Unset fields default from the
/// booking: all of its pets, its start date, its inclusive stay length.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateRequest {
    pub booking: BookingNo,
    #[serde(default)]
    pub pets: Option<Vec<PetNo>>,
    /// Applies to dogs only; cats always get a Standard run.
    #[serde(default)]
    pub run_type: Option<RunType>,
    #[serde(default)]
    pub start_date: Option<Day>,
    #[serde(default)]
    pub stay_length: Option<u32>,
}

impl AllocateRequest {
    pub fn for_booking(booking: BookingNo) -> Self {
        Self {
            booking,
            ..Self::default()
        }
    }
}
