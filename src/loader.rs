use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::model::*;

/// One historical occupancy row from the run/occupancy repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyRow {
    pub run: RunNo,
    pub pet: PetNo,
    pub date: Day,
    pub booking: BookingNo,
    #[serde(default)]
    pub kind: Option<String>,
}

/// Everything the engine is seeded with at startup or on reload: the run
/// set with its historical occupancy, and the booking/pet directories.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub runs: Vec<Run>,
    #[serde(default)]
    pub pets: Vec<Pet>,
    #[serde(default)]
    pub bookings: Vec<Booking>,
    #[serde(default)]
    pub occupancy: Vec<OccupancyRow>,
    /// Last day the vacancy span must reach even if nothing is booked that far.
    #[serde(default)]
    pub horizon: Option<Day>,
}

impl Snapshot {
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> io::Result<Self> {
        serde_json::from_str(json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Counts reported after seeding the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub runs: usize,
    pub pets: usize,
    pub bookings: usize,
    pub occupancy_rows: usize,
    /// Rows naming a run, booking or pet that is not in the snapshot.
    pub skipped_rows: usize,
    pub journal_events: usize,
    pub span: Option<(Day, Day)>,
}

impl std::fmt::Display for LoadReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} runs, {} pets, {} bookings, {} occupancy rows ({} skipped), {} journal events",
            self.runs, self.pets, self.bookings, self.occupancy_rows, self.skipped_rows, self.journal_events
        )?;
        match self.span {
            Some((min, max)) => write!(f, ", vacancy span {min}..={max}"),
            None => write!(f, ", no vacancy span"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn parses_full_snapshot() {
        let json = r#"{
            "runs": [
                {"no": 1, "code": "C1", "species": "Cat", "run_type": "Standard"},
                {"no": 2, "code": "D1", "species": "Dog", "run_type": "Deluxe"}
            ],
            "pets": [{"no": 10, "name": "Tibbles", "species": "Cat"}],
            "bookings": [
                {"no": 100, "start_date": "2025-03-01", "end_date": "2025-03-04", "pets": [10], "status": "confirmed"}
            ],
            "occupancy": [
                {"run": 1, "pet": 10, "date": "2025-03-01", "booking": 100, "kind": "B"}
            ],
            "horizon": "2025-12-31"
        }"#;
        let snap = Snapshot::from_json(json).unwrap();
        assert_eq!(snap.runs.len(), 2);
        assert_eq!(snap.runs[1].run_type, RunType::Deluxe);
        assert_eq!(snap.pets[0].species, Species::Cat);
        assert_eq!(
            snap.bookings[0].stay().unwrap().days,
            4
        );
        assert_eq!(snap.occupancy[0].kind.as_deref(), Some("B"));
        assert_eq!(snap.horizon, NaiveDate::from_ymd_opt(2025, 12, 31));
    }

    #[test]
    fn missing_sections_default_empty() {
        let snap = Snapshot::from_json(r#"{"runs": []}"#).unwrap();
        assert!(snap.pets.is_empty());
        assert!(snap.occupancy.is_empty());
        assert_eq!(snap.horizon, None);
        let pet: Pet = serde_json::from_str(r#"{"no": 1, "species": "Dog"}"#).unwrap();
        assert_eq!(pet.name, "");
    }

    #[test]
    fn malformed_json_is_invalid_data() {
        let err = Snapshot::from_json("{\"runs\": [").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let err = Snapshot::from_json(r#"{"runs": [{"no": 1, "code": "X", "species": "Ferret", "run_type": "Standard"}]}"#)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = Snapshot::from_file("/nonexistent/runboard/snapshot.json").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
