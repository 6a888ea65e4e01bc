use crate::model::*;
use crate::observability::AVAILABILITY_CHECKS_TOTAL;

use super::availability;
use super::{Engine, EngineError};

fn occupancy_info(run: RunNo, date: Day, entry: &OccupancyEntry) -> OccupancyInfo {
    OccupancyInfo {
        run,
        date,
        booking: entry.booking,
        pets: entry.pets.iter().copied().collect(),
        kind: entry.kind.clone(),
    }
}

impl Engine {
    /// True if every day of `[from, to]` has at least `run_count` vacant runs
    /// of the given species and type. Reads a consistent board: never a
    /// half-applied allocation.
    pub async fn check_availability(
        &self,
        from: Day,
        to: Day,
        species: Species,
        run_type: RunType,
        run_count: u32,
    ) -> Result<bool, EngineError> {
        let board = self.board.read().await;
        let result = availability::check_availability(
            &board.registry,
            &board.vacancy,
            from,
            to,
            GroupKey::new(species, run_type),
            run_count,
        );
        let label = match &result {
            Ok(true) => "available",
            Ok(false) => "full",
            Err(_) => "error",
        };
        metrics::counter!(AVAILABILITY_CHECKS_TOTAL, "result" => label).increment(1);
        result
    }

    pub async fn vacancy(&self, date: Day, species: Species, run_type: RunType) -> Result<u32, EngineError> {
        let board = self.board.read().await;
        board.vacancy.get(date, GroupKey::new(species, run_type))
    }

    pub async fn vacancy_series(
        &self,
        from: Day,
        to: Day,
        species: Species,
        run_type: RunType,
    ) -> Result<Vec<(Day, u32)>, EngineError> {
        let board = self.board.read().await;
        availability::vacancy_series(&board.vacancy, from, to, GroupKey::new(species, run_type))
    }

    /// Inclusive span the vacancy index covers, if any.
    pub async fn vacancy_span(&self) -> Option<(Day, Day)> {
        self.board.read().await.vacancy.span()
    }

    /// Entries in one run on one day.
    pub async fn occupancy(&self, run: RunNo, date: Day) -> Result<Vec<OccupancyInfo>, EngineError> {
        let board = self.board.read().await;
        let rs = board.registry.run(run)?;
        Ok(rs
            .entries(date)
            .iter()
            .map(|e| occupancy_info(run, date, e))
            .collect())
    }

    /// Every day of every run a booking currently occupies, by run then date.
    pub async fn booking_occupancy(&self, booking: BookingNo) -> Result<Vec<OccupancyInfo>, EngineError> {
        if !self.bookings.contains_key(&booking) {
            return Err(EngineError::UnknownBooking(booking));
        }
        let board = self.board.read().await;
        let mut out = Vec::new();
        for rs in board.registry.runs() {
            for (date, entries) in &rs.occupancy {
                out.extend(
                    entries
                        .iter()
                        .filter(|e| e.booking == booking)
                        .map(|e| occupancy_info(rs.run.no, *date, e)),
                );
            }
        }
        Ok(out)
    }

    /// Runs of a group in tie-break order. Its length is the group's
    /// potential vacancy on any day.
    pub async fn runs_of_type(&self, species: Species, run_type: RunType) -> Vec<RunInfo> {
        let board = self.board.read().await;
        board
            .registry
            .group(GroupKey::new(species, run_type))
            .iter()
            .filter_map(|no| board.registry.get(*no))
            .map(|rs| RunInfo::from(&rs.run))
            .collect()
    }

    pub async fn run(&self, no: RunNo) -> Result<RunInfo, EngineError> {
        let board = self.board.read().await;
        board.registry.run(no).map(|rs| RunInfo::from(&rs.run))
    }

    pub fn booking(&self, no: BookingNo) -> Option<Booking> {
        self.bookings.get(&no).map(|b| b.value().clone())
    }

    pub fn pet(&self, no: PetNo) -> Option<Pet> {
        self.pets.get(&no).map(|p| p.value().clone())
    }
}
