use std::collections::BTreeSet;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::limits::*;
use crate::loader::{LoadReport, Snapshot};
use crate::model::*;
use crate::observability::{ALLOCATIONS_TOTAL, ALLOCATION_DURATION_SECONDS, DISPLACEMENTS_TOTAL};

use super::allocator::{self, Party};
use super::{seed, Board, Engine, EngineError, VacancyIndex};

impl Engine {
    /// Place a booking's pets, rehoming anyone evicted on the way. All or
    /// nothing: on any error the board is exactly as it was.
    ///
    /// Existing placements of the booking are left alone. Allocating an
    /// already placed booking again puts the pets into a second run for the
    /// same days; clear the old placement first if a move is intended.
    pub async fn allocate(&self, req: AllocateRequest) -> Result<AllocationReport, EngineError> {
        let started = Instant::now();
        let result = self.allocate_inner(&req).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(EngineError::AllocationUnresolved { .. }) => "unresolved",
            Err(_) => "error",
        };
        metrics::counter!(ALLOCATIONS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(ALLOCATION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        match &result {
            Ok(report) => info!(
                "booking {} allocated: {} placements, {} displacements",
                req.booking,
                report.placements.len(),
                report.evictions.len()
            ),
            Err(e @ EngineError::AllocationUnresolved { .. }) => {
                warn!("allocation rolled back: {e}")
            }
            Err(e) => debug!("allocation of booking {} rejected: {e}", req.booking),
        }
        result
    }

    async fn allocate_inner(&self, req: &AllocateRequest) -> Result<AllocationReport, EngineError> {
        let parties = self.resolve_request(req)?;
        let mut board = self.board.write().await;
        let alloc = allocator::allocate(&mut board, parties, self.budget)?;
        metrics::counter!(DISPLACEMENTS_TOTAL).increment(alloc.report.evictions.len() as u64);

        let events = alloc.txn.events().to_vec();
        if !events.is_empty()
            && let Err(e) = self.journal_append(events.clone()).await
        {
            alloc.txn.rollback(&mut board);
            return Err(e);
        }
        for event in &events {
            self.notify.send(event.run(), event);
        }
        Ok(alloc.report)
    }

    /// Apply request defaults and split the pets into one party per species.
    pub(super) fn resolve_request(&self, req: &AllocateRequest) -> Result<Vec<Party>, EngineError> {
        let booking = self
            .bookings
            .get(&req.booking)
            .map(|b| b.value().clone())
            .ok_or(EngineError::UnknownBooking(req.booking))?;
        let pets = req.pets.as_ref().unwrap_or(&booking.pets);
        if pets.len() > MAX_PETS_PER_REQUEST {
            return Err(EngineError::LimitExceeded("too many pets in request"));
        }

        let start = req.start_date.unwrap_or(booking.start_date);
        let days = match req.stay_length {
            Some(n) => n,
            None => {
                booking
                    .stay()
                    .ok_or(EngineError::InvalidStay("booking ends before it starts"))?
                    .days
            }
        };
        if days == 0 {
            return Err(EngineError::InvalidStay("stay must be at least one day"));
        }
        if days > MAX_STAY_DAYS {
            return Err(EngineError::LimitExceeded("stay too long"));
        }
        let range = DayRange::new(start, days);

        let mut by_species: [(Species, BTreeSet<PetNo>); 2] = Species::ALL.map(|s| (s, BTreeSet::new()));
        for &pet in pets {
            if !booking.pets.contains(&pet) {
                return Err(EngineError::PetNotInBooking {
                    booking: booking.no,
                    pet,
                });
            }
            let species = self
                .pets
                .get(&pet)
                .map(|p| p.species)
                .ok_or(EngineError::UnknownPet(pet))?;
            if let Some((_, set)) = by_species.iter_mut().find(|(s, _)| *s == species) {
                set.insert(pet);
            }
        }

        Ok(by_species
            .into_iter()
            .filter(|(_, pets)| !pets.is_empty())
            .map(|(species, pets)| {
                let run_type = match species {
                    Species::Cat => RunType::Standard,
                    Species::Dog => req.run_type.unwrap_or(RunType::Standard),
                };
                Party {
                    booking: booking.no,
                    pets,
                    group: GroupKey::new(species, run_type),
                    range,
                }
            })
            .collect())
    }

    /// Add or replace a booking in the directory. The vacancy span grows to
    /// cover its stay.
    pub async fn register_booking(&self, booking: Booking) -> Result<(), EngineError> {
        let stay = booking
            .stay()
            .ok_or(EngineError::InvalidStay("booking ends before it starts"))?;
        if stay.days > MAX_STAY_DAYS {
            return Err(EngineError::LimitExceeded("stay too long"));
        }
        if booking.pets.len() > MAX_PETS_PER_REQUEST {
            return Err(EngineError::LimitExceeded("too many pets on booking"));
        }
        {
            let mut board = self.board.write().await;
            let covered = board.vacancy.check_range(&stay).is_ok();
            if !covered {
                let Board { registry, vacancy } = &mut *board;
                vacancy.extend(registry, stay.start, stay.last_day())?;
                debug!("vacancy span widened to {:?} for booking {}", vacancy.span(), booking.no);
            }
        }
        debug!("booking {} registered", booking.no);
        self.bookings.insert(booking.no, booking);
        Ok(())
    }

    pub fn register_pet(&self, pet: Pet) {
        debug!("pet {} ({}) registered", pet.no, pet.species);
        self.pets.insert(pet.no, pet);
    }

    /// Grow the vacancy span forward to `until`. Returns the new span.
    pub async fn extend_horizon(&self, until: Day) -> Result<(Day, Day), EngineError> {
        let mut board = self.board.write().await;
        let Board { registry, vacancy } = &mut *board;
        let lo = vacancy
            .span()
            .map(|(lo, _)| lo)
            .or_else(|| registry.occupied_span().map(|(lo, _)| lo))
            .unwrap_or(until)
            .min(until);
        vacancy.extend(registry, lo, until)?;
        let span = vacancy
            .span()
            .ok_or(EngineError::InvalidStay("vacancy span is empty"))?;
        info!("vacancy span extended to {}..={}", span.0, span.1);
        Ok(span)
    }

    /// Throw away all state and reseed from `snapshot`. The journal is
    /// truncated since the snapshot supersedes it.
    pub async fn reload(&self, snapshot: Snapshot) -> Result<LoadReport, EngineError> {
        let seeded = seed(snapshot, &[])?;
        let mut board = self.board.write().await;
        self.journal_checkpoint().await?;
        *board = seeded.board;
        self.notify.retain(|run| board.registry.get(run).is_some());
        self.bookings.clear();
        for b in seeded.bookings {
            self.bookings.insert(b.no, b);
        }
        self.pets.clear();
        for p in seeded.pets {
            self.pets.insert(p.no, p);
        }
        info!("reloaded: {}", seeded.report);
        Ok(seeded.report)
    }

    /// Truncate the journal once the external store has absorbed it.
    pub async fn checkpoint(&self) -> Result<(), EngineError> {
        // no allocation can be between its board mutation and its journal append
        let _board = self.board.write().await;
        self.journal_checkpoint().await?;
        info!("journal checkpointed");
        Ok(())
    }

    /// Rebuild the vacancy index over its current span from the calendars.
    pub async fn rebuild_vacancy(&self) -> Result<(), EngineError> {
        let mut board = self.board.write().await;
        if let Some((min, max)) = board.vacancy.span() {
            board.vacancy = VacancyIndex::build(&board.registry, min, max)?;
        }
        Ok(())
    }
}
