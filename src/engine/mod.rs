mod allocator;
mod availability;
mod calendar;
mod error;
mod mutations;
mod queries;
mod registry;
mod vacancy;

pub use allocator::{AllocationBudget, Party};
pub use availability::{check_availability, vacancy_series};
pub use error::{EngineError, UnresolvedReason};
pub use registry::RunRegistry;
pub use vacancy::VacancyIndex;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Days;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::warn;

use crate::limits::MAX_VACANCY_SPAN_DAYS;
use crate::loader::{LoadReport, Snapshot};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

/// Runs with their calendars plus the vacancy counts derived from them.
/// Always locked and mutated as one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Board {
    pub registry: RunRegistry,
    pub vacancy: VacancyIndex,
}

// ── Group-commit journal channel ─────────────────────────

pub(super) enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Checkpoint {
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCheckpoint {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the journal and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::JOURNAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    'outer: for (events, _) in batch {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                append_err = Some(e);
                break 'outer;
            }
        }
    }
    // Flush even after an append error so buffered bytes don't leak into
    // the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Checkpoint { response } => {
            let _ = response.send(wal.truncate());
        }
        WalCommand::AppendsSinceCheckpoint { response } => {
            let _ = response.send(wal.appends_since_checkpoint());
        }
        WalCommand::Append { events, response } => {
            let mut batch = vec![(events, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// Apply a journal event to the registry. Returns `false` (with a warning)
/// when it cannot apply, e.g. the run no longer exists.
pub(super) fn apply_event(registry: &mut RunRegistry, event: &Event) -> bool {
    let Some(rs) = registry.get_mut(event.run()) else {
        warn!("journal event for unknown run {} skipped", event.run());
        return false;
    };
    match event {
        Event::OccupancyAdded {
            booking,
            pet,
            date,
            kind,
            ..
        } => {
            calendar::add_occupancy(rs, *booking, *pet, *date, kind.clone());
            true
        }
        Event::OccupancyCleared {
            booking, start, days, ..
        } => calendar::clear_range(rs, *booking, *start, *days).is_ok(),
    }
}

fn widen(span: Option<(Day, Day)>, lo: Day, hi: Day) -> Option<(Day, Day)> {
    Some(match span {
        None => (lo, hi),
        Some((a, b)) => (a.min(lo), b.max(hi)),
    })
}

/// Booking stays and the horizon, widened by occupied days.
///
/// History reaches back at most `MAX_VACANCY_SPAN_DAYS` from the end of the
/// span. Older rows stay in the calendars but get no vacancy cells.
fn observed_span<'a>(
    registry: &RunRegistry,
    bookings: impl Iterator<Item = &'a Booking>,
    horizon: Option<Day>,
) -> Option<(Day, Day)> {
    let mut required = None;
    for b in bookings {
        if let Some(stay) = b.stay() {
            required = widen(required, stay.start, stay.last_day());
        }
    }
    if let Some(h) = horizon {
        required = widen(required, h, h);
    }
    let Some((first, last)) = registry.occupied_span() else {
        return required;
    };
    let (lo, hi) = widen(required, first, last)?;

    let earliest = hi - Days::new((MAX_VACANCY_SPAN_DAYS - 1) as u64);
    let floor = required.map_or(earliest, |(a, _)| earliest.min(a));
    if lo < floor {
        warn!("occupancy history from {lo} to {floor} is older than the vacancy span and is not counted");
        return Some((floor, hi));
    }
    Some((lo, hi))
}

/// Directories and board rebuilt from a snapshot with `journal` replayed on top.
pub(super) struct Seeded {
    pub board: Board,
    pub bookings: Vec<Booking>,
    pub pets: Vec<Pet>,
    pub report: LoadReport,
}

pub(super) fn seed(snapshot: Snapshot, journal: &[Event]) -> Result<Seeded, EngineError> {
    let mut report = LoadReport::default();
    let mut registry = RunRegistry::new();
    for run in snapshot.runs {
        let no = run.no;
        if registry.insert_run(run)? {
            report.runs += 1;
        } else {
            warn!("duplicate run {no} in snapshot skipped");
        }
    }
    let pets: std::collections::BTreeMap<PetNo, Pet> =
        snapshot.pets.into_iter().map(|p| (p.no, p)).collect();
    let bookings: std::collections::BTreeMap<BookingNo, Booking> =
        snapshot.bookings.into_iter().map(|b| (b.no, b)).collect();
    report.pets = pets.len();
    report.bookings = bookings.len();

    for row in snapshot.occupancy {
        if !bookings.contains_key(&row.booking) || !pets.contains_key(&row.pet) {
            warn!(
                "occupancy row for run {} on {} names unknown booking {} or pet {}; skipped",
                row.run, row.date, row.booking, row.pet
            );
            report.skipped_rows += 1;
            continue;
        }
        let Some(rs) = registry.get_mut(row.run) else {
            warn!("occupancy row for unknown run {} on {} skipped", row.run, row.date);
            report.skipped_rows += 1;
            continue;
        };
        calendar::add_occupancy(rs, row.booking, row.pet, row.date, row.kind);
        report.occupancy_rows += 1;
    }

    for event in journal {
        apply_event(&mut registry, event);
    }
    report.journal_events = journal.len();

    let vacancy = match observed_span(&registry, bookings.values(), snapshot.horizon) {
        Some((min, max)) => VacancyIndex::build(&registry, min, max)?,
        None => VacancyIndex::empty(),
    };
    report.span = vacancy.span();

    Ok(Seeded {
        board: Board { registry, vacancy },
        bookings: bookings.into_values().collect(),
        pets: pets.into_values().collect(),
        report,
    })
}

pub struct Engine {
    pub(super) board: RwLock<Board>,
    pub(super) bookings: DashMap<BookingNo, Booking>,
    pub(super) pets: DashMap<PetNo, Pet>,
    pub(super) budget: AllocationBudget,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    load_report: LoadReport,
}

impl Engine {
    /// Seed from `snapshot`, replay the journal at `journal_path` on top,
    /// then start the journal writer. Must be called inside a tokio runtime.
    pub fn new(journal_path: PathBuf, snapshot: Snapshot, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&journal_path)?;
        let seeded = seed(snapshot, &events).map_err(io::Error::other)?;
        let wal = Wal::open(&journal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let bookings = DashMap::new();
        for b in seeded.bookings {
            bookings.insert(b.no, b);
        }
        let pets = DashMap::new();
        for p in seeded.pets {
            pets.insert(p.no, p);
        }
        Ok(Self {
            board: RwLock::new(seeded.board),
            bookings,
            pets,
            budget: AllocationBudget::default(),
            wal_tx,
            notify,
            load_report: seeded.report,
        })
    }

    pub fn with_budget(mut self, budget: AllocationBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn budget(&self) -> AllocationBudget {
        self.budget
    }

    /// Counts from startup. `reload` returns its own.
    pub fn load_report(&self) -> &LoadReport {
        &self.load_report
    }

    /// Append one call's events to the journal via the group-commit writer.
    pub(super) async fn journal_append(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { events, response: tx })
            .await
            .map_err(|_| EngineError::JournalError("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::JournalError("journal writer dropped response".into()))?
            .map_err(|e| EngineError::JournalError(e.to_string()))
    }

    pub(super) async fn journal_checkpoint(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Checkpoint { response: tx })
            .await
            .map_err(|_| EngineError::JournalError("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::JournalError("journal writer dropped response".into()))?
            .map_err(|e| EngineError::JournalError(e.to_string()))
    }

    /// Events appended since the last checkpoint.
    pub async fn journal_pending(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCheckpoint { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
