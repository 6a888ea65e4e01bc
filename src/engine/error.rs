use crate::model::{BookingNo, Day, GroupKey, PetNo, RunNo};

/// Why a displacement chain was abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnresolvedReason {
    /// `displaced` could only be rehomed by evicting `displacer` again.
    Cycle { displaced: BookingNo, displacer: BookingNo },
    DepthExceeded(u32),
    BudgetExhausted(usize),
}

impl std::fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnresolvedReason::Cycle {
                displaced,
                displacer,
            } => write!(
                f,
                "booking {displaced} can only be rehomed by evicting booking {displacer}"
            ),
            UnresolvedReason::DepthExceeded(depth) => {
                write!(f, "reallocation depth {depth} exceeded")
            }
            UnresolvedReason::BudgetExhausted(n) => {
                write!(f, "displacement budget of {n} exhausted")
            }
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    UnknownRun(RunNo),
    UnknownBooking(BookingNo),
    UnknownPet(PetNo),
    PetNotInBooking {
        booking: BookingNo,
        pet: PetNo,
    },
    DateOutOfVacancyRange {
        date: Day,
        span: Option<(Day, Day)>,
    },
    NoRunsOfType(GroupKey),
    InvalidStay(&'static str),
    LimitExceeded(&'static str),
    AllocationUnresolved {
        booking: BookingNo,
        reason: UnresolvedReason,
    },
    InconsistentOccupancy {
        run: RunNo,
        booking: BookingNo,
        date: Day,
    },
    JournalError(String),
}

impl EngineError {
    /// Stable short code for the wire protocol and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::UnknownRun(_) => "unknown_run",
            EngineError::UnknownBooking(_) => "unknown_booking",
            EngineError::UnknownPet(_) => "unknown_pet",
            EngineError::PetNotInBooking { .. } => "pet_not_in_booking",
            EngineError::DateOutOfVacancyRange { .. } => "date_out_of_vacancy_range",
            EngineError::NoRunsOfType(_) => "no_runs_of_type",
            EngineError::InvalidStay(_) => "invalid_stay",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::AllocationUnresolved { .. } => "allocation_unresolved",
            EngineError::InconsistentOccupancy { .. } => "inconsistent_occupancy",
            EngineError::JournalError(_) => "journal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::UnknownRun(no) => write!(f, "unknown run: {no}"),
            EngineError::UnknownBooking(no) => write!(f, "unknown booking: {no}"),
            EngineError::UnknownPet(no) => write!(f, "unknown pet: {no}"),
            EngineError::PetNotInBooking { booking, pet } => {
                write!(f, "pet {pet} is not part of booking {booking}")
            }
            EngineError::DateOutOfVacancyRange { date, span } => match span {
                Some((min, max)) => {
                    write!(f, "date {date} outside vacancy range [{min}, {max}]")
                }
                None => write!(f, "date {date} outside vacancy range (no span built)"),
            },
            EngineError::NoRunsOfType(group) => write!(f, "no runs of type {group}"),
            EngineError::InvalidStay(msg) => write!(f, "invalid stay: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::AllocationUnresolved { booking, reason } => {
                write!(f, "no capacity for booking {booking}: {reason}")
            }
            EngineError::InconsistentOccupancy { run, booking, date } => write!(
                f,
                "inconsistent occupancy: run {run} has no entry for booking {booking} on {date}"
            ),
            EngineError::JournalError(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
