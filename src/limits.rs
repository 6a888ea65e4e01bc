//! Hard limits enforced at the engine boundary.

/// Longest stay a single allocation call may request.
pub const MAX_STAY_DAYS: u32 = 366;

/// Widest vacancy span the index will build (about ten years).
pub const MAX_VACANCY_SPAN_DAYS: i64 = 3_660;

/// Pets in one allocation request.
pub const MAX_PETS_PER_REQUEST: usize = 32;

/// Runs per registry.
pub const MAX_RUNS: usize = 10_000;

/// Displacement generations before an allocation is abandoned.
pub const DEFAULT_MAX_REALLOCATION_DEPTH: u32 = 16;

/// Longest accepted request line on the wire, in bytes.
pub const MAX_REQUEST_LINE_LEN: usize = 64 * 1024;

/// Run channels a single connection may listen on.
pub const MAX_LISTENS_PER_CONNECTION: usize = 256;
