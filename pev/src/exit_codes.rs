//! Stable exit codes for `pev` CLI commands.

/// Command succeeded and, for full cycles, verification passed.
pub const OK: i32 = 0;
/// Invalid input, schema error, prediction overflow, timeout, or a
/// non-recovered action failure.
pub const FAILED: i32 = 1;
/// The batch stopped early for a reason that must hold back downstream work.
pub const BLOCKED: i32 = 2;
/// The real post-execution state matched no predicted candidate.
pub const MISMATCH: i32 = 3;
