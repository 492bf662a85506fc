//! Stable exit codes for reflector CLI commands.

/// Command succeeded or the loop shut down cleanly.
pub const OK: i32 = 0;
/// Invalid configuration, missing workspace files, or another setup error.
pub const INVALID: i32 = 1;
/// The loop halted on a state-corruption error (duplicate key, second writer,
/// revision conflict). Requires operator intervention.
pub const HALTED: i32 = 2;
