//! Beacon epoch time.

/// The number of intervals (epochs) since the beginning of time.
pub type EpochTime = u64;

/// An invalid epoch time.
pub const EPOCH_INVALID: EpochTime = 0xffffffffffffffff;
