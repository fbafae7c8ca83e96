//! Identifier and time aliases shared across the crate.

/// Monotonically assigned task identifier.
pub type TaskId = i64;

/// Milliseconds since the Unix epoch (UTC).
pub type Timestamp = i64;

/// Identifier of the user a task or usage counter belongs to.
pub type UserId = String;
