//! Match records and the runtime that mutates them.

pub mod model;
pub mod runtime;

pub use model::{Match, MatchId, MatchOptions, MatchStatus, Seat, SeatKind, UserId};
pub use runtime::{MatchRuntime, PlayerProfile, RuntimeSettings};
