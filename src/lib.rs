//! Distributed session runtime for a multiplayer card-game portal.
//!
//! Lobbies, matches and per-seat timers live in a shared key-value +
//! pub/sub store so any number of frontend processes can serve the same
//! match; every mutation runs under a fenced, auto-expiring lock keyed by
//! match id. Rule engines and bot policies plug in behind small traits.
//! A fleet of background tasks (turn-timer sweeper, disconnect supervisor,
//! cleanup sweeper, one matchmaking loop per bot) keeps games moving
//! without any process being special.

pub mod bots;
pub mod broadcast;
pub mod cleanup;
pub mod config;
pub mod disconnect;
pub mod engine;
pub mod error;
pub mod events;
pub mod games;
pub mod lock;
pub mod matches;
pub mod portal;
pub mod store;
pub mod timer;

pub use error::{Error, Result};
pub use portal::Portal;
