//! Durable message store for the FuelFlux controller.
//!
//! One SQLite file holds everything the device must not lose:
//!
//! - `backlog`: reportable transactions awaiting successful delivery,
//!   drained FIFO by the backlog worker;
//! - `dead_messages`: transactions the portal explicitly rejected, kept
//!   for audit;
//! - `user_cache_a` / `user_cache_b`: the user allowance cache, kept as
//!   an active/standby pair so a population can be prepared off to the
//!   side and flipped in atomically;
//! - `user_cache_meta`: names the active table.
//!
//! All public calls serialize on one mutex; SQLite adds a multi-second
//! busy timeout underneath for cross-process contention.

mod error;
mod store;

pub use error::{StoreError, StoreResult};
pub use store::{MessageStore, StoredMessage};
