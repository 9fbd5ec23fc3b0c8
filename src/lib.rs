//! Earmarking / cross-linkage core for a personal-finance tracker.
//!
//! An earmark allocates a percentage of one asset's value to one financial
//! goal; the goal symmetrically records which assets fund it. Both views
//! live as JSON documents on otherwise fixed relational rows, and the
//! [`earmarks`] ledger is the only writer allowed to touch either side, so
//! the two can never diverge. Alongside it, [`columns`] keeps the per-user
//! registry of custom typed attributes for asset records, and [`funding`]
//! derives a goal's funding position from the link state.

pub mod columns;
pub mod db;
pub mod earmarks;
mod error;
pub mod funding;
pub mod linkdoc;
pub mod logging;
pub mod model;
pub mod projection;
mod time;

pub use error::{AppError, AppResult};
pub use time::now_ms;
