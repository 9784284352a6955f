//! Scenarios, grouped by the story they tell
//!
//! - `lifecycle`: a full Up, probe and Down round, and a run stopped
//!   part way through
//! - `failures`: runs where the provider, the nodes or the probes
//!   misbehave, and what is left afterwards
//! - `properties`: guarantees that hold across every run

mod failures;
mod helpers;
mod lifecycle;
mod properties;
