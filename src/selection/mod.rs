//! Selection Engine
//!
//! Picks which peer stores or serves a file.
//!
//! Every decision starts a fresh `ScoreChart` holding the available peers
//! at score zero, then runs the configured filter chain for that kind of
//! decision in order. Filters add to scores or eliminate candidates; an
//! eliminated peer never comes back within the same decision. The survivors
//! are ranked by score, ties broken by peer name.

pub mod chart;
pub mod filter;
pub mod filters;
pub mod manager;
pub mod types;
