//! Database layer for sluice: connection handling, migrations, row
//! models, and typed query functions.
//!
//! Every pipeline status transition is expressed here as a single
//! conditional UPDATE so that claims and finalizations stay atomic even
//! with multiple runner replicas.

pub mod models;
pub mod pool;
pub mod queries;
