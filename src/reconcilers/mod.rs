//! Reconcilers for owner resources
//!
//! Reconcilers hold the business logic for each owner type:
//! - Validating specs
//! - Declaring the objects the owner produces
//! - Updating resource status

pub mod config_set;
