//! Generators for the configuration that gates access to the database.
//!
//! - `parameters` - layered server parameters rendered for `postgresql.conf`
//! - `hba` - ordered `pg_hba.conf` records
//! - `logdir` - sanitizing of the `log_directory` parameter

pub mod hba;
pub mod logdir;
pub mod parameters;

pub use hba::{HBAs, HostBasedAuthentication, OrderedHBAs};
pub use logdir::sanitize_log_directory;
pub use parameters::{ParameterSet, Parameters, sanitize_parameters};
