//! pginit-core - bootstrap and runtime configuration of PostgreSQL
//! instances running in Kubernetes pods.
//!
//! Provides:
//! - `config` - layered server parameters, `pg_hba.conf` records, and log
//!   directory sanitizing
//! - `patroni` - the Patroni dynamic configuration carrying both
//! - `startup` - the protocol that prepares data volumes before the server starts
//! - `certs` - staging of replication certificates and hot reload
//! - `cluster` - the cluster description consumed by the generators
//! - `layout` - mount paths shared by every component
//! - `fs`, `procfs` - `/proc` scanning behind a testable filesystem trait

pub mod certs;
pub mod cluster;
pub mod config;
pub mod fs;
pub mod layout;
pub mod patroni;
pub mod procfs;
pub mod startup;
