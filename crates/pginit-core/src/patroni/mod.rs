//! Patroni dynamic configuration.
//!
//! Patroni distributes server parameters and `pg_hba.conf` records to every
//! member through its dynamic configuration. This module layers the values
//! this engine requires around whatever the user supplied and produces the
//! final document, plus the same values in file form for direct rendering.

pub mod dynamic;

use serde_json::{Map, Value, json};

use crate::cluster::Cluster;
use crate::config::{HBAs, OrderedHBAs, ParameterSet, Parameters};
use crate::layout;

/// Seconds a leader key lives without renewal, unless the user set one.
const DEFAULT_TTL: u64 = 30;

/// Seconds between Patroni's high-availability loops, unless the user set one.
const DEFAULT_LOOP_WAIT: u64 = 10;

/// Final parameters and HBA records of one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceConfig {
    pub parameters: ParameterSet,
    pub hbas: OrderedHBAs,
}

/// Combines the baseline with everything the user configured.
///
/// Parameters: defaults, then `postgresql.parameters` from the user's
/// Patroni configuration, then the cluster's parameter overrides, then the
/// mandatory values. HBA records: mandatory first, then the user's
/// `postgresql.pg_hba` strings, then the cluster's HBA lines. The default
/// records are used only when no user record survives filtering.
pub fn instance_configuration(
    cluster: &Cluster,
    hbas: &HBAs,
    parameters: &Parameters,
) -> InstanceConfig {
    let user = cluster.patroni.as_ref().unwrap_or(&Value::Null);

    let mut parameters = parameters.clone();
    if cluster.has_encryption_key_command()
        && let Some(command) = cluster.encryption_key_command.as_deref()
    {
        parameters.mandatory.add("encryption_key_command", command);
    }

    let mut requested = ParameterSet::new();
    if let Some(section) = dynamic::object_at(user, &["postgresql", "parameters"]) {
        for (name, value) in section {
            if let Some(value) = dynamic::scalar_string(value) {
                requested.add(name, value);
            }
        }
    }
    for (name, value) in &cluster.parameters {
        if let Some(value) = dynamic::scalar_string(value) {
            requested.add(name, value);
        }
    }

    let mut ordered = OrderedHBAs::new();
    ordered.append(&hbas.mandatory);
    let mandatory = ordered.len();

    // Entries that are not strings are skipped.
    if let Some(section) = dynamic::list_at(user, &["postgresql", "pg_hba"]) {
        ordered.append_unstructured(section.iter().filter_map(Value::as_str));
    }
    ordered.append_unstructured(&cluster.hba);

    if ordered.len() == mandatory {
        ordered.append(&hbas.default);
    }

    InstanceConfig {
        parameters: parameters.layer(cluster, &requested),
        hbas: ordered,
    }
}

/// Returns the Patroni dynamic configuration for `cluster`.
pub fn dynamic_configuration(cluster: &Cluster, hbas: &HBAs, parameters: &Parameters) -> Value {
    let user = cluster.patroni.as_ref().unwrap_or(&Value::Null);
    let config = instance_configuration(cluster, hbas, parameters);

    let mut root: Map<String, Value> = dynamic::object(user).cloned().unwrap_or_default();
    if dynamic::u64_at(user, &["ttl"]).is_none() {
        root.insert("ttl".to_string(), json!(DEFAULT_TTL));
    }
    if dynamic::u64_at(user, &["loop_wait"]).is_none() {
        root.insert("loop_wait".to_string(), json!(DEFAULT_LOOP_WAIT));
    }

    let mut postgresql: Map<String, Value> = dynamic::object_at(user, &["postgresql"])
        .cloned()
        .unwrap_or_default();

    let rendered: Map<String, Value> = config
        .parameters
        .iter()
        .map(|(name, value)| (name.to_string(), Value::String(value.to_string())))
        .collect();
    postgresql.insert("parameters".to_string(), Value::Object(rendered));
    postgresql.insert("pg_hba".to_string(), json!(config.hbas.as_strings()));

    // pg_rewind brings a former primary back into the cluster; slots are
    // managed by the operator rather than by Patroni.
    postgresql.insert("use_pg_rewind".to_string(), json!(true));
    postgresql.insert("use_slots".to_string(), json!(false));

    if cluster.has_encryption_key_command() {
        let mut bin_name = dynamic::object_at(user, &["postgresql", "bin_name"])
            .cloned()
            .unwrap_or_default();
        bin_name.insert("pg_rewind".to_string(), json!(layout::TDE_REWIND_WRAPPER));
        postgresql.insert("bin_name".to_string(), Value::Object(bin_name));
    }

    root.insert("postgresql".to_string(), Value::Object(postgresql));
    Value::Object(root)
}
