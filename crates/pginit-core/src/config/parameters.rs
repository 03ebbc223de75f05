//! PostgreSQL server parameters.
//!
//! A [`ParameterSet`] is a case-insensitive map of parameter names to
//! values. [`Parameters`] pairs the values this engine requires with the
//! values it merely recommends. Callers combine them with user input in a
//! fixed order so that mandatory values always win:
//!
//! ```text
//! default  →  user input  →  mandatory  →  sanitize_parameters
//! ```

use std::collections::BTreeMap;
use std::fmt;

use crate::cluster::Cluster;
use crate::config::logdir::sanitize_log_directory;
use crate::layout;

/// Case-insensitive collection of PostgreSQL parameters.
///
/// Names are lowercased before storage and lookup; rendering is sorted by
/// name so the output does not depend on insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSet {
    values: BTreeMap<String, String>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets parameter `name` to `value`, replacing any previous value.
    pub fn add(&mut self, name: &str, value: impl Into<String>) {
        self.values.insert(name.to_lowercase(), value.into());
    }

    /// Returns the value of parameter `name`, if it is set.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Whether parameter `name` is set.
    pub fn has(&self, name: &str) -> bool {
        self.values.contains_key(&name.to_lowercase())
    }

    /// Returns the value of parameter `name`, or the empty string.
    pub fn value(&self, name: &str) -> &str {
        self.get(name).unwrap_or("")
    }

    /// Appends `values` to the comma-separated list in parameter `name`.
    ///
    /// Values are joined without quoting. Calling this with no values sets
    /// an absent parameter to the empty string and leaves a present one alone.
    pub fn append_to_list<I, S>(&mut self, name: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let addition = values
            .into_iter()
            .map(|v| v.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(",");

        let result = match self.get(name) {
            None => addition,
            Some(current) if addition.is_empty() => current.to_string(),
            Some(current) if current.is_empty() => addition,
            Some(current) => format!("{},{}", current, addition),
        };
        self.add(name, result);
    }

    /// Copies every value of `other` into this set, overriding on conflict.
    pub fn merge(&mut self, other: &ParameterSet) {
        for (name, value) in &other.values {
            self.values.insert(name.clone(), value.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterates over `(name, value)` pairs sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Renders `name = 'value'` lines sorted by name, single quotes doubled.
impl fmt::Display for ParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.values {
            writeln!(f, "{} = '{}'", name, value.replace('\'', "''"))?;
        }
        Ok(())
    }
}

/// Pairing of parameters this engine requires and those it recommends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parameters {
    /// Values that user configuration must never override.
    pub mandatory: ParameterSet,
    /// Values that user configuration may override.
    pub default: ParameterSet,
}

impl Parameters {
    /// Returns the parameters every instance needs.
    pub fn new() -> Self {
        let mut mandatory = ParameterSet::new();
        let mut default = ParameterSet::new();

        // Local connections go through the shared socket directory.
        mandatory.add("unix_socket_directories", layout::SOCKET_DIRECTORY);

        // Server certificates are always mounted; TLS is not optional.
        mandatory.add("ssl", "on");
        mandatory.add("ssl_cert_file", format!("{}/tls.crt", layout::CERT_MOUNT_PATH));
        mandatory.add("ssl_key_file", format!("{}/tls.key", layout::CERT_MOUNT_PATH));
        mandatory.add("ssl_ca_file", format!("{}/ca.crt", layout::CERT_MOUNT_PATH));

        default.add("wal_level", "logical");
        default.add("password_encryption", "scram-sha-256");
        default.add("jit", "off");
        default.add("huge_pages", "try");
        default.add("log_directory", "log");

        Self { mandatory, default }
    }

    /// Layers `user` between the defaults and the mandatory values, then
    /// sanitizes the result for `cluster`.
    pub fn layer(&self, cluster: &Cluster, user: &ParameterSet) -> ParameterSet {
        let mut result = self.default.clone();
        result.merge(user);
        result.merge(&self.mandatory);
        sanitize_parameters(cluster, &mut result);
        result
    }
}

/// Rewrites values that must be made safe after all layers are combined.
pub fn sanitize_parameters(cluster: &Cluster, parameters: &mut ParameterSet) {
    if let Some(directory) = parameters.get("log_directory") {
        let safe = sanitize_log_directory(cluster, directory);
        parameters.add("log_directory", safe);
    }
}
