//! Host-based authentication records for `pg_hba.conf`.
//!
//! PostgreSQL evaluates these records top to bottom and the first match
//! wins, so the order in which [`OrderedHBAs`] receives records is the
//! security precedence of the generated file. Callers append the
//! mandatory records of [`HBAs::new`] first.
//!
//! See <https://www.postgresql.org/docs/current/auth-pg-hba-conf.html>.

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use crate::layout::{REPLICATION_USER, SUPERUSER};

/// Directives that make PostgreSQL read rules from another file.
const INCLUDE_DIRECTIVES: &[&str] = &["include", "include_dir", "include_if_exists"];

/// A single `pg_hba.conf` record.
///
/// The builder methods consume and return the record, so a chain always
/// ends in an owned value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostBasedAuthentication {
    origin: String,
    database: String,
    user: String,
    address: String,
    method: String,
    options: String,
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn quote_list<I, S>(names: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|n| quote(n.as_ref()))
        .collect::<Vec<_>>()
        .join(",")
}

impl HostBasedAuthentication {
    /// Returns a record that matches all databases, networks, and users.
    pub fn new() -> Self {
        Self::default().all_databases().all_networks().all_users()
    }

    /// Matches connections to any database.
    pub fn all_databases(mut self) -> Self {
        self.database = "all".to_string();
        self
    }

    /// Matches connection attempts from any IP address.
    pub fn all_networks(mut self) -> Self {
        self.address = "all".to_string();
        self
    }

    /// Matches connections by any user.
    pub fn all_users(mut self) -> Self {
        self.user = "all".to_string();
        self
    }

    /// Matches connections to one database.
    pub fn database(mut self, name: &str) -> Self {
        self.database = quote(name);
        self
    }

    /// Matches connections to any of the named databases.
    pub fn databases<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.database = quote_list(names);
        self
    }

    /// Matches connection attempts over Unix-domain sockets.
    pub fn local(mut self) -> Self {
        self.origin = "local".to_string();
        self
    }

    /// Sets the authentication method used when the record matches.
    pub fn method(mut self, name: &str) -> Self {
        self.method = name.to_string();
        self
    }

    /// Matches connection attempts from a CIDR block.
    pub fn network(mut self, block: &str) -> Self {
        self.address = quote(block);
        self
    }

    /// Matches TCP/IP connection attempts without SSL.
    pub fn no_ssl(mut self) -> Self {
        self.origin = "hostnossl".to_string();
        self
    }

    /// Sets options for the authentication method, rendered sorted by name.
    pub fn options(mut self, opts: &BTreeMap<String, String>) -> Self {
        self.options = opts
            .iter()
            .map(|(k, v)| format!("{}={}", k, quote(v)))
            .collect::<Vec<_>>()
            .join(" ");
        self
    }

    /// Matches physical replication connections.
    pub fn replication(mut self) -> Self {
        self.database = "replication".to_string();
        self
    }

    /// Matches connections by members of a role.
    pub fn role(mut self, name: &str) -> Self {
        self.user = format!("+{}", quote(name));
        self
    }

    /// Matches connection attempts from any directly connected subnet.
    pub fn same_network(mut self) -> Self {
        self.address = "samenet".to_string();
        self
    }

    /// Matches TCP/IP connection attempts with TLS.
    pub fn tls(mut self) -> Self {
        self.origin = "hostssl".to_string();
        self
    }

    /// Matches TCP/IP connection attempts with or without TLS.
    pub fn tcp(mut self) -> Self {
        self.origin = "host".to_string();
        self
    }

    /// Matches connections by one user.
    pub fn user(mut self, name: &str) -> Self {
        self.user = quote(name);
        self
    }

    /// Matches connections by any of the named users.
    pub fn users<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.user = quote_list(names);
        self
    }
}

/// Formats the record for `pg_hba.conf` without a trailing newline.
impl fmt::Display for HostBasedAuthentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let line = if self.origin == "local" {
            format!(
                "local {} {} {} {}",
                self.database, self.user, self.method, self.options
            )
        } else {
            format!(
                "{} {} {} {} {} {}",
                self.origin, self.database, self.user, self.address, self.method, self.options
            )
        };
        f.write_str(line.trim())
    }
}

/// Records this engine requires and records it recommends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HBAs {
    pub mandatory: Vec<HostBasedAuthentication>,
    pub default: Vec<HostBasedAuthentication>,
}

impl HBAs {
    /// Returns the baseline records for every cluster.
    pub fn new() -> Self {
        let mandatory = vec![
            // The superuser always connects locally.
            HostBasedAuthentication::new().local().user(SUPERUSER).method("peer"),
            // Replication always uses TLS certificates. Patroni also
            // connects to "postgres" when calling pg_rewind.
            HostBasedAuthentication::new()
                .tls()
                .user(REPLICATION_USER)
                .method("cert")
                .replication(),
            HostBasedAuthentication::new()
                .tls()
                .user(REPLICATION_USER)
                .method("cert")
                .database("postgres"),
            // Anything else from the replication user is rejected before
            // user rules get a chance to match.
            HostBasedAuthentication::new()
                .tcp()
                .user(REPLICATION_USER)
                .method("reject"),
        ];

        // "md5" verifies passwords stored as either MD5 or SCRAM-SHA-256.
        let default = vec![HostBasedAuthentication::new().tls().method("md5")];

        Self { mandatory, default }
    }
}

impl Default for HBAs {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered `pg_hba.conf` lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderedHBAs {
    records: Vec<String>,
}

impl OrderedHBAs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends structured records in order, skipping `None`.
    pub fn append<'a, I, R>(&mut self, records: I)
    where
        I: IntoIterator<Item = R>,
        R: Into<Option<&'a HostBasedAuthentication>>,
    {
        for record in records {
            let record: Option<&HostBasedAuthentication> = record.into();
            if let Some(record) = record {
                self.records.push(record.to_string());
            }
        }
    }

    /// Appends raw lines in order.
    ///
    /// Every input is split on `\n` and `\r` first, so each physical line
    /// of the rendered file is checked on its own. Each line is trimmed of
    /// control characters, whitespace, and backslashes on both ends. Empty
    /// lines and lines that would include another file are dropped.
    pub fn append_unstructured<I, S>(&mut self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for input in lines {
            for line in input.as_ref().split(['\n', '\r']) {
                let line =
                    line.trim_matches(|c: char| c.is_control() || c.is_whitespace() || c == '\\');
                if line.is_empty() {
                    continue;
                }
                if is_include_directive(line) {
                    debug!("dropping pg_hba include directive: {}", line);
                    continue;
                }
                self.records.push(line.to_string());
            }
        }
    }

    pub fn as_strings(&self) -> &[String] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// One line per record, each followed by a newline.
impl fmt::Display for OrderedHBAs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for record in &self.records {
            writeln!(f, "{}", record)?;
        }
        Ok(())
    }
}

fn is_include_directive(line: &str) -> bool {
    let keyword = line.split_whitespace().next().unwrap_or("");
    INCLUDE_DIRECTIVES
        .iter()
        .any(|d| keyword.eq_ignore_ascii_case(d))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_omits_address() {
        let hba = HostBasedAuthentication::new()
            .local()
            .user("postgres")
            .method("peer");
        assert_eq!(hba.to_string(), r#"local all "postgres" peer"#);
        assert_eq!(hba.to_string().split(' ').count(), 4);
    }

    #[test]
    fn test_non_local_has_six_fields() {
        let mut opts = BTreeMap::new();
        opts.insert("clientcert".to_string(), "verify-full".to_string());

        for hba in [
            HostBasedAuthentication::new().tcp().method("md5").options(&opts),
            HostBasedAuthentication::new().tls().method("cert").options(&opts),
            HostBasedAuthentication::new().no_ssl().method("reject").options(&opts),
        ] {
            let line = hba.to_string();
            assert_eq!(line.split(' ').count(), 6, "line {:?}", line);
        }
    }

    #[test]
    fn test_identifiers_are_quoted() {
        let hba = HostBasedAuthentication::new()
            .tcp()
            .database("we\"ird")
            .user("app")
            .network("10.0.0.0/8")
            .method("scram-sha-256");
        assert_eq!(
            hba.to_string(),
            r#"host "we""ird" "app" "10.0.0.0/8" scram-sha-256"#
        );
    }

    #[test]
    fn test_lists_and_roles() {
        let hba = HostBasedAuthentication::new()
            .tls()
            .databases(["a", "b"])
            .users(["x", "y\""])
            .same_network()
            .method("md5");
        assert_eq!(hba.to_string(), r#"hostssl "a","b" "x","y""" samenet md5"#);

        let hba = HostBasedAuthentication::new().tls().role("admins").method("md5");
        assert_eq!(hba.to_string(), r#"hostssl all +"admins" all md5"#);
    }

    #[test]
    fn test_options_are_sorted() {
        let mut opts = BTreeMap::new();
        opts.insert("map".to_string(), "m".to_string());
        opts.insert("clientcert".to_string(), "verify-ca".to_string());

        let hba = HostBasedAuthentication::new().tls().method("cert").options(&opts);
        assert_eq!(
            hba.to_string(),
            r#"hostssl all all all cert clientcert="verify-ca" map="m""#
        );
    }

    #[test]
    fn test_new_hbas() {
        let hbas = HBAs::new();
        let mandatory: Vec<String> = hbas.mandatory.iter().map(|h| h.to_string()).collect();
        assert_eq!(
            mandatory,
            vec![
                r#"local all "postgres" peer"#,
                r#"hostssl replication "_crunchyrepl" all cert"#,
                r#"hostssl "postgres" "_crunchyrepl" all cert"#,
                r#"host all "_crunchyrepl" all reject"#,
            ]
        );
        assert_eq!(hbas.default.len(), 1);
        assert_eq!(hbas.default[0].to_string(), "hostssl all all all md5");
    }

    #[test]
    fn test_append_skips_none() {
        let hba = HostBasedAuthentication::new().tcp().method("trust");
        let mut ordered = OrderedHBAs::new();
        ordered.append([None, Some(&hba), None]);
        ordered.append([&hba]);
        assert_eq!(ordered.len(), 2);
    }

    #[test]
    fn test_order_is_shared_between_structured_and_raw() {
        let hbas = HBAs::new();
        let mut ordered = OrderedHBAs::new();
        ordered.append(&hbas.mandatory);
        ordered.append_unstructured(["host all app 10.0.0.0/8 scram-sha-256"]);
        ordered.append(&hbas.default);

        let lines = ordered.as_strings();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], r#"local all "postgres" peer"#);
        assert_eq!(lines[4], "host all app 10.0.0.0/8 scram-sha-256");
        assert_eq!(lines[5], "hostssl all all all md5");
        assert!(ordered.to_string().ends_with("md5\n"));
    }

    #[test]
    fn test_include_directives_are_dropped() {
        let mut ordered = OrderedHBAs::new();
        ordered.append_unstructured([
            "include \"/etc/passwd\"",
            "ok",
            "  INCLUDE_DIR /etc",
            "include_if_exists x",
            "\tinclude\t/etc/shadow",
        ]);
        assert_eq!(ordered.as_strings(), &["ok".to_string()]);
    }

    #[test]
    fn test_include_directives_after_line_breaks_are_dropped() {
        let mut ordered = OrderedHBAs::new();
        ordered.append_unstructured([
            "hostssl all app all md5\r\ninclude_dir /etc",
            "host all all all md5\ninclude \"/etc/passwd\"",
            "host all b all md5\rinclude_if_exists /x\r",
            "host all c all md5 \\\ninclude /etc/hba",
        ]);

        assert_eq!(
            ordered.as_strings(),
            &[
                "hostssl all app all md5".to_string(),
                "host all all all md5".to_string(),
                "host all b all md5".to_string(),
                "host all c all md5".to_string(),
            ]
        );
        let rendered = ordered.to_string();
        assert!(
            rendered
                .split(['\n', '\r'])
                .all(|line| !line.trim_start().to_lowercase().starts_with("include"))
        );
    }

    #[test]
    fn test_multi_line_input_keeps_every_record() {
        let mut ordered = OrderedHBAs::new();
        ordered.append_unstructured(["host all a all md5\n\n  host all b all md5  \r\n"]);
        assert_eq!(ordered.len(), 2);
        assert_eq!(ordered.to_string(), "host all a all md5\nhost all b all md5\n");
    }

    #[test]
    fn test_unstructured_trims_control_space_and_backslash() {
        let mut ordered = OrderedHBAs::new();
        ordered.append_unstructured(["  \\\\ \u{c}", "", "\n\t", "\\ host all all all md5 \\\n"]);
        assert_eq!(ordered.as_strings(), &["host all all all md5".to_string()]);
    }

    #[test]
    fn test_include_as_quoted_identifier_is_kept() {
        let mut ordered = OrderedHBAs::new();
        ordered.append_unstructured(["local \"include\" all peer"]);
        assert_eq!(ordered.len(), 1);
    }
}
