//! Minimal `/proc` scanning used to find the postmaster.

use std::path::Path;

use tracing::trace;

use crate::fs::FileSystem;

/// Error type for parsing failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

/// The fields of `/proc/[pid]/stat` needed to identify a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: u32,
    pub comm: String,
    pub ppid: u32,
}

/// Parses `/proc/[pid]/stat` content.
///
/// The comm field may itself contain spaces and parentheses, so it spans
/// from the first `(` to the last `)`.
pub fn parse_proc_stat(content: &str) -> Result<ProcStat, ParseError> {
    let content = content.trim();

    let open_paren = content
        .find('(')
        .ok_or_else(|| ParseError::new("missing '(' in stat"))?;
    let close_paren = content
        .rfind(')')
        .ok_or_else(|| ParseError::new("missing ')' in stat"))?;

    if close_paren <= open_paren {
        return Err(ParseError::new("invalid parentheses in stat"));
    }

    let pid: u32 = content[..open_paren]
        .trim()
        .parse()
        .map_err(|_| ParseError::new("invalid pid"))?;
    let comm = content[open_paren + 1..close_paren].to_string();

    // state, then ppid
    let ppid = content[close_paren + 1..]
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| ParseError::new("missing field ppid"))?
        .parse()
        .map_err(|_| ParseError::new("invalid ppid"))?;

    Ok(ProcStat { pid, comm, ppid })
}

/// Returns every process under `proc_path` for which `select` holds.
///
/// Processes that exit or cannot be parsed while scanning are skipped.
pub fn find_processes<F, P>(fs: &F, proc_path: &Path, select: P) -> std::io::Result<Vec<ProcStat>>
where
    F: FileSystem,
    P: Fn(&ProcStat) -> bool,
{
    let mut found = Vec::new();
    for entry in fs.read_dir(proc_path)? {
        let Some(pid) = entry
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };

        let stat = match fs.read_to_string(&entry.join("stat")) {
            Ok(content) => content,
            Err(e) => {
                trace!("skipping pid {}: {}", pid, e);
                continue;
            }
        };
        match parse_proc_stat(&stat) {
            Ok(stat) if select(&stat) => found.push(stat),
            Ok(_) => {}
            Err(e) => trace!("skipping pid {}: {}", pid, e),
        }
    }
    found.sort_by_key(|s| s.pid);
    Ok(found)
}
