//! Job-file command grammar.
//!
//! One command per line:
//!
//! ```text
//! WRITE [(key,value)(key2,value2)]
//! READ [key,key2]
//! DELETE [key,key2]
//! SHOW
//! WAIT <delay_ms>
//! BACKUP
//! HELP
//! ```
//!
//! Blank lines are ignored; anything else parses to [`Command::Invalid`] and
//! the job worker logs it and moves on.

use crate::ops::MAX_BATCH;
use crate::wire::{MAX_KEY, MAX_VAL};

/// One parsed job command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Upsert a batch of pairs.
    Write(Vec<(String, String)>),
    /// Look up a batch of keys.
    Read(Vec<String>),
    /// Remove a batch of keys.
    Delete(Vec<String>),
    /// List the whole table.
    Show,
    /// Sleep the worker for the given number of milliseconds.
    Wait(u64),
    /// Snapshot the table to the job's next numbered backup file.
    Backup,
    /// Print the usage block to the job output.
    Help,
    /// A blank line.
    Empty,
    /// Anything that did not parse.
    Invalid,
}

/// Parses one line of a job file.
pub fn parse_line(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    if let Some(rest) = line.strip_prefix("WRITE") {
        return parse_pairs(rest.trim()).map_or(Command::Invalid, Command::Write);
    }
    if let Some(rest) = line.strip_prefix("READ") {
        return parse_keys(rest.trim()).map_or(Command::Invalid, Command::Read);
    }
    if let Some(rest) = line.strip_prefix("DELETE") {
        return parse_keys(rest.trim()).map_or(Command::Invalid, Command::Delete);
    }
    if let Some(rest) = line.strip_prefix("WAIT") {
        return rest.trim().parse().map_or(Command::Invalid, Command::Wait);
    }
    match line {
        "SHOW" => Command::Show,
        "BACKUP" => Command::Backup,
        "HELP" => Command::Help,
        _ => Command::Invalid,
    }
}

fn valid_key(key: &str) -> bool {
    !key.is_empty() && key.len() <= MAX_KEY
}

fn valid_value(value: &str) -> bool {
    !value.is_empty() && value.len() <= MAX_VAL
}

fn bracket_body(list: &str) -> Option<&str> {
    list.strip_prefix('[')?.strip_suffix(']')
}

/// `[(k,v)(k2,v2)]` — adjacent parenthesized pairs, no separator between
/// groups.
fn parse_pairs(list: &str) -> Option<Vec<(String, String)>> {
    let mut body = bracket_body(list)?;
    let mut pairs = Vec::new();
    while !body.is_empty() {
        let rest = body.strip_prefix('(')?;
        let (group, tail) = rest.split_once(')')?;
        let (key, value) = group.split_once(',')?;
        let (key, value) = (key.trim(), value.trim());
        if !valid_key(key) || !valid_value(value) {
            return None;
        }
        pairs.push((key.to_string(), value.to_string()));
        body = tail;
    }
    if pairs.is_empty() || pairs.len() > MAX_BATCH {
        return None;
    }
    Some(pairs)
}

/// `[k,k2,k3]` — comma-separated keys.
fn parse_keys(list: &str) -> Option<Vec<String>> {
    let body = bracket_body(list)?;
    let mut keys = Vec::new();
    for key in body.split(',') {
        let key = key.trim();
        if !valid_key(key) {
            return None;
        }
        keys.push(key.to_string());
    }
    if keys.is_empty() || keys.len() > MAX_BATCH {
        return None;
    }
    Some(keys)
}
