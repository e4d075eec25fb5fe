//! Journal segment filename grammar.
//!
//! `<timestamp>.<pid>.log{,.working}` and `<timestamp>.<pid>.snapshot{,.working}`,
//! each optionally suffixed with `.obsolete` or `.defunct` once superseded by
//! a later snapshot. Parsing is done with a `regex`, the same structured
//! filename/id parsing style used for worker task IDs elsewhere.

use std::path::PathBuf;

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref SEGMENT_RE: Regex = Regex::new(
        r"^(?P<ts>\d+)\.(?P<pid>\d+)\.(?P<kind>log|snapshot)(?P<working>\.working)?(?P<state>\.obsolete|\.defunct)?$"
    ).expect("static segment regex");
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Kind {
    Log,
    Snapshot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Obsolete,
    Defunct,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentName {
    pub ts: u64,
    pub pid: u32,
    pub kind: Kind,
    pub working: bool,
    pub state: Option<State>,
}

impl SegmentName {
    pub fn new(ts: u64, pid: u32, kind: Kind) -> Self {
        Self { ts, pid, kind, working: false, state: None }
    }

    pub fn working(mut self, working: bool) -> Self {
        self.working = working;
        self
    }

    pub fn parse(name: &str) -> Option<Self> {
        let caps = SEGMENT_RE.captures(name)?;
        let ts = caps.name("ts")?.as_str().parse().ok()?;
        let pid = caps.name("pid")?.as_str().parse().ok()?;
        let kind = match caps.name("kind")?.as_str() {
            "log" => Kind::Log,
            "snapshot" => Kind::Snapshot,
            _ => return None,
        };
        let working = caps.name("working").is_some();
        let state = caps.name("state").map(|m| match m.as_str() {
            ".obsolete" => State::Obsolete,
            ".defunct" => State::Defunct,
            _ => unreachable!(),
        });
        Some(Self { ts, pid, kind, working, state })
    }

    /// This segment's filename, in whatever (working/state) condition it
    /// currently records.
    pub fn file_name(&self) -> String {
        let kind = match self.kind {
            Kind::Log => "log",
            Kind::Snapshot => "snapshot",
        };
        let working = if self.working { ".working" } else { "" };
        let state = match self.state {
            Some(State::Obsolete) => ".obsolete",
            Some(State::Defunct) => ".defunct",
            None => "",
        };
        format!("{}.{}.{}{}{}", self.ts, self.pid, kind, working, state)
    }

    pub fn path_in(&self, dir: &std::path::Path) -> PathBuf {
        dir.join(self.file_name())
    }

    /// Is this a live (not yet superseded) segment?
    pub fn is_live(&self) -> bool {
        self.state.is_none()
    }
}

/// List every parseable segment name found directly in `dir`.
pub fn list(fs: &dyn crate::fs::Fs, dir: &std::path::Path) -> std::io::Result<Vec<SegmentName>> {
    let mut out = Vec::new();
    for name in fs.read_dir(dir)? {
        if let Some(seg) = SegmentName::parse(&name) {
            out.push(seg);
        }
    }
    Ok(out)
}
