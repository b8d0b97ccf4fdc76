//! Record filters: path exclusions, host exclusions, and our own traffic.
//!
//! A filtered request records its pair key so the matching response is
//! suppressed later; the pair either passes whole or is dropped whole.

use std::collections::HashSet;

use records::{Content, PairKey, Record};
use regex::Regex;

use crate::Collector;

// Marks for suppressed pairs are bounded; on overflow the set is cleared,
// which can at worst let an orphaned response of a long-filtered request
// through.
const MAX_MARKED: usize = 65_536;

#[derive(Default)]
struct PairMarks(HashSet<PairKey>);

impl PairMarks {
    fn mark(&mut self, key: PairKey) {
        if self.0.len() >= MAX_MARKED {
            tracing::warn!("filter mark set overflowed; clearing");
            self.0.clear();
        }
        self.0.insert(key);
    }

    fn take(&mut self, key: &PairKey) -> bool {
        self.0.remove(key)
    }
}

/// Drop requests whose URL path matches any exclusion, and their responses.
pub struct PathFilter {
    patterns: Vec<Regex>,
    marks: PairMarks,
    next: Box<dyn Collector>,
}

impl PathFilter {
    pub fn new(patterns: Vec<Regex>, next: Box<dyn Collector>) -> PathFilter {
        PathFilter {
            patterns,
            marks: PairMarks::default(),
            next,
        }
    }
}

impl Collector for PathFilter {
    fn process(&mut self, record: Record) -> anyhow::Result<()> {
        match &record.content {
            Content::Request(req) => {
                if self.patterns.iter().any(|p| p.is_match(&req.path)) {
                    self.marks.mark(req.pair_key());
                    return Ok(());
                }
            }
            Content::Response(resp) => {
                if self.marks.take(&resp.pair_key()) {
                    return Ok(());
                }
            }
            _ => {}
        }
        self.next.process(record)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.next.close()
    }
}

/// Identical shape to [`PathFilter`], keyed on the Host header.
pub struct HostFilter {
    patterns: Vec<Regex>,
    marks: PairMarks,
    next: Box<dyn Collector>,
}

impl HostFilter {
    pub fn new(patterns: Vec<Regex>, next: Box<dyn Collector>) -> HostFilter {
        HostFilter {
            patterns,
            marks: PairMarks::default(),
            next,
        }
    }
}

impl Collector for HostFilter {
    fn process(&mut self, record: Record) -> anyhow::Result<()> {
        match &record.content {
            Content::Request(req) => {
                if self.patterns.iter().any(|p| p.is_match(&req.host)) {
                    self.marks.mark(req.pair_key());
                    return Ok(());
                }
            }
            Content::Response(resp) => {
                if self.marks.take(&resp.pair_key()) {
                    return Ok(());
                }
            }
            _ => {}
        }
        self.next.process(record)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.next.close()
    }
}

// Headers our own uploader stamps on its requests.
const SELF_HEADERS: &[&str] = &["x-akita-cli-git-version", "x-akita-request-id"];
const DOGFOOD_HEADER: &str = "x-akita-dogfood";

/// Drop the agent's own backend traffic so observing a host that runs the
/// agent does not feed on itself. The dogfood header opts back in.
pub struct SelfTrafficFilter {
    marks: PairMarks,
    next: Box<dyn Collector>,
}

impl SelfTrafficFilter {
    pub fn new(next: Box<dyn Collector>) -> SelfTrafficFilter {
        SelfTrafficFilter {
            marks: PairMarks::default(),
            next,
        }
    }
}

impl Collector for SelfTrafficFilter {
    fn process(&mut self, record: Record) -> anyhow::Result<()> {
        match &record.content {
            Content::Request(req) => {
                let ours = SELF_HEADERS.iter().any(|h| req.headers.contains(h));
                let dogfood = req.headers.contains(DOGFOOD_HEADER);
                if ours && !dogfood {
                    self.marks.mark(req.pair_key());
                    return Ok(());
                }
            }
            Content::Response(resp) => {
                if self.marks.take(&resp.pair_key()) {
                    return Ok(());
                }
            }
            _ => {}
        }
        self.next.process(record)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.next.close()
    }
}
