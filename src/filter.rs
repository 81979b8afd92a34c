//! File-name selection: an ordered list of mask groups applied to every
//! listed name.
//!
//! Filter text format (as stored in the directory entry): one group per
//! line, masks within a group separated by commas, `!` prefix marks a
//! reject mask. A name is accepted when any group resolves to `Match`;
//! within a group the first decisive mask wins and a non-matching mask
//! falls through to the next one. Masks may carry strftime-style tokens
//! expanded against "now" before matching.

use chrono::{DateTime, Datelike, Local, Timelike};

/// Simple glob-style matcher supporting '*' and '?'. Not full-featured but
/// sufficient for our use (matching file names against masks).
pub fn wildcard_match(pat: &str, text: &str) -> bool {
    let p: Vec<char> = pat.chars().collect();
    let t: Vec<char> = text.chars().collect();
    fn helper(p: &[char], t: &[char]) -> bool {
        if p.is_empty() {
            return t.is_empty();
        }
        if p[0] == '*' {
            if helper(&p[1..], t) {
                return true;
            }
            if !t.is_empty() && helper(p, &t[1..]) {
                return true;
            }
            return false;
        } else if !t.is_empty() && (p[0] == '?' || p[0] == t[0]) {
            return helper(&p[1..], &t[1..]);
        }
        false
    }
    helper(&p, &t)
}

/// Outcome of one mask against one name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaskResult {
    Match,
    /// Decisive no: short-circuits the group, not the whole filter.
    Reject,
    /// Undecided, fall through to the next mask.
    Miss,
}

#[derive(Clone, Debug)]
struct Mask {
    pattern: String,
    negate: bool,
    timed: bool,
}

impl Mask {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let (negate, pattern) = match raw.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        if pattern.is_empty() {
            return None;
        }
        Some(Self { pattern: pattern.to_string(), negate, timed: pattern.contains('%') })
    }

    fn apply(&self, name: &str, now: DateTime<Local>) -> MaskResult {
        let expanded;
        let pattern = if self.timed {
            expanded = expand_time_tokens(&self.pattern, now);
            expanded.as_str()
        } else {
            self.pattern.as_str()
        };
        if wildcard_match(pattern, name) {
            if self.negate { MaskResult::Reject } else { MaskResult::Match }
        } else {
            MaskResult::Miss
        }
    }
}

#[derive(Clone, Debug, Default)]
struct MaskGroup {
    masks: Vec<Mask>,
}

impl MaskGroup {
    fn apply(&self, name: &str, now: DateTime<Local>) -> MaskResult {
        for mask in &self.masks {
            match mask.apply(name, now) {
                MaskResult::Miss => continue,
                decisive => return decisive,
            }
        }
        MaskResult::Miss
    }
}

/// Parsed filter for one directory.
#[derive(Clone, Debug, Default)]
pub struct FileFilter {
    groups: Vec<MaskGroup>,
}

impl FileFilter {
    pub fn parse(text: &str) -> Self {
        let mut groups = Vec::new();
        for line in text.lines() {
            let masks: Vec<Mask> = line.split(',').filter_map(Mask::parse).collect();
            if !masks.is_empty() {
                groups.push(MaskGroup { masks });
            }
        }
        Self { groups }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Whether `name` passes the filter at the given wallclock instant.
    pub fn accepts(&self, name: &str, now: DateTime<Local>) -> bool {
        self.groups.iter().any(|g| g.apply(name, now) == MaskResult::Match)
    }

    pub fn accepts_now(&self, name: &str) -> bool {
        self.accepts(name, Local::now())
    }
}

/// Expand the supported strftime tokens against `now`. Unknown tokens are
/// kept verbatim so a stray '%' in a file mask still matches literally.
fn expand_time_tokens(pattern: &str, now: DateTime<Local>) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('Y') => {
                chars.next();
                out.push_str(&format!("{:04}", now.year()));
            }
            Some('y') => {
                chars.next();
                out.push_str(&format!("{:02}", now.year() % 100));
            }
            Some('m') => {
                chars.next();
                out.push_str(&format!("{:02}", now.month()));
            }
            Some('d') => {
                chars.next();
                out.push_str(&format!("{:02}", now.day()));
            }
            Some('H') => {
                chars.next();
                out.push_str(&format!("{:02}", now.hour()));
            }
            Some('M') => {
                chars.next();
                out.push_str(&format!("{:02}", now.minute()));
            }
            Some('S') => {
                chars.next();
                out.push_str(&format!("{:02}", now.second()));
            }
            Some('j') => {
                chars.next();
                out.push_str(&format!("{:03}", now.ordinal()));
            }
            Some('%') => {
                chars.next();
                out.push('%');
            }
            _ => out.push('%'),
        }
    }
    out
}
