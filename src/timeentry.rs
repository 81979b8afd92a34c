//! Scheduled re-check times for a source directory.
//!
//! Five cron fields (minute, hour, day of month, month, day of week) with
//! `*`, lists, ranges and steps, stored as bitmasks inside the mapped
//! directory entry. Evaluation walks forward minute by minute; schedules
//! this system deals in fire at least daily, so the walk is short, and a
//! one-year bound guards against impossible entries (Feb 30).

use chrono::{DateTime, Datelike, Duration, Local, TimeZone, Timelike};

use crate::error::FetchError;
use crate::table::fra::TimeEntryRaw;

// days are 1-based; bit 0 stays clear
const DOM_ALL: u32 = ((1u64 << 32) - 2) as u32;
const DOW_ALL: u8 = (1 << 7) - 1;

/// Upper bound for the forward scan, in minutes (one leap year).
const SCAN_LIMIT_MINUTES: i64 = 366 * 24 * 60;

/// Parse one `"M H DoM Mon DoW"` expression into a mask entry.
pub fn parse(expr: &str) -> anyhow::Result<TimeEntryRaw> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(FetchError::Incorrect(format!(
            "time entry '{}' must have 5 fields",
            expr
        ))
        .into());
    }
    let entry = TimeEntryRaw {
        minute: field_mask(fields[0], 0, 59)?,
        hour: field_mask(fields[1], 0, 23)? as u32,
        day_of_month: field_mask(fields[2], 1, 31)? as u32,
        month: field_mask(fields[3], 1, 12)? as u16,
        day_of_week: field_mask(fields[4], 0, 6)? as u8,
        in_use: 1,
    };
    Ok(entry)
}

fn field_mask(spec: &str, lo: u32, hi: u32) -> anyhow::Result<u64> {
    let mut mask: u64 = 0;
    for part in spec.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().map_err(|_| {
                    FetchError::Incorrect(format!("bad step in time field '{}'", spec))
                })?;
                if step == 0 {
                    return Err(
                        FetchError::Incorrect(format!("zero step in '{}'", spec)).into()
                    );
                }
                (r, step)
            }
            None => (part, 1),
        };
        let (start, end) = if range == "*" {
            (lo, hi)
        } else if let Some((a, b)) = range.split_once('-') {
            let a: u32 = a.parse().map_err(|_| {
                FetchError::Incorrect(format!("bad range in time field '{}'", spec))
            })?;
            let b: u32 = b.parse().map_err(|_| {
                FetchError::Incorrect(format!("bad range in time field '{}'", spec))
            })?;
            (a, b)
        } else {
            let v: u32 = range.parse().map_err(|_| {
                FetchError::Incorrect(format!("bad value in time field '{}'", spec))
            })?;
            (v, v)
        };
        if start < lo || end > hi || start > end {
            return Err(FetchError::Incorrect(format!(
                "time field '{}' outside {}..={}",
                spec, lo, hi
            ))
            .into());
        }
        let mut v = start;
        while v <= end {
            mask |= 1u64 << v;
            v += step;
        }
    }
    Ok(mask)
}

fn dom_restricted(e: &TimeEntryRaw) -> bool {
    e.day_of_month != DOM_ALL
}

fn dow_restricted(e: &TimeEntryRaw) -> bool {
    e.day_of_week != DOW_ALL
}

fn entry_matches(e: &TimeEntryRaw, t: DateTime<Local>) -> bool {
    if e.in_use == 0 {
        return false;
    }
    if e.minute & (1u64 << t.minute()) == 0 {
        return false;
    }
    if e.hour & (1u32 << t.hour()) == 0 {
        return false;
    }
    if e.month & (1u16 << t.month()) == 0 {
        return false;
    }
    let dom_hit = e.day_of_month & (1u32 << t.day()) != 0;
    let dow_hit = e.day_of_week & (1u8 << t.weekday().num_days_from_sunday()) != 0;
    // classic cron day rule: with both day fields restricted, either side
    // firing is enough
    if dom_restricted(e) && dow_restricted(e) { dom_hit || dow_hit } else { dom_hit && dow_hit }
}

/// Earliest firing strictly after `after` across all in-use entries.
pub fn next_fire(entries: &[TimeEntryRaw], after: DateTime<Local>) -> Option<DateTime<Local>> {
    if !entries.iter().any(|e| e.in_use != 0) {
        return None;
    }
    let mut t = (after + Duration::minutes(1))
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(after);
    for _ in 0..SCAN_LIMIT_MINUTES {
        if entries.iter().any(|e| entry_matches(e, t)) {
            return Some(t);
        }
        t += Duration::minutes(1);
    }
    None
}

/// Convenience: next firing as a unix timestamp, for the mapped
/// `next_check_time` field.
pub fn next_fire_unix(entries: &[TimeEntryRaw], after_unix: i64) -> Option<i64> {
    let after = Local.timestamp_opt(after_unix, 0).single()?;
    next_fire(entries, after).map(|t| t.timestamp())
}
