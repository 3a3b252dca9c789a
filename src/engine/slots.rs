use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::model::*;

use super::EngineError;

// ── Slot Generator ───────────────────────────────────────────────

/// Candidate slots for one calendar day of a page.
///
/// Walks business hours in steps of `duration + buffer`, never emitting a
/// slot that would run past closing. A slot is unavailable if it overlaps
/// any busy interval or starts before `now + booking_notice`.
/// Pure: identical inputs give identical output.
pub fn generate_slots(
    config: &BookingPageConfig,
    date: NaiveDate,
    busy: &[BusyInterval],
    now: Ms,
) -> Result<Vec<Slot>, EngineError> {
    let tz = page_timezone(config)?;
    let Some(window) = day_window(config, &tz, date) else {
        return Ok(Vec::new());
    };
    let duration = config.slot_duration_ms();
    if duration <= 0 {
        return Err(EngineError::Validation("slot duration must be positive".into()));
    }
    let step = duration + config.buffer_ms();

    let mut spans: Vec<Span> = busy.iter().map(|b| b.span).collect();
    spans.sort_by_key(|s| s.start);
    let blocked = merge_overlapping(&spans);

    // Both "already started" and "inside the notice period" collapse into this.
    let earliest_start = now.max(now + config.notice_ms());

    let mut slots = Vec::new();
    let mut next_busy = 0;
    let mut cursor = window.start;
    while cursor + duration <= window.end {
        let span = Span::new(cursor, cursor + duration);
        while next_busy < blocked.len() && blocked[next_busy].end <= span.start {
            next_busy += 1;
        }
        let overlaps_busy = blocked.get(next_busy).is_some_and(|b| b.overlaps(&span));
        slots.push(Slot {
            start: span.start,
            end: span.end,
            is_available: !overlaps_busy && span.start >= earliest_start,
        });
        cursor += step;
    }
    Ok(slots)
}

/// Opening `[start, end)` of `date` in absolute time, or `None` when the
/// weekday is disabled or its hours are empty or inverted.
pub fn day_window(config: &BookingPageConfig, tz: &Tz, date: NaiveDate) -> Option<Span> {
    let schedule = config.business_hours.get(date.weekday());
    if !schedule.enabled {
        return None;
    }
    let start = resolve_local(tz, date, schedule.start)?;
    let end = resolve_local(tz, date, schedule.end)?;
    (start < end).then(|| Span::new(start, end))
}

/// `true` if `span` is exactly one slot of the page's grid: it starts on
/// the opening plus a whole number of `duration + buffer` steps, lasts one
/// slot and closes no later than the day's closing time.
pub fn is_grid_slot(config: &BookingPageConfig, tz: &Tz, span: &Span) -> bool {
    let Some(window) = local_date(tz, span.start).and_then(|d| day_window(config, tz, d)) else {
        return false;
    };
    let duration = config.slot_duration_ms();
    let step = duration + config.buffer_ms();
    let offset = span.start - window.start;
    duration > 0
        && span.duration_ms() == duration
        && offset >= 0
        && offset % step == 0
        && span.end <= window.end
}

/// Wall-clock time on `date` in `tz` as Unix ms. An ambiguous time (clocks
/// going back) takes the earlier instant; a time inside a DST gap moves
/// forward to the first instant that exists.
fn resolve_local(tz: &Tz, date: NaiveDate, time: NaiveTime) -> Option<Ms> {
    let mut local = date.and_time(time);
    for _ in 0..=180 {
        if let Some(dt) = tz.from_local_datetime(&local).earliest() {
            return Some(dt.timestamp_millis());
        }
        local += chrono::Duration::minutes(1);
    }
    None
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

// ── Calendar helpers ─────────────────────────────────────────────

pub fn page_timezone(config: &BookingPageConfig) -> Result<Tz, EngineError> {
    config
        .timezone
        .parse::<Tz>()
        .map_err(|_| EngineError::Validation(format!("unknown timezone: {}", config.timezone)))
}

/// Calendar date of an instant in `tz`.
pub fn local_date(tz: &Tz, at: Ms) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp_millis(at).map(|dt| dt.with_timezone(tz).date_naive())
}

/// Every calendar date (in `tz`) that `span` touches. A booking that crosses
/// midnight affects both days' slot lists.
pub fn dates_touched(tz: &Tz, span: &Span) -> Vec<NaiveDate> {
    let (Some(first), Some(last)) = (local_date(tz, span.start), local_date(tz, span.end - 1))
    else {
        return Vec::new();
    };
    first.iter_days().take_while(|d| *d <= last).collect()
}

/// `true` if `date` lies in `[today, today + max_days_advance]` for the page.
pub fn within_booking_horizon(config: &BookingPageConfig, tz: &Tz, date: NaiveDate, now: Ms) -> bool {
    let Some(today) = local_date(tz, now) else {
        return false;
    };
    let last = today
        .checked_add_days(Days::new(config.max_days_advance as u64))
        .unwrap_or(NaiveDate::MAX);
    today <= date && date <= last
}

/// ISO-8601 rendering of an instant with the page's UTC offset.
pub fn format_instant(at: Ms, tz: &Tz) -> String {
    match DateTime::<Utc>::from_timestamp_millis(at) {
        Some(dt) => dt.with_timezone(tz).to_rfc3339(),
        None => at.to_string(),
    }
}
