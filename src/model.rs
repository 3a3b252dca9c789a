use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the engine's instant type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Business hours ───────────────────────────────────────────────

/// Opening hours for one weekday, in the page's wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaySchedule {
    pub enabled: bool,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl DaySchedule {
    pub fn open(start: NaiveTime, end: NaiveTime) -> Self {
        Self { enabled: true, start, end }
    }

    pub fn closed() -> Self {
        Self {
            enabled: false,
            start: NaiveTime::MIN,
            end: NaiveTime::MIN,
        }
    }
}

/// Weekly schedule, indexed by `Weekday::num_days_from_monday`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    days: [DaySchedule; 7],
}

const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

impl BusinessHours {
    pub fn closed() -> Self {
        Self { days: [DaySchedule::closed(); 7] }
    }

    /// Monday to Friday open between `start` and `end`, weekend closed.
    pub fn weekdays(start: NaiveTime, end: NaiveTime) -> Self {
        let mut hours = Self::closed();
        for day in &WEEKDAYS[..5] {
            hours.set(*day, DaySchedule::open(start, end));
        }
        hours
    }

    pub fn get(&self, day: Weekday) -> &DaySchedule {
        &self.days[day.num_days_from_monday() as usize]
    }

    pub fn set(&mut self, day: Weekday, schedule: DaySchedule) {
        self.days[day.num_days_from_monday() as usize] = schedule;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Weekday, &DaySchedule)> {
        WEEKDAYS.iter().copied().zip(self.days.iter())
    }

    /// Parse the wire form: a JSON object keyed by lowercase weekday name,
    /// each value `{"enabled": bool, "start": "HH:MM", "end": "HH:MM"}`.
    /// Weekdays that are not mentioned are closed.
    pub fn from_json(text: &str) -> Result<Self, String> {
        #[derive(Deserialize)]
        struct RawDay {
            enabled: bool,
            #[serde(default)]
            start: Option<String>,
            #[serde(default)]
            end: Option<String>,
        }

        let raw: BTreeMap<String, RawDay> =
            serde_json::from_str(text).map_err(|e| format!("business_hours: {e}"))?;
        let mut hours = Self::closed();
        for (name, day) in raw {
            let weekday = parse_weekday(&name)
                .ok_or_else(|| format!("business_hours: unknown weekday '{name}'"))?;
            if !day.enabled {
                continue;
            }
            let start = parse_wall_clock(day.start.as_deref().unwrap_or_default())
                .ok_or_else(|| format!("business_hours: bad start time for {name}"))?;
            let end = parse_wall_clock(day.end.as_deref().unwrap_or_default())
                .ok_or_else(|| format!("business_hours: bad end time for {name}"))?;
            hours.set(weekday, DaySchedule::open(start, end));
        }
        Ok(hours)
    }
}

fn parse_weekday(name: &str) -> Option<Weekday> {
    match name.to_ascii_lowercase().as_str() {
        "monday" | "mon" => Some(Weekday::Mon),
        "tuesday" | "tue" => Some(Weekday::Tue),
        "wednesday" | "wed" => Some(Weekday::Wed),
        "thursday" | "thu" => Some(Weekday::Thu),
        "friday" | "fri" => Some(Weekday::Fri),
        "saturday" | "sat" => Some(Weekday::Sat),
        "sunday" | "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

/// Accepts `HH:MM` or `HH:MM:SS`.
pub fn parse_wall_clock(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

// ── Booking page ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingPageConfig {
    pub id: Ulid,
    /// Owning organisation; calendar integrations are registered per org.
    pub org_id: Ulid,
    pub slug: String,
    pub business_name: String,
    pub business_hours: BusinessHours,
    pub slot_duration_minutes: u32,
    pub buffer_time_minutes: u32,
    pub booking_notice_hours: u32,
    pub max_days_advance: u32,
    /// IANA timezone name, e.g. `America/New_York`.
    pub timezone: String,
    /// New bookings start `confirmed` instead of `pending`.
    pub auto_confirm: bool,
    pub is_active: bool,
}

impl BookingPageConfig {
    pub fn slot_duration_ms(&self) -> Ms {
        self.slot_duration_minutes as Ms * MINUTE_MS
    }

    pub fn buffer_ms(&self) -> Ms {
        self.buffer_time_minutes as Ms * MINUTE_MS
    }

    pub fn notice_ms(&self) -> Ms {
        self.booking_notice_hours as Ms * HOUR_MS
    }
}

// ── Availability values ──────────────────────────────────────────

/// Unavailable time reported by one busy source. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusyInterval {
    pub span: Span,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: Ms,
    pub end: Ms,
    pub is_available: bool,
}

impl Slot {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
}

impl BookingStatus {
    /// Only pending and confirmed bookings occupy time.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, Cancelled)
                | (Confirmed, Completed)
                | (Pending, NoShow)
                | (Confirmed, NoShow)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
            BookingStatus::NoShow => "no_show",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            "completed" => Ok(BookingStatus::Completed),
            "no_show" | "noshow" => Ok(BookingStatus::NoShow),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerInfo {
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub notes: Option<String>,
    /// Answers to the page's custom questions, in submission order.
    pub custom_fields: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub page_id: Ulid,
    pub customer: CustomerInfo,
    pub span: Span,
    pub status: BookingStatus,
    pub created_at: Ms,
    /// Id of the event created in the business's external calendar, if any.
    pub calendar_event_id: Option<String>,
}

/// Committed changes. Each variant carries whole records, no deltas.
/// This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PageCreated {
        config: BookingPageConfig,
    },
    PageUpdated {
        config: BookingPageConfig,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        page_id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    CalendarEventLinked {
        id: Ulid,
        page_id: Ulid,
        event_id: String,
    },
}

impl Event {
    pub fn page_id(&self) -> Ulid {
        match self {
            Event::PageCreated { config } | Event::PageUpdated { config } => config.id,
            Event::BookingCreated { booking } => booking.page_id,
            Event::BookingStatusChanged { page_id, .. }
            | Event::CalendarEventLinked { page_id, .. } => *page_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        assert!(a.overlaps(&Span::new(150, 250)));
        assert!(!a.overlaps(&Span::new(200, 300)));
        assert!(!a.overlaps(&Span::new(0, 100)));
    }

    #[test]
    fn status_transitions() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Completed));
        assert!(Confirmed.can_transition_to(NoShow));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Confirmed.can_transition_to(Pending));
        for terminal in [Cancelled, Completed, NoShow] {
            for next in [Pending, Confirmed, Cancelled, Completed, NoShow] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn status_parse() {
        assert_eq!("no_show".parse::<BookingStatus>(), Ok(BookingStatus::NoShow));
        assert_eq!("Canceled".parse::<BookingStatus>(), Ok(BookingStatus::Cancelled));
        assert!("draft".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn business_hours_from_json() {
        let json = r#"{
            "monday": {"enabled": true, "start": "09:00", "end": "17:00"},
            "saturday": {"enabled": true, "start": "10:00:00", "end": "14:30"},
            "sunday": {"enabled": false}
        }"#;
        let hours = BusinessHours::from_json(json).unwrap();
        assert_eq!(*hours.get(Weekday::Mon), DaySchedule::open(t(9, 0), t(17, 0)));
        assert_eq!(*hours.get(Weekday::Sat), DaySchedule::open(t(10, 0), t(14, 30)));
        assert!(!hours.get(Weekday::Sun).enabled);
        assert!(!hours.get(Weekday::Tue).enabled);
    }

    #[test]
    fn business_hours_rejects_unknown_day_and_bad_time() {
        assert!(BusinessHours::from_json(r#"{"funday": {"enabled": true}}"#).is_err());
        assert!(
            BusinessHours::from_json(r#"{"monday": {"enabled": true, "start": "9am", "end": "17:00"}}"#)
                .is_err()
        );
    }

    #[test]
    fn weekdays_helper_closes_weekend() {
        let hours = BusinessHours::weekdays(t(9, 0), t(17, 0));
        let open: Vec<_> = hours.iter().filter(|(_, d)| d.enabled).map(|(w, _)| w).collect();
        assert_eq!(
            open,
            vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri]
        );
    }
}
