use ulid::Ulid;

use crate::model::*;

/// Everything the engine knows about one booking page. Lives behind a
/// per-page `RwLock`; the write lock is the page's commit boundary.
#[derive(Debug, Clone)]
pub struct PageState {
    pub config: BookingPageConfig,
    /// Every booking ever made on the page (any status), sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl PageState {
    pub fn new(config: BookingPageConfig) -> Self {
        Self {
            config,
            bookings: Vec::new(),
        }
    }

    /// Store-level exclusion constraint: an active booking is refused if it
    /// overlaps another active booking. Returns the id it collided with.
    pub fn insert_booking(&mut self, booking: Booking) -> Result<(), Ulid> {
        if booking.status.is_active()
            && let Some(existing) = self.active_overlapping(&booking.span).next()
        {
            return Err(existing.id);
        }
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
        Ok(())
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Bookings whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn active_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        self.overlapping(query).filter(|b| b.status.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.bookings.iter().filter(|b| b.status.is_active()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn config() -> BookingPageConfig {
        BookingPageConfig {
            id: Ulid::new(),
            org_id: Ulid::new(),
            slug: "store".into(),
            business_name: "Store".into(),
            business_hours: BusinessHours::weekdays(
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            ),
            slot_duration_minutes: 30,
            buffer_time_minutes: 0,
            booking_notice_hours: 0,
            max_days_advance: 30,
            timezone: "UTC".into(),
            auto_confirm: true,
            is_active: true,
        }
    }

    fn booking(page_id: Ulid, start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            page_id,
            customer: CustomerInfo {
                name: "Bo".into(),
                phone: "555".into(),
                ..Default::default()
            },
            span: Span::new(start, end),
            status,
            created_at: 0,
            calendar_event_id: None,
        }
    }

    #[test]
    fn bookings_kept_sorted() {
        let mut ps = PageState::new(config());
        let pid = ps.config.id;
        ps.insert_booking(booking(pid, 300, 400, BookingStatus::Confirmed)).unwrap();
        ps.insert_booking(booking(pid, 100, 200, BookingStatus::Pending)).unwrap();
        ps.insert_booking(booking(pid, 200, 300, BookingStatus::Confirmed)).unwrap();
        let starts: Vec<_> = ps.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_active_booking_refused() {
        let mut ps = PageState::new(config());
        let pid = ps.config.id;
        let first = booking(pid, 100, 200, BookingStatus::Pending);
        let first_id = first.id;
        ps.insert_booking(first).unwrap();
        let clash = ps.insert_booking(booking(pid, 150, 250, BookingStatus::Confirmed));
        assert_eq!(clash, Err(first_id));
        assert_eq!(ps.bookings.len(), 1);
    }

    #[test]
    fn cancelled_bookings_do_not_block() {
        let mut ps = PageState::new(config());
        let pid = ps.config.id;
        ps.insert_booking(booking(pid, 100, 200, BookingStatus::Cancelled)).unwrap();
        ps.insert_booking(booking(pid, 100, 200, BookingStatus::Confirmed)).unwrap();
        assert_eq!(ps.bookings.len(), 2);
        assert_eq!(ps.active_count(), 1);
    }

    #[test]
    fn adjacent_bookings_allowed() {
        let mut ps = PageState::new(config());
        let pid = ps.config.id;
        ps.insert_booking(booking(pid, 100, 200, BookingStatus::Confirmed)).unwrap();
        ps.insert_booking(booking(pid, 200, 300, BookingStatus::Confirmed)).unwrap();
        assert_eq!(ps.overlapping(&Span::new(150, 250)).count(), 2);
        assert_eq!(ps.overlapping(&Span::new(300, 400)).count(), 0);
    }
}
