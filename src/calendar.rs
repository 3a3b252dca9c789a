use async_trait::async_trait;
use ulid::Ulid;

use crate::model::{Booking, Ms, Span};

/// Failure reported by an external collaborator (calendar provider,
/// notification channel). Never surfaced to booking customers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// Network failure, provider outage, rate limiting.
    Unavailable(String),
    /// Credentials expired or revoked and could not be refreshed.
    Unauthorized(String),
    /// The provider understood the request and refused it.
    Rejected(String),
}

impl std::fmt::Display for CollaboratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollaboratorError::Unavailable(e) => write!(f, "unavailable: {e}"),
            CollaboratorError::Unauthorized(e) => write!(f, "unauthorized: {e}"),
            CollaboratorError::Rejected(e) => write!(f, "rejected: {e}"),
        }
    }
}

impl std::error::Error for CollaboratorError {}

/// What gets written into the business's calendar for a new booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEventDetails {
    pub booking_id: Ulid,
    pub title: String,
    pub start: Ms,
    pub end: Ms,
    pub timezone: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub customer_email: Option<String>,
    pub notes: Option<String>,
}

impl CalendarEventDetails {
    pub fn for_booking(booking: &Booking, business_name: &str, timezone: &str) -> Self {
        Self {
            booking_id: booking.id,
            title: format!("{} - {}", booking.customer.name, business_name),
            start: booking.span.start,
            end: booking.span.end,
            timezone: timezone.to_string(),
            customer_name: booking.customer.name.clone(),
            customer_phone: booking.customer.phone.clone(),
            customer_email: booking.customer.email.clone(),
            notes: booking.customer.notes.clone(),
        }
    }
}

/// A connected external calendar (Google, Outlook, CalDAV, ...).
/// Credential refresh happens inside the implementation.
#[async_trait]
pub trait CalendarIntegration: Send + Sync {
    /// Short provider label used in logs and conflict messages.
    fn provider(&self) -> &str;

    /// Busy blocks overlapping `range`. Need not be clipped to it.
    async fn list_busy_times(&self, org_id: Ulid, range: Span) -> Result<Vec<Span>, CollaboratorError>;

    /// Create an event; `Ok(None)` when the provider accepted it without an id.
    async fn create_event(
        &self,
        org_id: Ulid,
        details: &CalendarEventDetails,
    ) -> Result<Option<String>, CollaboratorError>;
}
