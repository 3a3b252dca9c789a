use crate::limits::*;
use crate::model::*;

use super::store::PageState;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::Validation("start must be before end".into()));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_RESERVATION_SPAN_MS {
        return Err(EngineError::LimitExceeded("reservation too long"));
    }
    Ok(())
}

/// The write-path overlap test: the window must not touch any external busy
/// interval nor any active booking already on the page. Half-open on both sides.
pub(crate) fn check_no_conflict(
    ps: &PageState,
    span: &Span,
    external: &[BusyInterval],
) -> Result<(), EngineError> {
    if let Some(existing) = ps.active_overlapping(span).next() {
        return Err(EngineError::Conflict {
            span: *span,
            with: format!("booking {}", existing.id),
        });
    }
    if let Some(busy) = external.iter().find(|b| b.span.overlaps(span)) {
        return Err(EngineError::Conflict {
            span: *span,
            with: busy.source.clone(),
        });
    }
    Ok(())
}

pub(crate) fn validate_customer(customer: &CustomerInfo) -> Result<(), EngineError> {
    if customer.name.trim().is_empty() {
        return Err(EngineError::Validation("customer name is required".into()));
    }
    if customer.phone.trim().is_empty() {
        return Err(EngineError::Validation("customer phone is required".into()));
    }
    if customer.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("customer name too long"));
    }
    if customer.phone.len() > MAX_PHONE_LEN {
        return Err(EngineError::LimitExceeded("customer phone too long"));
    }
    if let Some(email) = &customer.email {
        if email.len() > MAX_EMAIL_LEN {
            return Err(EngineError::LimitExceeded("customer email too long"));
        }
        if !email.contains('@') {
            return Err(EngineError::Validation(format!("malformed email: {email}")));
        }
    }
    if customer.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    if customer.custom_fields.len() > MAX_CUSTOM_FIELDS {
        return Err(EngineError::LimitExceeded("too many custom fields"));
    }
    if customer
        .custom_fields
        .iter()
        .any(|(k, v)| k.len() > MAX_CUSTOM_FIELD_LEN || v.len() > MAX_CUSTOM_FIELD_LEN)
    {
        return Err(EngineError::LimitExceeded("custom field too long"));
    }
    Ok(())
}

pub(crate) fn validate_config(config: &BookingPageConfig) -> Result<(), EngineError> {
    let slug = config.slug.as_str();
    if slug.is_empty() {
        return Err(EngineError::Validation("slug is required".into()));
    }
    if slug.len() > MAX_SLUG_LEN {
        return Err(EngineError::LimitExceeded("slug too long"));
    }
    if !slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(EngineError::Validation(format!(
            "slug may only contain a-z, 0-9 and '-': {slug}"
        )));
    }
    if config.business_name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("business name too long"));
    }
    if config.timezone.len() > MAX_TIMEZONE_LEN {
        return Err(EngineError::LimitExceeded("timezone name too long"));
    }
    super::slots::page_timezone(config)?;
    if config.slot_duration_minutes == 0 {
        return Err(EngineError::Validation("slot duration must be positive".into()));
    }
    if config.slot_duration_minutes > MAX_SLOT_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("slot duration too long"));
    }
    if config.buffer_time_minutes > MAX_BUFFER_MINUTES {
        return Err(EngineError::LimitExceeded("buffer time too long"));
    }
    if config.booking_notice_hours > MAX_NOTICE_HOURS {
        return Err(EngineError::LimitExceeded("booking notice too long"));
    }
    if config.max_days_advance > MAX_DAYS_ADVANCE {
        return Err(EngineError::LimitExceeded("max_days_advance too far"));
    }
    for (day, schedule) in config.business_hours.iter() {
        if schedule.enabled && schedule.start >= schedule.end {
            return Err(EngineError::Validation(format!(
                "business hours for {day} end before they start"
            )));
        }
    }
    Ok(())
}
