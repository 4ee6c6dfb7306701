use crate::model::{BookingItem, DAY_MS, Minor, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub days: u32,
    pub items_per_day: Minor,
    pub studios_per_day: Minor,
    pub per_day: Minor,
    pub total: Minor,
}

/// Whole rental days, any started day counted in full. Never below one.
pub fn rental_days(span: &Span) -> u32 {
    let duration = span.duration_ms().max(0);
    let days = duration / DAY_MS + i64::from(duration % DAY_MS > 0);
    u32::try_from(days.max(1)).unwrap_or(u32::MAX)
}

/// Price snapshots times quantities plus studio day rates, times rental days.
pub fn quote(items: &[BookingItem], studio_rates: &[Minor], span: &Span) -> Quote {
    let items_per_day = items.iter().fold(0, |acc: Minor, i| {
        acc.saturating_add(i.unit_price.saturating_mul(Minor::from(i.quantity)))
    });
    let studios_per_day = studio_rates.iter().fold(0, |acc: Minor, r| acc.saturating_add(*r));
    let per_day = items_per_day.saturating_add(studios_per_day);
    let days = rental_days(span);
    Quote {
        days,
        items_per_day,
        studios_per_day,
        per_day,
        total: per_day.saturating_mul(Minor::from(days)),
    }
}
