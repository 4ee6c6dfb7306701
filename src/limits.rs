use crate::model::{DAY_MS, Ms};

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_SERIAL_LEN: usize = 100;
pub const MAX_CUSTOMER_FIELD_LEN: usize = 500;

pub const MAX_LEDGERS_PER_TENANT: usize = 100_000;
pub const MAX_BOOKINGS_PER_TENANT: usize = 1_000_000;
pub const MAX_RESERVATIONS_PER_LEDGER: usize = 100_000;

pub const MAX_LINES_PER_BOOKING: usize = 256;
pub const MAX_RESOURCES_PER_BOOKING: usize = 256;
pub const MAX_LINE_QUANTITY: u32 = 10_000;
pub const MAX_UNITS_PER_STOCKING: usize = 1_000;

/// Unix epoch.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;
pub const MAX_SPAN_DURATION_MS: Ms = 366 * DAY_MS;

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 64;
pub const MAX_SQL_LEN: usize = 64 * 1024;
