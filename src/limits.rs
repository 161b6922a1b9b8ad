/// Max chars in a display name (organizer or counterpart).
pub const MAX_NAME_LEN: usize = 100;

/// Max chars in free-text contact info.
pub const MAX_CONTACT_LEN: usize = 100;

/// Max chars in an organizer login handle.
pub const MAX_LOGIN_LEN: usize = 100;

/// Max chars in a reschedule reason.
pub const MAX_REASON_LEN: usize = 500;

/// Max counterparts on one organizer's roster.
pub const MAX_COUNTERPARTS_PER_ORGANIZER: usize = 1_000;

/// Max live bookings in one organizer's calendar.
pub const MAX_BOOKINGS_PER_ORGANIZER: usize = 100_000;

/// Max bytes in one transport request line.
pub const MAX_LINE_LEN: usize = 8 * 1024;
