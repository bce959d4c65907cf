/// Max length of a resident or amenity identifier, in bytes.
pub const MAX_ID_LEN: usize = 128;

/// Max length of a legacy combined time string.
pub const MAX_TIME_INPUT_LEN: usize = 32;

/// Max distinct amenities held by one engine.
pub const MAX_AMENITIES: usize = 10_000;

/// Max bookings (any status) stored per amenity.
pub const MAX_BOOKINGS_PER_AMENITY: usize = 100_000;

/// Max rows returned by a single SELECT.
pub const MAX_RESULT_ROWS: usize = 10_000;

/// Max length of a resident's name or e-mail address, in bytes.
pub const MAX_CONTACT_LEN: usize = 256;
