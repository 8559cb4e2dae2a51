//! Hard bounds on venue size and request inputs.

/// Upper bound on provisioned tables.
pub const MAX_TABLES: usize = 10_000;

/// Upper bound on seats at a single table.
pub const MAX_TABLE_CAPACITY: u32 = 1_000;

/// Upper bound on guest-list entries across the venue.
pub const MAX_GUESTS: usize = 1_000_000;

/// Upper bound on a guest's entourage, at reservation or on arrival.
pub const MAX_ACCOMPANYING_GUESTS: u32 = MAX_TABLE_CAPACITY - 1;

/// Guest names are compared byte-for-byte; this bounds their length in bytes.
pub const MAX_NAME_LEN: usize = 256;

/// A WAL entry whose length prefix exceeds this is treated as corruption.
pub const MAX_WAL_ENTRY_LEN: usize = 64 * 1024 * 1024;
