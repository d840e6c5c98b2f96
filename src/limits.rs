// Hard limits enforced at config load and at the ledger boundary.

pub const MAX_ID_LEN: usize = 128;
pub const MAX_POOLS: usize = 10_000;
pub const MAX_RESOURCES_PER_POOL: usize = 10_000;
pub const MAX_POOL_CAPACITY: u32 = 1_000_000;
pub const MAX_USERS: usize = 10_000_000;
pub const MAX_GRID_ROOMS: usize = 256;
pub const MAX_GRID_TIMES: usize = 1_440;
