// Test configuration constants

// Testcontainer settings
pub const TEST_DB_NAME: &str = "pgtestpool_test";
pub const TEST_DB_USER: &str = "postgres";
pub const TEST_DB_PASSWORD: &str = "postgres";
pub const POSTGRES_PORT: u16 = 5432;

// Admin connection
pub const MAX_CONNECTIONS: u32 = 8;
pub const CONNECTION_TIMEOUT_SECS: u64 = 10;
pub const VERIFICATION_QUERY: &str = "SELECT 1";

// Pools
pub const SEED_ITEM: &str = "seed";
