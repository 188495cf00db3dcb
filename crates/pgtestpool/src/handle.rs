//! Acquired test database handle.
use crate::error::Result;
use crate::pool::PoolInner;
use sqlx::PgPool;
use std::fmt;
use std::sync::Arc;

/// Exclusive use of one slot and its database until [`TestDb::release`].
///
/// Dropping a handle without releasing it marks the slot failed in the background; its database
/// is cloned again by whoever claims the slot next.
pub struct TestDb {
    owner: Arc<PoolInner>,
    slot_index: i32,
    database_name: String,
    db: PgPool,
    released: bool,
}

impl TestDb {
    pub(crate) fn new(
        owner: Arc<PoolInner>,
        slot_index: i32,
        database_name: String,
        db: PgPool,
    ) -> Self {
        Self {
            owner,
            slot_index,
            database_name,
            db,
            released: false,
        }
    }

    /// Connection pool bound to this test database.
    pub fn pool(&self) -> &PgPool {
        &self.db
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn slot_index(&self) -> i32 {
        self.slot_index
    }

    /// Give the slot back: reset and keep the database, or drop it, per the pool's strategy.
    ///
    /// A failing reset or drop marks the slot failed and is logged, but is not returned as an
    /// error. Errors here come from the state tables.
    pub async fn release(mut self) -> Result<()> {
        let result = self
            .owner
            .release_slot(self.slot_index, &self.database_name, self.db.clone())
            .await;
        if result.is_ok() {
            self.released = true;
        }
        result
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                "Test database '{}' (slot {}) dropped without release, marking it failed",
                self.database_name,
                self.slot_index
            );
            self.owner.abandon(self.slot_index, Some(self.db.clone()));
        }
    }
}

impl fmt::Debug for TestDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestDb")
            .field("slot_index", &self.slot_index)
            .field("database_name", &self.database_name)
            .field("released", &self.released)
            .finish()
    }
}
