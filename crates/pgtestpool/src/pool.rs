//! The slot allocator: builds a pool, hands out test databases and takes them back.
//!
//! ## What
//!
//! - [`Pool::builder`] validates the configuration, connects the admin pool, installs the state
//!   tables and registers (or checks) the pool identity.
//! - [`Pool::acquire`] readies the template, reclaims slots of dead processes, claims a slot and
//!   provisions its database, all bounded by the acquire timeout.
//! - [`crate::TestDb::release`] resets or drops the database according to the
//!   [`ReleaseStrategy`] and returns the slot.
//!
//! ## How
//!
//! Slot state lives in the server and is changed only through [`StateStore`], under the pool's
//! advisory lock. Physical DDL runs outside that lock: a claimed slot is owned exclusively by the
//! claiming process, so nothing else touches its database until it is released.
//!
//! A claim that is never turned into a handle (provisioning error, timeout, or a dropped
//! `acquire` future) is rolled back by marking the slot failed. The rollback guard is only
//! disarmed once that write has committed.
//!
//! ### Example
//!
//! ```rust,no_run
//! use pgtestpool::{BoxError, Config, Pool};
//!
//! # async fn example() -> pgtestpool::Result<()> {
//! let pool = Pool::builder(Config::new("orders").with_max_size(4))
//!     .setup_template(|db: sqlx::PgPool| async move {
//!         sqlx::query("CREATE TABLE orders (id BIGSERIAL PRIMARY KEY, total BIGINT NOT NULL)")
//!             .execute(&db)
//!             .await?;
//!         Ok::<(), BoxError>(())
//!     })
//!     .build()
//!     .await?;
//!
//! let test_db = pool.acquire().await?;
//! sqlx::query("INSERT INTO orders (total) VALUES (42)")
//!     .execute(test_db.pool())
//!     .await?;
//! test_db.release().await?;
//! # Ok(())
//! # }
//! ```
use crate::admin;
use crate::config::{AcquirePolicy, Config};
use crate::database;
use crate::error::{Error, Result};
use crate::handle::TestDb;
use crate::hooks::{DatabaseHook, ReleaseStrategy};
use crate::liveness::{LivenessProbe, ProcessProbe};
use crate::store::{Claim, ClaimOrigin, SlotRelease, StateStore};
use crate::template::TemplateManager;
use crate::types::{Holder, PoolInfo, PoolStats};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Builder for [`Pool`]. A setup hook is required.
pub struct PoolBuilder {
    config: Config,
    setup: Option<Arc<dyn DatabaseHook>>,
    strategy: ReleaseStrategy,
    root: Option<PgPool>,
    probe: Arc<dyn LivenessProbe>,
}

impl PoolBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            setup: None,
            strategy: ReleaseStrategy::default(),
            root: None,
            probe: Arc::new(ProcessProbe),
        }
    }

    /// Hook run once against the freshly created template database.
    pub fn setup_template<H: DatabaseHook + 'static>(mut self, setup: H) -> Self {
        self.setup = Some(Arc::new(setup));
        self
    }

    /// Hook run on release to clean a slot database for reuse. Selects [`ReleaseStrategy::Reuse`].
    pub fn reset_database<H: DatabaseHook + 'static>(mut self, reset: H) -> Self {
        self.strategy = ReleaseStrategy::reuse(reset);
        self
    }

    pub fn strategy(mut self, strategy: ReleaseStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Use an existing admin pool instead of connecting from the configuration.
    ///
    /// The pool must be allowed to create and drop databases, and needs at least two connections.
    pub fn root_pool(mut self, root: PgPool) -> Self {
        self.root = Some(root);
        self
    }

    pub fn liveness_probe<P: LivenessProbe + 'static>(mut self, probe: P) -> Self {
        self.probe = Arc::new(probe);
        self
    }

    /// Validate, connect and register the pool.
    pub async fn build(self) -> Result<Pool> {
        let config = self.config;
        config.validate()?;

        let setup = self.setup.ok_or_else(|| Error::MissingConfig {
            field: "setup_template".to_string(),
        })?;

        let (root, owns_root) = match self.root {
            Some(root) => (root, false),
            None => {
                let root = PgPoolOptions::new()
                    .max_connections(config.root_max_connections)
                    .connect_with(config.connect_options()?)
                    .await
                    .map_err(|e| Error::ConnectionFailed {
                        source: e,
                        context: format!("Failed to connect admin pool for '{}'", config.name),
                    })?;
                (root, true)
            }
        };
        let connect_options = (*root.connect_options()).clone();

        let store = StateStore::new(root.clone(), &config);
        let info = store.register().await?;
        let template = TemplateManager::new(
            root.clone(),
            connect_options.clone(),
            &info.name,
            &info.template_database,
        );

        tracing::info!(
            "Pool '{}' ready (max_size: {}, strategy: {:?}, policy: {:?})",
            info.name,
            info.max_size,
            self.strategy,
            config.acquire_policy
        );

        Ok(Pool {
            inner: Arc::new(PoolInner {
                config,
                root,
                owns_root,
                connect_options,
                store,
                template,
                setup,
                strategy: self.strategy,
                probe: self.probe,
                holder: Holder::current(),
                info,
                warm: Mutex::new(HashMap::new()),
                local_reset_failures: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

impl fmt::Debug for PoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuilder")
            .field("config", &self.config)
            .field("has_setup", &self.setup.is_some())
            .field("strategy", &self.strategy)
            .field("probe", &self.probe)
            .finish()
    }
}

/// A bounded set of test databases shared with every process using the same pool name.
///
/// Cloning is cheap; clones share the same local state.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    config: Config,
    root: PgPool,
    owns_root: bool,
    connect_options: PgConnectOptions,
    store: StateStore,
    template: TemplateManager,
    setup: Arc<dyn DatabaseHook>,
    strategy: ReleaseStrategy,
    probe: Arc<dyn LivenessProbe>,
    holder: Holder,
    info: PoolInfo,
    /// Released reuse-strategy slot pools, kept open for the next acquire of the same index
    warm: Mutex<HashMap<i32, PgPool>>,
    local_reset_failures: AtomicU64,
    closed: AtomicBool,
}

impl Pool {
    pub fn builder(config: Config) -> PoolBuilder {
        PoolBuilder::new(config)
    }

    pub fn name(&self) -> &str {
        &self.inner.info.name
    }

    /// The registered identity.
    pub fn info(&self) -> &PoolInfo {
        &self.inner.info
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn strategy(&self) -> &ReleaseStrategy {
        &self.inner.strategy
    }

    /// The admin pool, connected to the database holding the state tables.
    pub fn root(&self) -> &PgPool {
        &self.inner.root
    }

    /// Acquire a test database, bounded by the configured acquire timeout.
    pub async fn acquire(&self) -> Result<TestDb> {
        self.acquire_timeout(self.inner.config.acquire_timeout())
            .await
    }

    /// Acquire a test database, giving up after `timeout`.
    ///
    /// The timeout covers the whole call, template setup and DDL included. A slot claimed before
    /// the deadline is rolled back.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<TestDb> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed {
                name: self.name().to_string(),
            });
        }

        match tokio::time::timeout(timeout, self.acquire_inner()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                operation: format!("acquire from pool '{}' after {:?}", self.name(), timeout),
            }),
        }
    }

    async fn acquire_inner(&self) -> Result<TestDb> {
        let inner = &self.inner;
        inner.template.ensure_ready(inner.setup.as_ref()).await?;

        let claim = loop {
            inner.reclaim_dead().await?;
            if let Some(claim) = inner.store.claim(&inner.holder).await? {
                break claim;
            }

            match inner.config.acquire_policy {
                AcquirePolicy::FailFast => {
                    return Err(Error::PoolExhausted {
                        pool: self.name().to_string(),
                        max_size: inner.info.max_size,
                    })
                }
                AcquirePolicy::Blocking => {
                    tracing::debug!(
                        "Pool '{}' exhausted, retrying in {:?}",
                        self.name(),
                        inner.config.retry_interval()
                    );
                    tokio::time::sleep(inner.config.retry_interval()).await;
                }
            }
        };

        let index = claim.slot.slot_index;
        let mut guard = ClaimGuard::new(self.inner.clone(), index);

        match inner.provision(&claim).await {
            Ok(db) => {
                guard.complete();
                tracing::debug!(
                    "Acquired slot {} of pool '{}' ({})",
                    index,
                    self.name(),
                    claim.slot.database_name
                );
                Ok(TestDb::new(
                    self.inner.clone(),
                    index,
                    claim.slot.database_name,
                    db,
                ))
            }
            Err(e) => {
                tracing::warn!(
                    "Provisioning slot {} of pool '{}' failed, marking it failed: {}",
                    index,
                    self.name(),
                    e
                );
                // The guard stays armed until the rollback lands: a cancellation while it waits
                // on the pool lock still marks the slot failed.
                match inner
                    .store
                    .release(index, &inner.holder, SlotRelease::Fail)
                    .await
                {
                    Ok(()) => guard.complete(),
                    Err(rollback) => tracing::warn!(
                        "Failed to roll back claim of slot {} of pool '{}', retrying in the background: {}",
                        index,
                        self.name(),
                        rollback
                    ),
                }
                Err(e)
            }
        }
    }

    /// Drop the databases of failed slots and remove their rows so the indexes are reusable.
    ///
    /// Returns how many slots were recycled.
    pub async fn reclaim_failed(&self) -> Result<u64> {
        let inner = &self.inner;
        let taken = inner.store.take_failed(&inner.holder).await?;

        let mut recycled = 0;
        for slot in taken {
            inner.discard_warm(slot.slot_index).await;
            match database::drop_if_exists(&inner.root, &slot.database_name).await {
                Ok(()) => {
                    inner
                        .store
                        .release(slot.slot_index, &inner.holder, SlotRelease::Remove)
                        .await?;
                    recycled += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "Could not drop failed database '{}', leaving slot {} failed: {}",
                        slot.database_name,
                        slot.slot_index,
                        e
                    );
                    inner
                        .store
                        .release(slot.slot_index, &inner.holder, SlotRelease::Fail)
                        .await?;
                }
            }
        }

        if recycled > 0 {
            tracing::info!("Recycled {} failed slots of pool '{}'", recycled, self.name());
        }
        Ok(recycled)
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        let counts = self.inner.store.counts().await?;
        Ok(PoolStats {
            name: self.name().to_string(),
            max_size: self.inner.info.max_size,
            total_slots: counts.total,
            in_use: counts.in_use,
            free: counts.free,
            failed: counts.failed,
            local_reset_failures: self.inner.local_reset_failures.load(Ordering::Relaxed),
        })
    }

    /// Close this process's warm connections and, if the pool opened it, the admin pool.
    ///
    /// Shared state is untouched. Release outstanding handles first.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.close_warm().await;
        if self.inner.owns_root {
            self.inner.root.close().await;
        }
        tracing::debug!("Pool '{}' closed", self.name());
    }

    /// Drop every slot database and the template, and delete the pool's rows.
    ///
    /// Irreversible. Only call it when no other process is using the pool.
    pub async fn cleanup(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.close_warm().await;
        admin::cleanup_pool(&self.inner.root, self.name()).await?;
        if self.inner.owns_root {
            self.inner.root.close().await;
        }
        Ok(())
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("info", &self.inner.info)
            .field("strategy", &self.inner.strategy)
            .field("policy", &self.inner.config.acquire_policy)
            .field("holder", &self.inner.holder)
            .finish()
    }
}

impl PoolInner {
    fn pool_name(&self) -> &str {
        &self.info.name
    }

    fn warm(&self) -> MutexGuard<'_, HashMap<i32, PgPool>> {
        self.warm.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_warm(&self, index: i32) -> Option<PgPool> {
        self.warm().remove(&index)
    }

    async fn discard_warm(&self, index: i32) {
        let db = self.take_warm(index);
        if let Some(db) = db {
            db.close().await;
        }
    }

    async fn close_warm(&self) {
        let pools: Vec<PgPool> = self.warm().drain().map(|(_, db)| db).collect();
        for db in pools {
            db.close().await;
        }
    }

    fn record_release_failure(&self) {
        self.local_reset_failures.fetch_add(1, Ordering::Relaxed);
    }

    async fn reclaim_dead(&self) -> Result<()> {
        let reclaimed = self
            .store
            .reclaim_dead(&self.holder, self.probe.as_ref(), self.strategy.is_reuse())
            .await?;
        if reclaimed > 0 {
            tracing::info!(
                "Reclaimed {} slots of pool '{}' from dead processes",
                reclaimed,
                self.pool_name()
            );
        }
        Ok(())
    }

    async fn connect(&self, database_name: &str) -> Result<PgPool> {
        PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .connect_with(self.connect_options.clone().database(database_name))
            .await
            .map_err(|e| Error::ConnectionFailed {
                source: e,
                context: format!("Failed to connect to test database '{}'", database_name),
            })
    }

    /// Turn a claimed slot into an open connection pool on a clean database.
    async fn provision(&self, claim: &Claim) -> Result<PgPool> {
        let index = claim.slot.slot_index;
        let name = &claim.slot.database_name;

        match claim.origin {
            ClaimOrigin::Free { needs_reset: false } => {
                if let Some(db) = self.take_warm(index) {
                    return Ok(db);
                }
                if database::exists(&self.root, name).await? {
                    return self.connect(name).await;
                }
                tracing::debug!("Database '{}' of free slot {} is missing", name, index);
            }
            ClaimOrigin::Free { needs_reset: true } => {
                if let ReleaseStrategy::Reuse(reset) = &self.strategy {
                    if database::exists(&self.root, name).await? {
                        let db = match self.take_warm(index) {
                            Some(db) => db,
                            None => self.connect(name).await?,
                        };
                        match reset.run(&db).await {
                            Ok(()) => return Ok(db),
                            Err(source) => {
                                let err = Error::ResetFailed {
                                    database: name.clone(),
                                    source,
                                };
                                tracing::warn!("{}; cloning slot {} again", err, index);
                                self.record_release_failure();
                                db.close().await;
                            }
                        }
                    }
                }
            }
            ClaimOrigin::New | ClaimOrigin::Failed => {}
        }

        self.clone_slot(index, name).await
    }

    async fn clone_slot(&self, index: i32, name: &str) -> Result<PgPool> {
        self.discard_warm(index).await;
        database::drop_if_exists(&self.root, name).await?;
        database::create_from_template(&self.root, name, self.template.template_database())
            .await?;
        self.connect(name).await
    }

    /// Release path of [`TestDb`]. Reset and drop failures degrade the slot instead of failing.
    pub(crate) async fn release_slot(
        &self,
        index: i32,
        database_name: &str,
        db: PgPool,
    ) -> Result<()> {
        match &self.strategy {
            ReleaseStrategy::Reuse(reset) => match reset.run(&db).await {
                Ok(()) => {
                    self.store
                        .release(index, &self.holder, SlotRelease::Free)
                        .await?;
                    if self.closed.load(Ordering::Acquire) {
                        db.close().await;
                    } else {
                        self.warm().insert(index, db);
                    }
                }
                Err(source) => {
                    let err = Error::ResetFailed {
                        database: database_name.to_string(),
                        source,
                    };
                    tracing::warn!("{}; marking slot {} failed", err, index);
                    self.record_release_failure();
                    db.close().await;
                    self.store
                        .release(index, &self.holder, SlotRelease::Fail)
                        .await?;
                }
            },
            ReleaseStrategy::Isolate => {
                db.close().await;
                match database::drop_if_exists(&self.root, database_name).await {
                    Ok(()) => {
                        self.store
                            .release(index, &self.holder, SlotRelease::Remove)
                            .await?;
                    }
                    Err(e) => {
                        tracing::warn!("{}; marking slot {} failed", e, index);
                        self.record_release_failure();
                        self.store
                            .release(index, &self.holder, SlotRelease::Fail)
                            .await?;
                    }
                }
            }
        }

        tracing::debug!(
            "Released slot {} of pool '{}' ({})",
            index,
            self.pool_name(),
            database_name
        );
        Ok(())
    }

    /// Mark a slot this process holds as failed from a synchronous context.
    ///
    /// Spawned on the current tokio runtime; without one the slot stays in use until this
    /// process exits and another process reclaims it.
    pub(crate) fn abandon(self: &Arc<Self>, index: i32, db: Option<PgPool>) {
        let inner = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some(db) = db {
                        db.close().await;
                    }
                    if let Err(e) = inner
                        .store
                        .release(index, &inner.holder, SlotRelease::Fail)
                        .await
                    {
                        tracing::debug!(
                            "Could not mark abandoned slot {} of pool '{}' failed: {}",
                            index,
                            inner.pool_name(),
                            e
                        );
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    "No runtime to release slot {} of pool '{}'; it stays in use until this process exits",
                    index,
                    self.pool_name()
                );
            }
        }
    }
}

/// Rolls a claim back if the acquire future is dropped before the claim became a handle.
struct ClaimGuard {
    inner: Arc<PoolInner>,
    index: i32,
    completed: bool,
}

impl ClaimGuard {
    fn new(inner: Arc<PoolInner>, index: i32) -> Self {
        Self {
            inner,
            index,
            completed: false,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.completed {
            tracing::debug!(
                "Acquire of slot {} of pool '{}' cancelled, marking it failed",
                self.index,
                self.inner.pool_name()
            );
            self.inner.abandon(self.index, None);
        }
    }
}
