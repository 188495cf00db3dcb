//! Shared slot state, mutated only under the pool's advisory lock.
//!
//! Every method opens a transaction with [`lock::begin_locked`] on the pool key, reads the rows
//! it needs, writes the new assignment and commits. Claim, free, fail and reclamation are
//! therefore serialized pool-wide across every process, which keeps the capacity and
//! exclusivity invariants a matter of reading the rows.
use crate::config::Config;
use crate::error::{Error, Result};
use crate::liveness::{Liveness, LivenessProbe};
use crate::lock;
use crate::schema;
use crate::tables::pgtestpool_slots::SlotCounts;
use crate::tables::{NewPool, Pools, Slots, Templates};
use crate::types::{Holder, PoolInfo, SlotInfo, SlotStatus};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashSet;

/// Where a claimed slot came from; decides how its database is provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOrigin {
    /// Previously released slot. `needs_reset` is set when a dead holder's slot was reclaimed.
    Free { needs_reset: bool },
    /// Index that had no row; its database may not exist.
    New,
    /// Failed slot recycled because nothing else was available; its database is untrusted.
    Failed,
}

/// A slot now held by the caller.
#[derive(Debug, Clone)]
pub struct Claim {
    pub slot: SlotInfo,
    pub origin: ClaimOrigin,
}

/// How slot transitions end up after a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRelease {
    /// Back to `free`, database kept.
    Free,
    /// Row deleted, database already dropped.
    Remove,
    /// Database untrusted; recycled or swept later.
    Fail,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    root: PgPool,
    config: Config,
    lock_key: String,
    slots: Slots,
}

impl StateStore {
    pub fn new(root: PgPool, config: &Config) -> Self {
        Self {
            lock_key: lock::pool_key(&config.name),
            slots: Slots::new(root.clone()),
            config: config.clone(),
            root,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn max_size(&self) -> i32 {
        self.config.max_size as i32
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        lock::begin_locked(&self.root, &self.lock_key).await
    }

    async fn commit(&self, tx: Transaction<'static, Postgres>) -> Result<()> {
        lock::commit(tx, &self.lock_key).await
    }

    /// Register the pool identity and its template record, or check an existing registration.
    ///
    /// An existing pool with a different template or capacity is an error and is left untouched.
    pub async fn register(&self) -> Result<PoolInfo> {
        schema::install(&self.root).await?;

        let requested = NewPool {
            name: self.config.name.clone(),
            template_database: self.config.template_database_name(),
            max_size: self.max_size(),
        };

        let mut tx = self.begin().await?;
        let stored = Pools::insert_or_get_tx(&requested, &mut tx).await?;

        if stored.template_database != requested.template_database
            || stored.max_size != requested.max_size
        {
            // Dropping the transaction rolls back and releases the lock.
            return Err(Error::PoolConfigMismatch {
                name: stored.name,
                registered_template: stored.template_database,
                registered_max_size: stored.max_size,
                requested_template: requested.template_database,
                requested_max_size: requested.max_size,
            });
        }

        Templates::insert_if_absent_tx(&stored.name, &stored.template_database, &mut tx).await?;
        Pools::touch_tx(&stored.name, &mut tx).await?;
        self.commit(tx).await?;

        tracing::debug!("Registered {}", stored);
        Ok(stored)
    }

    /// Claim a slot for `holder`, or `None` when the pool is exhausted.
    ///
    /// Order: lowest free index, then the lowest index without a row, then the lowest failed
    /// slot. Failed slots are only recycled when nothing else is left and are always re-cloned.
    pub async fn claim(&self, holder: &Holder) -> Result<Option<Claim>> {
        let name = self.name();
        let mut tx = self.begin().await?;
        let slots = Slots::list_for_pool_tx(name, &mut tx).await?;

        let claim = if let Some(free) = slots.iter().find(|s| s.status == SlotStatus::Free) {
            let slot = Slots::claim_tx(name, free.slot_index, holder, &mut tx).await?;
            Some(Claim {
                origin: ClaimOrigin::Free {
                    needs_reset: free.needs_reset,
                },
                slot,
            })
        } else if (slots.len() as i32) < self.max_size() {
            let used: HashSet<i32> = slots.iter().map(|s| s.slot_index).collect();
            let index = (0..self.max_size())
                .find(|i| !used.contains(i))
                .ok_or_else(|| Error::Internal {
                    message: format!("Pool '{}' has no unused index below its size", name),
                })?;
            let database_name = self.config.slot_database_name(index);
            let slot = Slots::insert_claimed_tx(name, index, &database_name, holder, &mut tx).await?;
            Some(Claim {
                origin: ClaimOrigin::New,
                slot,
            })
        } else if let Some(failed) = slots.iter().find(|s| s.status == SlotStatus::Failed) {
            let slot = Slots::claim_tx(name, failed.slot_index, holder, &mut tx).await?;
            Some(Claim {
                origin: ClaimOrigin::Failed,
                slot,
            })
        } else {
            None
        };

        self.commit(tx).await?;

        if let Some(claim) = &claim {
            tracing::debug!(
                "Claimed slot {} of pool '{}' ({:?}) for {}",
                claim.slot.slot_index,
                name,
                claim.origin,
                holder
            );
        }
        Ok(claim)
    }

    /// Apply a release transition to a slot held by `holder`.
    ///
    /// Fails with [`Error::SlotNotHeld`] if the slot is missing, not in use, or held by someone
    /// else.
    pub async fn release(&self, index: i32, holder: &Holder, outcome: SlotRelease) -> Result<()> {
        let name = self.name();
        let mut tx = self.begin().await?;

        let slot = Slots::get_tx(name, index, &mut tx).await?;
        let reason = match &slot {
            None => Some("slot does not exist".to_string()),
            Some(s) if s.status != SlotStatus::InUse => Some(format!("slot is {}", s.status)),
            Some(s) if !s.is_held_by(holder) => Some(format!(
                "slot is held by {}@{}",
                s.process_id.unwrap_or_default(),
                s.hostname.as_deref().unwrap_or("unknown")
            )),
            Some(_) => None,
        };
        if let Some(reason) = reason {
            return Err(Error::SlotNotHeld {
                pool: name.to_string(),
                index,
                reason,
            });
        }

        match outcome {
            SlotRelease::Free => {
                Slots::release_tx(name, index, SlotStatus::Free, false, &mut tx).await?;
            }
            SlotRelease::Fail => {
                Slots::release_tx(name, index, SlotStatus::Failed, false, &mut tx).await?;
            }
            SlotRelease::Remove => {
                Slots::delete_tx(name, index, &mut tx).await?;
            }
        }
        self.commit(tx).await?;

        tracing::debug!(
            "Released slot {} of pool '{}' ({:?})",
            index,
            name,
            outcome
        );
        Ok(())
    }

    /// Take back in-use slots whose holder process no longer exists.
    ///
    /// Only holders on the local host are probed. With `reuse` the slot becomes free but flagged
    /// for reset; otherwise it becomes failed and its database is re-cloned on next use.
    pub async fn reclaim_dead(
        &self,
        holder: &Holder,
        probe: &dyn LivenessProbe,
        reuse: bool,
    ) -> Result<u64> {
        let name = self.name();
        let mut tx = self.begin().await?;
        let slots = Slots::list_for_pool_tx(name, &mut tx).await?;

        let mut reclaimed = 0;
        for slot in slots.iter().filter(|s| s.status == SlotStatus::InUse) {
            let (Some(pid), Some(host)) = (slot.process_id, slot.hostname.as_deref()) else {
                continue;
            };
            if host != holder.hostname || pid == holder.process_id {
                continue;
            }
            if probe.probe(pid) != Liveness::Dead {
                continue;
            }

            tracing::info!(
                "Stale holder detected: reclaiming slot {} of pool '{}' from dead process {}@{} (last used: {:?})",
                slot.slot_index,
                name,
                pid,
                host,
                slot.last_used_at
            );

            if reuse {
                Slots::release_tx(name, slot.slot_index, SlotStatus::Free, true, &mut tx).await?;
            } else {
                Slots::release_tx(name, slot.slot_index, SlotStatus::Failed, false, &mut tx)
                    .await?;
            }
            reclaimed += 1;
        }

        self.commit(tx).await?;
        Ok(reclaimed)
    }

    /// Claim every failed slot for `holder` so their databases can be dropped outside the lock.
    pub async fn take_failed(&self, holder: &Holder) -> Result<Vec<SlotInfo>> {
        let name = self.name();
        let mut tx = self.begin().await?;
        let slots = Slots::list_for_pool_tx(name, &mut tx).await?;

        let mut taken = Vec::new();
        for failed in slots.iter().filter(|s| s.status == SlotStatus::Failed) {
            taken.push(Slots::claim_tx(name, failed.slot_index, holder, &mut tx).await?);
        }

        self.commit(tx).await?;
        Ok(taken)
    }

    pub async fn counts(&self) -> Result<SlotCounts> {
        self.slots.counts(self.name()).await
    }
}
