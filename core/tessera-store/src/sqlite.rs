//! SQLite store.
//!
//! Uniqueness constraints back every insert-or-fail operation: a constraint
//! violation is reported as [`InsertOutcome::Duplicate`], never pre-checked.
//! Guarded updates and device binding run inside `IMMEDIATE` transactions.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{
    params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior,
};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tessera_types::{
    CodeKind, Customer, CustomerId, Device, DeviceId, DeviceIdentity, DeviceRecordId,
    Entitlement, EntitlementId, EntitlementMetadata, EntitlementSource, FoundersRepair,
    InsertOutcome, LicenseKey, LicenseKeyId, OfflineCodeUse, Platform, ProcessedEvent, Purchase,
    PurchaseId,
};

use crate::repo::{
    BillingEventLedger, BindOutcome, CustomerRepo, DeviceIdentityRepo, DeviceRepo,
    EntitlementRepo, GuardedUpdate, Mutation, PurchaseRepo, ReplayLedger,
};
use crate::{StoreError, StoreResult};

const LEGACY_FOUNDERS_TIER: &str = "founders";

const ENTITLEMENT_COLUMNS: &str = "id, customer_id, tier, status, source, is_lifetime, \
     expires_at, current_period_end, cancel_at_period_end, max_devices, \
     stripe_subscription_id, metadata, created_at, updated_at";

const DEVICE_COLUMNS: &str =
    "id, customer_id, device_id, name, platform, last_seen_at, entitlement_id, created_at";

/// Persistent store backed by SQLite.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> StoreResult<()> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS customers (
                id TEXT PRIMARY KEY,
                email TEXT,
                provider_customer_id TEXT UNIQUE,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entitlements (
                id TEXT PRIMARY KEY,
                customer_id TEXT NOT NULL,
                tier TEXT NOT NULL,
                status TEXT NOT NULL,
                source TEXT NOT NULL,
                is_lifetime INTEGER NOT NULL,
                expires_at TEXT,
                current_period_end TEXT,
                cancel_at_period_end INTEGER NOT NULL DEFAULT 0,
                max_devices INTEGER NOT NULL,
                stripe_subscription_id TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (is_lifetime = 0 OR expires_at IS NULL)
            );
            CREATE INDEX IF NOT EXISTS idx_entitlements_subscription
                ON entitlements(stripe_subscription_id);
            CREATE INDEX IF NOT EXISTS idx_entitlements_customer
                ON entitlements(customer_id);

            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                customer_id TEXT NOT NULL,
                device_id TEXT NOT NULL UNIQUE,
                name TEXT,
                platform TEXT,
                last_seen_at TEXT NOT NULL,
                entitlement_id TEXT REFERENCES entitlements(id),
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_devices_entitlement
                ON devices(entitlement_id);

            CREATE TABLE IF NOT EXISTS device_identities (
                device_id TEXT PRIMARY KEY,
                public_key TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS purchases (
                id TEXT PRIMARY KEY,
                customer_id TEXT NOT NULL,
                checkout_session_id TEXT NOT NULL UNIQUE,
                mode TEXT NOT NULL,
                price_id TEXT,
                amount REAL,
                currency TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS license_keys (
                id TEXT PRIMARY KEY,
                purchase_id TEXT NOT NULL UNIQUE REFERENCES purchases(id),
                entitlement_id TEXT NOT NULL UNIQUE REFERENCES entitlements(id),
                license_key TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS offline_code_uses (
                jti TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                customer_id TEXT NOT NULL,
                entitlement_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                used_at TEXT NOT NULL,
                expires_at TEXT
            );

            CREATE TABLE IF NOT EXISTS billing_events (
                event_id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                processed_at TEXT NOT NULL,
                event_created INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    /// Rewrites rows that stored the legacy "founders" tier.
    ///
    /// `repair` receives the stored tier string and metadata; rows it returns
    /// `Some` for are updated to the recomputed tier with `is_lifetime = 1`
    /// and no expiry. Returns the number of rows repaired.
    pub fn repair_legacy_founders<F>(&self, repair: F) -> StoreResult<usize>
    where
        F: Fn(&str, &EntitlementMetadata) -> Option<FoundersRepair>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let rows: Vec<(String, String, String)> = {
            let mut stmt =
                tx.prepare(
                "SELECT id, tier, metadata FROM entitlements WHERE lower(trim(tier)) = ?1",
            )?;
            let mapped = stmt.query_map(params![LEGACY_FOUNDERS_TIER], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            let rows = mapped.collect::<Result<_, _>>()?;
            rows
        };

        let now = ts(Utc::now());
        let mut repaired = 0;
        for (id, tier, metadata) in rows {
            let metadata: EntitlementMetadata = serde_json::from_str(&metadata)?;
            let Some(fix) = repair(&tier, &metadata) else {
                continue;
            };
            tx.execute(
                "UPDATE entitlements
                 SET tier = ?1, is_lifetime = 1, expires_at = NULL, updated_at = ?2
                 WHERE id = ?3",
                params![fix.tier.as_str(), now, id],
            )?;
            tracing::info!(entitlement_id = %id, tier = %fix.tier, "repaired legacy founders tier");
            repaired += 1;
        }
        tx.commit()?;
        Ok(repaired)
    }

    fn load_entitlement(conn: &Connection, id: &EntitlementId) -> StoreResult<Option<Entitlement>> {
        let sql = format!("SELECT {ENTITLEMENT_COLUMNS} FROM entitlements WHERE id = ?1");
        let raw = conn
            .query_row(&sql, params![id.to_string()], RawEntitlement::from_row)
            .optional()?;
        raw.map(RawEntitlement::into_entitlement).transpose()
    }

    fn write_entitlement(conn: &Connection, e: &Entitlement) -> StoreResult<()> {
        conn.execute(
            "UPDATE entitlements SET
                tier = ?2, status = ?3, source = ?4, is_lifetime = ?5, expires_at = ?6,
                current_period_end = ?7, cancel_at_period_end = ?8, max_devices = ?9,
                stripe_subscription_id = ?10, metadata = ?11, updated_at = ?12
             WHERE id = ?1",
            params![
                e.id.to_string(),
                e.tier.as_str(),
                e.status.as_str(),
                e.source.as_str(),
                e.is_lifetime,
                e.expires_at.map(ts),
                e.current_period_end.map(ts),
                e.cancel_at_period_end,
                e.max_devices,
                e.stripe_subscription_id,
                serde_json::to_string(&e.metadata)?,
                ts(e.updated_at),
            ],
        )?;
        Ok(())
    }

    fn insert_entitlement_row(conn: &Connection, e: &Entitlement) -> rusqlite::Result<usize> {
        let metadata = serde_json::to_string(&e.metadata)
            .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;
        conn.execute(
            "INSERT INTO entitlements (id, customer_id, tier, status, source, is_lifetime,
                expires_at, current_period_end, cancel_at_period_end, max_devices,
                stripe_subscription_id, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                e.id.to_string(),
                e.customer_id.to_string(),
                e.tier.as_str(),
                e.status.as_str(),
                e.source.as_str(),
                e.is_lifetime,
                e.expires_at.map(ts),
                e.current_period_end.map(ts),
                e.cancel_at_period_end,
                e.max_devices,
                e.stripe_subscription_id,
                metadata,
                ts(e.created_at),
                ts(e.updated_at),
            ],
        )
    }
}

impl CustomerRepo for SqliteStore {
    fn insert_customer(&self, customer: &Customer) -> StoreResult<()> {
        self.conn().execute(
            "INSERT INTO customers (id, email, provider_customer_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                customer.id.to_string(),
                customer.email,
                customer.provider_customer_id,
                ts(customer.created_at),
            ],
        )?;
        Ok(())
    }

    fn get_customer(&self, id: &CustomerId) -> StoreResult<Option<Customer>> {
        let raw = self
            .conn()
            .query_row(
                "SELECT id, email, provider_customer_id, created_at FROM customers WHERE id = ?1",
                params![id.to_string()],
                RawCustomer::from_row,
            )
            .optional()?;
        raw.map(RawCustomer::into_customer).transpose()
    }

    fn find_customer_by_provider_id(&self, provider_id: &str) -> StoreResult<Option<Customer>> {
        let raw = self
            .conn()
            .query_row(
                "SELECT id, email, provider_customer_id, created_at
                 FROM customers WHERE provider_customer_id = ?1",
                params![provider_id],
                RawCustomer::from_row,
            )
            .optional()?;
        raw.map(RawCustomer::into_customer).transpose()
    }

    fn upsert_provider_customer(
        &self,
        provider_id: &str,
        email: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<Customer> {
        {
            let conn = self.conn();
            conn.execute(
                "INSERT INTO customers (id, email, provider_customer_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(provider_customer_id) DO UPDATE
                 SET email = COALESCE(customers.email, excluded.email)",
                params![CustomerId::new().to_string(), email, provider_id, ts(now)],
            )?;
        }
        self.find_customer_by_provider_id(provider_id)?
            .ok_or_else(|| StoreError::NotFound(format!("customer {provider_id}")))
    }
}

impl EntitlementRepo for SqliteStore {
    fn insert_entitlement(&self, entitlement: &Entitlement) -> StoreResult<()> {
        Self::insert_entitlement_row(&self.conn(), entitlement)?;
        Ok(())
    }

    fn insert_trial(&self, entitlement: &Entitlement) -> StoreResult<InsertOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let has_trial: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM entitlements WHERE customer_id = ?1 AND source = ?2)",
            params![
                entitlement.customer_id.to_string(),
                EntitlementSource::Trial.as_str()
            ],
            |row| row.get(0),
        )?;
        if has_trial {
            return Ok(InsertOutcome::Duplicate);
        }
        Self::insert_entitlement_row(&tx, entitlement)?;
        tx.commit()?;
        Ok(InsertOutcome::Inserted)
    }

    fn get_entitlement(&self, id: &EntitlementId) -> StoreResult<Option<Entitlement>> {
        Self::load_entitlement(&self.conn(), id)
    }

    fn find_by_subscription(&self, subscription_id: &str) -> StoreResult<Option<Entitlement>> {
        let sql = format!(
            "SELECT {ENTITLEMENT_COLUMNS} FROM entitlements
             WHERE stripe_subscription_id = ?1 ORDER BY created_at LIMIT 1"
        );
        let raw = self
            .conn()
            .query_row(&sql, params![subscription_id], RawEntitlement::from_row)
            .optional()?;
        raw.map(RawEntitlement::into_entitlement).transpose()
    }

    fn list_for_customer(&self, customer_id: &CustomerId) -> StoreResult<Vec<Entitlement>> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {ENTITLEMENT_COLUMNS} FROM entitlements
             WHERE customer_id = ?1 ORDER BY created_at, id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![customer_id.to_string()], RawEntitlement::from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?.into_entitlement()?);
        }
        Ok(result)
    }

    fn update_guarded(
        &self,
        id: &EntitlementId,
        event_created: i64,
        now: DateTime<Utc>,
        mutate: &mut dyn FnMut(&mut Entitlement) -> Mutation,
    ) -> StoreResult<GuardedUpdate> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(mut entitlement) = Self::load_entitlement(&tx, id)? else {
            return Ok(GuardedUpdate::NotFound);
        };
        if let Some(last) = entitlement.metadata.last_event_created {
            if event_created <= last {
                return Ok(GuardedUpdate::Stale {
                    last_event_created: last,
                });
            }
        }
        match mutate(&mut entitlement) {
            Mutation::Skip(reason) => Ok(GuardedUpdate::Skipped(reason)),
            Mutation::Apply => {
                entitlement.metadata.last_event_created = Some(event_created);
                entitlement.updated_at = now;
                Self::write_entitlement(&tx, &entitlement)?;
                tx.commit()?;
                Ok(GuardedUpdate::Applied(entitlement))
            }
        }
    }

    fn expire_lapsed(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let now = ts(now);
        let changed = self.conn().execute(
            "UPDATE entitlements SET status = 'expired', updated_at = ?1
             WHERE is_lifetime = 0
               AND status IN ('active', 'inactive')
               AND expires_at IS NOT NULL
               AND expires_at <= ?1",
            params![now],
        )?;
        Ok(changed)
    }
}

impl DeviceRepo for SqliteStore {
    fn get_device(&self, device_id: &DeviceId) -> StoreResult<Option<Device>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE device_id = ?1");
        let raw = self
            .conn()
            .query_row(&sql, params![device_id.as_str()], RawDevice::from_row)
            .optional()?;
        raw.map(RawDevice::into_device).transpose()
    }

    fn insert_device(&self, device: &Device) -> StoreResult<InsertOutcome> {
        let result = self.conn().execute(
            "INSERT INTO devices (id, customer_id, device_id, name, platform, last_seen_at,
                entitlement_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                device.id.to_string(),
                device.customer_id.to_string(),
                device.device_id.as_str(),
                device.name,
                device.platform.map(|p| p.as_str()),
                ts(device.last_seen_at),
                device.entitlement_id.map(|e| e.to_string()),
                ts(device.created_at),
            ],
        );
        insert_outcome(result)
    }

    fn touch_device(&self, device: &Device) -> StoreResult<()> {
        self.conn().execute(
            "UPDATE devices SET name = ?2, platform = ?3, last_seen_at = ?4 WHERE device_id = ?1",
            params![
                device.device_id.as_str(),
                device.name,
                device.platform.map(|p| p.as_str()),
                ts(device.last_seen_at),
            ],
        )?;
        Ok(())
    }

    fn bind_device(
        &self,
        device_id: &DeviceId,
        entitlement_id: &EntitlementId,
        max_devices: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<BindOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<Option<String>> = tx
            .query_row(
                "SELECT entitlement_id FROM devices WHERE device_id = ?1",
                params![device_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let entitlement = entitlement_id.to_string();
        match current {
            None => return Ok(BindOutcome::DeviceNotFound),
            Some(Some(bound)) if bound == entitlement => return Ok(BindOutcome::AlreadyBound),
            Some(_) => {}
        }
        let bound: u32 = tx.query_row(
            "SELECT COUNT(*) FROM devices WHERE entitlement_id = ?1",
            params![entitlement],
            |row| row.get(0),
        )?;
        if bound >= max_devices {
            return Ok(BindOutcome::LimitReached);
        }
        tx.execute(
            "UPDATE devices SET entitlement_id = ?2, last_seen_at = ?3 WHERE device_id = ?1",
            params![device_id.as_str(), entitlement, ts(now)],
        )?;
        tx.commit()?;
        Ok(BindOutcome::Bound)
    }

    fn unbind_device(
        &self,
        device_id: &DeviceId,
        entitlement_id: &EntitlementId,
    ) -> StoreResult<bool> {
        let changed = self.conn().execute(
            "UPDATE devices SET entitlement_id = NULL
             WHERE device_id = ?1 AND entitlement_id = ?2",
            params![device_id.as_str(), entitlement_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    fn count_bound(&self, entitlement_id: &EntitlementId) -> StoreResult<u32> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM devices WHERE entitlement_id = ?1",
            params![entitlement_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn list_devices_for_customer(&self, customer_id: &CustomerId) -> StoreResult<Vec<Device>> {
        let conn = self.conn();
        let sql =
            format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE customer_id = ?1 ORDER BY device_id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![customer_id.to_string()], RawDevice::from_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?.into_device()?);
        }
        Ok(result)
    }
}

impl DeviceIdentityRepo for SqliteStore {
    fn get_identity(&self, device_id: &DeviceId) -> StoreResult<Option<DeviceIdentity>> {
        let row: Option<(String, String, String)> = self
            .conn()
            .query_row(
                "SELECT device_id, public_key, created_at FROM device_identities
                 WHERE device_id = ?1",
                params![device_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        row.map(|(device_id, public_key, created_at)| {
            Ok(DeviceIdentity {
                device_id: DeviceId::new(device_id),
                public_key,
                created_at: parse_ts(&created_at)?,
            })
        })
        .transpose()
    }

    fn insert_identity(&self, identity: &DeviceIdentity) -> StoreResult<InsertOutcome> {
        let result = self.conn().execute(
            "INSERT INTO device_identities (device_id, public_key, created_at)
             VALUES (?1, ?2, ?3)",
            params![
                identity.device_id.as_str(),
                identity.public_key,
                ts(identity.created_at),
            ],
        );
        insert_outcome(result)
    }
}

impl PurchaseRepo for SqliteStore {
    fn find_purchase_by_session(&self, checkout_session_id: &str) -> StoreResult<Option<Purchase>> {
        type PurchaseRow = (
            String,
            String,
            String,
            String,
            Option<String>,
            Option<f64>,
            Option<String>,
            String,
        );
        let row: Option<PurchaseRow> = self
            .conn()
            .query_row(
                "SELECT id, customer_id, checkout_session_id, mode, price_id, amount, currency,
                    created_at
                 FROM purchases WHERE checkout_session_id = ?1",
                params![checkout_session_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                    ))
                },
            )
            .optional()?;
        row.map(
            |(id, customer_id, session, mode, price_id, amount, currency, created_at)| {
                Ok(Purchase {
                    id: PurchaseId::parse(&id).map_err(invalid)?,
                    customer_id: CustomerId::parse(&customer_id).map_err(invalid)?,
                    checkout_session_id: session,
                    mode: mode.parse()?,
                    price_id,
                    amount,
                    currency,
                    created_at: parse_ts(&created_at)?,
                })
            },
        )
        .transpose()
    }

    fn create_purchase_bundle(
        &self,
        purchase: &Purchase,
        license_key: &LicenseKey,
        entitlement: &Entitlement,
    ) -> StoreResult<InsertOutcome> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = tx.execute(
            "INSERT INTO purchases (id, customer_id, checkout_session_id, mode, price_id, amount,
                currency, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                purchase.id.to_string(),
                purchase.customer_id.to_string(),
                purchase.checkout_session_id,
                purchase.mode.as_str(),
                purchase.price_id,
                purchase.amount,
                purchase.currency,
                ts(purchase.created_at),
            ],
        );
        if insert_outcome(inserted)? == InsertOutcome::Duplicate {
            return Ok(InsertOutcome::Duplicate);
        }
        Self::insert_entitlement_row(&tx, entitlement)?;
        tx.execute(
            "INSERT INTO license_keys (id, purchase_id, entitlement_id, license_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                license_key.id.to_string(),
                license_key.purchase_id.to_string(),
                license_key.entitlement_id.to_string(),
                license_key.key,
                ts(license_key.created_at),
            ],
        )?;
        tx.commit()?;
        Ok(InsertOutcome::Inserted)
    }

    fn license_key_for_entitlement(
        &self,
        entitlement_id: &EntitlementId,
    ) -> StoreResult<Option<LicenseKey>> {
        let row: Option<(String, String, String, String, String)> = self
            .conn()
            .query_row(
                "SELECT id, purchase_id, entitlement_id, license_key, created_at
                 FROM license_keys WHERE entitlement_id = ?1",
                params![entitlement_id.to_string()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(id, purchase_id, entitlement_id, key, created_at)| {
            Ok(LicenseKey {
                id: LicenseKeyId::parse(&id).map_err(invalid)?,
                purchase_id: PurchaseId::parse(&purchase_id).map_err(invalid)?,
                entitlement_id: EntitlementId::parse(&entitlement_id).map_err(invalid)?,
                key,
                created_at: parse_ts(&created_at)?,
            })
        })
        .transpose()
    }
}

impl ReplayLedger for SqliteStore {
    fn record_use(&self, code_use: &OfflineCodeUse) -> StoreResult<InsertOutcome> {
        let result = self.conn().execute(
            "INSERT INTO offline_code_uses (jti, kind, customer_id, entitlement_id, device_id,
                used_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                code_use.jti,
                code_use.kind.as_str(),
                code_use.customer_id.to_string(),
                code_use.entitlement_id.to_string(),
                code_use.device_id.as_str(),
                ts(code_use.used_at),
                code_use.expires_at.map(ts),
            ],
        );
        insert_outcome(result)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let deleted = self.conn().execute(
            "DELETE FROM offline_code_uses WHERE expires_at IS NOT NULL AND expires_at < ?1",
            params![ts(now)],
        )?;
        Ok(deleted)
    }
}

impl BillingEventLedger for SqliteStore {
    fn is_processed(&self, event_id: &str) -> StoreResult<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM billing_events WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn record_processed(&self, event: &ProcessedEvent) -> StoreResult<InsertOutcome> {
        let result = self.conn().execute(
            "INSERT INTO billing_events (event_id, event_type, processed_at, event_created)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event.event_id,
                event.event_type,
                ts(event.processed_at),
                event.event_created,
            ],
        );
        insert_outcome(result)
    }
}

impl SqliteStore {
    /// Loads a recorded single-use code by `jti`.
    pub fn get_code_use(&self, jti: &str) -> StoreResult<Option<OfflineCodeUse>> {
        type UseRow = (String, String, String, String, String, String, Option<String>);
        let row: Option<UseRow> = self
            .conn()
            .query_row(
                "SELECT jti, kind, customer_id, entitlement_id, device_id, used_at, expires_at
                 FROM offline_code_uses WHERE jti = ?1",
                params![jti],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .optional()?;
        row.map(
            |(jti, kind, customer_id, entitlement_id, device_id, used_at, expires_at)| {
                Ok(OfflineCodeUse {
                    jti,
                    kind: kind.parse::<CodeKind>()?,
                    customer_id: CustomerId::parse(&customer_id).map_err(invalid)?,
                    entitlement_id: EntitlementId::parse(&entitlement_id).map_err(invalid)?,
                    device_id: DeviceId::new(device_id),
                    used_at: parse_ts(&used_at)?,
                    expires_at: expires_at.as_deref().map(parse_ts).transpose()?,
                })
            },
        )
        .transpose()
    }
}

// ── Row decoding ─────────────────────────────────────────────────

struct RawCustomer {
    id: String,
    email: Option<String>,
    provider_customer_id: Option<String>,
    created_at: String,
}

impl RawCustomer {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
            provider_customer_id: row.get(2)?,
            created_at: row.get(3)?,
        })
    }

    fn into_customer(self) -> StoreResult<Customer> {
        Ok(Customer {
            id: CustomerId::parse(&self.id).map_err(invalid)?,
            email: self.email,
            provider_customer_id: self.provider_customer_id,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

struct RawEntitlement {
    id: String,
    customer_id: String,
    tier: String,
    status: String,
    source: String,
    is_lifetime: bool,
    expires_at: Option<String>,
    current_period_end: Option<String>,
    cancel_at_period_end: bool,
    max_devices: u32,
    stripe_subscription_id: Option<String>,
    metadata: String,
    created_at: String,
    updated_at: String,
}

impl RawEntitlement {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            customer_id: row.get(1)?,
            tier: row.get(2)?,
            status: row.get(3)?,
            source: row.get(4)?,
            is_lifetime: row.get(5)?,
            expires_at: row.get(6)?,
            current_period_end: row.get(7)?,
            cancel_at_period_end: row.get(8)?,
            max_devices: row.get(9)?,
            stripe_subscription_id: row.get(10)?,
            metadata: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_entitlement(self) -> StoreResult<Entitlement> {
        if self.tier == LEGACY_FOUNDERS_TIER {
            return Err(StoreError::LegacyTier(self.id));
        }
        Ok(Entitlement {
            id: EntitlementId::parse(&self.id).map_err(invalid)?,
            customer_id: CustomerId::parse(&self.customer_id).map_err(invalid)?,
            tier: self.tier.parse()?,
            status: self.status.parse()?,
            source: self.source.parse()?,
            is_lifetime: self.is_lifetime,
            expires_at: self.expires_at.as_deref().map(parse_ts).transpose()?,
            current_period_end: self.current_period_end.as_deref().map(parse_ts).transpose()?,
            cancel_at_period_end: self.cancel_at_period_end,
            max_devices: self.max_devices,
            stripe_subscription_id: self.stripe_subscription_id,
            metadata: serde_json::from_str(&self.metadata)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct RawDevice {
    id: String,
    customer_id: String,
    device_id: String,
    name: Option<String>,
    platform: Option<String>,
    last_seen_at: String,
    entitlement_id: Option<String>,
    created_at: String,
}

impl RawDevice {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            customer_id: row.get(1)?,
            device_id: row.get(2)?,
            name: row.get(3)?,
            platform: row.get(4)?,
            last_seen_at: row.get(5)?,
            entitlement_id: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_device(self) -> StoreResult<Device> {
        Ok(Device {
            id: DeviceRecordId::parse(&self.id).map_err(invalid)?,
            customer_id: CustomerId::parse(&self.customer_id).map_err(invalid)?,
            device_id: DeviceId::new(self.device_id),
            name: self.name,
            platform: self.platform.as_deref().map(str::parse::<Platform>).transpose()?,
            last_seen_at: parse_ts(&self.last_seen_at)?,
            entitlement_id: self
                .entitlement_id
                .as_deref()
                .map(EntitlementId::parse)
                .transpose()
                .map_err(invalid)?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

// ── Helpers ──────────────────────────────────────────────────────

/// Fixed-width RFC 3339 so that text comparison orders chronologically.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("invalid timestamp {s:?}: {e}")))
}

fn invalid(err: impl std::fmt::Display) -> StoreError {
    StoreError::InvalidData(err.to_string())
}

fn insert_outcome(result: rusqlite::Result<usize>) -> StoreResult<InsertOutcome> {
    match result {
        Ok(_) => Ok(InsertOutcome::Inserted),
        Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::ConstraintViolation => {
            Ok(InsertOutcome::Duplicate)
        }
        Err(e) => Err(e.into()),
    }
}
