//! The edge agent's persistent store: `services` and `addresses`.
//!
//! # Thread Safety
//!
//! `rusqlite::Connection` is `!Send`. The Reconciler owns a `Database`
//! directly on its single-threaded event-processing task; callers that need
//! it from async code route through `tokio::task::spawn_blocking`.
//!
//! # Why SQLite?
//!
//! Zero configuration, single-file, and with the `bundled` feature rusqlite
//! compiles SQLite from source so no system library is required — a good
//! fit for a small durable table set that only ever has one writer.

use crate::types::{AddressKey, IpVersion, ServiceKey, ServiceRecord};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during store operations. Per the design notes, a
/// duplicate primary-key insert on `services` is treated as success (the
/// SQLite analog of the source's tolerated MySQL 1062) and never reaches
/// this type; every other SQLite failure is fatal to the Reconciler.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid data in store: {0}")]
    InvalidData(String),
}

/// The store handle wrapping a SQLite connection, implementing the
/// `services`/`addresses` schema.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens (or creates) a database at the given path and runs migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Opens an in-memory database (used in tests).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS services (
                iface_name TEXT NOT NULL,
                iface_ip   INTEGER NOT NULL,
                name       TEXT NOT NULL,
                type       TEXT NOT NULL,
                hostname   TEXT,
                port       INTEGER,
                txt        BLOB,
                resolved   INTEGER NOT NULL DEFAULT 0,
                announced  INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (iface_name, iface_ip, name, type)
            );

            CREATE TABLE IF NOT EXISTS addresses (
                iface_name TEXT NOT NULL,
                iface_ip   INTEGER NOT NULL,
                hostname   TEXT NOT NULL,
                ip         INTEGER NOT NULL,
                address    TEXT NOT NULL,
                PRIMARY KEY (iface_name, iface_ip, hostname, ip, address)
            );

            CREATE INDEX IF NOT EXISTS idx_services_hostname
                ON services(hostname);
            CREATE INDEX IF NOT EXISTS idx_addresses_hostname
                ON addresses(iface_name, iface_ip, hostname);
            ",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // services
    // -----------------------------------------------------------------------

    /// Inserts a fresh, unresolved/unannounced service row for `key`. A
    /// duplicate-key insert is a no-op, not an error — mirrors the
    /// "duplicate-key insertions are no-ops" design decision.
    pub fn insert_service(&self, key: &ServiceKey) -> Result<(), StoreError> {
        let rows = self.conn.execute(
            "INSERT OR IGNORE INTO services
                (iface_name, iface_ip, name, type, resolved, announced)
             VALUES (?1, ?2, ?3, ?4, 0, 0)",
            params![key.iface_name, key.iface_ipver.as_u8(), key.name, key.stype],
        )?;
        let _ = rows; // 0 rows affected means it already existed — still a no-op success
        Ok(())
    }

    /// Reads a single service row, if present.
    pub fn get_service(&self, key: &ServiceKey) -> Result<Option<ServiceRecord>, StoreError> {
        self.conn
            .query_row(
                "SELECT hostname, port, txt, resolved, announced FROM services
                 WHERE iface_name = ?1 AND iface_ip = ?2 AND name = ?3 AND type = ?4",
                params![key.iface_name, key.iface_ipver.as_u8(), key.name, key.stype],
                |row| {
                    Ok(ServiceRecord {
                        key: key.clone(),
                        hostname: row.get(0)?,
                        port: row.get::<_, Option<i64>>(1)?.map(|p| p as u16),
                        txt: row.get(2)?,
                        resolved: row.get::<_, i64>(3)? != 0,
                        announced: row.get::<_, i64>(4)? != 0,
                    })
                },
            )
            .optional()
            .map_err(StoreError::from)
    }

    /// Writes the resolved `(hostname, port, txt)` fields and the
    /// `resolved`/`announced` flags for an existing service row.
    pub fn update_service(
        &self,
        key: &ServiceKey,
        hostname: Option<&str>,
        port: Option<u16>,
        txt: Option<&[u8]>,
        resolved: bool,
        announced: bool,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE services SET hostname = ?5, port = ?6, txt = ?7, resolved = ?8, announced = ?9
             WHERE iface_name = ?1 AND iface_ip = ?2 AND name = ?3 AND type = ?4",
            params![
                key.iface_name,
                key.iface_ipver.as_u8(),
                key.name,
                key.stype,
                hostname,
                port.map(|p| p as i64),
                txt,
                resolved as i64,
                announced as i64,
            ],
        )?;
        Ok(())
    }

    /// Sets only the `resolved`/`announced` flags, leaving host/port/txt
    /// untouched.
    pub fn set_service_flags(
        &self,
        key: &ServiceKey,
        resolved: bool,
        announced: bool,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE services SET resolved = ?5, announced = ?6
             WHERE iface_name = ?1 AND iface_ip = ?2 AND name = ?3 AND type = ?4",
            params![
                key.iface_name,
                key.iface_ipver.as_u8(),
                key.name,
                key.stype,
                resolved as i64,
                announced as i64,
            ],
        )?;
        Ok(())
    }

    /// Removes a service row. Returns `Ok(())` even if no such row exists.
    pub fn delete_service(&self, key: &ServiceKey) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM services WHERE iface_name = ?1 AND iface_ip = ?2 AND name = ?3 AND type = ?4",
            params![key.iface_name, key.iface_ipver.as_u8(), key.name, key.stype],
        )?;
        Ok(())
    }

    /// All services currently targeting the given hostname (on any
    /// interface/version), used by address-change handlers.
    pub fn services_for_hostname(&self, hostname: &str) -> Result<Vec<ServiceRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT iface_name, iface_ip, name, type, hostname, port, txt, resolved, announced
             FROM services WHERE hostname = ?1",
        )?;
        let rows = stmt
            .query_map(params![hostname], |row| {
                let iface_ip: i64 = row.get(1)?;
                Ok(ServiceRecord {
                    key: ServiceKey {
                        iface_name: row.get(0)?,
                        iface_ipver: IpVersion::from_u8(iface_ip as u8).unwrap_or(IpVersion::V4),
                        name: row.get(2)?,
                        stype: row.get(3)?,
                    },
                    hostname: row.get(4)?,
                    port: row.get::<_, Option<i64>>(5)?.map(|p| p as u16),
                    txt: row.get(6)?,
                    resolved: row.get::<_, i64>(7)? != 0,
                    announced: row.get::<_, i64>(8)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// T-count: number of *announced* services of the given type.
    pub fn announced_count_for_type(&self, stype: &str) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM services WHERE type = ?1 AND announced = 1",
            params![stype],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// H-count: number of *announced* services of the given hostname.
    pub fn announced_count_for_hostname(&self, hostname: &str) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM services WHERE hostname = ?1 AND announced = 1",
            params![hostname],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// A-count: number of services (announced or not) of the given
    /// hostname.
    pub fn total_count_for_hostname(&self, hostname: &str) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM services WHERE hostname = ?1",
            params![hostname],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // -----------------------------------------------------------------------
    // addresses
    // -----------------------------------------------------------------------

    /// Inserts an address row. A duplicate-key insert is a no-op.
    pub fn insert_address(&self, key: &AddressKey) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO addresses (iface_name, iface_ip, hostname, ip, address)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                key.iface_name,
                key.iface_ipver.as_u8(),
                key.hostname,
                key.addr_ipver.as_u8(),
                key.address.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Removes an address row. Returns `Ok(())` even if no such row exists.
    pub fn delete_address(&self, key: &AddressKey) -> Result<(), StoreError> {
        self.conn.execute(
            "DELETE FROM addresses
             WHERE iface_name = ?1 AND iface_ip = ?2 AND hostname = ?3 AND ip = ?4 AND address = ?5",
            params![
                key.iface_name,
                key.iface_ipver.as_u8(),
                key.hostname,
                key.addr_ipver.as_u8(),
                key.address.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Removes every address row for the given hostname, regardless of
    /// interface/version — used when a host's total service count drops
    /// to zero.
    pub fn delete_addresses_for_hostname(&self, hostname: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM addresses WHERE hostname = ?1", params![hostname])?;
        Ok(())
    }

    /// All currently-known addresses for a hostname.
    pub fn addresses_for_hostname(&self, hostname: &str) -> Result<Vec<AddressKey>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT iface_name, iface_ip, hostname, ip, address FROM addresses WHERE hostname = ?1",
        )?;
        let rows = stmt
            .query_map(params![hostname], |row| {
                let iface_ip: i64 = row.get(1)?;
                let addr_ip: i64 = row.get(3)?;
                let address_str: String = row.get(4)?;
                Ok((iface_ip, addr_ip, address_str, row.get::<_, String>(0)?, row.get::<_, String>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(iface_ip, addr_ip, address_str, iface_name, hostname)| {
                let address = address_str
                    .parse()
                    .map_err(|_| StoreError::InvalidData(format!("bad address in store: {address_str}")))?;
                Ok(AddressKey {
                    iface_name,
                    iface_ipver: IpVersion::from_u8(iface_ip as u8).unwrap_or(IpVersion::V4),
                    hostname,
                    addr_ipver: IpVersion::from_u8(addr_ip as u8).unwrap_or(IpVersion::V4),
                    address,
                })
            })
            .collect()
    }

    /// Total remaining address count for a hostname (used by
    /// `AddressGone` to decide whether to tear the service back down).
    pub fn address_count_for_hostname(&self, hostname: &str) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM addresses WHERE hostname = ?1",
            params![hostname],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("failed to create test database")
    }

    fn key(iface: &str, name: &str, stype: &str) -> ServiceKey {
        ServiceKey::new(iface, IpVersion::V4, name, stype)
    }

    #[test]
    fn insert_and_get_service() {
        let db = test_db();
        let k = key("eth0", "WebServer", "_http._tcp");
        db.insert_service(&k).unwrap();
        let row = db.get_service(&k).unwrap().unwrap();
        assert!(!row.resolved);
        assert!(!row.announced);
        assert_eq!(row.hostname, None);
    }

    #[test]
    fn duplicate_insert_is_noop() {
        let db = test_db();
        let k = key("eth0", "WebServer", "_http._tcp");
        db.insert_service(&k).unwrap();
        db.update_service(&k, Some("laptop-eth0-v4"), Some(80), None, true, true)
            .unwrap();
        db.insert_service(&k).unwrap();
        let row = db.get_service(&k).unwrap().unwrap();
        // second insert must not have reset the already-resolved row
        assert!(row.announced);
        assert_eq!(row.hostname.as_deref(), Some("laptop-eth0-v4"));
    }

    #[test]
    fn update_service_roundtrip() {
        let db = test_db();
        let k = key("eth0", "WebServer", "_http._tcp");
        db.insert_service(&k).unwrap();
        db.update_service(&k, Some("host-eth0-v4"), Some(8080), Some(b"path=/x"), true, true)
            .unwrap();
        let row = db.get_service(&k).unwrap().unwrap();
        assert_eq!(row.hostname.as_deref(), Some("host-eth0-v4"));
        assert_eq!(row.port, Some(8080));
        assert_eq!(row.txt.as_deref(), Some(&b"path=/x"[..]));
        assert!(row.resolved);
        assert!(row.announced);
    }

    #[test]
    fn delete_service_removes_row() {
        let db = test_db();
        let k = key("eth0", "WebServer", "_http._tcp");
        db.insert_service(&k).unwrap();
        db.delete_service(&k).unwrap();
        assert!(db.get_service(&k).unwrap().is_none());
    }

    #[test]
    fn t_count_counts_only_announced() {
        let db = test_db();
        let a = key("eth0", "Web1", "_http._tcp");
        let b = key("eth0", "Web2", "_http._tcp");
        db.insert_service(&a).unwrap();
        db.insert_service(&b).unwrap();
        db.update_service(&a, Some("h1"), Some(80), None, true, true).unwrap();
        assert_eq!(db.announced_count_for_type("_http._tcp").unwrap(), 1);
        db.update_service(&b, Some("h2"), Some(81), None, true, true).unwrap();
        assert_eq!(db.announced_count_for_type("_http._tcp").unwrap(), 2);
    }

    #[test]
    fn h_count_and_a_count_distinguish_announced() {
        let db = test_db();
        let a = key("eth0", "Web1", "_http._tcp");
        let b = key("eth0", "Web2", "_ssh._tcp");
        db.insert_service(&a).unwrap();
        db.insert_service(&b).unwrap();
        db.update_service(&a, Some("shared-host"), Some(80), None, true, true)
            .unwrap();
        db.update_service(&b, Some("shared-host"), Some(22), None, true, false)
            .unwrap();
        assert_eq!(db.announced_count_for_hostname("shared-host").unwrap(), 1);
        assert_eq!(db.total_count_for_hostname("shared-host").unwrap(), 2);
    }

    #[test]
    fn address_insert_delete_and_count() {
        let db = test_db();
        let addr_key = AddressKey {
            iface_name: "eth0".to_string(),
            iface_ipver: IpVersion::V4,
            hostname: "laptop.local".to_string(),
            addr_ipver: IpVersion::V4,
            address: "203.0.113.7".parse().unwrap(),
        };
        db.insert_address(&addr_key).unwrap();
        assert_eq!(db.address_count_for_hostname("laptop.local").unwrap(), 1);
        let addresses = db.addresses_for_hostname("laptop.local").unwrap();
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].address, addr_key.address);
        db.delete_address(&addr_key).unwrap();
        assert_eq!(db.address_count_for_hostname("laptop.local").unwrap(), 0);
    }

    #[test]
    fn delete_addresses_for_hostname_clears_all_versions() {
        let db = test_db();
        let v4 = AddressKey {
            iface_name: "eth0".to_string(),
            iface_ipver: IpVersion::V4,
            hostname: "laptop.local".to_string(),
            addr_ipver: IpVersion::V4,
            address: "203.0.113.7".parse().unwrap(),
        };
        let v6 = AddressKey {
            iface_name: "eth0".to_string(),
            iface_ipver: IpVersion::V4,
            hostname: "laptop.local".to_string(),
            addr_ipver: IpVersion::V6,
            address: "2001:db8::1".parse().unwrap(),
        };
        db.insert_address(&v4).unwrap();
        db.insert_address(&v6).unwrap();
        db.delete_addresses_for_hostname("laptop.local").unwrap();
        assert_eq!(db.address_count_for_hostname("laptop.local").unwrap(), 0);
    }

    #[test]
    fn services_for_hostname_finds_all_matches() {
        let db = test_db();
        let a = key("eth0", "Web1", "_http._tcp");
        let b = key("eth0", "Web2", "_ssh._tcp");
        db.insert_service(&a).unwrap();
        db.insert_service(&b).unwrap();
        db.update_service(&a, Some("shared-host"), Some(80), None, false, false)
            .unwrap();
        db.update_service(&b, Some("shared-host"), Some(22), None, false, false)
            .unwrap();
        let services = db.services_for_hostname("shared-host").unwrap();
        assert_eq!(services.len(), 2);
    }
}
