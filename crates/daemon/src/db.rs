use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS geos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS operators (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS cities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    city TEXT NOT NULL,
    region TEXT NOT NULL DEFAULT '',
    UNIQUE(city, region)
);

CREATE TABLE IF NOT EXISTS ports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    host TEXT NOT NULL,
    socks_port INTEGER NOT NULL DEFAULT 0,
    http_port INTEGER NOT NULL DEFAULT 0,
    login TEXT NOT NULL DEFAULT '',
    password TEXT NOT NULL DEFAULT '',
    geo_id INTEGER NOT NULL REFERENCES geos(id),
    ip_version INTEGER NOT NULL DEFAULT 4,
    is_active INTEGER NOT NULL DEFAULT 1,
    rotation_link TEXT,
    rent_end TEXT,
    UNIQUE(host, socks_port, http_port)
);

CREATE TABLE IF NOT EXISTS ip_info (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    port_id INTEGER NOT NULL REFERENCES ports(id),
    ip TEXT NOT NULL,
    ip_version INTEGER NOT NULL DEFAULT 4,
    operator_id INTEGER REFERENCES operators(id),
    city_id INTEGER REFERENCES cities(id),
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS requests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    servername TEXT NOT NULL,
    geo TEXT NOT NULL,
    ip_version INTEGER NOT NULL DEFAULT 0,
    priority INTEGER NOT NULL DEFAULT 5,
    rent_time_seconds INTEGER NOT NULL,
    requester TEXT,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS leases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id INTEGER NOT NULL REFERENCES requests(id),
    ip_info_id INTEGER NOT NULL REFERENCES ip_info(id),
    status TEXT NOT NULL,
    rent_ended_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS port_leases (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    port_id INTEGER NOT NULL UNIQUE REFERENCES ports(id),
    lease_id INTEGER NOT NULL UNIQUE REFERENCES leases(id),
    end_at TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_requests_queue ON requests(status, created_at);
CREATE INDEX IF NOT EXISTS idx_leases_parent ON leases(request_id);
CREATE INDEX IF NOT EXISTS idx_ip_info_port ON ip_info(port_id, created_at);
CREATE INDEX IF NOT EXISTS idx_port_leases_end ON port_leases(end_at);
"#;

/// Initialize the database at the given path, creating the directory if needed.
pub fn init_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok();
    }

    let conn = Connection::open(path)?;
    // journal_mode returns a row, so it cannot go through execute_batch
    conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Shared handle to the single connection; every read and write serializes
/// on it, which is what makes the guarded claim statements authoritative.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = init_db(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }
}

/// Fixed-width RFC3339 with microseconds, so string comparison in SQL
/// matches chronological order.
pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn now_ts() -> String {
    ts(Utc::now())
}

pub fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// A proxy endpoint as stored, with its geo name joined in.
#[derive(Debug, Clone)]
pub struct PortRow {
    pub id: i64,
    pub host: String,
    pub socks_port: u16,
    pub http_port: u16,
    pub login: String,
    pub password: String,
    pub geo: String,
    pub ip_version: u8,
    pub is_active: bool,
    pub rotation_link: Option<String>,
    pub rent_end: Option<DateTime<Utc>>,
}

impl PortRow {
    /// Wire shape; a stored 0 or empty string means the field is not offered.
    pub fn endpoint(&self) -> common::PortEndpoint {
        common::PortEndpoint {
            host: self.host.clone(),
            socks_port: (self.socks_port != 0).then_some(self.socks_port),
            http_port: (self.http_port != 0).then_some(self.http_port),
            login: (!self.login.is_empty()).then(|| self.login.clone()),
            password: (!self.password.is_empty()).then(|| self.password.clone()),
        }
    }
}

pub const PORT_COLS: &str = "p.id, p.host, p.socks_port, p.http_port, p.login, p.password, \
     g.name, p.ip_version, p.is_active, p.rotation_link, p.rent_end";

pub fn port_from_row(row: &rusqlite::Row<'_>) -> Result<PortRow> {
    Ok(PortRow {
        id: row.get(0)?,
        host: row.get(1)?,
        socks_port: row.get(2)?,
        http_port: row.get(3)?,
        login: row.get(4)?,
        password: row.get(5)?,
        geo: row.get(6)?,
        ip_version: row.get(7)?,
        is_active: row.get::<_, i64>(8)? != 0,
        rotation_link: row.get(9)?,
        rent_end: row.get::<_, Option<String>>(10)?.map(|s| parse_ts(&s)),
    })
}

pub fn upsert_geo(conn: &Connection, name: &str) -> Result<i64> {
    conn.execute("INSERT OR IGNORE INTO geos (name) VALUES (?1)", params![name])?;
    conn.query_row("SELECT id FROM geos WHERE name = ?1", params![name], |row| {
        row.get(0)
    })
}

pub fn upsert_operator(conn: &Connection, name: &str) -> Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO operators (name) VALUES (?1)",
        params![name],
    )?;
    conn.query_row(
        "SELECT id FROM operators WHERE name = ?1",
        params![name],
        |row| row.get(0),
    )
}

pub fn upsert_city(conn: &Connection, city: &str, region: Option<&str>) -> Result<i64> {
    let region = region.unwrap_or("");
    conn.execute(
        "INSERT OR IGNORE INTO cities (city, region) VALUES (?1, ?2)",
        params![city, region],
    )?;
    conn.query_row(
        "SELECT id FROM cities WHERE city = ?1 AND region = ?2",
        params![city, region],
        |row| row.get(0),
    )
}

/// Catalog entry as it arrives from the seed file.
#[derive(Debug, Clone)]
pub struct NewPort {
    pub host: String,
    pub socks_port: u16,
    pub http_port: u16,
    pub login: String,
    pub password: String,
    pub geo: String,
    pub ip_version: u8,
    pub active: bool,
    pub rotation_link: Option<String>,
    pub rent_end: Option<DateTime<Utc>>,
}

/// Insert a port, or refresh the mutable columns of the one already at this
/// endpoint (natural key: host, socks_port, http_port).
pub fn upsert_port(conn: &Connection, port: &NewPort) -> Result<i64> {
    let geo_id = upsert_geo(conn, &port.geo)?;
    let rent_end = port.rent_end.map(ts);

    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM ports WHERE host = ?1 AND socks_port = ?2 AND http_port = ?3",
            params![port.host, port.socks_port, port.http_port],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(id) = existing {
        conn.execute(
            "UPDATE ports SET login = ?1, password = ?2, geo_id = ?3, ip_version = ?4, \
             is_active = ?5, rotation_link = ?6, rent_end = ?7 WHERE id = ?8",
            params![
                port.login,
                port.password,
                geo_id,
                port.ip_version,
                port.active,
                port.rotation_link,
                rent_end,
                id
            ],
        )?;
        Ok(id)
    } else {
        conn.execute(
            "INSERT INTO ports (host, socks_port, http_port, login, password, geo_id, \
             ip_version, is_active, rotation_link, rent_end) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                port.host,
                port.socks_port,
                port.http_port,
                port.login,
                port.password,
                geo_id,
                port.ip_version,
                port.active,
                port.rotation_link,
                rent_end
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

pub fn port_by_id(conn: &Connection, id: i64) -> Result<Option<PortRow>> {
    conn.query_row(
        &format!("SELECT {PORT_COLS} FROM ports p JOIN geos g ON g.id = p.geo_id WHERE p.id = ?1"),
        params![id],
        port_from_row,
    )
    .optional()
}

/// Id of the most recent cached exit-IP row for a port, if any.
pub fn latest_ip_info_id(conn: &Connection, port_id: i64) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT id FROM ip_info WHERE port_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 1",
        params![port_id],
        |row| row.get(0),
    )
    .optional()
}

/// Record the exit address a port currently presents. Operator and city are
/// linked when the geo lookup had them, a bare ip row otherwise.
pub fn insert_ip_info(
    conn: &Connection,
    port_id: i64,
    ip: &str,
    ip_version: u8,
    operator: Option<&str>,
    city: Option<&str>,
    region: Option<&str>,
) -> Result<i64> {
    let operator_id = operator.map(|o| upsert_operator(conn, o)).transpose()?;
    let city_id = city.map(|c| upsert_city(conn, c, region)).transpose()?;
    conn.execute(
        "INSERT INTO ip_info (port_id, ip, ip_version, operator_id, city_id, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![port_id, ip, ip_version, operator_id, city_id, now_ts()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Active ports that have never had an exit address recorded.
pub fn active_ports_missing_ip_info(conn: &Connection) -> Result<Vec<PortRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PORT_COLS} FROM ports p JOIN geos g ON g.id = p.geo_id \
         WHERE p.is_active = 1 \
         AND NOT EXISTS (SELECT 1 FROM ip_info i WHERE i.port_id = p.id)"
    ))?;
    let rows = stmt.query_map([], port_from_row)?;
    rows.collect()
}

/// Active ports whose upstream rent runs out by the given deadline.
pub fn ports_with_rent_ending_by(
    conn: &Connection,
    deadline: DateTime<Utc>,
) -> Result<Vec<PortRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PORT_COLS} FROM ports p JOIN geos g ON g.id = p.geo_id \
         WHERE p.is_active = 1 AND p.rent_end IS NOT NULL AND p.rent_end <= ?1 \
         ORDER BY p.rent_end ASC"
    ))?;
    let rows = stmt.query_map(params![ts(deadline)], port_from_row)?;
    rows.collect()
}

/// Geos that currently have at least one active port.
pub fn list_geo_names(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT g.name FROM geos g JOIN ports p ON p.geo_id = g.id \
         WHERE p.is_active = 1 ORDER BY g.name",
    )?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}
