use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result};

use crate::db::{now_ts, parse_ts, port_from_row, PortRow, PORT_COLS};

/// Queue entry lifecycle. MISSED, FINISHED and AUTO_FINISHED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Reserved,
    Served,
    Missed,
    Finished,
    AutoFinished,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Reserved => "RESERVED",
            RequestStatus::Served => "SERVED",
            RequestStatus::Missed => "MISSED",
            RequestStatus::Finished => "FINISHED",
            RequestStatus::AutoFinished => "AUTO_FINISHED",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "PENDING" => RequestStatus::Pending,
            "RESERVED" => RequestStatus::Reserved,
            "SERVED" => RequestStatus::Served,
            "MISSED" => RequestStatus::Missed,
            "AUTO_FINISHED" => RequestStatus::AutoFinished,
            _ => RequestStatus::Finished,
        }
    }
}

/// Grant lifecycle. Kept as its own enum; a request status value is never
/// written into a lease column or the other way around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Reserved,
    Served,
    Missed,
    Finished,
    AutoFinished,
}

impl LeaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LeaseStatus::Reserved => "RESERVED",
            LeaseStatus::Served => "SERVED",
            LeaseStatus::Missed => "MISSED",
            LeaseStatus::Finished => "FINISHED",
            LeaseStatus::AutoFinished => "AUTO_FINISHED",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "RESERVED" => LeaseStatus::Reserved,
            "SERVED" => LeaseStatus::Served,
            "MISSED" => LeaseStatus::Missed,
            "AUTO_FINISHED" => LeaseStatus::AutoFinished,
            _ => LeaseStatus::Finished,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestRow {
    pub id: i64,
    pub servername: String,
    pub geo: String,
    pub ip_version: u8,
    pub priority: u8,
    pub rent_time_seconds: u32,
    pub requester: Option<String>,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LeaseRow {
    pub id: i64,
    pub request_id: i64,
    pub ip_info_id: i64,
    pub status: LeaseStatus,
    pub rent_ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

const REQUEST_COLS: &str =
    "id, servername, geo, ip_version, priority, rent_time_seconds, requester, status, created_at";

fn request_from_row(row: &rusqlite::Row<'_>) -> Result<RequestRow> {
    Ok(RequestRow {
        id: row.get(0)?,
        servername: row.get(1)?,
        geo: row.get(2)?,
        ip_version: row.get(3)?,
        priority: row.get(4)?,
        rent_time_seconds: row.get(5)?,
        requester: row.get(6)?,
        status: RequestStatus::parse(&row.get::<_, String>(7)?),
        created_at: parse_ts(&row.get::<_, String>(8)?),
    })
}

const LEASE_COLS: &str = "id, request_id, ip_info_id, status, rent_ended_at, created_at";

fn lease_from_row(row: &rusqlite::Row<'_>) -> Result<LeaseRow> {
    Ok(LeaseRow {
        id: row.get(0)?,
        request_id: row.get(1)?,
        ip_info_id: row.get(2)?,
        status: LeaseStatus::parse(&row.get::<_, String>(3)?),
        rent_ended_at: row.get::<_, Option<String>>(4)?.map(|s| parse_ts(&s)),
        created_at: parse_ts(&row.get::<_, String>(5)?),
    })
}

pub fn insert_request(
    conn: &Connection,
    req: &common::PortRequest,
    requester: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO requests (servername, geo, ip_version, priority, rent_time_seconds, \
         requester, status, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            req.servername,
            req.geo,
            req.ip_version,
            req.priority,
            req.rent_time_seconds,
            requester,
            RequestStatus::Pending.as_str(),
            now_ts(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn request_by_id(conn: &Connection, id: i64) -> Result<Option<RequestRow>> {
    conn.query_row(
        &format!("SELECT {REQUEST_COLS} FROM requests WHERE id = ?1"),
        params![id],
        request_from_row,
    )
    .optional()
}

pub fn set_request_status(conn: &Connection, id: i64, status: RequestStatus) -> Result<()> {
    conn.execute(
        "UPDATE requests SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), now_ts(), id],
    )?;
    Ok(())
}

/// The newest request from the same requester with identical constraints
/// that is still in flight. Repeat polls attach to this row instead of
/// growing the queue.
pub fn find_duplicate(
    conn: &Connection,
    requester: Option<&str>,
    servername: &str,
    geo: &str,
    ip_version: u8,
) -> Result<Option<RequestRow>> {
    conn.query_row(
        &format!(
            "SELECT {REQUEST_COLS} FROM requests \
             WHERE requester IS ?1 AND servername = ?2 AND geo = ?3 AND ip_version = ?4 \
             AND status IN ('PENDING', 'RESERVED', 'SERVED') \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ),
        params![requester, servername, geo, ip_version],
        request_from_row,
    )
    .optional()
}

/// Waiting queue, oldest first; priority only breaks ties within one
/// creation instant.
pub fn pending_requests(conn: &Connection) -> Result<Vec<RequestRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {REQUEST_COLS} FROM requests WHERE status = 'PENDING' \
         ORDER BY created_at ASC, priority DESC"
    ))?;
    let rows = stmt.query_map([], request_from_row)?;
    rows.collect()
}

pub fn insert_lease(
    conn: &Connection,
    request_id: i64,
    ip_info_id: i64,
    status: LeaseStatus,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO leases (request_id, ip_info_id, status, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![request_id, ip_info_id, status.as_str(), now_ts()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn lease_by_id(conn: &Connection, id: i64) -> Result<Option<LeaseRow>> {
    conn.query_row(
        &format!("SELECT {LEASE_COLS} FROM leases WHERE id = ?1"),
        params![id],
        lease_from_row,
    )
    .optional()
}

/// Newest lease spawned by a request.
pub fn lease_for_request(conn: &Connection, request_id: i64) -> Result<Option<LeaseRow>> {
    conn.query_row(
        &format!(
            "SELECT {LEASE_COLS} FROM leases WHERE request_id = ?1 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ),
        params![request_id],
        lease_from_row,
    )
    .optional()
}

/// Close out a lease, stamping rent_ended_at, but only if it is still
/// active. Returns false when another path already moved it to a terminal
/// state.
pub fn finish_lease(conn: &Connection, id: i64, to: LeaseStatus) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE leases SET status = ?1, rent_ended_at = ?2, updated_at = ?2 \
         WHERE id = ?3 AND status IN ('RESERVED', 'SERVED')",
        params![to.as_str(), now_ts(), id],
    )?;
    Ok(rows > 0)
}

/// Explicit end: flip lease and request to FINISHED in one transaction.
/// False when the lease was already terminal.
pub fn mark_finished(conn: &mut Connection, lease_id: i64) -> Result<bool> {
    let tx = conn.transaction()?;
    let Some(lease) = lease_by_id(&tx, lease_id)? else {
        return Ok(false);
    };
    if !finish_lease(&tx, lease_id, LeaseStatus::Finished)? {
        return Ok(false);
    }
    set_request_status(&tx, lease.request_id, RequestStatus::Finished)?;
    tx.commit()?;
    Ok(true)
}

/// Expiry sweep: flip a still-active lease and its request to AUTO_FINISHED.
/// False when an explicit finish got there first; the caller still releases
/// the port either way.
pub fn mark_auto_finished(conn: &mut Connection, lease_id: i64) -> Result<bool> {
    let tx = conn.transaction()?;
    let Some(lease) = lease_by_id(&tx, lease_id)? else {
        return Ok(false);
    };
    if !finish_lease(&tx, lease_id, LeaseStatus::AutoFinished)? {
        return Ok(false);
    }
    tx.execute(
        "UPDATE requests SET status = 'AUTO_FINISHED', updated_at = ?1 \
         WHERE id = ?2 AND status IN ('PENDING', 'RESERVED', 'SERVED')",
        params![now_ts(), lease.request_id],
    )?;
    tx.commit()?;
    Ok(true)
}

/// A holder row past its deadline, due for the expiry sweep.
#[derive(Debug, Clone, Copy)]
pub struct ExpiredHold {
    pub port_id: i64,
    pub lease_id: i64,
}

pub fn expired_port_leases(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<ExpiredHold>> {
    let mut stmt = conn.prepare(
        "SELECT port_id, lease_id FROM port_leases WHERE end_at < ?1 ORDER BY end_at ASC",
    )?;
    let rows = stmt.query_map(params![crate::db::ts(now)], |row| {
        Ok(ExpiredHold {
            port_id: row.get(0)?,
            lease_id: row.get(1)?,
        })
    })?;
    rows.collect()
}

/// When the lease still holds its port, the hold deadline; None once released.
pub fn hold_deadline(conn: &Connection, lease_id: i64) -> Result<Option<DateTime<Utc>>> {
    let end: Option<String> = conn
        .query_row(
            "SELECT end_at FROM port_leases WHERE lease_id = ?1",
            params![lease_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(end.map(|s| parse_ts(&s)))
}

/// The port a lease was granted on, reached through the exit-IP row the
/// lease was created with.
pub fn port_for_lease(conn: &Connection, lease_id: i64) -> Result<Option<PortRow>> {
    conn.query_row(
        &format!(
            "SELECT {PORT_COLS} FROM leases l \
             JOIN ip_info i ON i.id = l.ip_info_id \
             JOIN ports p ON p.id = i.port_id \
             JOIN geos g ON g.id = p.geo_id \
             WHERE l.id = ?1"
        ),
        params![lease_id],
        port_from_row,
    )
    .optional()
}

/// Drop the holder row, making the port claimable again.
pub fn delete_port_lease(conn: &Connection, port_id: i64) -> Result<bool> {
    let rows = conn.execute(
        "DELETE FROM port_leases WHERE port_id = ?1",
        params![port_id],
    )?;
    Ok(rows > 0)
}

pub fn delete_port_lease_by_lease(conn: &Connection, lease_id: i64) -> Result<bool> {
    let rows = conn.execute(
        "DELETE FROM port_leases WHERE lease_id = ?1",
        params![lease_id],
    )?;
    Ok(rows > 0)
}
