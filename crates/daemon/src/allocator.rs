use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result};

use crate::db::{latest_ip_info_id, now_ts, port_from_row, ts, PortRow, PORT_COLS};
use crate::ledger::{self, LeaseStatus, RequestStatus};

/// A successful claim: the port, the lease row backing it, and the hold deadline.
#[derive(Debug, Clone)]
pub struct Grant {
    pub port: PortRow,
    pub lease_id: i64,
    pub expires_at: DateTime<Utc>,
}

/// Try to claim one free port matching the request's constraints.
///
/// Candidates must be active, in the requested geo, on the requested ip
/// version (0 matches any), and carry cached exit-IP metadata. The guarded
/// insert into port_leases is the claim itself: zero rows affected means
/// another holder won that port, so it is skipped and the next candidate
/// tried. With `reserve` the grant starts as a reservation to be confirmed
/// by the consumer's next poll; otherwise it is served outright.
pub fn allocate(
    conn: &mut Connection,
    request_id: i64,
    geo: &str,
    ip_version: u8,
    hold: Duration,
    reserve: bool,
) -> Result<Option<Grant>> {
    let mut tx = conn.transaction()?;

    let candidates: Vec<PortRow> = {
        let mut stmt = tx.prepare(&format!(
            "SELECT {PORT_COLS} FROM ports p JOIN geos g ON g.id = p.geo_id \
             WHERE p.is_active = 1 AND g.name = ?1 \
             AND (?2 = 0 OR p.ip_version = ?2) \
             AND EXISTS (SELECT 1 FROM ip_info i WHERE i.port_id = p.id) \
             AND NOT EXISTS (SELECT 1 FROM port_leases h WHERE h.port_id = p.id) \
             ORDER BY p.id ASC"
        ))?;
        let rows = stmt.query_map(params![geo, ip_version], port_from_row)?;
        rows.collect::<Result<_>>()?
    };

    for port in candidates {
        let Some(ip_info_id) = latest_ip_info_id(&tx, port.id)? else {
            continue;
        };
        let now = Utc::now();
        let end = now + hold;
        let lease_status = if reserve {
            LeaseStatus::Reserved
        } else {
            LeaseStatus::Served
        };

        let sp = tx.savepoint()?;
        let lease_id = ledger::insert_lease(&sp, request_id, ip_info_id, lease_status)?;
        let claimed = sp.execute(
            "INSERT INTO port_leases (port_id, lease_id, end_at, created_at) \
             SELECT ?1, ?2, ?3, ?4 \
             WHERE NOT EXISTS (SELECT 1 FROM port_leases WHERE port_id = ?1)",
            params![port.id, lease_id, ts(end), ts(now)],
        )?;
        if claimed == 0 {
            // Savepoint drop rolls the lease row back.
            continue;
        }
        sp.commit()?;

        let request_status = if reserve {
            RequestStatus::Reserved
        } else {
            RequestStatus::Served
        };
        ledger::set_request_status(&tx, request_id, request_status)?;
        tx.commit()?;

        return Ok(Some(Grant {
            port,
            lease_id,
            expires_at: end,
        }));
    }

    Ok(None)
}

/// Confirm a reservation: extend the hold to the full rent window and flip
/// lease and request to SERVED. The conditional update on the holder row is
/// the claim; zero rows means the reservation was already reclaimed and the
/// caller gets nothing.
pub fn renew(conn: &mut Connection, lease_id: i64, rent_time: Duration) -> Result<Option<Grant>> {
    let tx = conn.transaction()?;
    let now = Utc::now();
    let end = now + rent_time;

    let claimed = tx.execute(
        "UPDATE port_leases SET end_at = ?1 WHERE lease_id = ?2 \
         AND EXISTS (SELECT 1 FROM leases WHERE id = ?2 AND status = 'RESERVED')",
        params![ts(end), lease_id],
    )?;
    if claimed == 0 {
        return Ok(None);
    }

    tx.execute(
        "UPDATE leases SET status = 'SERVED', updated_at = ?1 WHERE id = ?2",
        params![now_ts(), lease_id],
    )?;
    let Some(lease) = ledger::lease_by_id(&tx, lease_id)? else {
        return Ok(None);
    };
    ledger::set_request_status(&tx, lease.request_id, RequestStatus::Served)?;
    let Some(port) = ledger::port_for_lease(&tx, lease_id)? else {
        return Ok(None);
    };
    tx.commit()?;

    Ok(Some(Grant {
        port,
        lease_id,
        expires_at: end,
    }))
}

/// The live grant behind an already-served request, re-sent as-is to a
/// duplicate poll. Reports nothing once the hold was released.
pub fn active_grant(conn: &Connection, lease_id: i64) -> Result<Option<Grant>> {
    let Some(lease) = ledger::lease_by_id(conn, lease_id)? else {
        return Ok(None);
    };
    if lease.status != LeaseStatus::Served {
        return Ok(None);
    }
    let Some(expires_at) = ledger::hold_deadline(conn, lease_id)? else {
        return Ok(None);
    };
    let Some(port) = ledger::port_for_lease(conn, lease_id)? else {
        return Ok(None);
    };
    Ok(Some(Grant {
        port,
        lease_id,
        expires_at,
    }))
}

/// Take back a reservation that was never confirmed, freeing the port ahead
/// of its nominal term. No-op when the consumer confirmed (or something else
/// closed the lease) in the meantime.
pub fn reclaim_reservation(conn: &mut Connection, lease_id: i64) -> Result<bool> {
    let tx = conn.transaction()?;
    let flipped = tx.execute(
        "UPDATE leases SET status = 'MISSED', updated_at = ?1 \
         WHERE id = ?2 AND status = 'RESERVED'",
        params![now_ts(), lease_id],
    )?;
    if flipped == 0 {
        return Ok(false);
    }
    let Some(lease) = ledger::lease_by_id(&tx, lease_id)? else {
        return Ok(false);
    };
    ledger::set_request_status(&tx, lease.request_id, RequestStatus::Missed)?;
    ledger::delete_port_lease_by_lease(&tx, lease_id)?;
    tx.commit()?;
    Ok(true)
}

/// True when the port currently has a holder row.
pub fn port_is_held(conn: &Connection, port_id: i64) -> Result<bool> {
    let held: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM port_leases WHERE port_id = ?1",
            params![port_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(held.is_some())
}
