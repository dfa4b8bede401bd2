use chrono::{Duration, Utc};

use crate::allocator;
use crate::db;
use crate::ledger;
use crate::rotation;
use crate::AppState;

fn chrono_dur(d: std::time::Duration) -> Duration {
    Duration::milliseconds(d.as_millis() as i64)
}

/// Start the periodic jobs; each runs on its own interval for the life of
/// the process.
pub fn spawn_all(state: AppState) {
    let reconcile = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(reconcile.cfg.reconcile_interval);
        loop {
            interval.tick().await;
            reconcile_tick(&reconcile).await;
        }
    });

    let expiry = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(expiry.cfg.expiry_interval);
        loop {
            interval.tick().await;
            expiry_tick(&expiry).await;
        }
    });

    let alert = state;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(alert.cfg.alert_interval);
        loop {
            interval.tick().await;
            alert_tick(&alert).await;
        }
    });
}

/// One pass over the waiting queue, oldest request first: grant a
/// reservation where a matching port is free and arm its reclaim check.
/// Each attempt is its own transaction; per-request failures are logged and
/// the scan moves on.
pub async fn reconcile_tick(state: &AppState) {
    let pending = {
        let conn = state.store.lock();
        match ledger::pending_requests(&conn) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!("queue scan failed: {e}");
                return;
            }
        }
    };

    let grace = chrono_dur(state.cfg.reclaim_grace);
    for request in pending {
        let granted = {
            let mut conn = state.store.lock();
            allocator::allocate(
                &mut conn,
                request.id,
                &request.geo,
                request.ip_version,
                grace,
                true,
            )
        };
        match granted {
            Ok(Some(grant)) => {
                tracing::info!(
                    request_id = request.id,
                    lease_id = grant.lease_id,
                    port_id = grant.port.id,
                    "reservation granted from queue"
                );
                spawn_reclaim(state.clone(), grant.lease_id);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(request_id = request.id, "reservation attempt failed: {e}");
            }
        }
    }
}

/// Arm the one-shot check that reclaims a reservation never confirmed
/// within the grace window.
pub fn spawn_reclaim(state: AppState, lease_id: i64) {
    tokio::spawn(async move {
        tokio::time::sleep(state.cfg.reclaim_grace).await;
        reclaim_now(&state, lease_id).await;
    });
}

/// The reclaim check itself. Idempotent: a confirmed or already-closed
/// lease is left alone.
pub async fn reclaim_now(state: &AppState, lease_id: i64) {
    let reclaimed = {
        let mut conn = state.store.lock();
        allocator::reclaim_reservation(&mut conn, lease_id)
    };
    match reclaimed {
        Ok(true) => tracing::info!(lease_id, "reservation missed, port reclaimed"),
        Ok(false) => {}
        Err(e) => tracing::error!(lease_id, "reclaim check failed: {e}"),
    }
}

/// One expiry sweep: close out every hold past its deadline and release the
/// ports, rotating each exit address on the way out. Items are isolated;
/// one bad lease never stalls the rest.
pub async fn expiry_tick(state: &AppState) {
    let expired = {
        let conn = state.store.lock();
        match ledger::expired_port_leases(&conn, Utc::now()) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!("expiry scan failed: {e}");
                return;
            }
        }
    };

    for hold in expired {
        let flipped = {
            let mut conn = state.store.lock();
            ledger::mark_auto_finished(&mut conn, hold.lease_id)
        };
        match flipped {
            Ok(true) => tracing::info!(lease_id = hold.lease_id, "lease expired unattended"),
            Ok(false) => {}
            Err(e) => {
                tracing::error!(lease_id = hold.lease_id, "expiry transition failed: {e}");
            }
        }
        release_port(state, hold.port_id, hold.lease_id).await;
    }
}

/// Rotate a port being given back, then drop its holder row. The drop is
/// unconditional and always last; a failed rotation never leaves a port
/// stuck busy.
pub async fn release_port(state: &AppState, port_id: i64, lease_id: i64) {
    let port = {
        let conn = state.store.lock();
        db::port_by_id(&conn, port_id)
    };
    match port {
        Ok(Some(port)) => {
            if let Err(e) =
                rotation::rotate_and_refresh(&state.store, state.prober.clone(), &state.cfg, &port)
                    .await
            {
                tracing::warn!(port_id, lease_id, "rotation failed: {e}");
            }
        }
        Ok(None) => tracing::warn!(port_id, "released port no longer exists"),
        Err(e) => tracing::error!(port_id, "port lookup failed: {e}"),
    }

    let conn = state.store.lock();
    if let Err(e) = ledger::delete_port_lease(&conn, port_id) {
        tracing::error!(port_id, "failed to drop holder row: {e}");
    }
}

/// Rent-end sweep: one aggregate admin notice listing every active port
/// whose upstream rent runs out within the horizon.
pub async fn alert_tick(state: &AppState) {
    let horizon = Utc::now() + chrono_dur(state.cfg.alert_horizon);
    let due = {
        let conn = state.store.lock();
        match db::ports_with_rent_ending_by(&conn, horizon) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!("rent-end scan failed: {e}");
                return;
            }
        }
    };
    if due.is_empty() {
        return;
    }

    let lines: Vec<String> = due
        .iter()
        .map(|p| {
            let ends = p.rent_end.map(|t| t.to_rfc3339()).unwrap_or_default();
            format!(
                "rent for {}:{}:{} {} ends at {}",
                p.host, p.http_port, p.socks_port, p.login, ends
            )
        })
        .collect();
    state.notifier.notify_admin(&lines.join("\n")).await;
}
