use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Duration;
use tower_http::cors::CorsLayer;

use common::{Ack, EndPortRequest, GeosReply, PortGranted, PortRequest};

use crate::allocator;
use crate::db;
use crate::error::{Error, Result};
use crate::jobs;
use crate::ledger::{self, RequestStatus};
use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/getport", get(get_port))
        .route("/endport", get(end_port))
        .route("/geos", get(list_geos))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String> {
    let login = header_str(headers, "x-api-login");
    let key = header_str(headers, "x-api-key");
    state
        .auth
        .authenticate(login, key)
        .await
        .ok_or(Error::Unauthorized)
}

/// `/getport`: hand the caller its existing reservation or live grant when
/// one matches, otherwise queue the request and try to serve it on the spot.
async fn get_port(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(req): Query<PortRequest>,
) -> Result<Json<PortGranted>> {
    let requester = authenticate(&state, &headers).await?;
    req.validate().map_err(Error::Validation)?;
    let rent_time = Duration::seconds(i64::from(req.rent_time_seconds));

    let grant = {
        let mut conn = state.store.lock();
        let dup = ledger::find_duplicate(
            &conn,
            Some(&requester),
            &req.servername,
            &req.geo,
            req.ip_version,
        )?;
        match dup {
            Some(open) => match open.status {
                RequestStatus::Reserved => {
                    let lease = ledger::lease_for_request(&conn, open.id)?
                        .ok_or_else(|| Error::Conflict("reservation has no lease".to_string()))?;
                    allocator::renew(&mut conn, lease.id, rent_time)?.ok_or(Error::NoCapacity)?
                }
                RequestStatus::Served => {
                    let lease = ledger::lease_for_request(&conn, open.id)?
                        .ok_or_else(|| Error::Conflict("grant has no lease".to_string()))?;
                    allocator::active_grant(&conn, lease.id)?.ok_or(Error::NoCapacity)?
                }
                // Still queued; the reconciler will pick it up.
                _ => return Err(Error::NoCapacity),
            },
            None => {
                let request_id = ledger::insert_request(&conn, &req, Some(&requester))?;
                allocator::allocate(
                    &mut conn,
                    request_id,
                    &req.geo,
                    req.ip_version,
                    rent_time,
                    false,
                )?
                .ok_or(Error::NoCapacity)?
            }
        }
    };

    tracing::info!(
        requester,
        lease_id = grant.lease_id,
        port_id = grant.port.id,
        "port granted"
    );
    Ok(Json(PortGranted {
        ok: true,
        port_endpoint: grant.port.endpoint(),
        lease_id: grant.lease_id,
        expires_at: grant.expires_at,
    }))
}

/// `/endport`: close the caller's lease now; the port is rotated and freed
/// in the background after the reply goes out.
async fn end_port(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(req): Query<EndPortRequest>,
) -> Result<Json<Ack>> {
    let requester = authenticate(&state, &headers).await?;

    let port_id = {
        let mut conn = state.store.lock();
        let lease = ledger::lease_by_id(&conn, req.lease_id)?.ok_or(Error::NotFound)?;
        let request = ledger::request_by_id(&conn, lease.request_id)?.ok_or(Error::NotFound)?;
        // Someone else's lease looks exactly like a missing one.
        if request.requester.as_deref() != Some(requester.as_str()) {
            return Err(Error::NotFound);
        }
        if !ledger::mark_finished(&mut conn, lease.id)? {
            return Err(Error::AlreadyEnded);
        }
        ledger::port_for_lease(&conn, lease.id)?.map(|p| p.id)
    };

    if let Some(port_id) = port_id {
        let state = state.clone();
        let lease_id = req.lease_id;
        tokio::spawn(async move {
            jobs::release_port(&state, port_id, lease_id).await;
        });
    }

    tracing::info!(requester, lease_id = req.lease_id, "order ended");
    Ok(Json(Ack::ok("order ended, port rotation scheduled")))
}

async fn list_geos(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<GeosReply>> {
    authenticate(&state, &headers).await?;
    let conn = state.store.lock();
    let geos = db::list_geo_names(&conn)?;
    Ok(Json(GeosReply { geos }))
}
