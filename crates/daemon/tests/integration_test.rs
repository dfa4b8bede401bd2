use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::{Client, StatusCode};

use common::{Ack, Failure, PortGranted, PortRequest};
use daemon::allocator::port_is_held;
use daemon::api;
use daemon::auth::StaticTokenAuth;
use daemon::config::Config;
use daemon::db::{insert_ip_info, upsert_port, NewPort};
use daemon::testing::{fake_state, FakeProber};
use daemon::{jobs, ledger, AppState};

struct TestApp {
    base: String,
    client: Client,
    state: AppState,
    prober: Arc<FakeProber>,
}

impl TestApp {
    async fn getport(&self, login: &str, req: &PortRequest) -> reqwest::Response {
        self.client
            .get(format!("{}/getport", self.base))
            .header("x-api-login", login)
            .query(req)
            .send()
            .await
            .unwrap()
    }

    async fn endport(&self, login: &str, lease_id: i64) -> reqwest::Response {
        self.client
            .get(format!("{}/endport", self.base))
            .header("x-api-login", login)
            .query(&[("lease_id", lease_id)])
            .send()
            .await
            .unwrap()
    }

    fn seed_port(&self, host: &str, geo: &str, active: bool, rotation_link: Option<&str>) -> i64 {
        let conn = self.state.store.lock();
        let id = upsert_port(
            &conn,
            &NewPort {
                host: host.to_string(),
                socks_port: 1080,
                http_port: 8080,
                login: "puser".to_string(),
                password: "ppass".to_string(),
                geo: geo.to_string(),
                ip_version: 4,
                active,
                rotation_link: rotation_link.map(str::to_string),
                rent_end: None,
            },
        )
        .unwrap();
        insert_ip_info(&conn, id, "198.51.100.10", 4, None, None, None).unwrap();
        id
    }

    async fn wait_until_free(&self, port_id: i64) {
        for _ in 0..100 {
            {
                let conn = self.state.store.lock();
                if !port_is_held(&conn, port_id).unwrap() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("port {port_id} was never released");
    }
}

async fn spawn_app_with(state: AppState, prober: Arc<FakeProber>) -> TestApp {
    let app = api::router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestApp {
        base: format!("http://{addr}"),
        client: Client::new(),
        state,
        prober,
    }
}

async fn spawn_app() -> TestApp {
    let (state, prober, _) = fake_state(Config::default());
    spawn_app_with(state, prober).await
}

fn request(servername: &str, geo: &str) -> PortRequest {
    PortRequest {
        servername: servername.to_string(),
        priority: 5,
        geo: geo.to_string(),
        ip_version: 4,
        rent_time_seconds: 600,
    }
}

#[tokio::test]
async fn granting_follows_the_full_lifecycle() {
    let app = spawn_app().await;
    let port_id = app.seed_port("93.184.216.34", "de", true, None);

    let before = Utc::now();
    let resp = app.getport("alice", &request("site1", "de")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let grant: PortGranted = resp.json().await.unwrap();
    assert!(grant.ok);
    assert_eq!(grant.port_endpoint.host, "93.184.216.34");
    assert_eq!(grant.port_endpoint.http_port, Some(8080));
    assert_eq!(grant.port_endpoint.socks_port, Some(1080));
    assert_eq!(grant.port_endpoint.login.as_deref(), Some("puser"));
    assert!(grant.expires_at > before + chrono::Duration::seconds(590));
    assert!(grant.expires_at < before + chrono::Duration::seconds(620));

    // Polling again while the order is live hands back the same lease.
    let resp = app.getport("alice", &request("site1", "de")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let repeat: PortGranted = resp.json().await.unwrap();
    assert_eq!(repeat.lease_id, grant.lease_id);

    let resp = app.endport("alice", grant.lease_id).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let ack: Ack = resp.json().await.unwrap();
    assert!(ack.ok);

    app.wait_until_free(port_id).await;

    let resp = app.endport("alice", grant.lease_id).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let failure: Failure = resp.json().await.unwrap();
    assert_eq!(failure.reason, "order already ended");
}

#[tokio::test]
async fn contention_queues_the_loser_until_the_port_frees_up() {
    let app = spawn_app().await;
    let port_id = app.seed_port("93.184.216.34", "de", true, None);

    let resp = app.getport("alice", &request("site1", "de")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let alice: PortGranted = resp.json().await.unwrap();

    let resp = app.getport("bob", &request("site2", "de")).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let failure: Failure = resp.json().await.unwrap();
    assert_eq!(failure.reason, "no matching port is currently free");
    {
        let conn = app.state.store.lock();
        assert_eq!(ledger::pending_requests(&conn).unwrap().len(), 1);
    }

    // Repeat polls while queued do not grow the queue.
    let resp = app.getport("bob", &request("site2", "de")).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    {
        let conn = app.state.store.lock();
        assert_eq!(ledger::pending_requests(&conn).unwrap().len(), 1);
    }

    let resp = app.endport("alice", alice.lease_id).await;
    assert_eq!(resp.status(), StatusCode::OK);
    app.wait_until_free(port_id).await;

    jobs::reconcile_tick(&app.state).await;

    // The reservation turns into a live grant on bob's next poll.
    let resp = app.getport("bob", &request("site2", "de")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let bob: PortGranted = resp.json().await.unwrap();
    assert_ne!(bob.lease_id, alice.lease_id);
    {
        let conn = app.state.store.lock();
        let lease = ledger::lease_by_id(&conn, bob.lease_id).unwrap().unwrap();
        assert_eq!(lease.status, ledger::LeaseStatus::Served);
    }
}

#[tokio::test]
async fn bad_parameters_are_rejected_up_front() {
    let app = spawn_app().await;
    app.seed_port("93.184.216.34", "de", true, None);

    let mut req = request("site1", "de");
    req.priority = 0;
    let resp = app.getport("alice", &req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let failure: Failure = resp.json().await.unwrap();
    assert!(failure.reason.contains("priority"));

    let mut req = request("site1", "de");
    req.ip_version = 5;
    let resp = app.getport("alice", &req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // Nothing was queued for either attempt.
    let conn = app.state.store.lock();
    assert!(ledger::pending_requests(&conn).unwrap().is_empty());
}

#[tokio::test]
async fn foreign_and_unknown_orders_look_missing() {
    let app = spawn_app().await;
    app.seed_port("93.184.216.34", "de", true, None);

    let resp = app.getport("alice", &request("site1", "de")).await;
    let grant: PortGranted = resp.json().await.unwrap();

    let resp = app.endport("bob", grant.lease_id).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let failure: Failure = resp.json().await.unwrap();
    assert_eq!(failure.reason, "no such order found");

    let resp = app.endport("alice", 424242).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    // The owner can still end it.
    let resp = app.endport("alice", grant.lease_id).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn requests_without_the_api_key_are_refused() {
    let (mut state, prober, _) = fake_state(Config::default());
    state.auth = Arc::new(StaticTokenAuth::new(Some("sekrit".to_string())));
    let app = spawn_app_with(state, prober).await;
    app.seed_port("93.184.216.34", "de", true, None);

    let resp = app
        .client
        .get(format!("{}/getport", app.base))
        .query(&request("site1", "de"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let failure: Failure = resp.json().await.unwrap();
    assert_eq!(failure.reason, "invalid api key");

    let resp = app
        .client
        .get(format!("{}/getport", app.base))
        .header("x-api-login", "alice")
        .header("x-api-key", "sekrit")
        .query(&request("site1", "de"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn geos_lists_only_geos_with_active_ports() {
    let app = spawn_app().await;
    app.seed_port("93.184.216.34", "de", true, None);
    app.seed_port("93.184.216.35", "us", true, None);
    app.seed_port("93.184.216.36", "fr", false, None);

    let resp = app
        .client
        .get(format!("{}/geos", app.base))
        .header("x-api-login", "alice")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let reply: common::GeosReply = resp.json().await.unwrap();
    assert_eq!(reply.geos, vec!["de".to_string(), "us".to_string()]);
}

#[tokio::test]
async fn expiry_recycles_the_port_for_the_next_order() {
    let app = spawn_app().await;
    let port_id = app.seed_port(
        "93.184.216.34",
        "de",
        true,
        Some("https://provider.example/rotate"),
    );

    let resp = app.getport("alice", &request("site1", "de")).await;
    let first: PortGranted = resp.json().await.unwrap();

    {
        let conn = app.state.store.lock();
        conn.execute(
            "UPDATE port_leases SET end_at = ?1 WHERE lease_id = ?2",
            rusqlite::params![
                daemon::db::ts(Utc::now() - chrono::Duration::seconds(5)),
                first.lease_id
            ],
        )
        .unwrap();
    }
    jobs::expiry_tick(&app.state).await;

    assert_eq!(app.prober.rotation_links().len(), 1);
    {
        let conn = app.state.store.lock();
        assert!(!port_is_held(&conn, port_id).unwrap());
        let lease = ledger::lease_by_id(&conn, first.lease_id).unwrap().unwrap();
        assert_eq!(lease.status, ledger::LeaseStatus::AutoFinished);
    }

    // The closed order is gone from dedup, so the same caller rents afresh.
    let resp = app.getport("alice", &request("site1", "de")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let second: PortGranted = resp.json().await.unwrap();
    assert_ne!(second.lease_id, first.lease_id);
}
