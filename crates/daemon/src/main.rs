use std::sync::Arc;

use daemon::auth::StaticTokenAuth;
use daemon::catalog;
use daemon::config::Config;
use daemon::db::Store;
use daemon::jobs;
use daemon::notify::{AdminNotifier, LogNotifier, TelegramNotifier};
use daemon::rotation::HttpProber;
use daemon::{api, AppState};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cfg = Arc::new(Config::from_env());
    println!("Using database: {}", cfg.db_path.display());
    let store = Store::open(&cfg.db_path).expect("Failed to initialize database");

    let notifier: Arc<dyn AdminNotifier> = match TelegramNotifier::from_env() {
        Some(telegram) => Arc::new(telegram),
        None => Arc::new(LogNotifier),
    };
    let state = AppState {
        store: store.clone(),
        cfg: cfg.clone(),
        prober: Arc::new(HttpProber::new(&cfg)),
        notifier,
        auth: Arc::new(StaticTokenAuth::new(cfg.api_token.clone())),
    };

    if let Some(path) = &cfg.ports_file {
        match catalog::import_catalog(&store, path) {
            Ok(summary) => println!(
                "Catalog imported: {} geos, {} ports, {} exit addresses primed from file",
                summary.geos, summary.ports, summary.primed
            ),
            Err(e) => eprintln!("Failed to import catalog: {e}"),
        }
    }

    // Probe exit addresses for catalog ports that still lack one.
    tokio::spawn(catalog::prime_missing_ip_info(
        store.clone(),
        state.prober.clone(),
        cfg.clone(),
    ));

    jobs::spawn_all(state.clone());

    let app = api::router(state);
    println!("Listening on {}", cfg.listen_addr);
    let listener = tokio::net::TcpListener::bind(cfg.listen_addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
