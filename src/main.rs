//! Tick Analysis Service
//!
//! Streams ticks for the configured synthetic indices, keeps a rolling window
//! per instrument and serves last-digit statistics over HTTP.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tokio::sync::RwLock;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tick_analysis::stats::recent_marks;
use tick_analysis::transport::ConnectionStrategy;
use tick_analysis::{
    metrics, Config, ConnectionState, ContractPattern, Instrument, PatternSplit, PointerStatus,
    SocketStrategy, SubscriptionCoordinator, TickPointer, Transport, TransportController,
};

/// Ticks shown in the recent-outcome strips
const RECENT_MARKS: usize = 20;

/// Application state shared across components
pub struct AppState {
    pub config: Arc<Config>,
    pub controller: Arc<TransportController>,
    pub coordinator: SubscriptionCoordinator,
    pub pointers: BTreeMap<Instrument, RwLock<TickPointer>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting Tick Analysis Service");

    // Load configuration
    let config = Arc::new(Config::load()?);
    info!(
        symbols = ?config.symbols,
        endpoint = %config.ws_endpoint,
        history_capacity = config.history_capacity,
        "Configuration loaded"
    );

    // Transport with fallback; the socket strategy is the only one a standalone service has
    let strategies: Vec<Box<dyn ConnectionStrategy>> = vec![Box::new(SocketStrategy)];
    let controller = Arc::new(TransportController::from_config(&config, strategies)?);
    controller.add_connection_listener(Arc::new(|connected| {
        if connected {
            info!("Market-data transport connected");
        } else {
            warn!("Market-data transport not connected");
        }
    }));

    let state = controller.initialize().await;
    info!(state = ?state, "Transport initialized");

    // One pointer per configured instrument, sharing the coordinator's feeds
    let coordinator = SubscriptionCoordinator::from_config(controller.clone(), &config);
    let mut pointers = BTreeMap::new();
    for instrument in &config.symbols {
        let mut pointer = TickPointer::new(
            coordinator.clone(),
            config.backfill_count(),
            config.history_capacity,
        );
        pointer.set_instrument(instrument.symbol(), true).await;
        let pointer_state = pointer.state();
        info!(
            symbol = instrument.symbol(),
            status = ?pointer_state.status,
            ticks = pointer_state.history.len(),
            "Tick pointer attached"
        );
        pointers.insert(instrument.clone(), RwLock::new(pointer));
    }

    // Create shared application state
    let state = Arc::new(AppState {
        config: config.clone(),
        controller: controller.clone(),
        coordinator: coordinator.clone(),
        pointers,
    });

    // Start health/metrics/statistics server
    let health_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state).await {
            warn!(error = %e, "Health server error");
        }
    });

    // Periodic status log; feeds that gave up are restarted here
    let status_state = state.clone();
    tokio::spawn(async move {
        let period = Duration::from_secs(status_state.config.status_log_interval_secs.max(1));
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            log_status(&status_state).await;
        }
    });

    info!("All services started successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    drop(state);
    coordinator.shutdown();
    controller.close().await;

    info!("Tick Analysis Service stopped");
    Ok(())
}

async fn log_status(state: &AppState) {
    let stats = state.controller.stats();
    info!(
        transport = ?stats.state,
        connected = stats.connected,
        strategy = ?stats.strategy,
        "Transport status"
    );

    if stats.state == ConnectionState::Degraded {
        warn!("Transport degraded, running connection strategies again");
        let recovered = state.controller.recover().await;
        info!(state = ?recovered, "Transport recovery finished");
    }

    for (instrument, pointer) in &state.pointers {
        let pointer_state = pointer.read().await.state();
        info!(
            symbol = instrument.symbol(),
            status = ?pointer_state.status,
            ticks = pointer_state.history.len(),
            last_quote = ?pointer_state.current_tick.map(|t| t.quote),
            hot = ?pointer_state.hot_digits(state.config.hot_cold_count),
            cold = ?pointer_state.cold_digits(state.config.hot_cold_count),
            "Feed status"
        );

        if matches!(
            pointer_state.status,
            PointerStatus::Error | PointerStatus::Unavailable
        ) {
            warn!(symbol = instrument.symbol(), error = ?pointer_state.error, "Restarting feed");
            pointer
                .write()
                .await
                .set_instrument(instrument.symbol(), true)
                .await;
        }
    }
}

/// Start the health/metrics/statistics server
async fn start_health_server(state: Arc<AppState>) -> anyhow::Result<()> {
    use std::net::SocketAddr;

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .route("/status", get(status))
        .route("/digits/:symbol", get(digits))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.health_port));
    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let status = if state.controller.is_connected() {
        "healthy"
    } else {
        "degraded"
    };
    Json(serde_json::json!({
        "status": status,
        "component": "tick-analysis",
        "transport": state.controller.state(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn prometheus_metrics() -> impl IntoResponse {
    match metrics::render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    }
}

async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "transport": state.controller.stats(),
        "feeds": state.coordinator.summaries(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

#[derive(Debug, Deserialize)]
struct DigitsQuery {
    k: Option<usize>,
}

async fn digits(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<DigitsQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let not_found = |message: String| {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": message })),
        )
    };

    let instrument = Instrument::parse(&symbol).map_err(|e| not_found(e.to_string()))?;
    let pointer = state
        .pointers
        .get(&instrument)
        .ok_or_else(|| not_found(format!("{} is not streamed by this service", instrument)))?;

    let pointer_state = pointer.read().await.state();
    let window = pointer_state.tick_history();
    let stats = pointer_state.digit_stats();
    let k = query.k.unwrap_or(state.config.hot_cold_count);

    let patterns = [
        ContractPattern::EvenOdd,
        ContractPattern::RiseFall,
        ContractPattern::OverUnder { barrier: 4 },
        ContractPattern::MatchesDiffers {
            target: stats.mode().unwrap_or(0),
        },
    ];
    let splits: Vec<serde_json::Value> = patterns
        .iter()
        .map(|pattern| {
            let (first_label, second_label) = pattern.labels();
            serde_json::json!({
                "labels": [first_label, second_label],
                "split": PatternSplit::compute(&window, *pattern),
                "recent": recent_marks(&window, *pattern, RECENT_MARKS)
                    .into_iter()
                    .collect::<String>(),
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "symbol": instrument.symbol(),
        "name": instrument.display_name(),
        "status": pointer_state.status,
        "error": pointer_state.error,
        "current_tick": pointer_state.current_tick,
        "window": stats.total(),
        "digits": stats.shares(),
        "hot": stats.hot_digits(k),
        "cold": stats.cold_digits(k),
        "patterns": splits,
    })))
}
