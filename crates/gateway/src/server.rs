//! HTTP surface: the WebSocket endpoint, a plain health probe, and the
//! periodic tick broadcaster.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    axum::{
        Router,
        extract::{ConnectInfo, State, WebSocketUpgrade},
        response::IntoResponse,
        routing::get,
    },
    tokio::net::TcpListener,
    tracing::info,
};

use tether_protocol::TICK_INTERVAL_MS;

use crate::{
    broadcast::broadcast_tick,
    methods::MethodRegistry,
    state::GatewayState,
    ws::handle_socket,
};

#[derive(Clone)]
struct AppState {
    gateway: Arc<GatewayState>,
    registry: Arc<MethodRegistry>,
}

pub struct GatewayServer {
    gateway: Arc<GatewayState>,
    registry: Arc<MethodRegistry>,
}

impl GatewayServer {
    pub fn new(gateway: Arc<GatewayState>) -> Self {
        Self {
            gateway,
            registry: Arc::new(MethodRegistry::new()),
        }
    }

    /// Serve until the listener fails. Also owns the tick interval, which
    /// doubles as the expired-run sweep.
    pub async fn run(self, listener: TcpListener) -> anyhow::Result<()> {
        let app_state = AppState {
            gateway: self.gateway.clone(),
            registry: self.registry,
        };
        let app = Router::new()
            .route("/ws", get(ws_upgrade))
            .route("/health", get(health))
            .with_state(app_state);

        let tick_state = self.gateway;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
            interval.tick().await; // immediate first tick is pointless
            loop {
                interval.tick().await;
                broadcast_tick(&tick_state).await;
                tick_state.chat.gc();
            }
        });

        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "gateway listening");
        }
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(app): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(app.gateway, app.registry, socket, peer))
}

async fn health() -> impl IntoResponse {
    "ok"
}
