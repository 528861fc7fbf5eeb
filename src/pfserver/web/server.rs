// Web服务器实现
use crate::pfcommon::error::{AppError, Result};
use crate::pfserver::web::handlers;
use crate::pfserver::{gateway, AppState};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// /prices 升级处理器
async fn prices_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| gateway::handle_socket(socket, gateway))
}

/// 构建路由
pub fn build_router(state: Arc<AppState>, frontend_url: &str) -> Router {
    let cors = if frontend_url == "*" {
        CorsLayer::permissive()
    } else {
        match frontend_url.parse::<axum::http::HeaderValue>() {
            Ok(origin) => CorsLayer::new()
                .allow_origin([origin])
                .allow_methods(Any)
                .allow_headers(Any),
            Err(_) => {
                error!(target: "web", frontend_url, "前端来源配置无效，放行所有来源");
                CorsLayer::permissive()
            }
        }
    };

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/history", get(handlers::history_handler))
        .route("/prices", get(prices_ws_handler))
        .layer(cors)
        .with_state(state)
}

/// 启动Web服务器，直到停机信号
pub async fn start_web_server(
    state: Arc<AppState>,
    port: u16,
    frontend_url: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = build_router(state, &frontend_url);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::WebServerError(format!("绑定地址失败: {}", e)))?;

    info!(target: "web", "Web服务器启动在 http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
            info!(target: "web", "Web服务器开始优雅停机");
        })
        .await
        .map_err(|e| AppError::WebServerError(format!("Web服务器错误: {}", e)))?;

    info!(target: "web", "Web服务器已关闭");
    Ok(())
}
