use crate::pfcommon::error::AppError;
use crate::pfcommon::models::{is_supported_interval, normalize_symbol, Kline};
use crate::pfserver::AppState;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::error;

/// 历史查询参数
#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub symbol: Option<String>,
    pub interval: Option<String>,
    #[serde(rename = "startTime")]
    pub start_time: Option<i64>,
    #[serde(rename = "endTime")]
    pub end_time: Option<i64>,
    pub limit: Option<usize>,
}

/// 历史响应中的单行K线（对外字段用camelCase）
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRow {
    pub open_time: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub close_time: i64,
    pub quote_volume: String,
    pub trades: i64,
    pub taker_buy_base_volume: String,
    pub taker_buy_quote_volume: String,
}

impl From<Kline> for HistoryRow {
    fn from(k: Kline) -> Self {
        Self {
            open_time: k.open_time,
            open: k.open,
            high: k.high,
            low: k.low,
            close: k.close,
            volume: k.volume,
            close_time: k.close_time,
            quote_volume: k.quote_asset_volume,
            trades: k.number_of_trades,
            taker_buy_base_volume: k.taker_buy_base_asset_volume,
            taker_buy_quote_volume: k.taker_buy_quote_asset_volume,
        }
    }
}

/// 历史查询响应
#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub success: bool,
    pub symbol: String,
    pub interval: String,
    pub count: usize,
    pub data: Vec<HistoryRow>,
}

/// 错误到HTTP状态码的映射
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::SymbolNotFound(_) => StatusCode::NOT_FOUND,
            AppError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::BadGateway(_) | AppError::HttpError(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(target: "web", "请求处理失败: {}", self);
        }

        let body = Json(serde_json::json!({
            "success": false,
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}

/// GET /history
pub async fn history_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, AppError> {
    let symbol = params
        .symbol
        .as_deref()
        .map(normalize_symbol)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::ValidationError("symbol is required".to_string()))?;

    let interval = params
        .interval
        .as_deref()
        .unwrap_or_default()
        .to_string();
    if !is_supported_interval(&interval) {
        return Err(AppError::ValidationError(format!(
            "interval must be one of the supported intervals, got '{}'",
            interval
        )));
    }

    let limit = params.limit.unwrap_or(crate::pfstream::DEFAULT_HISTORY_LIMIT);
    if limit < 1 || limit > crate::pfcommon::MAX_KLINE_LIMIT {
        return Err(AppError::ValidationError(format!(
            "limit must be between 1 and {}",
            crate::pfcommon::MAX_KLINE_LIMIT
        )));
    }

    let klines = state
        .history
        .get_historical_klines(&symbol, &interval, params.start_time, params.end_time, limit)
        .await?;

    let data: Vec<HistoryRow> = klines.into_iter().map(HistoryRow::from).collect();

    Ok(Json(HistoryResponse {
        success: true,
        symbol,
        interval,
        count: data.len(),
        data,
    }))
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let queue_stats = state.queue.stats().await;

    Json(serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "upstream": {
            "connected": state.upstream_connected.load(Ordering::Relaxed),
        },
        "broker": {
            "connected": state.broker.is_connected(),
        },
        "queue": queue_stats,
    }))
}
