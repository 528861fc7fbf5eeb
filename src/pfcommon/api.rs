use crate::pfcommon::error::{AppError, Result};
use crate::pfcommon::models::Kline;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, warn};

/// 单次请求的最大K线数量
pub const MAX_KLINE_LIMIT: usize = 1000;

/// K线请求参数
#[derive(Debug, Clone)]
pub struct KlineQuery {
    pub symbol: String,
    pub interval: String,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub limit: usize,
}

/// 币安现货API客户端
#[derive(Clone, Debug)]
pub struct BinanceApi {
    api_url: String,
    client: Client,
}

impl BinanceApi {
    /// 创建新的API客户端实例
    pub fn new(api_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::ApiError(format!("创建HTTP客户端失败: {}", e)))?;

        debug!(target: "api", endpoint = %api_url, "初始化币安API客户端");
        Ok(Self { api_url, client })
    }

    /// 下载K线数据
    ///
    /// 调用 /api/v3/klines，响应为按位置编码的数组的数组。
    /// 状态码映射: 429 -> TooManyRequests, 404 -> SymbolNotFound, 其他非2xx -> BadGateway
    pub async fn get_klines(&self, query: &KlineQuery) -> Result<Vec<Kline>> {
        let mut url_params = format!(
            "symbol={}&interval={}&limit={}",
            query.symbol,
            query.interval,
            query.limit.min(MAX_KLINE_LIMIT)
        );

        if let Some(start_time) = query.start_time {
            url_params.push_str(&format!("&startTime={}", start_time));
        }
        if let Some(end_time) = query.end_time {
            url_params.push_str(&format!("&endTime={}", end_time));
        }

        let url = format!("{}/api/v3/klines?{}", self.api_url, url_params);

        let response = match self.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                error!(target: "api", symbol = %query.symbol, interval = %query.interval, url = %url, "K线请求失败: {}", e);
                return Err(AppError::from(e));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!(target: "api", symbol = %query.symbol, interval = %query.interval, status = %status, "K线请求被上游拒绝: {}", text);
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => {
                    AppError::TooManyRequests(format!("{}/{}: {}", query.symbol, query.interval, text))
                }
                StatusCode::NOT_FOUND => AppError::SymbolNotFound(query.symbol.clone()),
                _ => AppError::BadGateway(format!("{}/{}: {} - {}", query.symbol, query.interval, status, text)),
            });
        }

        let raw_klines: Vec<Vec<Value>> = match response.json().await {
            Ok(data) => data,
            Err(e) => {
                error!(target: "api", symbol = %query.symbol, interval = %query.interval, "解析K线JSON失败: {}", e);
                return Err(AppError::BadGateway(format!("解析上游K线响应失败: {}", e)));
            }
        };

        let klines: Vec<Kline> = raw_klines
            .iter()
            .filter_map(|raw| Kline::from_raw_kline(raw))
            .collect();

        if klines.len() != raw_klines.len() {
            warn!(
                target: "api",
                symbol = %query.symbol,
                interval = %query.interval,
                parsed = klines.len(),
                received = raw_klines.len(),
                "部分K线解析失败"
            );
        }

        debug!(target: "api", symbol = %query.symbol, interval = %query.interval, count = klines.len(), "K线下载完成");
        Ok(klines)
    }
}
