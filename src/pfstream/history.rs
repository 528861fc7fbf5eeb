use crate::pfcommon::api::{BinanceApi, KlineQuery, MAX_KLINE_LIMIT};
use crate::pfcommon::db::Database;
use crate::pfcommon::error::Result;
use crate::pfcommon::models::{interval_to_milliseconds, Kline, KlineData};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// 新鲜度窗口倍数：最新K线的开盘时间距now不得超过 3 * 周期时长
pub const FRESHNESS_MULTIPLIER: i64 = 3;

/// 默认查询条数
pub const DEFAULT_HISTORY_LIMIT: usize = 500;

/// 种子配置：启动时预热这些键
pub const SEED_SYMBOLS: [&str; 7] = [
    "BTCUSDT", "ETHUSDT", "BNBUSDT", "SOLUSDT", "XRPUSDT", "ADAUSDT", "DOGEUSDT",
];
pub const SEED_INTERVALS: [&str; 6] = ["1m", "5m", "15m", "1h", "4h", "1d"];
pub const SEED_LIMIT: usize = 1000;

/// 两次种子请求之间的间隔，控制上游请求频率
const SEED_PACE: Duration = Duration::from_millis(200);
/// 失败后的间隔
const SEED_FAILURE_PACE: Duration = Duration::from_millis(500);

/// 判断已存数据是否过期
///
/// 无时间范围的查询要求最新一根K线仍在新鲜度窗口内，否则强制回源
pub fn is_stale(latest_open_time: i64, interval: &str, now_ms: i64) -> bool {
    now_ms - latest_open_time > FRESHNESS_MULTIPLIER * interval_to_milliseconds(interval)
}

/// K线历史服务
///
/// 读路径先查本地存储，数据不足或过期时回源上游REST，
/// 返回上游数据的同时异步回填本地存储
pub struct HistoryService {
    db: Arc<Database>,
    api: BinanceApi,
}

impl HistoryService {
    pub fn new(db: Arc<Database>, api: BinanceApi) -> Arc<Self> {
        Arc::new(Self { db, api })
    }

    /// 查询历史K线
    ///
    /// 有时间范围时区间内升序返回；无范围时返回最新limit条（升序）。
    /// 存储中行数不足limit、或无范围且最新行超出新鲜度窗口时回源上游
    pub async fn get_historical_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Kline>> {
        let limit = limit.clamp(1, MAX_KLINE_LIMIT);
        let has_range = start_time.is_some() || end_time.is_some();

        // 第一步：查本地存储。读失败按空结果处理，让上游兜底
        let db_rows = if has_range {
            self.db
                .get_klines_in_range(symbol, interval, start_time, end_time, limit)
        } else {
            self.db.get_latest_klines(symbol, interval, limit)
        }
        .unwrap_or_else(|e| {
            warn!(target: "history", symbol, interval, "本地存储查询失败，改走上游: {}", e);
            Vec::new()
        });

        // 第二步：判定是否可以直接返回
        if db_rows.len() >= limit {
            let fresh = if has_range {
                true
            } else {
                match db_rows.last() {
                    Some(latest) => {
                        let now_ms = chrono::Utc::now().timestamp_millis();
                        !is_stale(latest.open_time, interval, now_ms)
                    }
                    None => false,
                }
            };

            if fresh {
                debug!(target: "history", symbol, interval, count = db_rows.len(), "历史查询命中本地存储");
                return Ok(db_rows);
            }
            info!(target: "history", symbol, interval, "本地数据已过期，回源上游");
        }

        // 第三步：回源上游REST
        let query = KlineQuery {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            start_time,
            end_time,
            limit,
        };
        let klines = self.api.get_klines(&query).await?;

        // 第四步：立即返回，同时异步回填本地存储预热缓存
        self.warm_cache(symbol, interval, klines.clone());

        info!(target: "history", symbol, interval, count = klines.len(), "历史查询回源完成");
        Ok(klines)
    }

    /// 异步回填本地存储（发后不理）
    fn warm_cache(&self, symbol: &str, interval: &str, klines: Vec<Kline>) {
        if klines.is_empty() {
            return;
        }

        let db = self.db.clone();
        let symbol = symbol.to_string();
        let interval = interval.to_string();

        tokio::task::spawn_blocking(move || {
            if let Err(e) = db.upsert_klines(&symbol, &interval, &klines) {
                warn!(target: "history", symbol = %symbol, interval = %interval, "回填本地存储失败: {}", e);
            }
        });
    }

    /// 把流上收到的K线落到本地存储
    ///
    /// 失败只记日志，绝不影响行情链路
    pub fn upsert_stream_kline(&self, symbol: &str, kline: &KlineData) {
        let db = self.db.clone();
        let symbol = symbol.to_string();
        let interval = kline.interval.clone();
        let row = kline.to_kline();

        tokio::task::spawn_blocking(move || {
            if let Err(e) = db.upsert_kline(&symbol, &interval, &row) {
                warn!(target: "history", symbol = %symbol, interval = %interval, "流式K线落库失败: {}", e);
            }
        });
    }

    /// 启动后台种子任务
    ///
    /// 对种子配置里的每个 交易对 x 周期 预热本地存储。
    /// 任何失败都只记日志，不影响服务启动
    pub fn spawn_seeder(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = self.clone();

        tokio::spawn(async move {
            info!(
                target: "history",
                symbols = SEED_SYMBOLS.len(),
                intervals = SEED_INTERVALS.len(),
                limit = SEED_LIMIT,
                "开始预热K线存储"
            );

            let mut seeded = 0usize;
            let mut skipped = 0usize;
            let mut failed = 0usize;

            for symbol in SEED_SYMBOLS {
                for interval in SEED_INTERVALS {
                    match service.seed_one(symbol, interval).await {
                        Ok(true) => {
                            seeded += 1;
                            sleep(SEED_PACE).await;
                        }
                        Ok(false) => {
                            skipped += 1;
                        }
                        Err(e) => {
                            failed += 1;
                            warn!(target: "history", symbol, interval, "预热失败: {}", e);
                            sleep(SEED_FAILURE_PACE).await;
                        }
                    }
                }
            }

            info!(target: "history", seeded, skipped, failed, "K线存储预热完成");
        })
    }

    /// 预热单个键；返回是否实际发起了下载
    async fn seed_one(&self, symbol: &str, interval: &str) -> Result<bool> {
        let count = self.db.get_kline_count(symbol, interval)?;
        if count >= (SEED_LIMIT as f64 * 0.9) as i64 {
            debug!(target: "history", symbol, interval, count, "数据已足够，跳过预热");
            return Ok(false);
        }

        // 从最新一根K线之后增量下载；没有数据时拉最新一批
        let start_time = self.db.get_latest_open_time(symbol, interval)?.map(|t| t + 1);

        let query = KlineQuery {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            start_time,
            end_time: None,
            limit: SEED_LIMIT,
        };

        let klines = self.api.get_klines(&query).await?;
        let written = if klines.is_empty() {
            0
        } else {
            let db = self.db.clone();
            let symbol_owned = symbol.to_string();
            let interval_owned = interval.to_string();
            tokio::task::spawn_blocking(move || db.upsert_klines(&symbol_owned, &interval_owned, &klines))
                .await
                .map_err(|e| crate::pfcommon::error::AppError::DatabaseError(format!("预热写入任务失败: {}", e)))??
        };

        info!(target: "history", symbol, interval, written, "预热完成");
        Ok(true)
    }
}
