use price_fanout::pfcommon::models::Kline;
use price_fanout::pfcommon::{BinanceApi, Database};
use price_fanout::pfstream::HistoryService;
use std::path::PathBuf;
use std::sync::Arc;

fn setup_test_db(name: &str) -> Arc<Database> {
    let db_path = PathBuf::from(format!("./target/test_history_{}.db", name));

    if db_path.exists() {
        let _ = std::fs::remove_file(&db_path);
    }

    Arc::new(Database::new(&db_path).unwrap())
}

// 指向不可达地址的API客户端：历史服务一旦回源就会立刻失败，
// 用来区分"本地命中"和"尝试回源"两条路径
fn unreachable_api() -> BinanceApi {
    BinanceApi::new("http://127.0.0.1:9".to_string()).unwrap()
}

fn kline_at(open_time: i64) -> Kline {
    Kline {
        open_time,
        open: "42.1".to_string(),
        high: "43.5".to_string(),
        low: "41.9".to_string(),
        close: "43.0".to_string(),
        volume: "120.5".to_string(),
        close_time: open_time + 59_999,
        quote_asset_volume: "5100.2".to_string(),
        number_of_trades: 321,
        taker_buy_base_asset_volume: "60.1".to_string(),
        taker_buy_quote_asset_volume: "2550.3".to_string(),
        is_closed: true,
    }
}

/// 写入count根1m周期的K线，最新一根的开盘时间为latest_open
fn seed_rows(db: &Arc<Database>, symbol: &str, count: i64, latest_open: i64) {
    let klines: Vec<Kline> = (0..count)
        .map(|i| kline_at(latest_open - (count - 1 - i) * 60_000))
        .collect();
    db.upsert_klines(symbol, "1m", &klines).unwrap();
}

#[tokio::test]
async fn test_fresh_db_rows_served_without_upstream() {
    let db = setup_test_db("fresh_hit");
    let now = chrono::Utc::now().timestamp_millis();

    // 100条新鲜数据，最新一根就在当前这一分钟
    seed_rows(&db, "BTCUSDT", 100, now - now % 60_000);

    let service = HistoryService::new(db, unreachable_api());
    let rows = service
        .get_historical_klines("BTCUSDT", "1m", None, None, 100)
        .await
        .unwrap();

    // API不可达仍然成功，说明完全由本地存储服务
    assert_eq!(rows.len(), 100);
    assert!(rows.windows(2).all(|w| w[0].open_time < w[1].open_time));
}

#[tokio::test]
async fn test_insufficient_rows_trigger_upstream() {
    let db = setup_test_db("insufficient");
    let now = chrono::Utc::now().timestamp_millis();

    // 只有10条，要100条 -> 必须回源；API不可达 -> 报错
    seed_rows(&db, "ETHUSDT", 10, now - now % 60_000);

    let service = HistoryService::new(db, unreachable_api());
    let result = service
        .get_historical_klines("ETHUSDT", "1m", None, None, 100)
        .await;

    assert!(result.is_err(), "行数不足时必须尝试回源上游");
}

#[tokio::test]
async fn test_stale_rows_trigger_upstream() {
    let db = setup_test_db("stale");
    let now = chrono::Utc::now().timestamp_millis();

    // 行数满足但最新一根是10分钟前的，超出 3 * 1m 新鲜度窗口
    seed_rows(&db, "BTCUSDT", 500, now - 10 * 60_000);

    let service = HistoryService::new(db, unreachable_api());
    let result = service
        .get_historical_klines("BTCUSDT", "1m", None, None, 500)
        .await;

    assert!(result.is_err(), "数据过期时必须尝试回源上游");
}

#[tokio::test]
async fn test_range_query_skips_freshness_check() {
    let db = setup_test_db("range_no_freshness");
    let now = chrono::Utc::now().timestamp_millis();

    // 同样是10分钟前的数据，但显式给了时间范围就不做新鲜度检查
    let latest = now - 10 * 60_000;
    seed_rows(&db, "BTCUSDT", 50, latest);

    let service = HistoryService::new(db, unreachable_api());
    let rows = service
        .get_historical_klines(
            "BTCUSDT",
            "1m",
            Some(latest - 49 * 60_000),
            Some(latest),
            50,
        )
        .await
        .unwrap();

    assert_eq!(rows.len(), 50);
}

#[tokio::test]
async fn test_limit_clamped() {
    let db = setup_test_db("limit_clamp");
    let now = chrono::Utc::now().timestamp_millis();
    seed_rows(&db, "BTCUSDT", 5, now - now % 60_000);

    let service = HistoryService::new(db, unreachable_api());
    // limit=0被钳到1，本地一条就够了
    let rows = service
        .get_historical_klines("BTCUSDT", "1m", None, None, 0)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

// 真实回源路径需要网络，按项目惯例忽略
#[tokio::test]
#[ignore]
async fn test_upstream_fallback_live() {
    let db = setup_test_db("live_fallback");
    let api = BinanceApi::new("https://api.binance.com".to_string()).unwrap();
    let service = HistoryService::new(db.clone(), api);

    let rows = service
        .get_historical_klines("BTCUSDT", "1h", None, None, 100)
        .await
        .unwrap();
    assert_eq!(rows.len(), 100);

    // 等回填落库后，第二次查询应由本地存储命中
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    assert!(db.get_kline_count("BTCUSDT", "1h").unwrap() >= 100);
}
