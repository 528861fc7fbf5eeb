use crate::pfcommon::error::{AppError, Result};
use crate::pfcommon::models::Kline;
use crossbeam_channel::{bounded, Receiver, Sender};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

// 数据库连接池类型
pub type DbPool = Pool<SqliteConnectionManager>;

/// 写入任务，表示一批待落库的K线
#[derive(Debug)]
struct WriteTask {
    symbol: String,
    interval: String,
    klines: Vec<Kline>,
    result_sender: Sender<Result<usize>>,
}

/// 数据库写入队列处理器
///
/// 所有写操作串行经过这条线程，避免SQLite写锁竞争
struct WriteQueueProcessor {
    receiver: Receiver<WriteTask>,
    pool: DbPool,
    is_running: Arc<Mutex<bool>>,
}

impl WriteQueueProcessor {
    fn new(receiver: Receiver<WriteTask>, pool: DbPool) -> Self {
        Self {
            receiver,
            pool,
            is_running: Arc::new(Mutex::new(true)),
        }
    }

    /// 启动写入队列处理线程
    fn start(self) -> Arc<Mutex<bool>> {
        let is_running = self.is_running.clone();

        thread::spawn(move || {
            info!(target: "db", "数据库写入队列处理器已启动");

            while *self.is_running.lock().unwrap() {
                match self.receiver.recv_timeout(Duration::from_millis(100)) {
                    Ok(task) => {
                        let result = self.process_write_task(&task.symbol, &task.interval, &task.klines);
                        if let Err(e) = task.result_sender.send(result) {
                            error!(target: "db", "无法发送写入任务结果: {}", e);
                        }
                    }
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                        info!(target: "db", "数据库写入队列已关闭，处理器将退出");
                        break;
                    }
                }
            }

            info!(target: "db", "数据库写入队列处理器已停止");
        });

        is_running
    }

    /// 处理单个写入任务：事务内逐条upsert
    fn process_write_task(&self, symbol: &str, interval: &str, klines: &[Kline]) -> Result<usize> {
        if klines.is_empty() {
            return Ok(0);
        }

        let mut conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("获取数据库连接失败: {}", e)))?;

        let tx = conn
            .transaction()
            .map_err(|e| AppError::DatabaseError(format!("开始事务失败: {}", e)))?;

        let mut count = 0;
        for kline in klines {
            match upsert_one(&tx, symbol, interval, kline) {
                Ok(_) => count += 1,
                Err(e) => {
                    let _ = tx.rollback();
                    return Err(e);
                }
            }
        }

        tx.commit()
            .map_err(|e| AppError::DatabaseError(format!("提交事务失败: {}", e)))?;

        debug!(target: "db", symbol, interval, count, "K线批量写入完成");
        Ok(count)
    }
}

/// 单条K线upsert
///
/// 唯一键 (symbol, interval, open_time)。已收盘的K线视为不可变：
/// 冲突时仅当现存行尚未收盘才允许更新，后续对已收盘行的写入被忽略
fn upsert_one(conn: &rusqlite::Connection, symbol: &str, interval: &str, kline: &Kline) -> Result<()> {
    conn.execute(
        "INSERT INTO klines (
            symbol, interval, open_time, open, high, low, close, volume,
            close_time, quote_asset_volume, number_of_trades,
            taker_buy_base_asset_volume, taker_buy_quote_asset_volume, is_closed
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        ON CONFLICT(symbol, interval, open_time) DO UPDATE SET
            open = excluded.open,
            high = excluded.high,
            low = excluded.low,
            close = excluded.close,
            volume = excluded.volume,
            close_time = excluded.close_time,
            quote_asset_volume = excluded.quote_asset_volume,
            number_of_trades = excluded.number_of_trades,
            taker_buy_base_asset_volume = excluded.taker_buy_base_asset_volume,
            taker_buy_quote_asset_volume = excluded.taker_buy_quote_asset_volume,
            is_closed = excluded.is_closed
        WHERE klines.is_closed = 0",
        params![
            symbol,
            interval,
            kline.open_time,
            kline.open,
            kline.high,
            kline.low,
            kline.close,
            kline.volume,
            kline.close_time,
            kline.quote_asset_volume,
            kline.number_of_trades,
            kline.taker_buy_base_asset_volume,
            kline.taker_buy_quote_asset_volume,
            kline.is_closed as i64,
        ],
    )
    .map_err(|e| AppError::DatabaseError(format!("写入K线失败: {}", e)))?;

    Ok(())
}

/// K线存储
///
/// 所有写入都是按 (symbol, interval, open_time) 幂等的upsert
pub struct Database {
    pool: DbPool,
    write_queue_sender: Sender<WriteTask>,
    queue_processor_running: Arc<Mutex<bool>>,
}

impl Database {
    /// 创建数据库连接，启用WAL模式
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!(target: "db", "Using SQLite database with WAL mode at {}", db_path.display());

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA cache_size = -65536;
                PRAGMA temp_store = MEMORY;
                PRAGMA busy_timeout = 5000;
            ",
            )
        });

        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| AppError::DatabaseError(format!("Failed to create connection pool: {}", e)))?;

        // 写入队列通道，最多容纳1000个写入任务
        let (sender, receiver) = bounded(1000);
        let processor = WriteQueueProcessor::new(receiver, pool.clone());
        let queue_processor_running = processor.start();

        let db = Self {
            pool,
            write_queue_sender: sender,
            queue_processor_running,
        };

        db.init_db()?;

        info!(target: "db", "SQLite database with WAL mode and write queue initialized successfully");
        Ok(db)
    }

    /// 初始化表结构与索引
    fn init_db(&self) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("Failed to get connection: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS klines (
                symbol TEXT NOT NULL,
                interval TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                open TEXT NOT NULL,
                high TEXT NOT NULL,
                low TEXT NOT NULL,
                close TEXT NOT NULL,
                volume TEXT NOT NULL,
                close_time INTEGER NOT NULL,
                quote_asset_volume TEXT NOT NULL,
                number_of_trades INTEGER NOT NULL,
                taker_buy_base_asset_volume TEXT NOT NULL,
                taker_buy_quote_asset_volume TEXT NOT NULL,
                is_closed INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (symbol, interval, open_time)
            )",
            [],
        )
        .map_err(|e| AppError::DatabaseError(format!("Failed to create klines table: {}", e)))?;

        // 查询索引：按 (symbol, interval) 取最新K线
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_klines_lookup
             ON klines (symbol, interval, open_time DESC)",
            [],
        )
        .map_err(|e| AppError::DatabaseError(format!("Failed to create klines index: {}", e)))?;

        Ok(())
    }

    /// 通过写入队列批量保存K线，等待写入完成
    pub fn upsert_klines(&self, symbol: &str, interval: &str, klines: &[Kline]) -> Result<usize> {
        if klines.is_empty() {
            return Ok(0);
        }

        let (result_sender, result_receiver) = bounded(1);

        let task = WriteTask {
            symbol: symbol.to_string(),
            interval: interval.to_string(),
            klines: klines.to_vec(),
            result_sender,
        };

        self.write_queue_sender
            .send(task)
            .map_err(|e| AppError::DatabaseError(format!("无法将写入任务添加到队列: {}", e)))?;

        match result_receiver.recv() {
            Ok(result) => result,
            Err(e) => Err(AppError::DatabaseError(format!("等待写入操作结果时出错: {}", e))),
        }
    }

    /// 保存单条K线
    pub fn upsert_kline(&self, symbol: &str, interval: &str, kline: &Kline) -> Result<()> {
        self.upsert_klines(symbol, interval, std::slice::from_ref(kline))?;
        Ok(())
    }

    /// 按开盘时间区间查询，区间内升序，最多limit条
    pub fn get_klines_in_range(
        &self,
        symbol: &str,
        interval: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Kline>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("Failed to get connection: {}", e)))?;

        let mut stmt = conn.prepare(
            "SELECT open_time, open, high, low, close, volume, close_time,
                    quote_asset_volume, number_of_trades,
                    taker_buy_base_asset_volume, taker_buy_quote_asset_volume, is_closed
             FROM klines
             WHERE symbol = ?1 AND interval = ?2
               AND open_time >= ?3 AND open_time <= ?4
             ORDER BY open_time ASC
             LIMIT ?5",
        )?;

        let rows = stmt.query_map(
            params![
                symbol,
                interval,
                start_time.unwrap_or(0),
                end_time.unwrap_or(i64::MAX),
                limit as i64
            ],
            row_to_kline,
        )?;

        let mut klines = Vec::new();
        for row in rows {
            klines.push(row?);
        }
        Ok(klines)
    }

    /// 查询最新的limit条K线，返回结果按时间升序
    pub fn get_latest_klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Kline>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("Failed to get connection: {}", e)))?;

        let mut stmt = conn.prepare(
            "SELECT open_time, open, high, low, close, volume, close_time,
                    quote_asset_volume, number_of_trades,
                    taker_buy_base_asset_volume, taker_buy_quote_asset_volume, is_closed
             FROM klines
             WHERE symbol = ?1 AND interval = ?2
             ORDER BY open_time DESC
             LIMIT ?3",
        )?;

        let rows = stmt.query_map(params![symbol, interval, limit as i64], row_to_kline)?;

        let mut klines = Vec::new();
        for row in rows {
            klines.push(row?);
        }
        // 倒序取出后翻转为升序
        klines.reverse();
        Ok(klines)
    }

    /// 查询单条K线
    pub fn get_kline(&self, symbol: &str, interval: &str, open_time: i64) -> Result<Option<Kline>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("Failed to get connection: {}", e)))?;

        let kline = conn
            .query_row(
                "SELECT open_time, open, high, low, close, volume, close_time,
                        quote_asset_volume, number_of_trades,
                        taker_buy_base_asset_volume, taker_buy_quote_asset_volume, is_closed
                 FROM klines
                 WHERE symbol = ?1 AND interval = ?2 AND open_time = ?3",
                params![symbol, interval, open_time],
                row_to_kline,
            )
            .optional()
            .map_err(|e| AppError::DatabaseError(format!("查询K线失败: {}", e)))?;

        Ok(kline)
    }

    /// 获取某个键下的K线数量
    pub fn get_kline_count(&self, symbol: &str, interval: &str) -> Result<i64> {
        let conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("Failed to get connection: {}", e)))?;

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM klines WHERE symbol = ?1 AND interval = ?2",
            params![symbol, interval],
            |row| row.get(0),
        )?;

        Ok(count)
    }

    /// 获取某个键下最新K线的开盘时间
    pub fn get_latest_open_time(&self, symbol: &str, interval: &str) -> Result<Option<i64>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("Failed to get connection: {}", e)))?;

        let result: Option<i64> = conn.query_row(
            "SELECT MAX(open_time) FROM klines WHERE symbol = ?1 AND interval = ?2",
            params![symbol, interval],
            |row| row.get(0),
        )?;

        Ok(result)
    }

    /// 关闭写入队列处理器
    pub fn shutdown(&self) {
        info!(target: "db", "正在关闭数据库写入队列...");
        if let Ok(mut running) = self.queue_processor_running.lock() {
            *running = false;
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn row_to_kline(row: &rusqlite::Row<'_>) -> rusqlite::Result<Kline> {
    Ok(Kline {
        open_time: row.get(0)?,
        open: row.get(1)?,
        high: row.get(2)?,
        low: row.get(3)?,
        close: row.get(4)?,
        volume: row.get(5)?,
        close_time: row.get(6)?,
        quote_asset_volume: row.get(7)?,
        number_of_trades: row.get(8)?,
        taker_buy_base_asset_volume: row.get(9)?,
        taker_buy_quote_asset_volume: row.get(10)?,
        is_closed: row.get::<_, i64>(11)? != 0,
    })
}
