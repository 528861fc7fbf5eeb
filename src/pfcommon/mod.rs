// 导出共享模块
pub mod api;
pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod queue;

// 重新导出常用类型，方便使用
pub use api::{BinanceApi, KlineQuery, MAX_KLINE_LIMIT};
pub use broker::{BrokerClient, BrokerEnvelope, PriceBroadcaster, PRICE_CHANNEL_PATTERN, PRICE_CHANNEL_PREFIX};
pub use config::Config;
pub use db::Database;
pub use error::{AppError, Result};
pub use models::{
    interval_to_milliseconds, is_supported_interval, normalize_symbol, Kline, KlineData,
    KlineEventData, MiniTickerData, PriceEvent, PriceSource, TradeData, SUPPORTED_INTERVALS,
};
pub use queue::{Job, JobHandler, JobQueue, PersistenceWorker, QueueStats, KIND_PERSIST_PRICE};
