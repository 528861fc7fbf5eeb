// 导出行情流水线相关模块
pub mod dispatch;
pub mod feed;
pub mod history;
pub mod throttle;

// 重新导出常用类型，方便使用
pub use dispatch::{run_emission_loop, Emission, EventDispatcher};
pub use feed::{parse_stream_message, CombinedStreamClient, FeedEvent, FeedHandler};
pub use history::{is_stale, HistoryService, DEFAULT_HISTORY_LIMIT, FRESHNESS_MULTIPLIER};
pub use throttle::{
    Throttle, KLINE_BROADCAST_INTERVAL, KLINE_PERSIST_INTERVAL, PRICE_BROADCAST_INTERVAL,
    PRICE_PERSIST_INTERVAL,
};
