use serde::{Deserialize, Serialize};

/// 支持的K线周期（闭集）
pub const SUPPORTED_INTERVALS: [&str; 15] = [
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w", "1M",
];

/// 周期是否在支持的闭集内
pub fn is_supported_interval(interval: &str) -> bool {
    SUPPORTED_INTERVALS.contains(&interval)
}

/// 将时间间隔转换为毫秒数
/// 例如: "1m" -> 60000, "1h" -> 3600000
/// "1M" 按30天计算，仅用于新鲜度判断，真实月线的收盘时间以交易所为准
pub fn interval_to_milliseconds(interval: &str) -> i64 {
    let last_char = interval.chars().last().unwrap_or('m');
    let value: i64 = interval[..interval.len().saturating_sub(1)].parse().unwrap_or(1);

    match last_char {
        'm' => value * 60 * 1000,                 // 分钟
        'h' => value * 60 * 60 * 1000,            // 小时
        'd' => value * 24 * 60 * 60 * 1000,       // 天
        'w' => value * 7 * 24 * 60 * 60 * 1000,   // 周
        'M' => value * 30 * 24 * 60 * 60 * 1000,  // 月（近似）
        _ => value * 60 * 1000,
    }
}

/// 规范化交易对：边界处统一转为大写
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

/// 价格事件来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceSource {
    MiniTicker,
    Trade,
    Kline,
}

/// 归一化后的价格事件
///
/// 价格保持字符串形式，保留交易所上报的精度
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceEvent {
    /// 交易对（大写）
    pub symbol: String,
    /// 价格（字符串形式）
    pub price: String,
    /// 事件时间（毫秒时间戳，取上游E字段）
    pub ts: i64,
    /// 事件来源
    pub source: PriceSource,
    /// 原始消息载荷
    pub raw: serde_json::Value,
}

/// 表示K线/蜡烛图 - 数据库存储格式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    /// K线开盘时间
    pub open_time: i64,
    /// 开盘价
    pub open: String,
    /// 最高价
    pub high: String,
    /// 最低价
    pub low: String,
    /// 收盘价
    pub close: String,
    /// 成交量
    pub volume: String,
    /// K线收盘时间
    pub close_time: i64,
    /// 报价资产成交量
    pub quote_asset_volume: String,
    /// 成交笔数
    pub number_of_trades: i64,
    /// 主动买入基础资产成交量
    pub taker_buy_base_asset_volume: String,
    /// 主动买入报价资产成交量
    pub taker_buy_quote_asset_volume: String,
    /// K线是否已收盘
    pub is_closed: bool,
}

impl Kline {
    /// 从REST接口的原始数组创建K线对象
    ///
    /// 数组按位置编码:
    /// [openTime, open, high, low, close, volume, closeTime,
    ///  quoteVolume, trades, takerBuyBase, takerBuyQuote, _ignored]
    pub fn from_raw_kline(raw: &[serde_json::Value]) -> Option<Self> {
        if raw.len() < 12 {
            return None;
        }

        Some(Self {
            open_time: raw[0].as_i64()?,
            open: raw[1].as_str()?.to_string(),
            high: raw[2].as_str()?.to_string(),
            low: raw[3].as_str()?.to_string(),
            close: raw[4].as_str()?.to_string(),
            volume: raw[5].as_str()?.to_string(),
            close_time: raw[6].as_i64()?,
            quote_asset_volume: raw[7].as_str()?.to_string(),
            number_of_trades: raw[8].as_i64()?,
            taker_buy_base_asset_volume: raw[9].as_str()?.to_string(),
            taker_buy_quote_asset_volume: raw[10].as_str()?.to_string(),
            // REST接口只返回已收盘的K线
            is_closed: true,
        })
    }
}

/// K线数据结构（WebSocket的k字段）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KlineData {
    #[serde(rename = "t")]
    pub start_time: i64,
    #[serde(rename = "T")]
    pub end_time: i64,
    #[serde(rename = "i")]
    pub interval: String,
    #[serde(rename = "f", default)]
    pub first_trade_id: i64,
    #[serde(rename = "L", default)]
    pub last_trade_id: i64,
    #[serde(rename = "o")]
    pub open: String,
    #[serde(rename = "c")]
    pub close: String,
    #[serde(rename = "h")]
    pub high: String,
    #[serde(rename = "l")]
    pub low: String,
    #[serde(rename = "v")]
    pub volume: String,
    #[serde(rename = "n", default)]
    pub number_of_trades: i64,
    #[serde(rename = "x")]
    pub is_closed: bool,
    #[serde(rename = "q", default)]
    pub quote_volume: String,
    #[serde(rename = "V", default)]
    pub taker_buy_volume: String,
    #[serde(rename = "Q", default)]
    pub taker_buy_quote_volume: String,
}

impl KlineData {
    /// 转换为标准K线格式
    pub fn to_kline(&self) -> Kline {
        Kline {
            open_time: self.start_time,
            open: self.open.clone(),
            high: self.high.clone(),
            low: self.low.clone(),
            close: self.close.clone(),
            volume: self.volume.clone(),
            close_time: self.end_time,
            quote_asset_volume: self.quote_volume.clone(),
            number_of_trades: self.number_of_trades,
            taker_buy_base_asset_volume: self.taker_buy_volume.clone(),
            taker_buy_quote_asset_volume: self.taker_buy_quote_volume.clone(),
            is_closed: self.is_closed,
        }
    }
}

/// 全市场精简Ticker数据（24hrMiniTicker事件）
#[derive(Debug, Clone, Deserialize)]
pub struct MiniTickerData {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c")]
    pub close_price: String,
    #[serde(rename = "o", default)]
    pub open_price: String,
    #[serde(rename = "h", default)]
    pub high_price: String,
    #[serde(rename = "l", default)]
    pub low_price: String,
    #[serde(rename = "v", default)]
    pub total_traded_volume: String,
    #[serde(rename = "q", default)]
    pub total_traded_quote_volume: String,
}

/// 逐笔成交数据（trade事件）
#[derive(Debug, Clone, Deserialize)]
pub struct TradeData {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "q", default)]
    pub quantity: String,
    #[serde(rename = "T", default)]
    pub trade_time: i64,
}

/// K线事件外层（kline事件）
#[derive(Debug, Clone, Deserialize)]
pub struct KlineEventData {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "k")]
    pub kline: KlineData,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_to_milliseconds() {
        assert_eq!(interval_to_milliseconds("1m"), 60_000);
        assert_eq!(interval_to_milliseconds("15m"), 900_000);
        assert_eq!(interval_to_milliseconds("1h"), 3_600_000);
        assert_eq!(interval_to_milliseconds("4h"), 14_400_000);
        assert_eq!(interval_to_milliseconds("1d"), 86_400_000);
        assert_eq!(interval_to_milliseconds("1w"), 604_800_000);
        assert_eq!(interval_to_milliseconds("1M"), 2_592_000_000);
    }

    #[test]
    fn test_supported_intervals() {
        assert!(is_supported_interval("1m"));
        assert!(is_supported_interval("1M"));
        assert!(!is_supported_interval("2m"));
        assert!(!is_supported_interval(""));
        assert!(!is_supported_interval("60"));
    }

    #[test]
    fn test_normalize_symbol() {
        assert_eq!(normalize_symbol("btcusdt"), "BTCUSDT");
        assert_eq!(normalize_symbol(" EthUsdt "), "ETHUSDT");
    }

    #[test]
    fn test_kline_from_raw() {
        let raw: Vec<serde_json::Value> = serde_json::from_str(
            r#"[1700000040000,"42.1","43.5","41.9","43.0","120.5",1700000099999,"5100.2",321,"60.1","2550.3","0"]"#,
        )
        .unwrap();
        let kline = Kline::from_raw_kline(&raw).unwrap();
        assert_eq!(kline.open_time, 1700000040000);
        assert_eq!(kline.open, "42.1");
        assert_eq!(kline.close, "43.0");
        assert_eq!(kline.close_time, 1700000099999);
        assert_eq!(kline.number_of_trades, 321);
        assert!(kline.is_closed);
    }

    #[test]
    fn test_kline_from_raw_too_short() {
        let raw: Vec<serde_json::Value> = serde_json::from_str(r#"[1700000040000,"42.1"]"#).unwrap();
        assert!(Kline::from_raw_kline(&raw).is_none());
    }
}
