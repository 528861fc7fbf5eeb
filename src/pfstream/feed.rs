use crate::pfcommon::error::Result;
use crate::pfcommon::models::{
    normalize_symbol, KlineData, KlineEventData, MiniTickerData, PriceEvent, PriceSource, TradeData,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

/// 重连退避基数
const RECONNECT_BASE: Duration = Duration::from_secs(1);
/// 重连退避上限
const RECONNECT_MAX: Duration = Duration::from_secs(30);
/// 重连次数上限，超过后放弃连接
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// 解码后的上游事件
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// 价格事件（mini-ticker与trade）
    Price(PriceEvent),
    /// K线事件，同时携带派生的价格事件
    Kline {
        symbol: String,
        kline: KlineData,
        event: PriceEvent,
    },
}

/// 上游事件处理接口
///
/// 在读取任务上同步调用，实现方不得阻塞
pub trait FeedHandler: Send + Sync {
    fn on_price_event(&self, event: PriceEvent);
    fn on_kline_event(&self, symbol: &str, kline: &KlineData, event: &PriceEvent);
}

/// 上游组合流客户端
///
/// 单条连接订阅全部流，路径形如 /stream?streams=s1/s2/...
/// 断线按 min(1s * 2^n, 30s) 退避重连，连续失败10次后放弃
pub struct CombinedStreamClient {
    ws_base: String,
    streams: Vec<String>,
    handler: Arc<dyn FeedHandler>,
    connected: Arc<AtomicBool>,
    decode_errors: Arc<AtomicU64>,
}

impl CombinedStreamClient {
    pub fn new(ws_base: String, streams: Vec<String>, handler: Arc<dyn FeedHandler>) -> Self {
        Self {
            ws_base,
            streams,
            handler,
            connected: Arc::new(AtomicBool::new(false)),
            decode_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 连接状态标志，健康检查用
    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    /// 累计解码失败的帧数
    pub fn decode_error_count(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    /// 拼接组合流URL
    fn stream_url(&self) -> String {
        format!("{}/stream?streams={}", self.ws_base, self.streams.join("/"))
    }

    /// 运行客户端直到停机信号或重连次数耗尽
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let url = self.stream_url();
        let mut attempts: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            if attempts > 0 {
                if attempts > MAX_RECONNECT_ATTEMPTS {
                    error!(
                        target: "feed",
                        attempts,
                        "重连次数耗尽，放弃上游连接"
                    );
                    break;
                }
                let delay = reconnect_delay(attempts);
                warn!(target: "feed", attempts, delay_ms = delay.as_millis() as u64, "等待重连上游");
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }

            info!(target: "feed", url = %url, "连接上游组合流");
            let ws_stream = match connect_async(url.as_str()).await {
                Ok((ws_stream, _)) => ws_stream,
                Err(e) => {
                    warn!(target: "feed", "上游连接失败: {}", e);
                    attempts += 1;
                    continue;
                }
            };

            info!(target: "feed", streams = self.streams.len(), "上游连接已建立");
            self.connected.store(true, Ordering::Relaxed);
            attempts = 0;

            let (mut write, mut read) = ws_stream.split();

            // 读取循环：收到停机信号或连接中断时退出
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!(target: "feed", "收到停机信号，关闭上游连接");
                        let _ = write.send(Message::Close(None)).await;
                        self.connected.store(false, Ordering::Relaxed);
                        return;
                    }
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                self.dispatch_frame(&text);
                            }
                            Some(Ok(Message::Ping(data))) => {
                                // 对上游的每个ping都回pong，不主动发心跳
                                if let Err(e) = write.send(Message::Pong(data)).await {
                                    error!(target: "feed", "发送Pong失败: {}", e);
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                info!(target: "feed", "上游关闭连接: {:?}", frame);
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!(target: "feed", "上游读取错误: {}", e);
                                break;
                            }
                            None => {
                                warn!(target: "feed", "上游连接已断开");
                                break;
                            }
                        }
                    }
                }
            }

            self.connected.store(false, Ordering::Relaxed);
            attempts += 1;
        }

        self.connected.store(false, Ordering::Relaxed);
    }

    /// 解码一帧并交给处理器；解码失败只丢帧，不断开连接
    fn dispatch_frame(&self, text: &str) {
        match parse_stream_message(text) {
            Ok(Some(FeedEvent::Price(event))) => {
                self.handler.on_price_event(event);
            }
            Ok(Some(FeedEvent::Kline { symbol, kline, event })) => {
                self.handler.on_kline_event(&symbol, &kline, &event);
            }
            Ok(None) => {}
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(target: "feed", "解码上游消息失败，已丢帧: {}", e);
            }
        }
    }
}

/// 重连延迟: min(1s * 2^attempts, 30s)，attempts从1开始
fn reconnect_delay(attempts: u32) -> Duration {
    let exp = RECONNECT_BASE
        .as_millis()
        .saturating_mul(1u128 << (attempts - 1).min(30));
    Duration::from_millis(exp.min(RECONNECT_MAX.as_millis()) as u64)
}

/// 解析组合流消息
///
/// 帧格式为 {"stream": "...", "data": {...}}，data.e 区分事件类型。
/// 没有data.e的帧（订阅确认等）返回None；未知事件类型记日志后丢弃
pub fn parse_stream_message(text: &str) -> Result<Option<FeedEvent>> {
    let frame: Value = serde_json::from_str(text)?;

    let data = match frame.get("data") {
        Some(data) => data,
        None => return Ok(None),
    };

    let event_type = match data.get("e").and_then(|e| e.as_str()) {
        Some(event_type) => event_type,
        None => return Ok(None),
    };

    match event_type {
        "24hrMiniTicker" => {
            let ticker: MiniTickerData = serde_json::from_value(data.clone())?;
            Ok(Some(FeedEvent::Price(PriceEvent {
                symbol: normalize_symbol(&ticker.symbol),
                price: ticker.close_price,
                ts: ticker.event_time,
                source: PriceSource::MiniTicker,
                raw: data.clone(),
            })))
        }
        "trade" => {
            let trade: TradeData = serde_json::from_value(data.clone())?;
            Ok(Some(FeedEvent::Price(PriceEvent {
                symbol: normalize_symbol(&trade.symbol),
                price: trade.price,
                ts: trade.event_time,
                source: PriceSource::Trade,
                raw: data.clone(),
            })))
        }
        "kline" => {
            let kline_event: KlineEventData = serde_json::from_value(data.clone())?;
            let symbol = normalize_symbol(&kline_event.symbol);
            let event = PriceEvent {
                symbol: symbol.clone(),
                price: kline_event.kline.close.clone(),
                ts: kline_event.event_time,
                source: PriceSource::Kline,
                raw: data.clone(),
            };
            Ok(Some(FeedEvent::Kline {
                symbol,
                kline: kline_event.kline,
                event,
            }))
        }
        other => {
            debug!(target: "feed", event_type = other, "未知的上游事件类型，已丢弃");
            Ok(None)
        }
    }
}

