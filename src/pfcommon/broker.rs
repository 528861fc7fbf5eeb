use crate::pfcommon::models::{KlineEventData, PriceEvent};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// 广播通道前缀，完整通道名为 prices:<SYMBOL>
pub const PRICE_CHANNEL_PREFIX: &str = "prices:";

/// 订阅端使用的通配模式
pub const PRICE_CHANNEL_PATTERN: &str = "prices:*";

/// 跨副本消息信封
///
/// origin为发布副本的标识，订阅端据此丢弃自己发布的消息，
/// 避免本地客户端收到重复推送
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerEnvelope {
    pub origin: String,
    pub event: PriceEvent,
}

/// 下游广播接口
///
/// 上游馈送与代理订阅端都只依赖这个接口，具体网关在组装时注入
pub trait PriceBroadcaster: Send + Sync {
    /// 向订阅了该交易对的客户端推送价格更新
    fn broadcast_price(&self, event: &PriceEvent);
    /// 向订阅了该交易对的客户端推送K线更新
    fn broadcast_kline(&self, symbol: &str, kline_payload: &serde_json::Value);
}

/// 发布任务的指令
enum PublishOp {
    /// 向指定通道发布一条消息
    Publish { channel: String, payload: String },
    /// 排空在途消息后退出
    Close,
}

/// 消息代理客户端
///
/// 持有两个逻辑连接：发布连接由内部通道驱动，订阅连接对 prices:* 做模式订阅。
/// 发布是发后不理的，代理故障只记日志，绝不阻塞行情链路。
/// close()让发布任务先排空已入队的消息再退出，订阅任务立即停止
pub struct BrokerClient {
    origin: String,
    redis_url: String,
    publish_tx: mpsc::UnboundedSender<PublishOp>,
    connected: Arc<AtomicBool>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl BrokerClient {
    /// 创建代理客户端并启动发布任务
    pub fn new(redis_url: String) -> Arc<Self> {
        let origin = uuid::Uuid::new_v4().to_string();
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(false));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let client = Arc::new(Self {
            origin,
            redis_url: redis_url.clone(),
            publish_tx,
            connected: connected.clone(),
            closed: AtomicBool::new(false),
            shutdown_tx,
        });

        tokio::spawn(run_publisher(redis_url, publish_rx, connected, shutdown_rx));

        client
    }

    /// 关闭代理客户端
    ///
    /// 订阅任务立即退出；发布任务把close()之前入队的消息发完再退出，
    /// 之后的发布调用直接丢弃
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "broker", "正在关闭代理客户端");
        let _ = self.shutdown_tx.send(true);
        let _ = self.publish_tx.send(PublishOp::Close);
    }

    /// 本副本的标识
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// 代理连接状态（健康检查用）
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// 发布价格事件到 prices:<SYMBOL>（发后不理）
    pub fn publish_price(&self, event: &PriceEvent) {
        if self.closed.load(Ordering::SeqCst) {
            debug!(target: "broker", "代理已关闭，消息被丢弃");
            return;
        }

        let envelope = BrokerEnvelope {
            origin: self.origin.clone(),
            event: event.clone(),
        };

        let payload = match serde_json::to_string(&envelope) {
            Ok(p) => p,
            Err(e) => {
                error!(target: "broker", "序列化价格事件失败: {}", e);
                return;
            }
        };

        let channel = format!("{}{}", PRICE_CHANNEL_PREFIX, event.symbol);
        if self
            .publish_tx
            .send(PublishOp::Publish { channel, payload })
            .is_err()
        {
            warn!(target: "broker", "发布任务已退出，消息被丢弃");
        }
    }

    /// 启动订阅任务，把其他副本的事件转交给本地网关
    pub fn spawn_subscriber(self: &Arc<Self>, gateway: Arc<dyn PriceBroadcaster>) {
        let redis_url = self.redis_url.clone();
        let origin = self.origin.clone();
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut retries: u32 = 0;

            loop {
                if *shutdown.borrow() {
                    info!(target: "broker", "代理订阅任务退出");
                    return;
                }

                let client = match redis::Client::open(redis_url.as_str()) {
                    Ok(c) => c,
                    Err(e) => {
                        error!(target: "broker", "Redis地址无效: {}", e);
                        return;
                    }
                };

                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(e) = pubsub.psubscribe(PRICE_CHANNEL_PATTERN).await {
                            error!(target: "broker", "模式订阅失败: {}", e);
                        } else {
                            info!(target: "broker", pattern = PRICE_CHANNEL_PATTERN, "代理订阅已建立");
                            retries = 0;

                            let mut stream = pubsub.on_message();
                            loop {
                                tokio::select! {
                                    _ = shutdown.changed() => {
                                        info!(target: "broker", "代理订阅任务退出");
                                        return;
                                    }
                                    msg = stream.next() => {
                                        let msg = match msg {
                                            Some(msg) => msg,
                                            None => {
                                                warn!(target: "broker", "代理订阅流中断，准备重连");
                                                break;
                                            }
                                        };
                                        let payload: String = match msg.get_payload() {
                                            Ok(p) => p,
                                            Err(e) => {
                                                warn!(target: "broker", "读取订阅消息失败: {}", e);
                                                continue;
                                            }
                                        };
                                        handle_broker_message(&origin, &payload, gateway.as_ref());
                                    }
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!(target: "broker", "代理订阅连接失败: {}", e);
                    }
                }

                retries += 1;
                tokio::select! {
                    _ = sleep(reconnect_delay(retries)) => {}
                    _ = shutdown.changed() => {}
                }
            }
        });
    }
}

/// 重连延迟: min(retries * 100ms, 3s)
fn reconnect_delay(retries: u32) -> Duration {
    Duration::from_millis((retries as u64 * 100).min(3000))
}

/// 发布任务：消费内部通道，写入代理，断线重连
///
/// 收到Close指令时之前入队的消息已经发完，直接退出；
/// 停机期间代理不可达则放弃剩余消息
async fn run_publisher(
    redis_url: String,
    mut rx: mpsc::UnboundedReceiver<PublishOp>,
    connected: Arc<AtomicBool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let client = match redis::Client::open(redis_url.as_str()) {
        Ok(c) => c,
        Err(e) => {
            error!(target: "broker", "Redis地址无效: {}", e);
            return;
        }
    };

    let mut retries: u32 = 0;

    loop {
        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => {
                info!(target: "broker", "代理发布连接已建立");
                connected.store(true, Ordering::Relaxed);
                retries = 0;
                conn
            }
            Err(e) => {
                connected.store(false, Ordering::Relaxed);
                if *shutdown.borrow() {
                    info!(target: "broker", "代理不可达，发布任务放弃剩余消息并退出");
                    return;
                }
                retries += 1;
                warn!(target: "broker", retries, "代理发布连接失败: {}", e);
                tokio::select! {
                    _ = sleep(reconnect_delay(retries)) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
        };

        while let Some(op) = rx.recv().await {
            let (channel, payload) = match op {
                PublishOp::Publish { channel, payload } => (channel, payload),
                PublishOp::Close => {
                    info!(target: "broker", "发布队列已排空，发布任务退出");
                    connected.store(false, Ordering::Relaxed);
                    return;
                }
            };

            match redis::AsyncCommands::publish::<_, _, i64>(&mut conn, &channel, &payload).await {
                Ok(receivers) => {
                    debug!(target: "broker", channel = %channel, receivers, "消息已发布");
                }
                Err(e) => {
                    // 发后不理：当前消息丢弃，连接重建
                    warn!(target: "broker", channel = %channel, "发布失败，消息被丢弃: {}", e);
                    connected.store(false, Ordering::Relaxed);
                    break;
                }
            }
        }

        if rx.is_closed() && rx.is_empty() {
            info!(target: "broker", "发布通道已关闭，发布任务退出");
            return;
        }

        retries += 1;
        tokio::select! {
            _ = sleep(reconnect_delay(retries)) => {}
            _ = shutdown.changed() => {}
        }
    }
}

/// 处理一条来自其他副本的订阅消息
fn handle_broker_message(own_origin: &str, payload: &str, gateway: &dyn PriceBroadcaster) {
    let envelope: BrokerEnvelope = match serde_json::from_str(payload) {
        Ok(env) => env,
        Err(e) => {
            warn!(target: "broker", "解析代理消息失败: {}", e);
            return;
        }
    };

    // 本副本发布的消息在发出时已完成本地扇出
    if envelope.origin == own_origin {
        return;
    }

    let event = envelope.event;

    // K线事件额外走klineUpdate广播，且先于派生的priceUpdate
    if event.raw.get("e").and_then(|e| e.as_str()) == Some("kline") {
        if let Ok(kline_event) = serde_json::from_value::<KlineEventData>(event.raw.clone()) {
            let payload = serde_json::json!({
                "symbol": kline_event.symbol,
                "interval": kline_event.kline.interval,
                "kline": kline_event.kline,
            });
            gateway.broadcast_kline(&event.symbol, &payload);
        }
    }

    gateway.broadcast_price(&event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pfcommon::models::PriceSource;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// 记录每次广播的内容与全局序号，用于断言投递顺序
    struct RecordingGateway {
        seq: AtomicUsize,
        prices: Mutex<Vec<(usize, PriceEvent)>>,
        klines: Mutex<Vec<(usize, String, serde_json::Value)>>,
    }

    impl RecordingGateway {
        fn new() -> Self {
            Self {
                seq: AtomicUsize::new(0),
                prices: Mutex::new(Vec::new()),
                klines: Mutex::new(Vec::new()),
            }
        }
    }

    impl PriceBroadcaster for RecordingGateway {
        fn broadcast_price(&self, event: &PriceEvent) {
            let seq = self.seq.fetch_add(1, Ordering::SeqCst);
            self.prices.lock().unwrap().push((seq, event.clone()));
        }

        fn broadcast_kline(&self, symbol: &str, kline_payload: &serde_json::Value) {
            let seq = self.seq.fetch_add(1, Ordering::SeqCst);
            self.klines
                .lock()
                .unwrap()
                .push((seq, symbol.to_string(), kline_payload.clone()));
        }
    }

    fn sample_event() -> PriceEvent {
        PriceEvent {
            symbol: "BTCUSDT".to_string(),
            price: "70000.00".to_string(),
            ts: 1700000000000,
            source: PriceSource::MiniTicker,
            raw: serde_json::json!({"e": "24hrMiniTicker", "s": "BTCUSDT", "c": "70000.00"}),
        }
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelope = BrokerEnvelope {
            origin: "replica-a".to_string(),
            event: sample_event(),
        };

        let wire = serde_json::to_string(&envelope).unwrap();
        let decoded: BrokerEnvelope = serde_json::from_str(&wire).unwrap();

        assert_eq!(decoded.origin, "replica-a");
        assert_eq!(decoded.event.symbol, envelope.event.symbol);
        assert_eq!(decoded.event.price, envelope.event.price);
        assert_eq!(decoded.event.ts, envelope.event.ts);
        assert_eq!(decoded.event.source, envelope.event.source);
    }

    #[test]
    fn test_own_origin_discarded() {
        let gateway = RecordingGateway::new();
        let envelope = BrokerEnvelope {
            origin: "replica-a".to_string(),
            event: sample_event(),
        };
        let wire = serde_json::to_string(&envelope).unwrap();

        handle_broker_message("replica-a", &wire, &gateway);
        assert!(gateway.prices.lock().unwrap().is_empty());

        handle_broker_message("replica-b", &wire, &gateway);
        assert_eq!(gateway.prices.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_kline_message_broadcasts_kline_before_price() {
        let gateway = RecordingGateway::new();
        let raw = serde_json::json!({
            "e": "kline",
            "E": 1700000041000i64,
            "s": "BTCUSDT",
            "k": {
                "t": 1700000040000i64, "T": 1700000099999i64, "i": "1m",
                "o": "42.0", "c": "43.0", "h": "43.5", "l": "41.9",
                "v": "120.5", "n": 321, "x": false,
                "q": "5100.2", "V": "60.1", "Q": "2550.3"
            }
        });
        let envelope = BrokerEnvelope {
            origin: "replica-a".to_string(),
            event: PriceEvent {
                symbol: "BTCUSDT".to_string(),
                price: "43.0".to_string(),
                ts: 1700000041000,
                source: PriceSource::Kline,
                raw,
            },
        };
        let wire = serde_json::to_string(&envelope).unwrap();

        handle_broker_message("replica-b", &wire, &gateway);

        let prices = gateway.prices.lock().unwrap();
        let klines = gateway.klines.lock().unwrap();
        assert_eq!(prices.len(), 1);
        assert_eq!(klines.len(), 1);
        assert_eq!(klines[0].1, "BTCUSDT");
        // klineUpdate必须先于派生的priceUpdate
        assert!(
            klines[0].0 < prices[0].0,
            "klineUpdate(seq={})应先于priceUpdate(seq={})",
            klines[0].0,
            prices[0].0
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = BrokerClient::new("redis://127.0.0.1:9/".to_string());
        broker.close();
        broker.close();
        // 关闭后发布直接丢弃，不会panic也不会入队
        broker.publish_price(&sample_event());
    }

    #[test]
    fn test_reconnect_delay_capped() {
        assert_eq!(reconnect_delay(1), Duration::from_millis(100));
        assert_eq!(reconnect_delay(15), Duration::from_millis(1500));
        assert_eq!(reconnect_delay(100), Duration::from_millis(3000));
    }
}
