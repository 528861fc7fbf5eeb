use crate::pfcommon::broker::{BrokerClient, PriceBroadcaster};
use crate::pfcommon::models::{KlineData, PriceEvent};
use crate::pfcommon::queue::{JobQueue, KIND_PERSIST_PRICE};
use crate::pfstream::feed::FeedHandler;
use crate::pfstream::history::HistoryService;
use crate::pfstream::throttle::{
    Throttle, KLINE_BROADCAST_INTERVAL, KLINE_PERSIST_INTERVAL, PRICE_BROADCAST_INTERVAL,
    PRICE_PERSIST_INTERVAL,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// 限速器的发射产物，由统一的消费任务执行实际副作用
#[derive(Debug, Clone)]
pub enum Emission {
    /// 价格广播：本地扇出 + 代理发布
    Price(PriceEvent),
    /// K线广播，随身携带同一帧派生的价格事件
    ///
    /// 派生价格不在提交时进入价格限速器，而是等K线广播完成后
    /// 由消费任务提交，保证klineUpdate先于对应的priceUpdate
    Kline {
        symbol: String,
        kline: KlineData,
        event: PriceEvent,
    },
    /// 价格持久化任务入队
    PersistPrice(PriceEvent),
    /// K线落库
    PersistKline { symbol: String, kline: KlineData },
}

/// 事件分发器
///
/// 上游读取任务同步调用，内部只做限速判定与通道投递。
/// 四条限速通道共用一个发射通道；K线派生的价格广播由K线发射驱动，
/// 不靠提交顺序来维持投递顺序
pub struct EventDispatcher {
    price_throttle: Arc<Throttle<String, Emission>>,
    kline_throttle: Arc<Throttle<(String, String), Emission>>,
    persist_throttle: Arc<Throttle<String, Emission>>,
    kline_persist_throttle: Arc<Throttle<(String, String), Emission>>,
}

impl EventDispatcher {
    /// 创建分发器，返回分发器与发射通道的接收端
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Emission>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let dispatcher = Arc::new(Self {
            price_throttle: Throttle::new(PRICE_BROADCAST_INTERVAL, tx.clone()),
            kline_throttle: Throttle::new(KLINE_BROADCAST_INTERVAL, tx.clone()),
            persist_throttle: Throttle::new(PRICE_PERSIST_INTERVAL, tx.clone()),
            kline_persist_throttle: Throttle::new(KLINE_PERSIST_INTERVAL, tx),
        });

        (dispatcher, rx)
    }

    /// K线广播完成后，把派生的价格事件提交给价格限速器
    fn offer_derived_price(&self, event: PriceEvent) {
        let symbol = event.symbol.clone();
        self.price_throttle.offer(symbol, Emission::Price(event));
    }

    /// 停机时冲刷所有限速器的pending值
    pub fn flush(&self) {
        self.price_throttle.flush();
        self.kline_throttle.flush();
        self.persist_throttle.flush();
        self.kline_persist_throttle.flush();
    }
}

impl FeedHandler for EventDispatcher {
    fn on_price_event(&self, event: PriceEvent) {
        let symbol = event.symbol.clone();
        self.persist_throttle
            .offer(symbol.clone(), Emission::PersistPrice(event.clone()));
        self.price_throttle.offer(symbol, Emission::Price(event));
    }

    fn on_kline_event(&self, symbol: &str, kline: &KlineData, event: &PriceEvent) {
        let key = (symbol.to_string(), kline.interval.clone());

        // 持久化入队不受广播顺序约束，按到达节流
        self.persist_throttle
            .offer(symbol.to_string(), Emission::PersistPrice(event.clone()));

        // 派生的价格事件随K线一起走K线限速器：K线被合并挂起时价格同样挂起，
        // 消费任务广播完klineUpdate才提交价格，顺序在结构上成立
        self.kline_throttle.offer(
            key.clone(),
            Emission::Kline {
                symbol: symbol.to_string(),
                kline: kline.clone(),
                event: event.clone(),
            },
        );

        // 已收盘K线绕过限速立即落库，未收盘按5秒合并
        let persist = Emission::PersistKline {
            symbol: symbol.to_string(),
            kline: kline.clone(),
        };
        if kline.is_closed {
            self.kline_persist_throttle.send_now(persist);
        } else {
            self.kline_persist_throttle.offer(key, persist);
        }
    }
}

/// 发射消费循环
///
/// 所有会挂起的副作用（网关写出、代理发布、任务入队、落库）都在这里执行，
/// 限速判定路径上没有任何等待
pub async fn run_emission_loop(
    mut rx: mpsc::UnboundedReceiver<Emission>,
    dispatcher: Arc<EventDispatcher>,
    gateway: Arc<dyn PriceBroadcaster>,
    broker: Arc<BrokerClient>,
    queue: Arc<JobQueue>,
    history: Arc<HistoryService>,
) {
    info!(target: "throttle", "发射消费循环已启动");

    while let Some(emission) = rx.recv().await {
        match emission {
            Emission::Price(event) => {
                gateway.broadcast_price(&event);
                broker.publish_price(&event);
            }
            Emission::Kline { symbol, kline, event } => {
                let payload = serde_json::json!({
                    "symbol": symbol,
                    "interval": kline.interval,
                    "kline": kline,
                });
                gateway.broadcast_kline(&symbol, &payload);
                // klineUpdate已广播，派生价格此刻才进入价格限速
                dispatcher.offer_derived_price(event);
            }
            Emission::PersistPrice(event) => {
                queue.enqueue(
                    KIND_PERSIST_PRICE,
                    serde_json::json!({
                        "symbol": event.symbol,
                        "price": event.price,
                        "ts": event.ts,
                    }),
                );
            }
            Emission::PersistKline { symbol, kline } => {
                history.upsert_stream_kline(&symbol, &kline);
            }
        }
    }

    info!(target: "throttle", "发射消费循环已停止");
}
