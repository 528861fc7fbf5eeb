use crate::pfcommon::broker::PriceBroadcaster;
use crate::pfcommon::models::{normalize_symbol, PriceEvent};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// 每个客户端的出站缓冲容量
///
/// 缓冲满说明客户端消费不过来，新帧直接丢弃（易失投递）
const CLIENT_BUFFER: usize = 32;

type ClientSender = mpsc::Sender<String>;

/// 下游价格网关
///
/// 维护 交易对 -> 订阅客户端 的房间关系。
/// 广播对每个客户端做非阻塞写：缓冲满就丢帧，从不排队、从不反压
pub struct PriceGateway {
    rooms: RwLock<HashMap<String, HashMap<u64, ClientSender>>>,
    next_client_id: AtomicU64,
}

impl PriceGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
        })
    }

    /// 分配客户端标识
    fn next_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    /// 把客户端加入交易对房间
    pub fn join(&self, symbol: &str, client_id: u64, sender: ClientSender) {
        let mut rooms = self.rooms.write().unwrap();
        rooms
            .entry(symbol.to_string())
            .or_default()
            .insert(client_id, sender);
        debug!(target: "gateway", symbol, client_id, "客户端订阅");
    }

    /// 把客户端移出交易对房间；房间空了就删除
    pub fn leave(&self, symbol: &str, client_id: u64) {
        let mut rooms = self.rooms.write().unwrap();
        if let Some(members) = rooms.get_mut(symbol) {
            members.remove(&client_id);
            if members.is_empty() {
                rooms.remove(symbol);
            }
        }
        debug!(target: "gateway", symbol, client_id, "客户端退订");
    }

    /// 客户端断开：从所有房间原子移除
    pub fn remove_client(&self, client_id: u64) {
        let mut rooms = self.rooms.write().unwrap();
        rooms.retain(|_, members| {
            members.remove(&client_id);
            !members.is_empty()
        });
    }

    /// 某个房间当前的成员数
    pub fn room_size(&self, symbol: &str) -> usize {
        self.rooms
            .read()
            .unwrap()
            .get(symbol)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    /// 向房间内所有客户端做易失广播
    fn broadcast_to_room(&self, symbol: &str, payload: String) {
        let rooms = self.rooms.read().unwrap();
        let members = match rooms.get(symbol) {
            Some(members) => members,
            None => return,
        };

        let mut dropped = 0usize;
        for sender in members.values() {
            // 非阻塞写：缓冲满或客户端已断开都直接丢帧
            if sender.try_send(payload.clone()).is_err() {
                dropped += 1;
            }
        }

        if dropped > 0 {
            debug!(target: "gateway", symbol, dropped, "部分客户端缓冲已满，帧被丢弃");
        }
    }
}

impl PriceBroadcaster for PriceGateway {
    fn broadcast_price(&self, event: &PriceEvent) {
        // 短键设计，压缩带宽: s=交易对 p=价格 t=事件时间
        let payload = json!({
            "event": "priceUpdate",
            "data": { "s": event.symbol, "p": event.price, "t": event.ts },
        })
        .to_string();
        self.broadcast_to_room(&event.symbol, payload);
    }

    fn broadcast_kline(&self, symbol: &str, kline_payload: &Value) {
        let payload = json!({
            "event": "klineUpdate",
            "data": kline_payload,
        })
        .to_string();
        self.broadcast_to_room(symbol, payload);
    }
}

/// 客户端入站消息信封
#[derive(Debug, Deserialize)]
struct ClientEnvelope {
    event: String,
    #[serde(default)]
    data: Option<Value>,
}

/// 从subscribe/unsubscribe的data字段提取交易对
///
/// 兼容三种形态：{"symbol": "..."} 对象、内嵌JSON的字符串、裸交易对字符串
fn extract_symbol(data: Option<&Value>) -> Option<String> {
    let data = data?;

    if let Some(obj_symbol) = data.get("symbol").and_then(|s| s.as_str()) {
        let symbol = normalize_symbol(obj_symbol);
        return if symbol.is_empty() { None } else { Some(symbol) };
    }

    if let Some(text) = data.as_str() {
        // 字符串先按JSON解析，失败再当裸交易对
        if let Ok(inner) = serde_json::from_str::<Value>(text) {
            if let Some(obj_symbol) = inner.get("symbol").and_then(|s| s.as_str()) {
                let symbol = normalize_symbol(obj_symbol);
                return if symbol.is_empty() { None } else { Some(symbol) };
            }
        }
        let symbol = normalize_symbol(text);
        return if symbol.is_empty() { None } else { Some(symbol) };
    }

    None
}

fn ack_success(event: &str, symbol: &str) -> String {
    json!({
        "event": event,
        "data": { "status": "success", "symbol": symbol },
    })
    .to_string()
}

fn ack_error(event: &str, message: &str) -> String {
    json!({
        "event": event,
        "data": { "status": "error", "message": message },
    })
    .to_string()
}

/// 处理一条 /prices 连接
pub async fn handle_socket(socket: WebSocket, gateway: Arc<PriceGateway>) {
    let client_id = gateway.next_id();
    info!(target: "gateway", client_id, "客户端已连接");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(CLIENT_BUFFER);

    // 写出任务：排空客户端通道
    let forward_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    // 入站循环：只认subscribe/unsubscribe
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let envelope: ClientEnvelope = match serde_json::from_str(&text) {
                    Ok(envelope) => envelope,
                    Err(_) => {
                        let _ = tx.try_send(ack_error("error", "invalid message"));
                        continue;
                    }
                };

                match envelope.event.as_str() {
                    "subscribe" => match extract_symbol(envelope.data.as_ref()) {
                        Some(symbol) => {
                            gateway.join(&symbol, client_id, tx.clone());
                            let _ = tx.try_send(ack_success("subscribe", &symbol));
                        }
                        None => {
                            let _ = tx.try_send(ack_error("subscribe", "symbol is required"));
                        }
                    },
                    "unsubscribe" => match extract_symbol(envelope.data.as_ref()) {
                        Some(symbol) => {
                            gateway.leave(&symbol, client_id);
                            let _ = tx.try_send(ack_success("unsubscribe", &symbol));
                        }
                        None => {
                            let _ = tx.try_send(ack_error("unsubscribe", "symbol is required"));
                        }
                    },
                    other => {
                        debug!(target: "gateway", client_id, event = other, "忽略未知事件");
                    }
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    // 断开即从所有房间移除，无需显式退订
    gateway.remove_client(client_id);
    forward_task.abort();
    info!(target: "gateway", client_id, "客户端已断开");
}
