// 导出服务端模块
pub mod gateway;
pub mod web;

use crate::pfcommon::broker::BrokerClient;
use crate::pfcommon::queue::JobQueue;
use crate::pfstream::history::HistoryService;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// HTTP/WS处理器共享的应用状态
pub struct AppState {
    pub gateway: Arc<PriceGateway>,
    pub history: Arc<HistoryService>,
    pub queue: Arc<JobQueue>,
    pub broker: Arc<BrokerClient>,
    pub upstream_connected: Arc<AtomicBool>,
}

pub use gateway::PriceGateway;
