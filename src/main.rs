use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use price_fanout::pfcommon::broker::{BrokerClient, PriceBroadcaster};
use price_fanout::pfcommon::{BinanceApi, Config, Database, JobQueue, PersistenceWorker};
use price_fanout::pfserver::web::start_web_server;
use price_fanout::pfserver::{AppState, PriceGateway};
use price_fanout::pfstream::{
    run_emission_loop, CombinedStreamClient, EventDispatcher, FeedHandler, HistoryService,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting market data fanout service");

    let config = Config::from_env();

    // 停机信号：ctrl-c触发，所有后台任务监听
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 基础设施层：存储、代理、队列
    let db = Arc::new(Database::new(&config.db_path)?);
    let broker = BrokerClient::new(config.redis_url());
    let queue = JobQueue::new(config.redis_url(), config.queue_name.clone());

    // 服务层：历史服务、网关、分发器
    let api = BinanceApi::new(config.rest_base.clone())?;
    let history = HistoryService::new(db.clone(), api);
    let gateway = PriceGateway::new();
    let (dispatcher, emission_rx) = EventDispatcher::new();

    // 订阅其他副本的广播
    broker.spawn_subscriber(gateway.clone() as Arc<dyn PriceBroadcaster>);

    // 发射消费循环：执行广播、发布、入队、落库
    tokio::spawn(run_emission_loop(
        emission_rx,
        dispatcher.clone(),
        gateway.clone() as Arc<dyn PriceBroadcaster>,
        broker.clone(),
        queue.clone(),
        history.clone(),
    ));

    // 持久化工作进程
    let worker_handle = queue.spawn_worker(Arc::new(PersistenceWorker), shutdown_rx.clone());

    // 后台预热K线存储，失败不影响启动
    history.spawn_seeder();

    // 上游行情流
    let feed = Arc::new(CombinedStreamClient::new(
        config.ws_base.clone(),
        config.streams.clone(),
        dispatcher.clone() as Arc<dyn FeedHandler>,
    ));
    let upstream_connected = feed.connected_flag();
    let feed_shutdown = shutdown_rx.clone();
    let feed_task = {
        let feed = feed.clone();
        tokio::spawn(async move { feed.run(feed_shutdown).await })
    };

    // Web服务器（HTTP + /prices WebSocket）
    let state = Arc::new(AppState {
        gateway,
        history,
        queue,
        broker: broker.clone(),
        upstream_connected,
    });

    let mut server_task = tokio::spawn(start_web_server(
        state,
        config.port,
        config.frontend_url.clone(),
        shutdown_rx,
    ));

    // 等待ctrl-c；Web服务器提前退出视为致命错误
    let mut server_running = true;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("收到停机信号，开始有序关闭");
        }
        result = &mut server_task => {
            server_running = false;
            match result {
                Ok(Ok(())) => error!("Web服务器意外退出"),
                Ok(Err(e)) => error!("Web服务器错误: {}", e),
                Err(e) => error!("Web服务器任务异常: {}", e),
            }
        }
    }

    // 停机顺序：关闭行情流 -> 冲刷限速器 -> 关闭代理 -> 排空队列 -> 停Web服务器
    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(Duration::from_secs(5), feed_task).await.is_err() {
        error!("等待行情流退出超时");
    }

    dispatcher.flush();

    // 让发射消费循环处理完冲刷出来的尾值，再关闭代理
    tokio::time::sleep(Duration::from_millis(100)).await;
    broker.close();

    if tokio::time::timeout(Duration::from_secs(8), worker_handle).await.is_err() {
        error!("等待持久化队列排空超时");
    }

    if server_running
        && tokio::time::timeout(Duration::from_secs(5), server_task).await.is_err()
    {
        error!("等待Web服务器退出超时");
    }

    info!("服务已停止");
    Ok(())
}
