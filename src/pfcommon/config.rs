use std::path::PathBuf;
use tracing::info;

/// 服务配置
///
/// 全部从环境变量读取，未设置时使用默认值
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP/WS监听端口
    pub port: u16,
    /// Redis地址
    pub redis_host: String,
    /// Redis端口
    pub redis_port: u16,
    /// Redis密码（可选）
    pub redis_password: Option<String>,
    /// 上游WebSocket基础地址
    pub ws_base: String,
    /// 上游REST基础地址
    pub rest_base: String,
    /// 上游订阅的流名称列表
    pub streams: Vec<String>,
    /// 持久化队列名称
    pub queue_name: String,
    /// K线数据库路径
    pub db_path: PathBuf,
    /// 允许的前端来源，"*"表示全部放行
    pub frontend_url: String,
}

impl Config {
    /// 从环境变量读取配置
    pub fn from_env() -> Self {
        let port = env_or("PORT", "3000").parse().unwrap_or(3000);
        let redis_host = env_or("REDIS_HOST", "localhost");
        let redis_port = env_or("REDIS_PORT", "6379").parse().unwrap_or(6379);
        let redis_password = std::env::var("REDIS_PASSWORD").ok().filter(|s| !s.is_empty());
        let ws_base = env_or("BINANCE_SPOT_WS_BASE", "wss://stream.binance.com:9443");
        let rest_base = env_or("BINANCE_SPOT_REST_BASE", "https://api.binance.com");

        // 流名称逗号分隔，例如 "btcusdt@miniTicker,ethusdt@kline_1m"
        let streams: Vec<String> = env_or("BINANCE_STREAMS", "btcusdt@miniTicker")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let queue_name = env_or("PRICE_QUEUE_NAME", "price");
        let db_path = PathBuf::from(env_or("DATABASE_PATH", "./data/klines.db"));
        let frontend_url = env_or("FRONTEND_URL", "*");

        let config = Self {
            port,
            redis_host,
            redis_port,
            redis_password,
            ws_base,
            rest_base,
            streams,
            queue_name,
            db_path,
            frontend_url,
        };

        info!(
            target: "config",
            port = config.port,
            redis = %format!("{}:{}", config.redis_host, config.redis_port),
            streams = config.streams.len(),
            db_path = %config.db_path.display(),
            "配置加载完成"
        );

        config
    }

    /// 构建Redis连接URL
    pub fn redis_url(&self) -> String {
        match &self.redis_password {
            Some(password) => format!("redis://:{}@{}:{}/", password, self.redis_host, self.redis_port),
            None => format!("redis://{}:{}/", self.redis_host, self.redis_port),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_url() {
        let config = Config {
            port: 3000,
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            redis_password: None,
            ws_base: String::new(),
            rest_base: String::new(),
            streams: vec![],
            queue_name: "price".to_string(),
            db_path: PathBuf::new(),
            frontend_url: "*".to_string(),
        };
        assert_eq!(config.redis_url(), "redis://localhost:6379/");

        let with_password = Config {
            redis_password: Some("secret".to_string()),
            ..config
        };
        assert_eq!(with_password.redis_url(), "redis://:secret@localhost:6379/");
    }
}
