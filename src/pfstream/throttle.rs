use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::debug;

/// 价格广播的最小发射间隔（按交易对）
pub const PRICE_BROADCAST_INTERVAL: Duration = Duration::from_millis(200);
/// K线广播的最小发射间隔（按交易对+周期）
pub const KLINE_BROADCAST_INTERVAL: Duration = Duration::from_millis(500);
/// 价格持久化入队的最小间隔（按交易对）
pub const PRICE_PERSIST_INTERVAL: Duration = Duration::from_millis(1000);
/// K线持久化的最小间隔（按交易对+周期），已收盘K线不受此限制
pub const KLINE_PERSIST_INTERVAL: Duration = Duration::from_millis(5000);

/// 单个键的限速状态
///
/// generation用于识别过期定时器：flush之后残留的定时器到点时不得再发射
struct Entry<V> {
    last_emit: Option<Instant>,
    pending: Option<V>,
    timer_armed: bool,
    generation: u64,
}

impl<V> Default for Entry<V> {
    fn default() -> Self {
        Self {
            last_emit: None,
            pending: None,
            timer_armed: false,
            generation: 0,
        }
    }
}

/// 按键限速的合并发射器
///
/// 对每个键维护 lastEmit 与 pending：
/// - 距上次发射已满最小间隔的事件立即发射；
/// - 否则记为pending并按需挂一个一次性定时器，到点发射届时最新的pending；
/// - 定时器已挂起时只覆盖pending。
///
/// 这保证了发射间隔不小于最小间隔，且静默期的最后一个值总会被发射出去。
/// 判定过程持有普通互斥锁，从不挂起；实际发射通过通道交给消费任务
pub struct Throttle<K, V> {
    min_interval: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
    out: mpsc::UnboundedSender<V>,
}

impl<K, V> Throttle<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    pub fn new(min_interval: Duration, out: mpsc::UnboundedSender<V>) -> Arc<Self> {
        Arc::new(Self {
            min_interval,
            entries: Mutex::new(HashMap::new()),
            out,
        })
    }

    /// 提交一个事件，由限速器决定立即发射、延迟发射或合并
    pub fn offer(self: &Arc<Self>, key: K, value: V) {
        let (deadline, generation) = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.entry(key.clone()).or_default();
            let now = Instant::now();

            if entry.timer_armed {
                // 定时器在途，只覆盖pending，到点的定时器会取走最新值
                entry.pending = Some(value);
                return;
            }

            match entry.last_emit {
                Some(last) if now.duration_since(last) < self.min_interval => {
                    entry.pending = Some(value);
                    entry.timer_armed = true;
                    entry.generation += 1;
                    (last + self.min_interval, entry.generation)
                }
                _ => {
                    entry.last_emit = Some(now);
                    let _ = self.out.send(value);
                    return;
                }
            }
        };

        let throttle = Arc::clone(self);
        tokio::spawn(async move {
            sleep_until(deadline).await;
            throttle.fire(&key, generation);
        });
    }

    /// 绕过限速直接发射（已收盘K线走这条路径）
    pub fn send_now(&self, value: V) {
        let _ = self.out.send(value);
    }

    /// 定时器到点：发射当前pending
    fn fire(&self, key: &K, generation: u64) {
        let value = {
            let mut entries = self.entries.lock().unwrap();
            let entry = match entries.get_mut(key) {
                Some(entry) => entry,
                None => return,
            };
            // 过期定时器（flush后该键已重新挂起新定时器）直接作废
            if !entry.timer_armed || entry.generation != generation {
                return;
            }
            entry.timer_armed = false;
            match entry.pending.take() {
                Some(value) => {
                    entry.last_emit = Some(Instant::now());
                    Some(value)
                }
                None => None,
            }
        };

        if let Some(value) = value {
            let _ = self.out.send(value);
        }
    }

    /// 立即发射所有pending值（停机时调用，保证尾值不丢）
    pub fn flush(&self) {
        let drained: Vec<V> = {
            let mut entries = self.entries.lock().unwrap();
            let now = Instant::now();
            entries
                .values_mut()
                .filter_map(|entry| {
                    entry.timer_armed = false;
                    entry.pending.take().map(|value| {
                        entry.last_emit = Some(now);
                        value
                    })
                })
                .collect()
        };

        if !drained.is_empty() {
            debug!(target: "throttle", count = drained.len(), "停机冲刷pending值");
        }
        for value in drained {
            let _ = self.out.send(value);
        }
    }
}
