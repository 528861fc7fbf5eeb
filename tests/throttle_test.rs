use price_fanout::pfstream::Throttle;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::advance;

// 让spawn出来的定时器任务有机会跑完
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<u32>) -> Vec<u32> {
    let mut out = Vec::new();
    while let Ok(v) = rx.try_recv() {
        out.push(v);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn test_first_event_emits_immediately() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let throttle = Throttle::new(Duration::from_millis(200), tx);

    throttle.offer("BTCUSDT".to_string(), 1);
    settle().await;

    assert_eq!(drain(&mut rx), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn test_burst_coalesces_to_two_frames() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let throttle = Throttle::new(Duration::from_millis(200), tx);

    // 100毫秒内50个事件，价格1..=50
    for i in 1..=50u32 {
        throttle.offer("BTCUSDT".to_string(), i);
        advance(Duration::from_millis(2)).await;
    }

    // 等定时器到点
    advance(Duration::from_millis(200)).await;
    settle().await;

    let got = drain(&mut rx);
    // 至多2帧：首个立即发射 + 尾值合并发射
    assert!(got.len() <= 2, "收到{}帧，超出限速上限", got.len());
    assert_eq!(*got.first().unwrap(), 1);
    assert_eq!(*got.last().unwrap(), 50, "尾值必须是最后一个事件");
}

#[tokio::test(start_paused = true)]
async fn test_trailing_value_always_emitted() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let throttle = Throttle::new(Duration::from_millis(200), tx);

    throttle.offer("BTCUSDT".to_string(), 1);
    advance(Duration::from_millis(50)).await;
    throttle.offer("BTCUSDT".to_string(), 2);
    settle().await;

    // 此时只有首帧
    assert_eq!(drain(&mut rx), vec![1]);

    // 静默两个周期后，尾值必须已经发射
    advance(Duration::from_millis(400)).await;
    settle().await;
    assert_eq!(drain(&mut rx), vec![2]);
}

#[tokio::test(start_paused = true)]
async fn test_pending_overwritten_by_latest() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let throttle = Throttle::new(Duration::from_millis(200), tx);

    throttle.offer("BTCUSDT".to_string(), 1);
    advance(Duration::from_millis(50)).await;
    throttle.offer("BTCUSDT".to_string(), 2);
    advance(Duration::from_millis(50)).await;
    throttle.offer("BTCUSDT".to_string(), 3);

    advance(Duration::from_millis(200)).await;
    settle().await;

    // 中间值2被3覆盖，不会出现在发射序列里
    assert_eq!(drain(&mut rx), vec![1, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_emission_gap_not_less_than_min_interval() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let throttle = Throttle::new(Duration::from_millis(200), tx);

    // 持续供给事件，检查相邻发射之间至少隔一个周期
    let mut emit_times = Vec::new();
    for i in 0..40u32 {
        throttle.offer("BTCUSDT".to_string(), i);
        if rx.try_recv().is_ok() {
            emit_times.push(tokio::time::Instant::now());
        }
        advance(Duration::from_millis(30)).await;
        settle().await;
        while rx.try_recv().is_ok() {
            emit_times.push(tokio::time::Instant::now());
        }
    }

    assert!(emit_times.len() >= 2, "应该有多次发射");
    for pair in emit_times.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(
            gap >= Duration::from_millis(200) - Duration::from_millis(31),
            "发射间隔{}ms小于限速周期",
            gap.as_millis()
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_keys_throttled_independently() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let throttle = Throttle::new(Duration::from_millis(200), tx);

    throttle.offer("BTCUSDT".to_string(), 1);
    throttle.offer("ETHUSDT".to_string(), 2);
    settle().await;

    // 不同键互不影响，都立即发射
    let got = drain(&mut rx);
    assert_eq!(got.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_flush_emits_pending() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let throttle = Throttle::new(Duration::from_millis(200), tx);

    throttle.offer("BTCUSDT".to_string(), 1);
    advance(Duration::from_millis(10)).await;
    throttle.offer("BTCUSDT".to_string(), 2);
    settle().await;
    assert_eq!(drain(&mut rx), vec![1]);

    // 停机冲刷：pending立即发射，不等定时器
    throttle.flush();
    assert_eq!(drain(&mut rx), vec![2]);

    // 原定时器到点后不能重复发射
    advance(Duration::from_millis(300)).await;
    settle().await;
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_send_now_bypasses_throttle() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let throttle: std::sync::Arc<Throttle<String, u32>> =
        Throttle::new(Duration::from_millis(5000), tx);

    throttle.offer("BTCUSDT".to_string(), 1);
    // 已收盘K线路径：不经过限速
    throttle.send_now(2);
    throttle.send_now(3);
    settle().await;

    assert_eq!(drain(&mut rx), vec![1, 2, 3]);
}
