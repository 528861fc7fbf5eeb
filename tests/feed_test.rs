use price_fanout::pfcommon::models::PriceSource;
use price_fanout::pfstream::{parse_stream_message, FeedEvent};

#[test]
fn test_parse_mini_ticker() {
    let frame = r#"{
        "stream": "btcusdt@miniTicker",
        "data": {
            "e": "24hrMiniTicker", "E": 1700000000000, "s": "BTCUSDT",
            "c": "70000.00", "o": "69000.00", "h": "70500.00", "l": "68800.00",
            "v": "1234.5", "q": "85000000.0"
        }
    }"#;

    let event = match parse_stream_message(frame).unwrap().unwrap() {
        FeedEvent::Price(event) => event,
        other => panic!("期望价格事件，得到 {:?}", other),
    };

    assert_eq!(event.symbol, "BTCUSDT");
    assert_eq!(event.price, "70000.00");
    assert_eq!(event.ts, 1700000000000);
    assert_eq!(event.source, PriceSource::MiniTicker);
    // raw保留原始载荷
    assert_eq!(event.raw["e"], "24hrMiniTicker");
}

#[test]
fn test_parse_trade() {
    let frame = r#"{
        "stream": "ethusdt@trade",
        "data": {
            "e": "trade", "E": 1700000001000, "s": "ETHUSDT",
            "p": "3500.55", "q": "0.25", "T": 1700000000990
        }
    }"#;

    let event = match parse_stream_message(frame).unwrap().unwrap() {
        FeedEvent::Price(event) => event,
        other => panic!("期望价格事件，得到 {:?}", other),
    };

    assert_eq!(event.symbol, "ETHUSDT");
    assert_eq!(event.price, "3500.55");
    // ts取事件时间E，不是成交时间T
    assert_eq!(event.ts, 1700000001000);
    assert_eq!(event.source, PriceSource::Trade);
}

#[test]
fn test_parse_kline() {
    let frame = r#"{
        "stream": "btcusdt@kline_1m",
        "data": {
            "e": "kline", "E": 1700000041000, "s": "BTCUSDT",
            "k": {
                "t": 1700000040000, "T": 1700000099999, "s": "BTCUSDT", "i": "1m",
                "f": 100, "L": 421, "o": "42.1", "c": "43.0", "h": "43.5", "l": "41.9",
                "v": "120.5", "n": 321, "x": false, "q": "5100.2",
                "V": "60.1", "Q": "2550.3", "B": "0"
            }
        }
    }"#;

    let (symbol, kline, event) = match parse_stream_message(frame).unwrap().unwrap() {
        FeedEvent::Kline { symbol, kline, event } => (symbol, kline, event),
        other => panic!("期望K线事件，得到 {:?}", other),
    };

    assert_eq!(symbol, "BTCUSDT");
    assert_eq!(kline.interval, "1m");
    assert_eq!(kline.start_time, 1700000040000);
    assert!(!kline.is_closed);
    // 派生的价格事件取K线收盘价
    assert_eq!(event.price, "43.0");
    assert_eq!(event.ts, 1700000041000);
    assert_eq!(event.source, PriceSource::Kline);
}

#[test]
fn test_symbol_normalized_to_uppercase() {
    let frame = r#"{
        "stream": "btcusdt@miniTicker",
        "data": { "e": "24hrMiniTicker", "E": 1, "s": "btcusdt", "c": "1.0" }
    }"#;

    match parse_stream_message(frame).unwrap().unwrap() {
        FeedEvent::Price(event) => assert_eq!(event.symbol, "BTCUSDT"),
        other => panic!("期望价格事件，得到 {:?}", other),
    }
}

#[test]
fn test_unknown_event_type_dropped() {
    let frame = r#"{
        "stream": "btcusdt@depth",
        "data": { "e": "depthUpdate", "E": 1700000000000, "s": "BTCUSDT" }
    }"#;

    assert!(parse_stream_message(frame).unwrap().is_none());
}

#[test]
fn test_frame_without_data_ignored() {
    // 订阅确认等消息没有data字段
    assert!(parse_stream_message(r#"{"result": null, "id": 1}"#).unwrap().is_none());
}

#[test]
fn test_data_without_event_type_ignored() {
    let frame = r#"{"stream": "x", "data": {"s": "BTCUSDT", "c": "1.0"}}"#;
    assert!(parse_stream_message(frame).unwrap().is_none());
}

#[test]
fn test_invalid_json_is_decode_error() {
    assert!(parse_stream_message("not json at all").is_err());
}

#[test]
fn test_malformed_known_event_is_decode_error() {
    // e是kline但缺少k字段
    let frame = r#"{"stream": "x", "data": {"e": "kline", "E": 1, "s": "BTCUSDT"}}"#;
    assert!(parse_stream_message(frame).is_err());
}
