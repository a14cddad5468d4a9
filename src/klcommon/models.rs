use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 表示一笔归集交易 - 应用内部存储格式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// 交易对 (大写)
    pub symbol: String,
    /// 归集成交ID
    pub trade_id: i64,
    /// 成交价格 (字符串形式，保留来源精度)
    pub price: String,
    /// 成交数量 (字符串形式)
    pub quantity: String,
    /// 成交时间 (毫秒时间戳)
    pub trade_time: i64,
    /// 事件时间 (毫秒时间戳)
    pub event_time: i64,
    /// 买方是否是做市方
    pub is_buyer_maker: bool,
}

/// 组合流推送的归集交易事件
/// 格式: {"stream":"btcusdt@aggTrade","data":{...}}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggTradeEvent {
    pub stream: String,
    pub data: AggTradeData,
}

/// 币安原始归集交易数据 (单字母字段)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggTradeData {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "a")]
    pub agg_id: i64,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "q")]
    pub quantity: String,
    #[serde(rename = "f", default)]
    pub first_trade_id: i64,
    #[serde(rename = "l", default)]
    pub last_trade_id: i64,
    #[serde(rename = "T")]
    pub trade_time: i64,
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,
}

impl AggTradeEvent {
    /// 转换为应用内部Trade
    pub fn to_trade(&self) -> Trade {
        Trade {
            symbol: self.data.symbol.to_uppercase(),
            trade_id: self.data.agg_id,
            price: self.data.price.clone(),
            quantity: self.data.quantity.clone(),
            trade_time: self.data.trade_time,
            event_time: self.data.event_time,
            is_buyer_maker: self.data.is_buyer_maker,
        }
    }
}

/// 一分钟OHLCV蜡烛
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// 分钟对齐的开盘时间 (UTC)
    pub timestamp: DateTime<Utc>,
    /// 开盘价
    pub open: String,
    /// 最高价
    pub high: String,
    /// 最低价
    pub low: String,
    /// 收盘价
    pub close: String,
    /// 成交量 (基础资产)
    pub volume: String,
    /// 成交笔数
    pub trade_count: i64,
}

impl Candle {
    /// 以该分钟内第一笔成交初始化蜡烛
    pub fn from_trade(timestamp: DateTime<Utc>, trade: &Trade) -> Self {
        Self {
            timestamp,
            open: trade.price.clone(),
            high: trade.price.clone(),
            low: trade.price.clone(),
            close: trade.price.clone(),
            volume: trade.quantity.clone(),
            trade_count: 1,
        }
    }

    /// 按后续成交更新蜡烛
    ///
    /// 高低价必须按数值比较，字符串比较会得出 "1000" < "9" 的错误结果。
    pub fn update_from_trade(&mut self, trade: &Trade) {
        let price = parse_decimal(&trade.price);
        let quantity = parse_decimal(&trade.quantity);

        if price > parse_decimal(&self.high) {
            self.high = trade.price.clone();
        }
        if price < parse_decimal(&self.low) {
            self.low = trade.price.clone();
        }
        self.close = trade.price.clone();
        self.volume = format_decimal(parse_decimal(&self.volume) + quantity);
        self.trade_count += 1;
    }
}

/// 解析十进制字符串，无法解析时取0
pub fn parse_decimal(s: &str) -> f64 {
    s.parse::<f64>().unwrap_or(0.0)
}

/// 十进制数值转字符串 (Display格式，不产生科学计数法)
pub fn format_decimal(v: f64) -> String {
    format!("{}", v)
}

/// 将毫秒时间戳截断到分钟 (UTC)
///
/// 恰好落在分钟边界的成交属于该分钟自身。
pub fn truncate_to_minute(timestamp_ms: i64) -> DateTime<Utc> {
    let floored = (timestamp_ms / 60_000) * 60_000;
    DateTime::from_timestamp_millis(floored).unwrap_or_default()
}

/// 表示交易对
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub status: String,
}

/// 交易所信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeInfo {
    #[serde(default)]
    pub symbols: Vec<SymbolInfo>,
}

/// 24小时行情 (仅取报价资产成交额)
#[derive(Debug, Clone, Deserialize)]
pub struct Ticker24hr {
    pub symbol: String,
    #[serde(rename = "quoteVolume", default)]
    pub quote_volume: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_trade(price: &str, quantity: &str, trade_time: i64) -> Trade {
        Trade {
            symbol: "BTCUSDT".to_string(),
            trade_id: 1,
            price: price.to_string(),
            quantity: quantity.to_string(),
            trade_time,
            event_time: trade_time,
            is_buyer_maker: false,
        }
    }

    #[test]
    fn test_candle_from_first_trade() {
        let trade = make_trade("50000.00", "1.5", 1_704_110_430_000);
        let minute = truncate_to_minute(trade.trade_time);
        let candle = Candle::from_trade(minute, &trade);

        assert_eq!(candle.open, "50000.00");
        assert_eq!(candle.high, "50000.00");
        assert_eq!(candle.low, "50000.00");
        assert_eq!(candle.close, "50000.00");
        assert_eq!(candle.volume, "1.5");
        assert_eq!(candle.trade_count, 1);
    }

    #[test]
    fn test_candle_update_sequence() {
        // 三笔成交: 50000 -> 51000 -> 49000
        let t1 = make_trade("50000", "1", 1_704_110_400_000);
        let t2 = make_trade("51000", "2", 1_704_110_410_000);
        let t3 = make_trade("49000", "1.5", 1_704_110_420_000);

        let minute = truncate_to_minute(t1.trade_time);
        let mut candle = Candle::from_trade(minute, &t1);
        candle.update_from_trade(&t2);
        candle.update_from_trade(&t3);

        assert_eq!(candle.open, "50000", "开盘价应为第一笔成交价");
        assert_eq!(candle.high, "51000", "最高价不正确");
        assert_eq!(candle.low, "49000", "最低价不正确");
        assert_eq!(candle.close, "49000", "收盘价应为最后一笔成交价");
        assert_eq!(parse_decimal(&candle.volume), 4.5, "成交量应为累加值");
        assert_eq!(candle.trade_count, 3);
    }

    #[test]
    fn test_candle_numeric_comparison_not_lexicographic() {
        // 字符串比较会认为 "1000" < "9"，数值比较必须正确处理
        let t1 = make_trade("9", "1", 1_704_110_400_000);
        let t2 = make_trade("1000", "1", 1_704_110_410_000);

        let minute = truncate_to_minute(t1.trade_time);
        let mut candle = Candle::from_trade(minute, &t1);
        candle.update_from_trade(&t2);

        assert_eq!(candle.high, "1000", "最高价必须按数值比较");
        assert_eq!(candle.low, "9", "最低价必须按数值比较");
    }

    #[test]
    fn test_truncate_to_minute_boundary() {
        // 2024-01-01T12:00:00Z 整分钟边界的成交属于 12:00 这一分钟
        let boundary_ms = 1_704_110_400_000;
        let truncated = truncate_to_minute(boundary_ms);
        assert_eq!(truncated.timestamp_millis(), boundary_ms);

        // 12:00:59.999 同样属于 12:00
        let late_ms = boundary_ms + 59_999;
        assert_eq!(truncate_to_minute(late_ms).timestamp_millis(), boundary_ms);

        // 12:01:00.000 属于下一分钟
        let next_ms = boundary_ms + 60_000;
        assert_eq!(truncate_to_minute(next_ms).timestamp_millis(), next_ms);
    }

    #[test]
    fn test_agg_trade_event_roundtrip() {
        let raw = r#"{"stream":"btcusdt@aggTrade","data":{"e":"aggTrade","E":1704110430100,"s":"BTCUSDT","a":12345,"p":"50000.00","q":"1.5","f":100,"l":105,"T":1704110430000,"m":true}}"#;
        let event: AggTradeEvent = serde_json::from_str(raw).unwrap();

        assert_eq!(event.stream, "btcusdt@aggTrade");
        assert_eq!(event.data.symbol, "BTCUSDT");
        assert_eq!(event.data.agg_id, 12345);

        let trade = event.to_trade();
        assert_eq!(trade.symbol, "BTCUSDT");
        assert_eq!(trade.trade_id, 12345);
        assert_eq!(trade.price, "50000.00");
        assert_eq!(trade.quantity, "1.5");
        assert_eq!(trade.trade_time, 1_704_110_430_000);
        assert_eq!(trade.event_time, 1_704_110_430_100);
        assert!(trade.is_buyer_maker);

        // 序列化-反序列化回环，字段值不变
        let json = serde_json::to_string(&event).unwrap();
        let reparsed: AggTradeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(reparsed.data.price, event.data.price);
        assert_eq!(reparsed.data.trade_time, event.data.trade_time);
    }

    #[test]
    fn test_format_decimal_no_scientific_notation() {
        assert_eq!(format_decimal(0.0000001), "0.0000001");
        assert_eq!(format_decimal(4.5), "4.5");
        assert_eq!(format_decimal(50000.0), "50000");
    }
}
