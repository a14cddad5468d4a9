// 分钟K线聚合器 - 维护进行中的蜡烛表并周期性冲刷到冷存储
use crate::klcommon::db::Database;
use crate::klcommon::models::{truncate_to_minute, Candle, Trade};
use crate::klcommon::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};

/// 聚合器持有的未完成蜡烛
struct PendingCandle {
    symbol: String,
    candle: Candle,
}

/// 分钟K线聚合器
///
/// 蜡烛表以 `大写品种:RFC3339分钟时间` 为键，表级互斥锁同时覆盖
/// 成交写入与冲刷两条路径。
pub struct CandleAggregator {
    db: Arc<Database>,
    candles: Mutex<HashMap<String, PendingCandle>>,
    flush_interval: Duration,
}

impl CandleAggregator {
    /// 创建新的聚合器
    pub fn new(db: Arc<Database>, flush_interval: Duration) -> Self {
        Self {
            db,
            candles: Mutex::new(HashMap::new()),
            flush_interval,
        }
    }

    /// 蜡烛表键: 大写品种 + RFC3339分钟时间戳
    fn candle_key(symbol: &str, minute: &DateTime<Utc>) -> String {
        format!("{}:{}", symbol.to_uppercase(), minute.to_rfc3339())
    }

    /// 将一笔成交折叠进对应分钟的蜡烛
    pub async fn process_trade(&self, trade: &Trade) -> Result<()> {
        let minute = truncate_to_minute(trade.trade_time);
        let key = Self::candle_key(&trade.symbol, &minute);

        let mut candles = self.candles.lock().await;
        match candles.get_mut(&key) {
            Some(pending) => pending.candle.update_from_trade(trade),
            None => {
                debug!("创建新蜡烛: {}", key);
                candles.insert(
                    key,
                    PendingCandle {
                        symbol: trade.symbol.to_uppercase(),
                        candle: Candle::from_trade(minute, trade),
                    },
                );
            }
        }
        Ok(())
    }

    /// 冲刷循环，退出前做最后一次冲刷
    pub async fn run_flush_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("K线聚合器启动，冲刷周期 {:?}", self.flush_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_completed().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.flush_completed().await;
        info!("K线聚合器已退出");
    }

    /// 冲刷所有已完成分钟的蜡烛
    pub async fn flush_completed(&self) {
        let current_minute = truncate_to_minute(Utc::now().timestamp_millis());
        self.flush_until(current_minute).await;
    }

    /// 冲刷开盘时间严格早于 current_minute 的蜡烛
    ///
    /// 等于 current_minute 的蜡烛仍在接收成交，提前冲刷会让冷存储在同一
    /// 分钟内收到第二次合并写入并覆盖 open/close。失败的蜡烛保留在表中，
    /// 下个tick重试。
    pub async fn flush_until(&self, current_minute: DateTime<Utc>) {
        let mut candles = self.candles.lock().await;

        let due: Vec<String> = candles
            .iter()
            .filter(|(_, pending)| pending.candle.timestamp < current_minute)
            .map(|(key, _)| key.clone())
            .collect();

        let mut flushed = 0usize;
        for key in due {
            let Some(pending) = candles.get(&key) else {
                continue;
            };
            match self.db.store_candle_data(&pending.symbol, &pending.candle) {
                Ok(()) => {
                    candles.remove(&key);
                    flushed += 1;
                }
                Err(e) => {
                    error!("冲刷K线失败，保留待重试: key={}, {}", key, e);
                }
            }
        }

        if flushed > 0 {
            debug!("本轮冲刷 {} 根K线，剩余 {}", flushed, candles.len());
        }
    }

    /// 当前挂起的蜡烛数量
    pub async fn pending_count(&self) -> usize {
        self.candles.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_candle_key_format() {
        let minute = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(
            CandleAggregator::candle_key("btcusdt", &minute),
            "BTCUSDT:2024-01-01T12:00:00+00:00"
        );
    }
}
