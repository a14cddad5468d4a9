// 迁移任务 - 将热存储的原始成交尾部重建为蜡烛并回填冷存储
use crate::klcommon::config::Config;
use crate::klcommon::db::Database;
use crate::klcommon::models::{truncate_to_minute, Candle, Trade};
use crate::klcommon::redis::RedisStore;
use crate::klcommon::Result;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// 历史数据迁移器
///
/// 聚合器因重启或冲刷失败漏掉的分钟，由本任务从原始成交历史重建补齐。
/// 每个品种维护已处理窗口末端的游标，同一段历史只会被重放一次，
/// 避免合并规则中可加字段 (volume/trade_count) 被重复累加。
pub struct TradeMigrator {
    store: Arc<RedisStore>,
    db: Arc<Database>,
    config: Config,
    cursors: Mutex<HashMap<String, i64>>,
}

impl TradeMigrator {
    /// 创建新的迁移器
    pub fn new(store: Arc<RedisStore>, db: Arc<Database>, config: Config) -> Self {
        Self {
            store,
            db,
            config,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// 迁移循环
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.migration_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            "历史数据迁移任务启动，周期 {:?}",
            self.config.migration_interval
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.migrate_once().await {
                        error!("历史数据迁移失败: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("历史数据迁移任务已退出");
    }

    /// 扫描一轮全部品种
    pub async fn migrate_once(&self) -> Result<()> {
        let symbols = self.store.get_tracked_symbols().await?;
        debug!("迁移扫描 {} 个品种", symbols.len());

        let now_ms = Utc::now().timestamp_millis();
        let end_ms = now_ms - self.config.migration_cutoff.as_millis() as i64;
        let window_start_ms = end_ms - self.config.migration_window.as_millis() as i64;

        for symbol in &symbols {
            // 游标之前的历史已经重放过，窗口只向前推进
            let start_ms = {
                let cursors = self.cursors.lock().await;
                match cursors.get(symbol) {
                    Some(cursor) => window_start_ms.max(cursor + 1),
                    None => window_start_ms,
                }
            };

            if start_ms <= end_ms {
                match self.migrate_symbol(symbol, start_ms, end_ms).await {
                    Ok(count) => {
                        self.cursors.lock().await.insert(symbol.clone(), end_ms);
                        if count > 0 {
                            info!("已为 {} 回填 {} 根蜡烛", symbol, count);
                        }
                    }
                    Err(e) => {
                        error!("迁移 {} 失败，跳过该品种: {}", symbol, e);
                    }
                }
            }

            // 无论本轮是否有待迁移数据，都收紧该品种的历史
            if let Err(e) = self.store.trim_history(symbol).await {
                warn!("收紧 {} 历史失败: {}", symbol, e);
            }
        }

        Ok(())
    }

    /// 单个品种: 读取窗口内原始成交，重建分钟蜡烛并幂等写入
    async fn migrate_symbol(&self, symbol: &str, start_ms: i64, end_ms: i64) -> Result<usize> {
        let trades = self.store.get_trade_history(symbol, start_ms, end_ms).await?;
        if trades.is_empty() {
            return Ok(0);
        }
        debug!("{} 窗口内有 {} 笔历史成交", symbol, trades.len());

        let candles = rebuild_candles(&trades);
        let count = candles.len();
        for candle in candles.values() {
            self.db.store_candle_data(symbol, candle)?;
        }
        Ok(count)
    }
}

/// 从成交序列重建分钟蜡烛表
///
/// 逐笔应用与聚合器相同的更新路径，同一批成交在两条路径下得到同一根蜡烛。
pub fn rebuild_candles(trades: &[Trade]) -> BTreeMap<i64, Candle> {
    let mut candles: BTreeMap<i64, Candle> = BTreeMap::new();
    for trade in trades {
        let minute = truncate_to_minute(trade.trade_time);
        match candles.get_mut(&minute.timestamp_millis()) {
            Some(candle) => candle.update_from_trade(trade),
            None => {
                candles.insert(minute.timestamp_millis(), Candle::from_trade(minute, trade));
            }
        }
    }
    candles
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_trade(price: &str, quantity: &str, trade_time: i64) -> Trade {
        Trade {
            symbol: "BTCUSDT".to_string(),
            trade_id: trade_time,
            price: price.to_string(),
            quantity: quantity.to_string(),
            trade_time,
            event_time: trade_time,
            is_buyer_maker: false,
        }
    }

    #[test]
    fn test_rebuild_groups_by_minute() {
        // 2024-01-01T12:00:00Z
        let base_ms = 1_704_110_400_000;
        let trades = vec![
            make_trade("100", "1", base_ms + 30_000),
            make_trade("110", "2", base_ms + 75_000),
        ];

        let candles = rebuild_candles(&trades);
        assert_eq!(candles.len(), 2, "跨两个分钟应得到两根蜡烛");

        let first = candles.get(&base_ms).unwrap();
        assert_eq!(first.open, "100");
        assert_eq!(first.close, "100");
        assert_eq!(first.trade_count, 1);

        let second = candles.get(&(base_ms + 60_000)).unwrap();
        assert_eq!(second.open, "110");
        assert_eq!(second.trade_count, 1);
    }

    #[test]
    fn test_rebuild_single_minute_ohlcv() {
        let base_ms = 1_704_110_400_000;
        let trades = vec![
            make_trade("50000", "1", base_ms + 1_000),
            make_trade("51000", "2", base_ms + 2_000),
            make_trade("49000", "1.5", base_ms + 3_000),
        ];

        let candles = rebuild_candles(&trades);
        assert_eq!(candles.len(), 1);

        let candle = candles.get(&base_ms).unwrap();
        assert_eq!(candle.open, "50000");
        assert_eq!(candle.high, "51000");
        assert_eq!(candle.low, "49000");
        assert_eq!(candle.close, "49000");
        assert_eq!(candle.trade_count, 3);
    }
}
