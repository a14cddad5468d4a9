// 热存储模块 - 最新成交、原始成交历史与滚动成交额计数器
use crate::klcommon::config::{mask_url, Config};
use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::{parse_decimal, AggTradeEvent, Trade};
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashSet;
use std::future::Future;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// 单次热存储操作的超时上限
const HOT_STORE_OP_TIMEOUT: Duration = Duration::from_secs(5);
/// 历史查询单次返回的最大条数
const HISTORY_FETCH_LIMIT: isize = 1000;
/// 24小时成交额缓存TTL
const VOLUME_24H_TTL_SECS: u64 = 300;
/// 缓存TTL高于该值视为仍然新鲜，跳过刷新
const VOLUME_24H_FRESH_SECS: i64 = 30;
/// 自失效更新锁TTL
const VOLUME_LOCK_TTL_SECS: u64 = 30;

/// 热存储客户端 (Redis)
pub struct RedisStore {
    conn: ConnectionManager,
    config: Config,
}

impl RedisStore {
    /// 建立连接并以PING验证，失败视为启动失败
    pub async fn new(config: &Config) -> Result<Self> {
        info!("连接热存储: {}", mask_url(&config.redis_url));

        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = client.get_connection_manager().await?;

        let store = Self {
            conn,
            config: config.clone(),
        };

        let mut conn = store.conn.clone();
        let _: String = with_timeout(redis::cmd("PING").query_async(&mut conn)).await?;
        info!("热存储连接就绪");

        Ok(store)
    }

    // ------------------------------------------------------------------
    // 键布局 (P = 配置前缀)
    //   P + symbols                     跟踪中的大写品种集合
    //   P + trade:<SYM>:latest          最新一笔成交 (JSON)
    //   P + trade:<SYM>:history         按成交时间评分的有序集合
    //   P + <SYM>:volume:running        滚动窗口成交额计数器
    //   P + <SYM>:volume:reset_time     计数器重置时间 (TTL = 窗口)
    //   P + <SYM>:volume:24h            24小时成交额缓存
    //   P + <SYM>:volume:lock           自失效更新锁
    // ------------------------------------------------------------------

    fn symbols_key(&self) -> String {
        format!("{}symbols", self.config.key_prefix)
    }

    fn latest_key(&self, symbol: &str) -> String {
        format!(
            "{}trade:{}:latest",
            self.config.key_prefix,
            symbol.to_uppercase()
        )
    }

    fn history_key(&self, symbol: &str) -> String {
        format!(
            "{}trade:{}:history",
            self.config.key_prefix,
            symbol.to_uppercase()
        )
    }

    fn running_volume_key(&self, symbol: &str) -> String {
        format!(
            "{}{}:volume:running",
            self.config.key_prefix,
            symbol.to_uppercase()
        )
    }

    fn reset_time_key(&self, symbol: &str) -> String {
        format!(
            "{}{}:volume:reset_time",
            self.config.key_prefix,
            symbol.to_uppercase()
        )
    }

    fn volume_24h_key(&self, symbol: &str) -> String {
        format!(
            "{}{}:volume:24h",
            self.config.key_prefix,
            symbol.to_uppercase()
        )
    }

    fn volume_lock_key(&self, symbol: &str) -> String {
        format!(
            "{}{}:volume:lock",
            self.config.key_prefix,
            symbol.to_uppercase()
        )
    }

    /// 写入最新成交并刷新品种集合与滚动成交额
    pub async fn store_trade(&self, trade: &Trade) -> Result<()> {
        let payload = compress(serde_json::to_vec(trade)?, self.config.use_compression)?;
        let retention_secs = self.config.retention_period.as_secs();

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.set_ex(self.latest_key(&trade.symbol), payload.as_slice(), retention_secs)
            .ignore()
            .sadd(self.symbols_key(), trade.symbol.to_uppercase())
            .ignore()
            .expire(self.symbols_key(), retention_secs as i64)
            .ignore();
        let _: () = with_timeout(pipe.query_async(&mut conn)).await?;

        self.update_running_volume(trade).await
    }

    /// 滚动成交额计数器
    ///
    /// 重置时间键随窗口过期；键缺失时下一笔成交原子地重建计数器与重置时间。
    async fn update_running_volume(&self, trade: &Trade) -> Result<()> {
        let turnover = parse_decimal(&trade.price) * parse_decimal(&trade.quantity);
        let counter_key = self.running_volume_key(&trade.symbol);
        let reset_key = self.reset_time_key(&trade.symbol);
        let window_secs = self.config.volume_window.as_secs();

        let mut conn = self.conn.clone();
        let reset_at: Option<i64> = with_timeout(conn.get(&reset_key)).await?;

        match reset_at {
            Some(_) => {
                let _: f64 = with_timeout(conn.incr(&counter_key, turnover)).await?;
            }
            None => {
                let now_secs = Utc::now().timestamp();
                let mut pipe = redis::pipe();
                pipe.set_ex(&counter_key, turnover, window_secs)
                    .ignore()
                    .set_ex(&reset_key, now_secs, window_secs)
                    .ignore();
                let _: () = with_timeout(pipe.query_async(&mut conn)).await?;
            }
        }
        Ok(())
    }

    /// 将原始线上负载写入历史集合，评分取负载内嵌的成交时间 (毫秒)
    pub async fn store_raw_trade(&self, symbol: &str, trade_time_ms: i64, raw: &[u8]) -> Result<()> {
        let payload = compress(raw.to_vec(), self.config.use_compression)?;
        let history_key = self.history_key(symbol);

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.zadd(&history_key, payload.as_slice(), trade_time_ms)
            .ignore()
            .expire(&history_key, self.config.retention_period.as_secs() as i64)
            .ignore();
        let _: () = with_timeout(pipe.query_async(&mut conn)).await?;

        // 每次写入都顺带收紧该键
        self.trim_history(symbol).await
    }

    /// 查询最新成交，键不存在返回None而不是错误
    pub async fn get_latest_trade(&self, symbol: &str) -> Result<Option<Trade>> {
        let mut conn = self.conn.clone();
        let data: Option<Vec<u8>> = with_timeout(conn.get(self.latest_key(symbol))).await?;

        let Some(data) = data else {
            return Ok(None);
        };
        let data = decompress(&data)?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    /// 查询时间范围内的成交历史，升序返回
    ///
    /// 最多取范围内最近的1000条再反转为升序；解压或解析失败的记录跳过；
    /// 重复的trade_id去重，保留首次出现。
    pub async fn get_trade_history(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Trade>> {
        let mut conn = self.conn.clone();
        let raw: Vec<Vec<u8>> = with_timeout(conn.zrevrangebyscore_limit(
            self.history_key(symbol),
            end_ms,
            start_ms,
            0,
            HISTORY_FETCH_LIMIT,
        ))
        .await?;

        let mut trades = Vec::with_capacity(raw.len());
        for member in raw.iter().rev() {
            let data = match decompress(member) {
                Ok(data) => data,
                Err(e) => {
                    warn!("解压 {} 历史记录失败，跳过: {}", symbol, e);
                    continue;
                }
            };
            match serde_json::from_slice::<AggTradeEvent>(&data) {
                Ok(event) => trades.push(event.to_trade()),
                Err(e) => {
                    warn!("解析 {} 历史记录失败，跳过: {}", symbol, e);
                }
            }
        }

        let mut seen = HashSet::new();
        trades.retain(|t| seen.insert(t.trade_id));
        Ok(trades)
    }

    /// 惰性刷新24小时成交额缓存
    ///
    /// 缓存仍然新鲜或锁被他人持有时直接返回。
    pub async fn update_24h_volume(&self, symbol: &str) -> Result<()> {
        let volume_key = self.volume_24h_key(symbol);
        let mut conn = self.conn.clone();

        let ttl: i64 = with_timeout(conn.ttl(&volume_key)).await?;
        if ttl > VOLUME_24H_FRESH_SECS {
            return Ok(());
        }

        let lock_key = self.volume_lock_key(symbol);
        let acquired: Option<String> = with_timeout(
            redis::cmd("SET")
                .arg(&lock_key)
                .arg(1)
                .arg("NX")
                .arg("EX")
                .arg(VOLUME_LOCK_TTL_SECS)
                .query_async(&mut conn),
        )
        .await?;
        if acquired.is_none() {
            return Ok(());
        }

        let now_ms = Utc::now().timestamp_millis();
        let trades = self
            .get_trade_history(symbol, now_ms - 86_400_000, now_ms)
            .await?;
        let total: f64 = trades
            .iter()
            .map(|t| parse_decimal(&t.price) * parse_decimal(&t.quantity))
            .sum();

        let _: () = with_timeout(conn.set_ex(&volume_key, total, VOLUME_24H_TTL_SECS)).await?;
        debug!("已刷新 {} 的24小时成交额: {}", symbol, total);
        Ok(())
    }

    /// 按保留期限和条数上限收紧某品种的历史集合
    pub async fn trim_history(&self, symbol: &str) -> Result<()> {
        let history_key = self.history_key(symbol);
        let cutoff_ms =
            Utc::now().timestamp_millis() - self.config.retention_period.as_millis() as i64;

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        // 先按保留期限删旧，再按排名裁剪到最多 max_trades_per_key 条
        // (上限为0时等价于清空整个集合)
        pipe.zrembyscore(&history_key, "-inf", cutoff_ms)
            .ignore()
            .zremrangebyrank(&history_key, 0, -(self.config.max_trades_per_key as isize + 1))
            .ignore();
        let _: () = with_timeout(pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    /// 读取跟踪中的品种集合
    pub async fn get_tracked_symbols(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let symbols: Vec<String> = with_timeout(conn.smembers(self.symbols_key())).await?;
        Ok(symbols)
    }

    /// 后台保留清理任务，遍历全部品种收紧历史并顺带刷新成交额缓存
    pub async fn run_cleanup_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("热存储清理任务启动，周期 {:?}", self.config.cleanup_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.cleanup().await {
                        error!("保留清理失败: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("热存储清理任务已退出");
    }

    async fn cleanup(&self) -> Result<()> {
        let symbols = self.get_tracked_symbols().await?;
        debug!("开始清理 {} 个品种的过期历史", symbols.len());

        for symbol in &symbols {
            if let Err(e) = self.trim_history(symbol).await {
                error!("收紧 {} 历史失败: {}", symbol, e);
            }
            if let Err(e) = self.update_24h_volume(symbol).await {
                warn!("刷新 {} 24小时成交额失败: {}", symbol, e);
            }
        }
        Ok(())
    }
}

/// 为热存储操作加上超时，后端卡死不应无限阻塞任务
async fn with_timeout<T>(
    fut: impl Future<Output = std::result::Result<T, redis::RedisError>>,
) -> Result<T> {
    match tokio::time::timeout(HOT_STORE_OP_TIMEOUT, fut).await {
        Ok(result) => result.map_err(AppError::from),
        Err(_) => Err(AppError::StorageError(
            "hot store operation timed out".to_string(),
        )),
    }
}

/// gzip压缩，未启用压缩时原样返回
fn compress(data: Vec<u8>, enabled: bool) -> Result<Vec<u8>> {
    if !enabled {
        return Ok(data);
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&data)?;
    Ok(encoder.finish()?)
}

/// gzip解压，按魔数自动识别，未压缩数据原样返回
fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 2 || data[0] != 0x1f || data[1] != 0x8b {
        return Ok(data.to_vec());
    }
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
