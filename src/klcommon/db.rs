use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::{format_decimal, parse_decimal, Candle};
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use tracing::info;

// 数据库连接池类型
pub type DbPool = Pool<SqliteConnectionManager>;

// 连接池上限与生命周期
const POOL_MAX_SIZE: u32 = 25;
const POOL_MIN_IDLE: u32 = 5;
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(300);

/// Database handler for the candle archive
#[derive(Debug)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Create a new database connection with WAL mode and pooled connections
    ///
    /// 连接串形如 `sqlite:///path/to/candles.db` 或直接给出文件路径。
    pub fn new(database_url: &str) -> Result<Self> {
        let db_path = database_url
            .strip_prefix("sqlite://")
            .unwrap_or(database_url);
        let db_path = Path::new(db_path);

        // Ensure parent directory exists for database
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!("Using SQLite database with WAL mode at {}", db_path.display());

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA temp_store = MEMORY;
                PRAGMA busy_timeout = 5000;
            ",
            )
        });

        let pool = Pool::builder()
            .max_size(POOL_MAX_SIZE)
            .min_idle(Some(POOL_MIN_IDLE))
            .max_lifetime(Some(POOL_MAX_LIFETIME))
            .build(manager)
            .map_err(|e| AppError::DatabaseError(format!("Failed to create connection pool: {}", e)))?;

        let db = Self { pool };
        db.init_db()?;

        info!("SQLite candle archive initialized successfully");
        Ok(db)
    }

    /// Initialize database tables
    fn init_db(&self) -> Result<()> {
        let conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("Failed to get connection: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trade_candles (
                symbol      TEXT    NOT NULL,
                timestamp   INTEGER NOT NULL,
                open        TEXT    NOT NULL,
                high        TEXT    NOT NULL,
                low         TEXT    NOT NULL,
                close       TEXT    NOT NULL,
                volume      TEXT    NOT NULL,
                trade_count INTEGER NOT NULL,
                PRIMARY KEY (symbol, timestamp)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trade_candles_timestamp
                ON trade_candles(timestamp)",
            [],
        )?;

        Ok(())
    }

    /// 幂等写入一根分钟蜡烛
    ///
    /// 冲突键 (symbol, timestamp) 上的合并规则:
    /// open/close 取本次写入值, high取大, low取小, volume与trade_count累加。
    pub fn store_candle_data(&self, symbol: &str, candle: &Candle) -> Result<()> {
        let timestamp = candle.timestamp.with_timezone(&Utc).timestamp_millis();
        if timestamp == 0 {
            return Err(AppError::InvalidArgument(format!(
                "zero timestamp candle for {}",
                symbol
            )));
        }
        if parse_decimal(&candle.volume) < 0.0 {
            return Err(AppError::InvalidArgument(format!(
                "negative volume candle for {}",
                symbol
            )));
        }
        let symbol = symbol.to_uppercase();

        let mut conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("Failed to get connection: {}", e)))?;
        let tx = conn.transaction()?;

        let existing: Option<(String, String, String, i64)> = tx
            .query_row(
                "SELECT high, low, volume, trade_count FROM trade_candles
                 WHERE symbol = ? AND timestamp = ?",
                params![symbol, timestamp],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        match existing {
            Some((high, low, volume, trade_count)) => {
                // 高低价按数值合并，成交量与笔数累加
                let merged_high = if parse_decimal(&candle.high) > parse_decimal(&high) {
                    candle.high.clone()
                } else {
                    high
                };
                let merged_low = if parse_decimal(&candle.low) < parse_decimal(&low) {
                    candle.low.clone()
                } else {
                    low
                };
                let merged_volume =
                    format_decimal(parse_decimal(&volume) + parse_decimal(&candle.volume));
                let merged_count = trade_count + candle.trade_count;

                tx.execute(
                    "UPDATE trade_candles SET
                        open = ?, high = ?, low = ?, close = ?, volume = ?, trade_count = ?
                     WHERE symbol = ? AND timestamp = ?",
                    params![
                        candle.open,
                        merged_high,
                        merged_low,
                        candle.close,
                        merged_volume,
                        merged_count,
                        symbol,
                        timestamp,
                    ],
                )?;
            }
            None => {
                tx.execute(
                    "INSERT INTO trade_candles (
                        symbol, timestamp, open, high, low, close, volume, trade_count
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        symbol,
                        timestamp,
                        candle.open,
                        candle.high,
                        candle.low,
                        candle.close,
                        candle.volume,
                        candle.trade_count,
                    ],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// 按时间范围查询蜡烛，升序返回
    pub fn get_historical_candles(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| AppError::DatabaseError(format!("Failed to get connection: {}", e)))?;

        let mut stmt = conn.prepare(
            "SELECT timestamp, open, high, low, close, volume, trade_count
             FROM trade_candles
             WHERE symbol = ? AND timestamp BETWEEN ? AND ?
             ORDER BY timestamp ASC",
        )?;

        let rows = stmt.query_map(
            params![
                symbol.to_uppercase(),
                start.timestamp_millis(),
                end.timestamp_millis()
            ],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            },
        )?;

        let mut candles = Vec::new();
        for row in rows {
            let (timestamp, open, high, low, close, volume, trade_count) = row?;
            candles.push(Candle {
                timestamp: DateTime::from_timestamp_millis(timestamp).unwrap_or_default(),
                open,
                high,
                low,
                close,
                volume,
                trade_count,
            });
        }

        Ok(candles)
    }

    /// 按指定周期重新分桶查询
    ///
    /// 周期语法为整数加单位后缀，单位取 {m, h, d}，例如 "5m"、"1h"。
    pub fn get_aggregated_candles(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: &str,
    ) -> Result<Vec<Candle>> {
        let interval_ms = parse_interval(interval)?;
        let candles = self.get_historical_candles(symbol, start, end)?;
        Ok(aggregate_candles(&candles, interval_ms))
    }
}

/// 将周期字符串转换为毫秒数
/// 例如: "1m" -> 60000, "1h" -> 3600000
pub fn parse_interval(interval: &str) -> Result<i64> {
    let unit = interval
        .chars()
        .last()
        .ok_or_else(|| AppError::InvalidArgument("empty interval".to_string()))?;
    let digits = &interval[..interval.len() - unit.len_utf8()];

    let value: i64 = digits
        .parse()
        .map_err(|_| AppError::InvalidArgument(format!("invalid interval: {}", interval)))?;
    if value <= 0 {
        return Err(AppError::InvalidArgument(format!(
            "invalid interval: {}",
            interval
        )));
    }

    let unit_ms = match unit {
        'm' => 60 * 1000,
        'h' => 60 * 60 * 1000,
        'd' => 24 * 60 * 60 * 1000,
        _ => {
            return Err(AppError::InvalidArgument(format!(
                "invalid interval unit: {}",
                interval
            )))
        }
    };

    Ok(value * unit_ms)
}

/// 将升序的1分钟蜡烛归并到更大的时间桶
///
/// 桶内: open取首根, close取末根, high取大, low取小, volume与笔数累加。
fn aggregate_candles(candles: &[Candle], interval_ms: i64) -> Vec<Candle> {
    let mut result: Vec<Candle> = Vec::new();

    for candle in candles {
        let bucket_ms = (candle.timestamp.timestamp_millis() / interval_ms) * interval_ms;

        match result.last_mut() {
            Some(last) if last.timestamp.timestamp_millis() == bucket_ms => {
                if parse_decimal(&candle.high) > parse_decimal(&last.high) {
                    last.high = candle.high.clone();
                }
                if parse_decimal(&candle.low) < parse_decimal(&last.low) {
                    last.low = candle.low.clone();
                }
                last.close = candle.close.clone();
                last.volume =
                    format_decimal(parse_decimal(&last.volume) + parse_decimal(&candle.volume));
                last.trade_count += candle.trade_count;
            }
            _ => {
                let mut bucket = candle.clone();
                bucket.timestamp = DateTime::from_timestamp_millis(bucket_ms).unwrap_or_default();
                result.push(bucket);
            }
        }
    }

    result
}
