// 导出共享模块
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod redis;

// 重新导出常用类型，方便使用
pub use self::redis::RedisStore;
pub use api::BinanceApi;
pub use config::{mask_url, Config};
pub use db::Database;
pub use error::{AppError, Result};
pub use models::{
    truncate_to_minute, AggTradeData, AggTradeEvent, Candle, ExchangeInfo, SymbolInfo, Ticker24hr,
    Trade,
};
