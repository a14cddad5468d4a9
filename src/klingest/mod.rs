// 导出数据接入相关模块
pub mod aggregator;
pub mod migrator;
pub mod streamer;

// 重新导出常用类型，方便使用
pub use aggregator::CandleAggregator;
pub use migrator::{rebuild_candles, TradeMigrator};
pub use streamer::AggTradeClient;
