use anyhow::Result;
use kline_stream::klcommon::{mask_url, BinanceApi, Config, Database, RedisStore};
use kline_stream::klingest::{AggTradeClient, CandleAggregator, TradeMigrator};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 配置错误属于启动失败，进程以非零码退出
    let config = Config::from_env()?;
    init_tracing(config.debug);

    info!("启动 kline-stream 服务");
    info!("热存储: {}", mask_url(&config.redis_url));
    info!("冷存储: {}", mask_url(&config.database_url));

    // 两个存储任一连不上都无法继续
    let store = Arc::new(RedisStore::new(&config).await?);
    let db = Arc::new(Database::new(&config.database_url)?);

    let aggregator = Arc::new(CandleAggregator::new(db.clone(), config.flush_interval));
    let migrator = Arc::new(TradeMigrator::new(store.clone(), db.clone(), config.clone()));
    let api = BinanceApi::new(config.base_url.clone())?;
    let client = Arc::new(AggTradeClient::new(
        config.clone(),
        api,
        store.clone(),
        aggregator.clone(),
    ));

    // 单一关停信号贯穿全部任务
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::new();
    handles.push(tokio::spawn(
        store.clone().run_cleanup_loop(shutdown_rx.clone()),
    ));
    handles.push(tokio::spawn(
        aggregator.clone().run_flush_loop(shutdown_rx.clone()),
    ));
    handles.push(tokio::spawn(migrator.run(shutdown_rx.clone())));
    handles.push(tokio::spawn(client.start(shutdown_rx.clone())));

    tokio::signal::ctrl_c().await?;
    info!("收到终止信号，开始优雅关停");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            error!("任务退出异常: {}", e);
        }
    }

    info!("服务已退出");
    Ok(())
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
