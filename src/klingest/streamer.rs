// 流会话管理器 - 维护多条持久WebSocket连接并将成交分发到两个下游
use crate::klcommon::api::BinanceApi;
use crate::klcommon::config::Config;
use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::AggTradeEvent;
use crate::klcommon::redis::RedisStore;
use crate::klingest::aggregator::CandleAggregator;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 构建组合流订阅URL
/// 形如 wss://.../stream?streams=btcusdt@aggTrade/ethusdt@aggTrade
pub fn build_stream_url(ws_base: &str, symbols: &[String]) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .map(|symbol| format!("{}@aggTrade", symbol.to_lowercase()))
        .collect();
    format!("{}/stream?streams={}", ws_base, streams.join("/"))
}

/// 归集交易流客户端
pub struct AggTradeClient {
    config: Config,
    api: BinanceApi,
    store: Arc<RedisStore>,
    aggregator: Arc<CandleAggregator>,
}

impl AggTradeClient {
    /// 创建新的流客户端
    pub fn new(
        config: Config,
        api: BinanceApi,
        store: Arc<RedisStore>,
        aggregator: Arc<CandleAggregator>,
    ) -> Self {
        Self {
            config,
            api,
            store,
            aggregator,
        }
    }

    /// 启动客户端: 计算工作集并为每个分组拉起一条会话
    pub async fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        // 工作集获取失败时退避重试，不终止进程
        let symbols = loop {
            if *shutdown.borrow() {
                return;
            }
            match self.api.get_symbols(&self.config).await {
                Ok(symbols) => break symbols,
                Err(e) => {
                    error!(
                        "获取工作集失败: {}，{:?} 后重试",
                        e, self.config.reconnect_delay
                    );
                    let mut shutdown = shutdown.clone();
                    if sleep_or_shutdown(&mut shutdown, self.config.reconnect_delay).await {
                        return;
                    }
                }
            }
        };

        info!("工作集共 {} 个品种", symbols.len());

        // 按连接上限切分为连续分组，每组一条会话
        let mut handles = Vec::new();
        for (session_id, chunk) in symbols.chunks(self.config.max_streams_per_conn).enumerate() {
            let client = self.clone();
            let group = chunk.to_vec();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                client.run_session(session_id, group, shutdown).await;
            }));
        }

        futures_util::future::join_all(handles).await;
        info!("所有流会话已退出");
    }

    /// 单条会话的连接-重连循环
    async fn run_session(
        &self,
        session_id: usize,
        symbols: Vec<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let url = build_stream_url(&self.config.ws_url, &symbols);
        info!("会话 {} 启动，携带 {} 个流", session_id, symbols.len());

        loop {
            if *shutdown.borrow() {
                break;
            }

            let ws_stream = match connect_async(url.as_str()).await {
                Ok((ws_stream, _)) => ws_stream,
                Err(e) => {
                    warn!(
                        "会话 {} 连接失败: {}，{:?} 后重连",
                        session_id, e, self.config.reconnect_delay
                    );
                    if sleep_or_shutdown(&mut shutdown, self.config.reconnect_delay).await {
                        break;
                    }
                    continue;
                }
            };

            info!("会话 {} 已连接", session_id);
            if let Err(e) = self.stream_frames(session_id, ws_stream, &mut shutdown).await {
                warn!(
                    "会话 {} 流中断: {}，{:?} 后重连",
                    session_id, e, self.config.reconnect_delay
                );
            }

            if *shutdown.borrow() {
                break;
            }
            if sleep_or_shutdown(&mut shutdown, self.config.reconnect_delay).await {
                break;
            }
        }

        info!("会话 {} 已退出", session_id);
    }

    /// 帧循环: 读取、保活与关停三路select
    async fn stream_frames(
        &self,
        session_id: usize,
        ws_stream: WsStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut write, mut read) = ws_stream.split();
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            self.process_frame(text.as_bytes()).await;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            self.process_frame(&data).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write
                                .send(Message::Pong(data))
                                .await
                                .map_err(|e| AppError::WebSocketError(format!("发送Pong失败: {}", e)))?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("会话 {} 收到关闭帧: {:?}", session_id, frame);
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(AppError::WebSocketError(format!("读取失败: {}", e)));
                        }
                        None => return Ok(()),
                    }
                }
                _ = ping.tick() => {
                    write
                        .send(Message::Ping(Vec::new()))
                        .await
                        .map_err(|e| AppError::WebSocketError(format!("发送Ping失败: {}", e)))?;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }
        }
    }

    /// 单帧处理: 两个下游依次调用，任一失败只记日志，不终止帧循环
    async fn process_frame(&self, raw: &[u8]) {
        let event: AggTradeEvent = match serde_json::from_slice(raw) {
            Ok(event) => event,
            Err(e) => {
                debug!("忽略无法解析的帧: {}", e);
                return;
            }
        };
        if event.data.event_type != "aggTrade" {
            return;
        }

        let trade = event.to_trade();
        if self.config.debug {
            debug!(
                "收到成交 {}: price={}, quantity={}, is_buyer_maker={}",
                trade.symbol, trade.price, trade.quantity, trade.is_buyer_maker
            );
        }

        if let Err(e) = self.store.store_trade(&trade).await {
            error!("写入最新成交失败: {}", e);
        }
        if let Err(e) = self
            .store
            .store_raw_trade(&trade.symbol, trade.trade_time, raw)
            .await
        {
            error!("写入原始成交失败: {}", e);
        }
        if let Err(e) = self.aggregator.process_trade(&trade).await {
            error!("聚合成交失败: {}", e);
        }
    }
}

/// 退避等待，期间收到关停信号时返回true
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => *shutdown.borrow(),
    }
}
