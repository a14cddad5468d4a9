use crate::klcommon::config::Config;
use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::{ExchangeInfo, Ticker24hr};
use reqwest::Client;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, warn};

/// 币安REST API客户端
#[derive(Clone, Debug)]
pub struct BinanceApi {
    client: Client,
    base_url: String,
}

impl BinanceApi {
    /// 创建新的API客户端实例
    pub fn new(base_url: String) -> Result<Self> {
        // 带超时设置的HTTP客户端
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self { client, base_url })
    }

    /// 获取交易所信息
    pub async fn get_exchange_info(&self) -> Result<ExchangeInfo> {
        let url = format!("{}/api/v3/exchangeInfo", self.base_url);
        debug!(target: "api", "获取交易所信息: {}", url);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(AppError::ApiError(format!(
                "获取交易所信息失败: {}",
                response.status()
            )));
        }

        Ok(response.json::<ExchangeInfo>().await?)
    }

    /// 获取全部品种的24小时行情
    pub async fn get_24h_tickers(&self) -> Result<Vec<Ticker24hr>> {
        let url = format!("{}/api/v3/ticker/24hr", self.base_url);
        debug!(target: "api", "获取24小时行情: {}", url);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(AppError::ApiError(format!(
                "获取24小时行情失败: {}",
                response.status()
            )));
        }

        Ok(response.json::<Vec<Ticker24hr>>().await?)
    }

    /// 计算本次运行要订阅的工作集 (小写品种列表)
    pub async fn get_symbols(&self, config: &Config) -> Result<Vec<String>> {
        // 优先列表已达上限时不再请求交易所
        if config.max_symbols > 0 && config.main_symbols.len() >= config.max_symbols {
            let symbols: Vec<String> = config
                .main_symbols
                .iter()
                .take(config.max_symbols)
                .map(|s| s.to_lowercase())
                .collect();
            debug!("仅使用配置的优先品种: {:?}", symbols);
            return Ok(symbols);
        }

        let exchange_info = self.get_exchange_info().await?;

        let volumes = if config.min_daily_volume > 0.0 {
            Some(build_volume_map(self.get_24h_tickers().await?))
        } else {
            None
        };

        select_symbols(&exchange_info, volumes.as_ref(), config)
    }
}

/// 行情列表转为 小写品种 -> 成交额 映射，无法解析的条目跳过
fn build_volume_map(tickers: Vec<Ticker24hr>) -> HashMap<String, f64> {
    let mut volumes = HashMap::with_capacity(tickers.len());
    for ticker in tickers {
        match ticker.quote_volume.parse::<f64>() {
            Ok(volume) => {
                volumes.insert(ticker.symbol.to_lowercase(), volume);
            }
            Err(_) => {
                warn!("品种 {} 的成交额无法解析: {}", ticker.symbol, ticker.quote_volume);
            }
        }
    }
    volumes
}

/// 品种筛选核心逻辑
///
/// 优先品种先占位，剩余名额按交易所返回顺序补足：
/// 仅保留 TRADING 状态、报价资产后缀匹配、且成交额达标的品种。
pub(crate) fn select_symbols(
    exchange_info: &ExchangeInfo,
    volumes: Option<&HashMap<String, f64>>,
    config: &Config,
) -> Result<Vec<String>> {
    let cap = if config.max_symbols == 0 {
        usize::MAX
    } else {
        config.max_symbols
    };
    let suffix = config.quote_asset.to_lowercase();

    let mut selected = Vec::new();
    let mut seen = HashSet::new();

    for symbol in &config.main_symbols {
        let symbol = symbol.to_lowercase();
        if selected.len() >= cap {
            break;
        }
        if seen.insert(symbol.clone()) {
            selected.push(symbol);
        }
    }

    for entry in &exchange_info.symbols {
        if selected.len() >= cap {
            break;
        }
        let symbol = entry.symbol.to_lowercase();
        if seen.contains(&symbol) || entry.status != "TRADING" || !symbol.ends_with(&suffix) {
            continue;
        }
        if let Some(volumes) = volumes {
            match volumes.get(&symbol) {
                Some(v) if *v >= config.min_daily_volume => {}
                _ => continue,
            }
        }
        seen.insert(symbol.clone());
        selected.push(symbol);
    }

    if selected.is_empty() {
        return Err(AppError::NoSymbolsAvailable);
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klcommon::config::{DEFAULT_BASE_URL, DEFAULT_WS_URL};
    use crate::klcommon::models::SymbolInfo;
    use std::time::Duration;

    fn test_config(main_symbols: Vec<&str>, max_symbols: usize, min_daily_volume: f64) -> Config {
        Config {
            redis_url: "redis://localhost:6379".to_string(),
            database_url: "./target/api_test.db".to_string(),
            key_prefix: "binance:".to_string(),
            retention_period: Duration::from_secs(86_400),
            cleanup_interval: Duration::from_secs(3_600),
            max_trades_per_key: 1_000,
            use_compression: false,
            base_url: DEFAULT_BASE_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
            quote_asset: "USDT".to_string(),
            max_streams_per_conn: 200,
            main_symbols: main_symbols.into_iter().map(String::from).collect(),
            max_symbols,
            min_daily_volume,
            reconnect_delay: Duration::from_secs(5),
            ping_interval: Duration::from_secs(5),
            flush_interval: Duration::from_secs(10),
            migration_interval: Duration::from_secs(300),
            migration_cutoff: Duration::from_secs(7_200),
            migration_window: Duration::from_secs(79_200),
            volume_window: Duration::from_secs(7_200),
            debug: false,
        }
    }

    fn exchange_info(entries: &[(&str, &str)]) -> ExchangeInfo {
        ExchangeInfo {
            symbols: entries
                .iter()
                .map(|(symbol, status)| SymbolInfo {
                    symbol: symbol.to_string(),
                    status: status.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_priority_symbols_come_first() {
        let info = exchange_info(&[
            ("SOLUSDT", "TRADING"),
            ("BTCUSDT", "TRADING"),
            ("XRPUSDT", "TRADING"),
        ]);
        let config = test_config(vec!["BTCUSDT"], 2, 0.0);

        let symbols = select_symbols(&info, None, &config).unwrap();
        assert_eq!(symbols, vec!["btcusdt", "solusdt"], "优先品种应排在最前");
    }

    #[test]
    fn test_non_trading_and_wrong_quote_filtered() {
        let info = exchange_info(&[
            ("AAAUSDT", "BREAK"),
            ("BBBBTC", "TRADING"),
            ("CCCUSDT", "TRADING"),
        ]);
        let config = test_config(vec![], 10, 0.0);

        let symbols = select_symbols(&info, None, &config).unwrap();
        assert_eq!(symbols, vec!["cccusdt"]);
    }

    #[test]
    fn test_volume_filter() {
        let info = exchange_info(&[("AAAUSDT", "TRADING"), ("BBBUSDT", "TRADING")]);
        let config = test_config(vec![], 10, 1_000_000.0);

        let mut volumes = HashMap::new();
        volumes.insert("aaausdt".to_string(), 2_000_000.0);
        volumes.insert("bbbusdt".to_string(), 500.0);

        let symbols = select_symbols(&info, Some(&volumes), &config).unwrap();
        assert_eq!(symbols, vec!["aaausdt"], "成交额不达标的品种应被过滤");
    }

    #[test]
    fn test_cap_zero_means_unlimited() {
        let info = exchange_info(&[
            ("AAAUSDT", "TRADING"),
            ("BBBUSDT", "TRADING"),
            ("CCCUSDT", "TRADING"),
        ]);
        let config = test_config(vec![], 0, 0.0);

        let symbols = select_symbols(&info, None, &config).unwrap();
        assert_eq!(symbols.len(), 3);
    }

    #[test]
    fn test_empty_result_is_error() {
        let info = exchange_info(&[("AAAUSDT", "BREAK")]);
        let config = test_config(vec![], 10, 0.0);

        let result = select_symbols(&info, None, &config);
        assert!(matches!(result, Err(AppError::NoSymbolsAvailable)));
    }

    #[test]
    fn test_build_volume_map_skips_unparseable() {
        let tickers = vec![
            Ticker24hr {
                symbol: "BTCUSDT".to_string(),
                quote_volume: "123.45".to_string(),
            },
            Ticker24hr {
                symbol: "BADUSDT".to_string(),
                quote_volume: "not-a-number".to_string(),
            },
        ];
        let volumes = build_volume_map(tickers);
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes.get("btcusdt"), Some(&123.45));
    }
}
