//! Binance spot REST client: market data, exchange filters, and signed
//! account/order endpoints.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::models::{Candle, OrderFill, SymbolQuantization, Timeframe, TradeSide};

use super::candles::{clean_candles, parse_klines};
use super::error::GatewayError;
use super::gateway::ExchangeGateway;
use super::rate_limit::RateLimiter;
use super::retry::RetryPolicy;
use super::types::*;

pub const BINANCE_BASE_URL: &str = "https://api.binance.com";
pub const BINANCE_TESTNET_URL: &str = "https://testnet.binance.vision";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_ORDER_TIMEOUT: Duration = Duration::from_secs(30);
const RECV_WINDOW_MS: u64 = 5_000;
const MAX_KLINES: usize = 1_000;

type HmacSha256 = Hmac<Sha256>;

struct Credentials {
    api_key: String,
    api_secret: String,
}

/// Client for the Binance spot API.
pub struct BinanceClient {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
    quote_asset: String,
    limiter: RateLimiter,
    retry: RetryPolicy,
    order_timeout: Duration,
    filters: Mutex<HashMap<String, SymbolQuantization>>,
}

impl BinanceClient {
    /// Create a public (unsigned) client; see `BINANCE_BASE_URL`.
    pub fn with_base_url(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials: None,
            quote_asset: "USDT".to_string(),
            limiter: RateLimiter::exchange_default(),
            retry: RetryPolicy::default(),
            order_timeout: DEFAULT_ORDER_TIMEOUT,
            filters: Mutex::new(HashMap::new()),
        })
    }

    /// Enable signed endpoints.
    pub fn with_credentials(mut self, api_key: String, api_secret: String) -> Self {
        self.credentials = Some(Credentials {
            api_key,
            api_secret,
        });
        self
    }

    pub fn with_order_timeout(mut self, timeout: Duration) -> Self {
        self.order_timeout = timeout;
        self
    }

    pub fn with_quote_asset(mut self, asset: impl Into<String>) -> Self {
        self.quote_asset = asset.into();
        self
    }

    // ==================== Transport ====================

    /// Unsigned GET, retried on transient failures.
    async fn get_public<T: DeserializeOwned>(&self, path: &str, query: &str, call: &str) -> Result<T, GatewayError> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let url = &url;
        self.retry
            .run(call, move || async move {
                self.limiter.acquire().await;
                debug!(url = %url, call, "Fetching");
                let response = self.client.get(url).send().await?;
                read_json(response).await
            })
            .await
    }

    /// Signed request, retried on transient failures. Each attempt is
    /// re-stamped and re-signed.
    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        call: &str,
    ) -> Result<T, GatewayError> {
        let method = &method;
        self.retry
            .run(call, move || async move {
                self.signed_once(method.clone(), path, params).await
            })
            .await
    }

    /// One signed attempt.
    async fn signed_once<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| GatewayError::Auth("API key and secret are required".to_string()))?;

        let mut query = encode_query(params);
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!(
            "recvWindow={}&timestamp={}",
            RECV_WINDOW_MS,
            Utc::now().timestamp_millis()
        ));
        let signature = sign(&credentials.api_secret, &query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        self.limiter.acquire().await;
        debug!(method = %method, path, "Signed request");
        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &credentials.api_key)
            .send()
            .await?;
        read_json(response).await
    }
}

impl ExchangeGateway for BinanceClient {
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError> {
        let query = format!(
            "symbol={}&interval={}&limit={}",
            symbol,
            timeframe,
            limit.clamp(1, MAX_KLINES)
        );
        let rows: Vec<KlineRow> = self.get_public("/api/v3/klines", &query, "klines").await?;
        let candles = parse_klines(&rows)?;
        clean_candles(symbol, candles, timeframe, Utc::now())
    }

    async fn get_price(&self, symbol: &str) -> Result<Decimal, GatewayError> {
        let ticker: TickerPrice = self
            .get_public("/api/v3/ticker/price", &format!("symbol={}", symbol), "price")
            .await?;
        Ok(ticker.price)
    }

    async fn get_quantization(&self, symbol: &str) -> Result<SymbolQuantization, GatewayError> {
        if let Some(cached) = self.filters.lock().await.get(symbol) {
            return Ok(cached.clone());
        }

        let info: ExchangeInfo = self
            .get_public("/api/v3/exchangeInfo", &format!("symbol={}", symbol), "exchangeInfo")
            .await?;
        let symbol_info = info
            .symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| GatewayError::UnknownSymbol(symbol.to_string()))?;
        let quantization = quantization_from(symbol_info);
        debug!(symbol, step = %quantization.step_size, tick = %quantization.tick_size, "Loaded symbol filters");

        self.filters
            .lock()
            .await
            .insert(symbol.to_string(), quantization.clone());
        Ok(quantization)
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
    ) -> Result<OrderFill, GatewayError> {
        let client_order_id = format!("et-{}", uuid::Uuid::new_v4().simple());
        let params = [
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("type", "MARKET".to_string()),
            ("quantity", quantity.normalize().to_string()),
            ("newClientOrderId", client_order_id.clone()),
            ("newOrderRespType", "FULL".to_string()),
        ];

        info!(symbol, side = %side, quantity = %quantity, "Placing market order");
        let response: OrderResponse = tokio::time::timeout(
            self.order_timeout,
            self.signed_once(Method::POST, "/api/v3/order", &params),
        )
        .await
        .map_err(|_| GatewayError::OrderTimeout {
            symbol: symbol.to_string(),
            timeout: self.order_timeout,
        })??;

        fill_from(response)
    }

    async fn get_equity(&self) -> Result<Decimal, GatewayError> {
        let account: AccountResponse = self
            .signed(Method::GET, "/api/v3/account", &[], "account")
            .await?;
        let equity = account
            .balances
            .iter()
            .find(|b| b.asset == self.quote_asset)
            .map(|b| b.free + b.locked)
            .unwrap_or_default();
        if equity.is_zero() {
            warn!(asset = %self.quote_asset, "No quote balance on account");
        }
        Ok(equity)
    }

    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<String>, GatewayError> {
        let orders: Vec<OpenOrderResponse> = self
            .signed(
                Method::GET,
                "/api/v3/openOrders",
                &[("symbol", symbol.to_string())],
                "openOrders",
            )
            .await?;
        Ok(orders.iter().map(|o| o.order_id.to_string()).collect())
    }
}

// ==================== Helpers ====================

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(GatewayError::from_status(status.as_u16(), body));
    }
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| GatewayError::Parse(e.to_string()))
}

fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Hex HMAC-SHA256 of `payload` keyed by `secret`.
pub fn sign(secret: &str, payload: &str) -> Result<String, GatewayError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GatewayError::Auth(format!("Invalid API secret: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Fold exchange filters over the replay defaults.
fn quantization_from(info: &SymbolInfo) -> SymbolQuantization {
    let mut q = SymbolQuantization::default();
    for filter in &info.filters {
        match filter {
            SymbolFilter::LotSize {
                min_qty,
                max_qty,
                step_size,
            } => {
                q.min_qty = *min_qty;
                q.max_qty = *max_qty;
                q.step_size = *step_size;
            }
            SymbolFilter::PriceFilter {
                min_price,
                max_price,
                tick_size,
            } => {
                q.min_price = *min_price;
                q.max_price = *max_price;
                q.tick_size = *tick_size;
            }
            SymbolFilter::MinNotional { min_notional } | SymbolFilter::Notional { min_notional } => {
                q.min_notional = *min_notional;
            }
            SymbolFilter::Other => {}
        }
    }
    q
}

fn fill_from(response: OrderResponse) -> Result<OrderFill, GatewayError> {
    if response.executed_qty <= Decimal::ZERO {
        return Err(GatewayError::OrderRejected {
            symbol: response.symbol,
            reason: format!("status {} with nothing executed", response.status),
        });
    }

    let quote = if response.cumulative_quote_qty > Decimal::ZERO {
        response.cumulative_quote_qty
    } else {
        response.fills.iter().map(|f| f.price * f.qty).sum()
    };
    let avg_price = quote / response.executed_qty;
    // Commission is reported in whatever asset was charged; convert base-asset
    // fees at the fill price.
    let commission = response
        .fills
        .iter()
        .map(|f| {
            if response.symbol.starts_with(&f.commission_asset) && !f.commission_asset.is_empty() {
                f.commission * f.price
            } else {
                f.commission
            }
        })
        .sum();

    Ok(OrderFill {
        order_id: response.order_id.to_string(),
        client_order_id: response.client_order_id,
        filled_quantity: response.executed_qty,
        avg_price,
        commission,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_signature_matches_reference_vector() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_encode_query() {
        let q = encode_query(&[("symbol", "BTCUSDT".into()), ("limit", "5".into())]);
        assert_eq!(q, "symbol=BTCUSDT&limit=5");
        assert_eq!(encode_query(&[]), "");
    }

    #[test]
    fn test_quantization_from_filters() {
        let json = r#"{
            "symbols": [{
                "symbol": "BTCUSDT",
                "status": "TRADING",
                "quoteAsset": "USDT",
                "filters": [
                    {"filterType": "PRICE_FILTER", "minPrice": "0.01", "maxPrice": "1000000.00", "tickSize": "0.01"},
                    {"filterType": "LOT_SIZE", "minQty": "0.00001", "maxQty": "9000.00", "stepSize": "0.00001"},
                    {"filterType": "ICEBERG_PARTS", "limit": 10},
                    {"filterType": "NOTIONAL", "minNotional": "5.00", "applyMinToMarket": true, "maxNotional": "9000000.00"}
                ]
            }]
        }"#;
        let info: ExchangeInfo = serde_json::from_str(json).unwrap();
        let q = quantization_from(&info.symbols[0]);
        assert_eq!(q.tick_size, dec!(0.01));
        assert_eq!(q.step_size, dec!(0.00001));
        assert_eq!(q.max_qty, dec!(9000));
        assert_eq!(q.min_notional, dec!(5));
    }

    #[test]
    fn test_fill_average_price_and_commission() {
        let json = r#"{
            "symbol": "BTCUSDT",
            "orderId": 28,
            "clientOrderId": "et-abc",
            "status": "FILLED",
            "executedQty": "0.50000000",
            "cummulativeQuoteQty": "20050.00000000",
            "fills": [
                {"price": "40000.00", "qty": "0.25", "commission": "10.00", "commissionAsset": "USDT"},
                {"price": "40200.00", "qty": "0.25", "commission": "0.00025", "commissionAsset": "BTC"}
            ]
        }"#;
        let response: OrderResponse = serde_json::from_str(json).unwrap();
        let fill = fill_from(response).unwrap();
        assert_eq!(fill.order_id, "28");
        assert_eq!(fill.avg_price, dec!(40100));
        assert_eq!(fill.commission, dec!(20.05));
    }

    #[test]
    fn test_unfilled_order_rejected() {
        let json = r#"{"symbol": "BTCUSDT", "orderId": 1, "status": "EXPIRED", "executedQty": "0"}"#;
        let response: OrderResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(fill_from(response), Err(GatewayError::OrderRejected { .. })));
    }
}
