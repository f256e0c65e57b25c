//! The exchange surface both drivers trade through.

use rust_decimal::Decimal;

use crate::models::{Candle, OrderFill, SymbolQuantization, Timeframe, TradeSide};

use super::error::GatewayError;

/// Market data and order placement for one exchange account.
///
/// Implementations own rate limiting and retries; callers see either a
/// value or a final `GatewayError`.
pub trait ExchangeGateway {
    /// Cleaned, closed candles, oldest first.
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError>;

    async fn get_price(&self, symbol: &str) -> Result<Decimal, GatewayError>;

    async fn get_quantization(&self, symbol: &str) -> Result<SymbolQuantization, GatewayError>;

    /// Market order. Never retried once sent.
    async fn place_order(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
    ) -> Result<OrderFill, GatewayError>;

    /// Account equity in the quote asset.
    async fn get_equity(&self) -> Result<Decimal, GatewayError>;

    /// Ids of orders still working on `symbol`.
    async fn get_open_orders(&self, symbol: &str) -> Result<Vec<String>, GatewayError>;
}
