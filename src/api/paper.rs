//! Paper trading: real market data from an inner gateway, simulated fills.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::info;

use crate::models::{Candle, OrderFill, SymbolQuantization, Timeframe, TradeSide};

use super::error::GatewayError;
use super::gateway::ExchangeGateway;

#[derive(Debug)]
struct PaperBook {
    cash: Decimal,
    /// Signed base quantity per symbol
    holdings: BTreeMap<String, Decimal>,
    next_order_id: u64,
}

/// Fills market orders at the inner gateway's price plus adverse slippage
/// and charges the taker fee against cash.
pub struct PaperGateway<G> {
    market: G,
    slippage: Decimal,
    fee_rate: Decimal,
    book: Mutex<PaperBook>,
}

impl<G: ExchangeGateway> PaperGateway<G> {
    pub fn new(market: G, starting_cash: Decimal, slippage: Decimal, fee_rate: Decimal) -> Self {
        Self {
            market,
            slippage,
            fee_rate,
            book: Mutex::new(PaperBook {
                cash: starting_cash,
                holdings: BTreeMap::new(),
                next_order_id: 1,
            }),
        }
    }

    pub async fn cash(&self) -> Decimal {
        self.book.lock().await.cash
    }

    fn fill_price(&self, side: TradeSide, price: Decimal) -> Decimal {
        let slip = price * self.slippage;
        match side {
            TradeSide::Buy => price + slip,
            TradeSide::Sell => price - slip,
        }
    }
}

impl<G: ExchangeGateway> ExchangeGateway for PaperGateway<G> {
    async fn get_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, GatewayError> {
        self.market.get_candles(symbol, timeframe, limit).await
    }

    async fn get_price(&self, symbol: &str) -> Result<Decimal, GatewayError> {
        self.market.get_price(symbol).await
    }

    async fn get_quantization(&self, symbol: &str) -> Result<SymbolQuantization, GatewayError> {
        self.market.get_quantization(symbol).await
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
    ) -> Result<OrderFill, GatewayError> {
        if quantity <= Decimal::ZERO {
            return Err(GatewayError::OrderRejected {
                symbol: symbol.to_string(),
                reason: format!("non-positive quantity {}", quantity),
            });
        }
        let market_price = self.market.get_price(symbol).await?;
        let price = self.fill_price(side, market_price);
        let notional = price * quantity;
        let commission = notional * self.fee_rate;

        let mut book = self.book.lock().await;
        let order_id = book.next_order_id;
        book.next_order_id += 1;
        book.cash -= notional * side.sign() + commission;
        *book.holdings.entry(symbol.to_string()).or_default() += quantity * side.sign();

        info!(
            symbol,
            side = %side,
            quantity = %quantity,
            price = %price,
            cash = %book.cash,
            "Paper fill"
        );
        Ok(OrderFill {
            order_id: format!("paper-{}", order_id),
            client_order_id: format!("paper-{}", order_id),
            filled_quantity: quantity,
            avg_price: price,
            commission,
        })
    }

    /// Cash plus holdings marked at the current price.
    async fn get_equity(&self) -> Result<Decimal, GatewayError> {
        let (cash, holdings) = {
            let book = self.book.lock().await;
            (book.cash, book.holdings.clone())
        };
        let mut equity = cash;
        for (symbol, quantity) in holdings.iter().filter(|(_, q)| !q.is_zero()) {
            equity += *quantity * self.market.get_price(symbol).await?;
        }
        Ok(equity)
    }

    /// Market orders fill immediately, so nothing is ever working.
    async fn get_open_orders(&self, _symbol: &str) -> Result<Vec<String>, GatewayError> {
        Ok(Vec::new())
    }
}
