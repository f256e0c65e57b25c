//! Exchange gateways: Binance REST, paper fills, and the plumbing they share.

mod binance;
pub mod candles;
mod error;
mod gateway;
mod paper;
mod rate_limit;
mod retry;
mod types;

pub use binance::{BinanceClient, BINANCE_BASE_URL, BINANCE_TESTNET_URL};
pub use error::GatewayError;
pub use gateway::ExchangeGateway;
pub use paper::PaperGateway;
