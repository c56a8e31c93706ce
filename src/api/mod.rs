pub mod alpaca;
pub mod alpaca_stream;
pub mod broker;
pub mod paper;
pub mod streaming;

pub use alpaca::{AlpacaClient, AlpacaConfig};
pub use alpaca_stream::{AlpacaStreamConfig, AlpacaStreamConnector};
pub use broker::{with_timeout, BrokerApi, BrokerError, BrokerResult};
pub use paper::{FillMode, PaperBroker};
pub use streaming::{Feed, StreamConnection, StreamConnector, StreamError, Subscriptions};
