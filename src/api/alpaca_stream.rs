use super::streaming::{Feed, StreamConnection, StreamConnector, StreamError, Subscriptions};
use crate::models::{Bar, DataKind, MarketEvent, Quote, Trade, TradingStatus};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::io::ErrorKind;
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

const DEFAULT_STREAM_URL: &str = "wss://stream.data.alpaca.markets/v2";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Provider error codes
const CODE_AUTH_FAILED: u16 = 402;
const CODE_AUTH_TIMEOUT: u16 = 404;
const CODE_CONNECTION_LIMIT: u16 = 406;
const CODE_NOT_AUTHENTICATED: u16 = 401;

/// Connection settings for the Alpaca market data websocket
#[derive(Debug, Clone)]
pub struct AlpacaStreamConfig {
    pub base_url: String,
    pub api_key: String,
    pub secret_key: String,
    pub read_timeout: Duration,
}

impl AlpacaStreamConfig {
    pub fn new(api_key: String, secret_key: String) -> Self {
        Self {
            base_url: DEFAULT_STREAM_URL.to_string(),
            api_key,
            secret_key,
            read_timeout: Duration::from_secs(1),
        }
    }
}

/// Decoded message from one websocket frame
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Market(MarketEvent),
    Success(String),
    Subscription,
    Error { code: u16, message: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "T")]
enum RawMessage {
    #[serde(rename = "t")]
    Trade {
        #[serde(rename = "S")]
        symbol: String,
        #[serde(rename = "p")]
        price: f64,
        #[serde(rename = "s")]
        size: f64,
        #[serde(rename = "t")]
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "q")]
    Quote {
        #[serde(rename = "S")]
        symbol: String,
        #[serde(rename = "bp")]
        bid: f64,
        #[serde(rename = "bs")]
        bid_size: f64,
        #[serde(rename = "ap")]
        ask: f64,
        #[serde(rename = "as")]
        ask_size: f64,
        #[serde(rename = "t")]
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "b", alias = "u", alias = "d")]
    Bar {
        #[serde(rename = "S")]
        symbol: String,
        #[serde(rename = "o")]
        open: f64,
        #[serde(rename = "h")]
        high: f64,
        #[serde(rename = "l")]
        low: f64,
        #[serde(rename = "c")]
        close: f64,
        #[serde(rename = "v")]
        volume: f64,
        #[serde(rename = "t")]
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "s")]
    Status {
        #[serde(rename = "S")]
        symbol: String,
        #[serde(rename = "sc")]
        code: String,
        #[serde(rename = "sm", default)]
        message: String,
        #[serde(rename = "t")]
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "success")]
    Success { msg: String },
    #[serde(rename = "subscription")]
    Subscription {},
    #[serde(rename = "error")]
    Error { code: u16, msg: String },
    #[serde(other)]
    Other,
}

impl RawMessage {
    fn into_message(self) -> Option<StreamMessage> {
        let message = match self {
            RawMessage::Trade {
                symbol,
                price,
                size,
                timestamp,
            } => StreamMessage::Market(MarketEvent::Trade(Trade {
                symbol,
                price,
                size,
                timestamp,
            })),
            RawMessage::Quote {
                symbol,
                bid,
                bid_size,
                ask,
                ask_size,
                timestamp,
            } => StreamMessage::Market(MarketEvent::Quote(Quote {
                symbol,
                bid,
                ask,
                bid_size,
                ask_size,
                timestamp,
            })),
            RawMessage::Bar {
                symbol,
                open,
                high,
                low,
                close,
                volume,
                timestamp,
            } => StreamMessage::Market(MarketEvent::Bar(Bar {
                symbol,
                open,
                high,
                low,
                close,
                volume,
                timestamp,
            })),
            RawMessage::Status {
                symbol,
                code,
                message,
                timestamp,
            } => StreamMessage::Market(MarketEvent::Status(TradingStatus {
                symbol,
                code,
                message,
                timestamp,
            })),
            RawMessage::Success { msg } => StreamMessage::Success(msg),
            RawMessage::Subscription {} => StreamMessage::Subscription,
            RawMessage::Error { code, msg } => StreamMessage::Error { code, message: msg },
            RawMessage::Other => return None,
        };
        Some(message)
    }
}

/// Decode one text frame. Frames are JSON arrays of typed messages;
/// individual messages that fail to decode are skipped.
pub fn parse_stream_frame(text: &str) -> Result<Vec<StreamMessage>, StreamError> {
    let values: Vec<serde_json::Value> = serde_json::from_str(text)
        .map_err(|e| StreamError::Protocol(format!("frame is not a JSON array: {}", e)))?;

    let mut messages = Vec::with_capacity(values.len());
    for value in values {
        match serde_json::from_value::<RawMessage>(value) {
            Ok(raw) => {
                if let Some(message) = raw.into_message() {
                    messages.push(message);
                }
            }
            Err(e) => tracing::debug!("Skipping undecodable stream message: {}", e),
        }
    }
    Ok(messages)
}

/// Map a provider error code to a stream error
pub fn error_from_code(code: u16, message: String) -> StreamError {
    match code {
        CODE_CONNECTION_LIMIT => StreamError::ConnectionLimit,
        CODE_NOT_AUTHENTICATED | CODE_AUTH_FAILED | CODE_AUTH_TIMEOUT => StreamError::Auth(message),
        _ => StreamError::Protocol(format!("{} {}", code, message)),
    }
}

/// Subscribe/unsubscribe request body
pub fn subscription_request(action: &str, subscriptions: &Subscriptions) -> String {
    let mut body = serde_json::Map::new();
    body.insert("action".to_string(), serde_json::Value::from(action));
    for kind in DataKind::ALL {
        let symbols = subscriptions.symbols_for(kind);
        if !symbols.is_empty() {
            body.insert(kind.as_str().to_string(), serde_json::Value::from(symbols));
        }
    }
    serde_json::Value::Object(body).to_string()
}

/// Opens authenticated websocket connections to the Alpaca data stream
pub struct AlpacaStreamConnector {
    config: AlpacaStreamConfig,
}

impl AlpacaStreamConnector {
    pub fn new(config: AlpacaStreamConfig) -> Self {
        Self { config }
    }
}

impl StreamConnector for AlpacaStreamConnector {
    fn connect(&self, feed: Feed) -> Result<Box<dyn StreamConnection>, StreamError> {
        let url = format!("{}/{}", self.config.base_url, feed);
        tracing::info!("📡 Connecting market data stream: {}", url);

        let (socket, _response) = tungstenite::connect(url.as_str()).map_err(map_ws_error)?;
        let mut connection = AlpacaStreamConnection { socket };
        connection.set_read_timeout(Some(self.config.read_timeout))?;

        connection.await_control("connected")?;
        let auth = serde_json::json!({
            "action": "auth",
            "key": self.config.api_key,
            "secret": self.config.secret_key,
        });
        connection.send_text(auth.to_string())?;
        connection.await_control("authenticated")?;

        tracing::info!("✅ Market data stream authenticated ({})", feed);
        Ok(Box::new(connection))
    }
}

/// Live, authenticated websocket
pub struct AlpacaStreamConnection {
    socket: WebSocket<MaybeTlsStream<TcpStream>>,
}

impl AlpacaStreamConnection {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), StreamError> {
        let result = match self.socket.get_ref() {
            MaybeTlsStream::Plain(stream) => stream.set_read_timeout(timeout),
            MaybeTlsStream::NativeTls(stream) => stream.get_ref().set_read_timeout(timeout),
            _ => Ok(()),
        };
        result.map_err(|e| StreamError::Transport(e.to_string()))
    }

    fn send_text(&mut self, text: String) -> Result<(), StreamError> {
        self.socket.send(Message::Text(text)).map_err(map_ws_error)
    }

    /// Next text payload, `None` on read timeout or control frames
    fn read_text(&mut self) -> Result<Option<String>, StreamError> {
        match self.socket.read() {
            Ok(Message::Text(text)) => Ok(Some(text)),
            Ok(Message::Binary(bytes)) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StreamError::Protocol(e.to_string())),
            Ok(Message::Close(_)) => Err(StreamError::Closed),
            Ok(_) => Ok(None),
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                Ok(None)
            }
            Err(e) => Err(map_ws_error(e)),
        }
    }

    fn await_control(&mut self, expected: &str) -> Result<(), StreamError> {
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        while Instant::now() < deadline {
            let Some(text) = self.read_text()? else {
                continue;
            };
            for message in parse_stream_frame(&text)? {
                match message {
                    StreamMessage::Success(msg) if msg == expected => return Ok(()),
                    StreamMessage::Error { code, message } => {
                        return Err(error_from_code(code, message))
                    }
                    _ => {}
                }
            }
        }
        Err(StreamError::Protocol(format!(
            "no '{}' acknowledgement within {:?}",
            expected, HANDSHAKE_TIMEOUT
        )))
    }
}

impl StreamConnection for AlpacaStreamConnection {
    fn subscribe(&mut self, subscriptions: &Subscriptions) -> Result<(), StreamError> {
        if subscriptions.is_empty() {
            return Ok(());
        }
        self.send_text(subscription_request("subscribe", subscriptions))
    }

    fn unsubscribe(&mut self, subscriptions: &Subscriptions) -> Result<(), StreamError> {
        if subscriptions.is_empty() {
            return Ok(());
        }
        self.send_text(subscription_request("unsubscribe", subscriptions))
    }

    fn recv(&mut self) -> Result<Option<Vec<MarketEvent>>, StreamError> {
        let Some(text) = self.read_text()? else {
            return Ok(None);
        };

        let mut events = Vec::new();
        for message in parse_stream_frame(&text)? {
            match message {
                StreamMessage::Market(event) => events.push(event),
                StreamMessage::Error { code, message } => {
                    return Err(error_from_code(code, message))
                }
                StreamMessage::Success(msg) => tracing::debug!("Stream control: {}", msg),
                StreamMessage::Subscription => tracing::debug!("Stream subscription acknowledged"),
            }
        }
        Ok(Some(events))
    }

    fn close(&mut self) {
        if let Err(e) = self.socket.close(None) {
            tracing::debug!("Stream close: {}", e);
        }
        // Drain until the close handshake finishes or the socket errors
        for _ in 0..10 {
            if self.socket.read().is_err() {
                break;
            }
        }
    }
}

fn map_ws_error(e: tungstenite::Error) -> StreamError {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            StreamError::Closed
        }
        tungstenite::Error::Http(response) if response.status().as_u16() == 429 => {
            StreamError::ConnectionLimit
        }
        other => StreamError::Transport(other.to_string()),
    }
}
