// Market data buffering, ledger and order execution
pub mod auto_trader;
pub mod fill_watcher;
pub mod ledger;
pub mod stream_buffer;
pub mod stream_manager;

pub use auto_trader::{AutoTrader, ExitReason, TradeAction, TradeDecision, TradeState, TraderConfig};
pub use fill_watcher::{FillOutcome, FillWatcher};
pub use ledger::{Ledger, OrderSlot, RefreshSummary};
pub use stream_buffer::{BufferStats, StreamBuffers};
pub use stream_manager::{HibernationChange, StreamConfig, StreamManager, StreamStatus};
