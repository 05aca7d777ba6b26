// Wire protocol
pub mod codec;
pub mod protocol;
pub mod types;

// Server side
pub mod config;
pub mod coordinator;
pub mod server;
pub mod session;
pub mod storage;

// Agency side
pub mod client;

// Public exports
pub use client::{AgencyClient, AgencyConnection, ClientError, RetryPolicy};
pub use config::{Config, ConfigError};
pub use coordinator::{Coordinator, CoordinatorError, DrawPolicy, FinishOutcome};
pub use protocol::{Request, Response};
pub use server::{ExecutionUnit, LotteryServer, ShutdownToken, ShutdownTrigger, shutdown_channel};
pub use session::{MalformedBatchPolicy, SessionConfig, SessionEnd};
pub use storage::{BetStore, MemoryBetStore, SqliteBetStore, StorageError};
pub use types::{AgencyId, Bet, BetParseError, BirthDate, WireFormat};
