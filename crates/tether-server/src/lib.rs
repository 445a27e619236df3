pub mod builtin;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod registry;
pub mod runner;
pub mod server;
pub mod session;
pub mod transport;

pub use builtin::builtin_registry;
pub use config::{load_config, ServerConfig};
pub use connection::{serve_connection, ConnectionContext, ConnectionSettings, ConnectionSummary, ExitReason};
pub use dispatcher::Dispatcher;
pub use error::{ConfigError, DispatchError, TransportError};
pub use registry::{ConnectionRegistry, PushError};
pub use runner::RunnerOptions;
pub use server::{build_router, start, AppState, ServerHandle};
pub use session::ConnectionSession;
pub use transport::{AxumTransport, Frame, Transport};
