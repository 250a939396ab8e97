pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod version;
pub mod wire;

pub use client::{ClientNotification, ExecuteConfig, ServiceClient};
pub use config::{ClientConfiguration, LogVerbosity};
pub use error::{ClientError, ClientResult};
pub use protocol::{DiagnosticsEvent, DiagnosticsKind, Event, Request, Response, ServerMessage};
pub use server::spawner::{ProcessSpawner, ServerKind, Spawner};
pub use server::{ExecuteInfo, LanguageServer, ServerResponse, SpawnedServer};
pub use version::ProtocolVersion;
