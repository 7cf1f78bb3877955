pub mod catalogue;
pub mod client;
pub mod engine;
pub mod monitor;
pub mod provider;
pub mod refresh;
pub mod registry;
pub mod session;

pub use catalogue::{CatalogueEntry, CatalogueLookup, HttpCatalogueLookup};
pub use client::{Connector, LookupSettings, StreamClient, TcpConnector, TlsConnector};
pub use engine::{Effect, StreamEngine};
pub use provider::{HttpSessionProvider, SessionProvider};
pub use registry::{ArchiveTask, EntityMetadata, Registry, TrackedEntity, UpsertOutcome};
pub use session::{Checkpoint, Session, SessionAction, SessionSettings, SessionState};
