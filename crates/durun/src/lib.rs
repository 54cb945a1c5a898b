pub mod alarm;
pub mod config;
pub mod deferred;
pub mod gate;
pub mod id;
pub mod instance;
pub mod namespace;
pub mod object;
pub mod router;
pub mod state;
pub mod storage;
pub mod stub;
pub mod tasks;
pub mod transport;
pub mod websocket;

pub use config::Config;
pub use id::ObjectId;
pub use namespace::Namespace;
pub use namespace::NamespaceOptions;
pub use object::DurableObject;
pub use router::Router;
pub use state::State;
pub use stub::Stub;
