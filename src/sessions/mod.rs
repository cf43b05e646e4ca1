pub mod gateway;
pub mod registry;

pub use gateway::{EventStream, StreamEvent, StreamingGateway};
pub use registry::{Session, SessionId, SessionRegistry};
