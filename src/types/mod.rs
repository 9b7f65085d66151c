pub mod events;

pub use events::{ConnectionEvent, ConnectionEventKind, ConnectionState};
