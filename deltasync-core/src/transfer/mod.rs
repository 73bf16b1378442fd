//! Batched delta transfer between devices and the server.

pub mod messages;
pub mod puller;
pub mod pusher;
pub mod transport;

pub use messages::{Cursor, PullRequest, PushRequest, Request, Response};
pub use puller::{pull, PullOutcome, Puller};
pub use pusher::{push, PushOutcome, Pusher};
#[cfg(feature = "http")]
pub use transport::HttpTransport;
pub use transport::{LoopbackTransport, Transport};
