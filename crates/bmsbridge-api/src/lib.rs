// bmsbridge-api: Async Rust client for the building-management auth API
// and the Pusher real-time transport it authorizes.

pub mod auth;
pub mod error;
pub mod pusher;
pub mod transport;

pub use auth::{AuthClient, ChannelAuthorization, TokenResponse};
pub use error::Error;
pub use pusher::{Frame, PusherEndpoint, PusherEvent, PusherSocket};
pub use transport::{TlsMode, TransportConfig};
