/// Backend submodules for the chat socket and REST calls
///
/// - `connection`: WebSocket establishment behind the `Connector` seam
/// - `handlers`: frame decoding and command encoding
/// - `main_loop`: action dispatch, socket reads and reconnection
/// - `reconnect`: backoff schedule
mod connection;
mod handlers;
mod main_loop;
mod reconnect;

pub use connection::{Connector, Transport, WsConnector};
pub use handlers::{decode_frame, encode_commands};
pub use main_loop::{run_backend, run_loop, LoopConfig};
pub use reconnect::{Backoff, ReconnectPolicy};
