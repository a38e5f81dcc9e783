//! Gateway: the call pipeline, the registry HTTP surface and the server

mod call;
mod router;
mod server;

pub use call::{ToolGateway, UNKNOWN_SERVER};
pub use router::{AppState, WEIGHT_RANGE, create_router};
pub use server::Gateway;
