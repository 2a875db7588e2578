mod block_source;
mod broker;
mod connection;
mod repository;

pub use block_source::*;
pub use broker::*;
pub use connection::*;
pub use repository::*;
