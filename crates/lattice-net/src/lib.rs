mod cache;
mod connection;
mod error;
mod ring;
pub mod tcp;

pub use cache::{ConnAttr, ConnIndex, ConnectionCache, DispatchPolicy};
pub use connection::{ConnId, NetConnection};
pub use error::NetError;
pub use ring::RingBuffer;
