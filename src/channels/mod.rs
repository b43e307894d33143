//! Transport abstraction for chat-network I/O.

pub mod telegram;
pub mod transport;

#[cfg(test)]
pub mod testing;

pub use telegram::TelegramTransport;
pub use transport::*;
