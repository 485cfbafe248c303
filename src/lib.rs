pub mod app;
pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod device;
pub mod server;
pub mod transport;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;
