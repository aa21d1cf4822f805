//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod bitmap;
mod error;
mod safetcp;

pub use bitmap::Bitmap;
pub use error::RssError;
pub use print::logger_init;

pub(crate) use safetcp::{
    safe_tcp_read, safe_tcp_write, tcp_bind, tcp_connect_with_timeout,
};
