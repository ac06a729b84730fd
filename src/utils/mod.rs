//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod bitmap;
mod error;
mod safetcp;
mod timer;
mod utime;

pub use bitmap::Bitmap;
pub use error::MonaxosError;
pub use timer::Timer;
pub use utime::UTime;

pub(crate) use safetcp::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry,
    tcp_connect_with_retry, WIRE_CONFIG,
};
