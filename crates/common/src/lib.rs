pub mod error;
pub mod time;

pub use error::FromMessage;
pub use time::unix_now_ms;
