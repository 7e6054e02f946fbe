pub mod codec;
pub mod server;

pub use codec::{Command, Frame, ReplyFrame};
pub use server::run_unix_server;
