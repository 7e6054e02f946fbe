pub mod config;
pub mod domain;
pub mod enumeration;
pub mod error;
pub mod graceful_shutdown;
pub mod http_server;
pub mod idmap;
pub mod mcache;
pub mod metrics;
pub mod negcache;
pub mod pipeline;
pub mod protocol;
pub mod provider;
pub mod reply;
pub mod responder;
pub mod sid;
pub mod sysdb;

pub use error::{ResponderError, Result};
pub use responder::ResponderContext;
