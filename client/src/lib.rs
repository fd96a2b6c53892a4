pub mod announce;
pub mod cli;
pub mod config;
pub mod error;
pub mod peer;
pub mod session;
pub mod storage;
pub mod swarm;

pub use config::SessionConfig;
pub use session::{Session, SessionStats};
