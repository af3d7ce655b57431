pub mod channel;
pub mod handler;
pub mod keys;
pub mod session;
pub mod supervisor;
