//! Wire model shared by the directory daemon and its control client.

pub mod codec;
pub mod protocol;
pub mod types;
