//! Status models shared by the client and the test tooling

mod condition;
mod snapshot;
mod status;

pub use condition::*;
pub use snapshot::*;
pub use status::*;
