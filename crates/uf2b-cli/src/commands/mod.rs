//! Command implementations for uf2b

pub mod console;
pub mod flash;
pub mod reboot;
pub mod status;

pub use console::console;
pub use flash::flash;
pub use reboot::reboot;
pub use status::status;
