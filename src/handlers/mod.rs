pub mod config;
pub mod history;

pub use config::*;
pub use history::*;
