pub mod aggregator;
pub mod config;
pub mod controller;
pub mod driver;
pub mod events;
pub mod parse;

pub use aggregator::*;
pub use config::*;
pub use controller::*;
pub use driver::*;
pub use events::*;
pub use parse::*;
