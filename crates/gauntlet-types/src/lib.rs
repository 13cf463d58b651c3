pub mod attempt;
pub mod error;
pub mod event;
pub mod process;
pub mod report;
pub mod task;

pub use attempt::*;
pub use error::*;
pub use event::*;
pub use process::*;
pub use report::*;
pub use task::*;
