pub mod error;
pub mod log;
pub mod span;
pub mod store;

pub use error::{Error, Result};
pub use log::action::Action;
pub use log::reader::{DictEntry, LogReader, Piece};
pub use log::CommitLog;
pub use span::Span;
pub use store::{Store, StreamStat};
