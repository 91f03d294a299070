//! Interactive terminal client for one chat room.

mod command;
mod formatter;
mod runner;
mod ui;

pub use command::{Command, content_type_for, parse_command};
pub use formatter::MessageFormatter;
pub use runner::run_room;
