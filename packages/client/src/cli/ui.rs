//! Terminal helpers.

use std::io::Write;

/// Prompt shown by the line editor
pub fn prompt(room_label: &str) -> String {
    format!("{}> ", room_label)
}

/// Redisplay the prompt after printing an asynchronous line
pub fn redisplay_prompt(room_label: &str) {
    print!("{}", prompt(room_label));
    std::io::stdout().flush().ok();
}
