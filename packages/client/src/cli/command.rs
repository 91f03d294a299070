//! Input line parsing for the interactive client.

use std::path::PathBuf;

/// A parsed input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Plain text to post to the room
    Say(String),
    /// `/image <path>`
    Image(PathBuf),
    /// `/leave`: leave the room for good
    Leave,
    /// `/quit`: close the room, keep the membership
    Quit,
    /// `/help`
    Help,
}

/// Parse one trimmed, non-empty input line.
///
/// Lines starting with `/` are commands; `//` escapes a leading slash.
pub fn parse_command(line: &str) -> Result<Command, String> {
    if let Some(escaped) = line.strip_prefix("//") {
        return Ok(Command::Say(format!("/{}", escaped)));
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Command::Say(line.to_string()));
    };

    let (name, argument) = match command.split_once(char::is_whitespace) {
        Some((name, argument)) => (name, argument.trim()),
        None => (command, ""),
    };
    match name {
        "image" if argument.is_empty() => Err("usage: /image <path>".to_string()),
        "image" => Ok(Command::Image(PathBuf::from(argument))),
        "leave" => Ok(Command::Leave),
        "quit" | "exit" => Ok(Command::Quit),
        "help" => Ok(Command::Help),
        other => Err(format!("unknown command '/{}', try /help", other)),
    }
}

/// Content type of an image file, guessed from its extension.
pub fn content_type_for(path: &std::path::Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}
