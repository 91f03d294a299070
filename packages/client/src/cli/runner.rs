//! Interactive room session: line input, live message stream, status changes.

use std::path::Path;

use rustyline::{DefaultEditor, error::ReadlineError};
use tokio::sync::{broadcast, mpsc};

use crate::{
    client::ChatClient,
    credentials::SharedCredentials,
    domain::{ImageUpload, RoomId},
    error::ChatError,
    session::ChatSession,
};

use super::{
    command::{Command, content_type_for, parse_command},
    formatter::MessageFormatter,
    ui::{prompt, redisplay_prompt},
};

/// How the input loop ended
enum Exit {
    Quit,
    Leave,
}

/// Run the interactive session of `room_id` until the user quits or leaves.
///
/// An expired credential clears `credentials` and is returned as an error.
pub async fn run_room(
    client: &ChatClient,
    room_id: RoomId,
    credentials: &SharedCredentials,
) -> Result<(), ChatError> {
    let session = match client.enter_room(&room_id).await {
        Ok(session) => session,
        Err(e) => return Err(force_logout_on_fatal(e, credentials)),
    };
    let my_id = client.identity().user_id;
    let label = room_id.to_string();

    let mut updates = session.updates();
    if let Some(room) = session.room_info() {
        print!("{}", MessageFormatter::format_room_header(&room, my_id));
    }
    for message in session.messages() {
        print!("{}", MessageFormatter::format_message(&message, my_id));
    }
    println!(
        "\nType messages and press Enter to send. /help for commands, Ctrl+C to exit.\n"
    );

    let mut input_rx = spawn_line_reader(prompt(&label));
    let mut connected = session.watch_connected();
    let mut fatal = session.watch_fatal();

    let exit = loop {
        tokio::select! {
            line = input_rx.recv() => {
                let Some(line) = line else {
                    break Exit::Quit;
                };
                match parse_command(&line) {
                    Ok(Command::Say(text)) => report(session.send(text).await, &label),
                    Ok(Command::Image(path)) => {
                        report(send_image(&session, &path).await, &label);
                    }
                    Ok(Command::Help) => {
                        print!("{}", MessageFormatter::format_help());
                        redisplay_prompt(&label);
                    }
                    Ok(Command::Leave) => break Exit::Leave,
                    Ok(Command::Quit) => break Exit::Quit,
                    Err(usage) => {
                        print!("{}", MessageFormatter::format_notice(&usage));
                        redisplay_prompt(&label);
                    }
                }
            }
            update = updates.recv() => match update {
                Ok(message) => {
                    print!("{}", MessageFormatter::format_message(&message, my_id));
                    redisplay_prompt(&label);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Display fell behind, {} messages skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break Exit::Quit,
            },
            Ok(()) = connected.changed() => {
                let is_connected = *connected.borrow_and_update();
                print!("{}", MessageFormatter::format_status(is_connected));
                redisplay_prompt(&label);
            }
            Ok(()) = fatal.changed() => {
                let error = fatal.borrow_and_update().clone();
                if let Some(error) = error {
                    return Err(force_logout_on_fatal(error, credentials));
                }
            }
        }
    };

    match exit {
        Exit::Quit => {
            client.close_room(&room_id).await;
            Ok(())
        }
        Exit::Leave => {
            let result = client.leave_room(&room_id).await;
            if result.is_ok() {
                println!("\nYou left room '{}'.", room_id);
            }
            result.map_err(|e| force_logout_on_fatal(e, credentials))
        }
    }
}

/// Print a non-fatal send failure as a one-time notice.
fn report(result: Result<(), ChatError>, label: &str) {
    let Err(e) = result else {
        return;
    };
    let notice = match &e {
        ChatError::NotReady => "not connected yet, try again in a moment".to_string(),
        other => other.to_string(),
    };
    tracing::debug!("Send failed: {}", e);
    print!("{}", MessageFormatter::format_notice(&notice));
    redisplay_prompt(label);
}

async fn send_image(session: &ChatSession, path: &Path) -> Result<(), ChatError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| ChatError::UploadFailed(format!("{}: {}", path.display(), e)))?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());

    session
        .send_image(ImageUpload {
            file_name,
            content_type: content_type_for(path).to_string(),
            bytes,
        })
        .await
}

fn force_logout_on_fatal(error: ChatError, credentials: &SharedCredentials) -> ChatError {
    if error.is_fatal() {
        tracing::error!("Credential expired, logging out: {}", error);
        credentials.clear();
    }
    error
}

/// Read lines on a blocking thread (rustyline is synchronous).
fn spawn_line_reader(prompt: String) -> mpsc::UnboundedReceiver<String> {
    let (input_tx, input_rx) = mpsc::unbounded_channel::<String>();

    std::thread::spawn(move || {
        let mut rl = match DefaultEditor::new() {
            Ok(rl) => rl,
            Err(e) => {
                eprintln!("Failed to initialize readline: {}", e);
                return;
            }
        };

        loop {
            match rl.readline(&prompt) {
                Ok(line) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        rl.add_history_entry(line).ok();
                        if input_tx.send(line.to_string()).is_err() {
                            break;
                        }
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    tracing::info!("Interrupted");
                    break;
                }
                Err(ReadlineError::Eof) => {
                    tracing::info!("EOF");
                    break;
                }
                Err(err) => {
                    tracing::error!("Readline error: {}", err);
                    break;
                }
            }
        }
    });

    input_rx
}
