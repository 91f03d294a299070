//! Message formatting for terminal display.

use souk_shared::time::timestamp_to_rfc3339;

use crate::domain::{ChatMessage, MessageKind, RoomInfo};

const RULE: &str = "============================================================";

/// Message formatter for terminal display
pub struct MessageFormatter;

impl MessageFormatter {
    /// Format the header printed when a room is opened
    ///
    /// # Arguments
    ///
    /// * `room` - Room metadata
    /// * `my_id` - The current user's id (to mark as "me")
    pub fn format_room_header(room: &RoomInfo, my_id: i64) -> String {
        let mut output = String::new();
        output.push_str(&format!("\n\n{}\n", RULE));
        output.push_str(&format!("Room: {} ({})\n", room.title, room.id));
        output.push_str("Participants:\n");

        if room.participants.is_empty() {
            output.push_str("(No participants)\n");
        } else {
            for participant in &room.participants {
                let me_suffix = if *participant == my_id { " (me)" } else { "" };
                output.push_str(&format!("user {}{}\n", participant, me_suffix));
            }
        }

        output.push_str(&format!("{}\n", RULE));
        output
    }

    /// Format one log entry
    ///
    /// `SYSTEM` entries are shown without a sender; `IMAGE` entries show the
    /// image URL.
    pub fn format_message(message: &ChatMessage, my_id: i64) -> String {
        let timestamp_str = timestamp_to_rfc3339(message.sent_at);
        match message.kind {
            MessageKind::System => format!("\n* {} ({})\n", message.body, timestamp_str),
            MessageKind::Text | MessageKind::Image => {
                let sender = if message.sender_id == my_id {
                    "me".to_string()
                } else {
                    format!("user {}", message.sender_id)
                };
                let body = match message.kind {
                    MessageKind::Image => format!("[image] {}", message.body),
                    _ => message.body.clone(),
                };
                format!("\n@{}: {}\nsent at {}\n", sender, body, timestamp_str)
            }
        }
    }

    /// Format a change of the combined connectivity flag
    pub fn format_status(connected: bool) -> String {
        if connected {
            "\n[online] chat connected\n".to_string()
        } else {
            "\n[offline] chat unavailable, reconnecting...\n".to_string()
        }
    }

    /// Format a one-time, non-fatal notice
    pub fn format_notice(text: &str) -> String {
        format!("\n! {}\n", text)
    }

    pub fn format_help() -> String {
        "\nCommands:\n  \
         /image <path>  send an image\n  \
         /leave         leave the room\n  \
         /quit          close the room\n  \
         //text         send text starting with '/'\n"
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RoomId;

    fn message(sender_id: i64, body: &str, kind: MessageKind) -> ChatMessage {
        ChatMessage {
            sender_id,
            body: body.to_string(),
            kind,
            sent_at: 1672498800000,
        }
    }

    #[test]
    fn test_format_room_header_marks_me() {
        // テスト項目: ルームヘッダーに参加者が表示され、自分にはマークが付く
        // given (前提条件):
        let room = RoomInfo {
            id: RoomId::new("room-1"),
            title: "Road bike".to_string(),
            participants: vec![7, 8],
        };

        // when (操作):
        let result = MessageFormatter::format_room_header(&room, 7);

        // then (期待する結果):
        assert!(result.contains("Road bike (room-1)"));
        assert!(result.contains("user 7 (me)"));
        assert!(result.contains("user 8\n"));
    }

    #[test]
    fn test_format_room_header_without_participants() {
        // テスト項目: 参加者が空の場合、適切なメッセージが表示される
        // given (前提条件):
        let room = RoomInfo {
            id: RoomId::new("room-1"),
            title: "Road bike".to_string(),
            participants: vec![],
        };

        // when (操作):
        let result = MessageFormatter::format_room_header(&room, 7);

        // then (期待する結果):
        assert!(result.contains("(No participants)"));
    }

    #[test]
    fn test_format_text_message() {
        // テスト項目: テキストメッセージに送信者と送信時刻が表示される
        // given (前提条件):
        let from_other = message(8, "Hello, world!", MessageKind::Text);
        let from_me = message(7, "hi", MessageKind::Text);

        // when (操作):
        let other = MessageFormatter::format_message(&from_other, 7);
        let mine = MessageFormatter::format_message(&from_me, 7);

        // then (期待する結果):
        assert!(other.contains("@user 8: Hello, world!"));
        assert!(other.contains("2023-01-01"));
        assert!(mine.contains("@me: hi"));
    }

    #[test]
    fn test_format_image_and_system_messages() {
        // テスト項目: 画像は URL 付きで、システムメッセージは送信者なしで表示される
        // given (前提条件):
        let image = message(8, "http://cdn/1.png", MessageKind::Image);
        let system = message(0, "you purchased this item", MessageKind::System);

        // when (操作):
        let image_line = MessageFormatter::format_message(&image, 7);
        let system_line = MessageFormatter::format_message(&system, 7);

        // then (期待する結果):
        assert!(image_line.contains("[image] http://cdn/1.png"));
        assert!(system_line.contains("* you purchased this item"));
        assert!(!system_line.contains('@'));
    }

    #[test]
    fn test_format_status() {
        // テスト項目: 接続状態の変化が表示される
        // given (前提条件) / when (操作) / then (期待する結果):
        assert!(MessageFormatter::format_status(true).contains("online"));
        assert!(MessageFormatter::format_status(false).contains("offline"));
    }
}
