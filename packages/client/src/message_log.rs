//! Append-only, arrival-ordered message log of one room.

use crate::domain::ChatMessage;

/// Ordered message log owned by a chat session
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    entries: Vec<ChatMessage>,
    history_merged: bool,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message at the end of the log.
    pub fn append(&mut self, message: ChatMessage) {
        self.entries.push(message);
    }

    /// Place a fetched history page ahead of the live entries.
    ///
    /// Frames that arrived while history was loading stay after the page, in
    /// arrival order. Only the first page is merged; later calls are ignored.
    pub fn merge_history(&mut self, history: Vec<ChatMessage>) {
        if self.history_merged {
            tracing::debug!("History already merged, ignoring {} entries", history.len());
            return;
        }
        self.history_merged = true;

        let live = std::mem::replace(&mut self.entries, history);
        self.entries.extend(live);
    }

    pub fn entries(&self) -> &[ChatMessage] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(body: &str) -> ChatMessage {
        ChatMessage {
            sender_id: 1,
            body: body.to_string(),
            kind: crate::domain::MessageKind::Text,
            sent_at: 0,
        }
    }

    fn bodies(log: &MessageLog) -> Vec<&str> {
        log.entries().iter().map(|m| m.body.as_str()).collect()
    }

    #[test]
    fn test_append_preserves_arrival_order() {
        // テスト項目: 到着順に追加したメッセージがそのままの順序で保持される
        // given (前提条件):
        let mut log = MessageLog::new();

        // when (操作):
        log.append(text("m1"));
        log.append(text("m2"));
        log.append(text("m3"));

        // then (期待する結果):
        assert_eq!(bodies(&log), vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_merge_history_goes_before_live_entries() {
        // テスト項目: 履歴ロード中に届いたメッセージは履歴の後ろに並ぶ
        // given (前提条件):
        let mut log = MessageLog::new();
        log.append(text("live-1"));

        // when (操作):
        log.merge_history(vec![text("old-1"), text("old-2")]);
        log.append(text("live-2"));

        // then (期待する結果):
        assert_eq!(bodies(&log), vec!["old-1", "old-2", "live-1", "live-2"]);
    }

    #[test]
    fn test_merge_history_only_once() {
        // テスト項目: 2回目以降の履歴マージは無視される
        // given (前提条件):
        let mut log = MessageLog::new();
        log.merge_history(vec![text("old-1")]);

        // when (操作):
        log.merge_history(vec![text("old-again")]);

        // then (期待する結果):
        assert_eq!(bodies(&log), vec!["old-1"]);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_duplicates_are_kept() {
        // テスト項目: 重複排除は行われない
        // given (前提条件):
        let mut log = MessageLog::new();

        // when (操作):
        log.append(text("same"));
        log.append(text("same"));

        // then (期待する結果):
        assert_eq!(log.len(), 2);
    }
}
