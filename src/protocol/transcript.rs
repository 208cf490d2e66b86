//! # Transcript and Message Log
//!
//! `TranscriptAccumulator` builds the running conversation notes out of
//! transcript deltas: consecutive deltas from the same speaker extend the
//! current block, a change of speaker opens a new block under a role header.
//!
//! Every turn gets a message id when its first delta arrives; `end_turn`
//! (on `turn_complete`) retires it, so the next delta opens a new turn even
//! when the same speaker keeps talking. The notes still merge that speaker's
//! text under one header.
//!
//! `MessageLog` is the user-visible message list: system notices plus one
//! entry per speaker per turn, extended as deltas arrive. Entry ids are
//! millisecond timestamps, bumped when two entries land in the same
//! millisecond so they stay strictly increasing.

use chrono::Utc;
use serde::Serialize;

use crate::protocol::messages::Role;

/// Hands out strictly increasing millisecond ids.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    last: i64,
}

impl IdGenerator {
    pub fn next_id(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis();
        self.last = now.max(self.last + 1);
        self.last
    }
}

/// One speaker's contiguous block of text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptBlock {
    /// Turn that opened this block. A block continued into a later turn by
    /// the same speaker keeps its opening id.
    pub message_id: i64,
    pub role: Role,
    pub text: String,
    /// Set once a delta arrived with `finished: true`
    pub is_final: bool,
}

/// What an appended delta did to the notes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptUpdate {
    pub role: Role,
    /// A new block with a role header was started
    pub new_block: bool,
    /// The turn this delta belongs to
    pub message_id: i64,
}

#[derive(Debug, Default)]
pub struct TranscriptAccumulator {
    blocks: Vec<TranscriptBlock>,
    active_message_id: Option<i64>,
    ids: IdGenerator,
}

impl TranscriptAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta, opening a new block if the speaker changed.
    pub fn append(&mut self, role: Role, text: &str, is_final: bool) -> TranscriptUpdate {
        let message_id = match self.active_message_id {
            Some(id) => id,
            None => {
                let id = self.ids.next_id();
                self.active_message_id = Some(id);
                id
            }
        };

        match self.blocks.last_mut() {
            Some(block) if block.role == role => {
                block.text.push_str(text);
                block.is_final |= is_final;
                TranscriptUpdate { role, new_block: false, message_id }
            }
            _ => {
                self.blocks.push(TranscriptBlock {
                    message_id,
                    role,
                    text: text.to_string(),
                    is_final,
                });
                TranscriptUpdate { role, new_block: true, message_id }
            }
        }
    }

    /// End of turn: the next delta belongs to a new message.
    pub fn end_turn(&mut self) {
        self.active_message_id = None;
    }

    pub fn active_message_id(&self) -> Option<i64> {
        self.active_message_id
    }

    pub fn blocks(&self) -> &[TranscriptBlock] {
        &self.blocks
    }

    /// Render as markdown notes: `**Agent:** text` blocks separated by blank lines.
    pub fn notes(&self) -> String {
        self.blocks
            .iter()
            .map(|b| format!("{} {}", b.role.header(), b.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.active_message_id = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    System,
    Agent,
    User,
}

impl From<Role> for Sender {
    fn from(role: Role) -> Self {
        match role {
            Role::User => Sender::User,
            Role::Agent => Sender::Agent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub sender: Sender,
    pub text: String,
    /// Turn a speaker entry belongs to; `None` for system notices
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<i64>,
}

#[derive(Debug, Default)]
pub struct MessageLog {
    entries: Vec<LogEntry>,
    ids: IdGenerator,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sender: Sender, text: impl Into<String>) -> &LogEntry {
        self.push_entry(sender, text.into(), None)
    }

    /// Extend `sender`'s entry for `turn_id`, opening it on the first delta.
    pub fn append_to_turn(&mut self, sender: Sender, turn_id: i64, text: &str) -> &LogEntry {
        let existing = self
            .entries
            .iter()
            .rposition(|e| e.sender == sender && e.turn_id == Some(turn_id));
        match existing {
            Some(index) => {
                self.entries[index].text.push_str(text);
                &self.entries[index]
            }
            None => self.push_entry(sender, text.to_string(), Some(turn_id)),
        }
    }

    fn push_entry(&mut self, sender: Sender, text: String, turn_id: Option<i64>) -> &LogEntry {
        let entry = LogEntry {
            id: self.ids.next_id(),
            sender,
            text,
            turn_id,
        };
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&LogEntry> {
        self.entries.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_speaker_appends_in_place() {
        let mut transcript = TranscriptAccumulator::new();
        let first = transcript.append(Role::Agent, "He", false);
        let second = transcript.append(Role::Agent, "llo", false);

        assert!(first.new_block);
        assert!(!second.new_block);
        assert_eq!(transcript.blocks().len(), 1);
        assert_eq!(transcript.blocks()[0].text, "Hello");
        assert_eq!(transcript.notes(), "**Agent:** Hello");
    }

    #[test]
    fn test_speaker_change_inserts_header() {
        let mut transcript = TranscriptAccumulator::new();
        transcript.append(Role::User, "Hi there", true);
        transcript.append(Role::Agent, "Hello", false);
        transcript.append(Role::Agent, "!", false);
        transcript.append(Role::User, "Bye", false);

        assert_eq!(
            transcript.notes(),
            "**You:** Hi there\n\n**Agent:** Hello!\n\n**You:** Bye"
        );
        assert!(transcript.blocks()[0].is_final);
    }

    #[test]
    fn test_end_turn_resets_active_message() {
        let mut transcript = TranscriptAccumulator::new();
        let first = transcript.append(Role::Agent, "one", false);
        assert_eq!(transcript.active_message_id(), Some(first.message_id));

        transcript.end_turn();
        assert_eq!(transcript.active_message_id(), None);

        transcript.append(Role::User, "two", false);
        let next = transcript.active_message_id().unwrap();
        assert!(next > first.message_id);
    }

    #[test]
    fn test_new_turn_gets_new_message_id() {
        let mut transcript = TranscriptAccumulator::new();
        let first = transcript.append(Role::Agent, "Hello.", true);
        transcript.end_turn();
        let second = transcript.append(Role::Agent, "Bye.", true);

        assert_ne!(first.message_id, second.message_id);
        assert_eq!(transcript.active_message_id(), Some(second.message_id));
        // Notes keep one header while the speaker does not change
        assert!(!second.new_block);
        assert_eq!(transcript.notes(), "**Agent:** Hello.Bye.");
    }

    #[test]
    fn test_turn_entries_extend_per_speaker() {
        let mut log = MessageLog::new();
        log.append_to_turn(Sender::User, 1, "Hi");
        log.append_to_turn(Sender::Agent, 1, "Hel");
        log.push(Sender::System, "notice");
        log.append_to_turn(Sender::Agent, 1, "lo");
        log.append_to_turn(Sender::Agent, 2, "Bye");

        let texts: Vec<(Sender, &str)> = log.entries().iter().map(|e| (e.sender, e.text.as_str())).collect();
        assert_eq!(
            texts,
            vec![
                (Sender::User, "Hi"),
                (Sender::Agent, "Hello"),
                (Sender::System, "notice"),
                (Sender::Agent, "Bye"),
            ]
        );
        assert_eq!(log.entries()[1].turn_id, Some(1));
        assert_eq!(log.entries()[3].turn_id, Some(2));
    }

    #[test]
    fn test_log_ids_strictly_increase() {
        let mut log = MessageLog::new();
        for i in 0..50 {
            log.push(Sender::System, format!("notice {}", i));
        }
        let ids: Vec<i64> = log.entries().iter().map(|e| e.id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(log.last().unwrap().text, "notice 49");
    }

    #[test]
    fn test_log_entry_serializes_lowercase_sender() {
        let mut log = MessageLog::new();
        let entry = log.push(Sender::System, "Connection closed.").clone();
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["sender"], "system");
        assert_eq!(value["text"], "Connection closed.");
        assert!(value.get("turn_id").is_none());
    }
}
