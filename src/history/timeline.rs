use crate::common::ChatMessage;

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub message: ChatMessage,
    /// Local send not yet echoed back by the broker.
    pub pending: bool,
}

/// Ordered view of one room's messages: ascending `sent_at`, ties in
/// arrival order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    room_id: String,
    entries: Vec<TimelineEntry>,
}

impl Timeline {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            entries: Vec::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.entries.iter().map(|entry| &entry.message)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.messages().any(|message| message.id.as_deref() == Some(id))
    }

    /// Add a message observed from the server (history or live).
    ///
    /// Returns `false` for another room or an `id` already present. The
    /// message replaces the oldest pending local send with the same
    /// `(sender_id, content, room_id)`; otherwise it is inserted, so an
    /// id-less repeat of an earlier message is kept.
    pub fn absorb(&mut self, message: ChatMessage) -> bool {
        if !self.belongs_here(&message) {
            return false;
        }
        if let Some(id) = message.id.as_deref().filter(|id| !id.is_empty()) {
            if self.contains_id(id) {
                return false;
            }
        }
        if let Some(index) = self
            .entries
            .iter()
            .position(|entry| entry.pending && entry.message.echo_key() == message.echo_key())
        {
            self.entries.remove(index);
        }
        self.insert_ordered(message, false);
        true
    }

    /// Add an optimistic entry for a message this client just sent.
    pub fn push_pending(&mut self, message: ChatMessage) -> bool {
        if !self.belongs_here(&message) {
            return false;
        }
        self.insert_ordered(message, true);
        true
    }

    pub(crate) fn into_entries(self) -> Vec<TimelineEntry> {
        self.entries
    }

    fn belongs_here(&self, message: &ChatMessage) -> bool {
        message.room_id == self.room_id
    }

    fn insert_ordered(&mut self, message: ChatMessage, pending: bool) {
        let index = self
            .entries
            .partition_point(|entry| entry.message.sent_at <= message.sent_at);
        self.entries.insert(index, TimelineEntry { message, pending });
    }
}
