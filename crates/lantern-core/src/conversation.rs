//! Conversation bookkeeping.
//!
//! Maps delivered messages to a direct or group conversation, deduplicates
//! by MessageID, and tracks unread counts. This is the receive-side
//! contract the router terminates into; presentation and persistence live
//! above it.

use crate::envelope::MessageId;
use lantern_crypto::{GroupId, NodeId};
use std::collections::{HashMap, HashSet};

/// Identifier of a logical conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationId {
    /// One-to-one conversation with a peer
    Direct(NodeId),
    /// Group conversation
    Group(GroupId),
}

/// One message as the conversation layer stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    /// MessageID, used for idempotent insertion
    pub id: MessageId,
    /// The sender
    pub sender: NodeId,
    /// The sender's display name
    pub sender_name: String,
    /// Message text
    pub text: String,
    /// Whether the local node sent it
    pub outgoing: bool,
}

/// A direct or group conversation.
#[derive(Debug)]
pub struct Conversation {
    /// Which conversation this is
    pub id: ConversationId,
    /// Display title (peer name or group name)
    pub title: String,
    /// Group membership, as known locally; empty for direct conversations
    pub members: Vec<NodeId>,
    messages: Vec<StoredMessage>,
    known_ids: HashSet<MessageId>,
    unread: Vec<(MessageId, NodeId)>,
}

impl Conversation {
    fn new(id: ConversationId, title: String) -> Self {
        Self {
            id,
            title,
            members: Vec::new(),
            messages: Vec::new(),
            known_ids: HashSet::new(),
            unread: Vec::new(),
        }
    }

    /// Messages in arrival order.
    #[must_use]
    pub fn messages(&self) -> &[StoredMessage] {
        &self.messages
    }

    /// Unread message count.
    #[must_use]
    pub fn unread_count(&self) -> usize {
        self.unread.len()
    }

    /// The most recent message, if any.
    #[must_use]
    pub fn last_message(&self) -> Option<&StoredMessage> {
        self.messages.last()
    }
}

/// Summary row for a conversation list.
#[derive(Debug, Clone)]
pub struct ConversationSummary {
    /// Which conversation this is
    pub id: ConversationId,
    /// Display title
    pub title: String,
    /// Unread message count
    pub unread: usize,
    /// Text of the most recent message
    pub last_message: Option<String>,
}

/// The set of conversations this node participates in.
#[derive(Default)]
pub struct ConversationRegistry {
    conversations: HashMap<ConversationId, Conversation>,
}

impl ConversationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an incoming message, creating the conversation on first
    /// contact.
    ///
    /// Idempotent by MessageID: returns `false` and changes nothing for a
    /// duplicate.
    pub fn add_incoming(
        &mut self,
        id: ConversationId,
        title: &str,
        message: StoredMessage,
    ) -> bool {
        let conversation = self
            .conversations
            .entry(id)
            .or_insert_with(|| Conversation::new(id, title.to_owned()));
        if !conversation.known_ids.insert(message.id) {
            return false;
        }
        conversation.unread.push((message.id, message.sender));
        conversation.messages.push(message);
        true
    }

    /// Record a message the local node sent.
    pub fn add_outgoing(&mut self, id: ConversationId, title: &str, message: StoredMessage) {
        let conversation = self
            .conversations
            .entry(id)
            .or_insert_with(|| Conversation::new(id, title.to_owned()));
        if conversation.known_ids.insert(message.id) {
            conversation.messages.push(message);
        }
    }

    /// Register a group conversation with its membership.
    pub fn register_group(&mut self, group: GroupId, name: &str, members: Vec<NodeId>) {
        let id = ConversationId::Group(group);
        let conversation = self
            .conversations
            .entry(id)
            .or_insert_with(|| Conversation::new(id, name.to_owned()));
        conversation.title = name.to_owned();
        conversation.members = members;
    }

    /// Add a member to a group conversation.
    ///
    /// Returns `false` if the group is unknown or the member already
    /// listed.
    pub fn add_group_member(&mut self, group: &GroupId, member: NodeId) -> bool {
        let Some(conversation) = self.conversations.get_mut(&ConversationId::Group(*group)) else {
            return false;
        };
        if conversation.members.contains(&member) {
            return false;
        }
        conversation.members.push(member);
        true
    }

    /// Membership of a group, as known locally.
    #[must_use]
    pub fn group_members(&self, group: &GroupId) -> Option<&[NodeId]> {
        self.conversations
            .get(&ConversationId::Group(*group))
            .map(|c| c.members.as_slice())
    }

    /// Look up a conversation.
    #[must_use]
    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    /// Clear a conversation's unread state, returning the message ids and
    /// senders that had been unread (for read receipts).
    pub fn mark_read(&mut self, id: &ConversationId) -> Vec<(MessageId, NodeId)> {
        match self.conversations.get_mut(id) {
            Some(conversation) => std::mem::take(&mut conversation.unread),
            None => Vec::new(),
        }
    }

    /// Summaries for a conversation list, unread first.
    #[must_use]
    pub fn summaries(&self) -> Vec<ConversationSummary> {
        let mut rows: Vec<ConversationSummary> = self
            .conversations
            .values()
            .map(|c| ConversationSummary {
                id: c.id,
                title: c.title.clone(),
                unread: c.unread_count(),
                last_message: c.last_message().map(|m| m.text.clone()),
            })
            .collect();
        rows.sort_by(|a, b| b.unread.cmp(&a.unread));
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u8) -> NodeId {
        NodeId::from_bytes([n; 16])
    }

    fn incoming(from: u8, text: &str) -> StoredMessage {
        StoredMessage {
            id: MessageId::random(),
            sender: node(from),
            sender_name: format!("node-{from}"),
            text: text.to_owned(),
            outgoing: false,
        }
    }

    #[test]
    fn test_incoming_creates_conversation_and_counts_unread() {
        let mut registry = ConversationRegistry::new();
        let id = ConversationId::Direct(node(2));

        assert!(registry.add_incoming(id, "bob", incoming(2, "hi")));
        assert!(registry.add_incoming(id, "bob", incoming(2, "there")));

        let conversation = registry.get(&id).unwrap();
        assert_eq!(conversation.messages().len(), 2);
        assert_eq!(conversation.unread_count(), 2);
        assert_eq!(conversation.last_message().unwrap().text, "there");
    }

    #[test]
    fn test_duplicate_message_id_is_noop() {
        let mut registry = ConversationRegistry::new();
        let id = ConversationId::Direct(node(2));
        let message = incoming(2, "hi");

        assert!(registry.add_incoming(id, "bob", message.clone()));
        assert!(!registry.add_incoming(id, "bob", message));
        assert_eq!(registry.get(&id).unwrap().messages().len(), 1);
        assert_eq!(registry.get(&id).unwrap().unread_count(), 1);
    }

    #[test]
    fn test_mark_read_returns_unread_and_clears() {
        let mut registry = ConversationRegistry::new();
        let id = ConversationId::Direct(node(2));
        let message = incoming(2, "hi");
        let message_id = message.id;
        registry.add_incoming(id, "bob", message);

        let unread = registry.mark_read(&id);
        assert_eq!(unread, vec![(message_id, node(2))]);
        assert_eq!(registry.get(&id).unwrap().unread_count(), 0);
        assert!(registry.mark_read(&id).is_empty());
    }

    #[test]
    fn test_outgoing_does_not_count_unread() {
        let mut registry = ConversationRegistry::new();
        let id = ConversationId::Direct(node(2));
        registry.add_outgoing(
            id,
            "bob",
            StoredMessage {
                id: MessageId::random(),
                sender: node(1),
                sender_name: "alice".to_owned(),
                text: "hey".to_owned(),
                outgoing: true,
            },
        );
        assert_eq!(registry.get(&id).unwrap().unread_count(), 0);
    }

    #[test]
    fn test_group_membership() {
        let mut registry = ConversationRegistry::new();
        let group = GroupId::from_bytes([7u8; 16]);
        registry.register_group(group, "hikers", vec![node(1)]);

        assert!(registry.add_group_member(&group, node(2)));
        assert!(!registry.add_group_member(&group, node(2)));
        assert_eq!(
            registry.group_members(&group).unwrap(),
            &[node(1), node(2)]
        );

        let unknown = GroupId::from_bytes([9u8; 16]);
        assert!(!registry.add_group_member(&unknown, node(2)));
    }

    #[test]
    fn test_summaries_sort_unread_first() {
        let mut registry = ConversationRegistry::new();
        let quiet = ConversationId::Direct(node(2));
        let busy = ConversationId::Direct(node(3));
        registry.add_incoming(quiet, "bob", incoming(2, "hi"));
        registry.mark_read(&quiet);
        registry.add_incoming(busy, "carol", incoming(3, "one"));
        registry.add_incoming(busy, "carol", incoming(3, "two"));

        let summaries = registry.summaries();
        assert_eq!(summaries[0].title, "carol");
        assert_eq!(summaries[0].unread, 2);
        assert_eq!(summaries[1].unread, 0);
    }
}
