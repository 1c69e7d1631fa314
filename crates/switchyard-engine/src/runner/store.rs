use std::collections::{BTreeMap, HashMap};

use switchyard_core::types::Message;

/// Append-only store of node outputs for one run, keyed by (node, attempt).
#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
    keys: HashMap<(String, u32), usize>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message. Returns `false` and keeps the existing entry if the
    /// (node, attempt) key was already stored.
    pub fn insert(&mut self, message: Message) -> bool {
        let key = (message.producer().to_string(), message.attempt());
        if self.keys.contains_key(&key) {
            return false;
        }
        self.keys.insert(key, self.messages.len());
        self.messages.push(message);
        true
    }

    pub fn get(&self, node: &str, attempt: u32) -> Option<&Message> {
        self.keys
            .get(&(node.to_string(), attempt))
            .map(|&i| &self.messages[i])
    }

    /// Latest stored output of `node`.
    pub fn latest(&self, node: &str) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.producer() == node)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Latest output per node.
    pub fn into_outputs(self) -> BTreeMap<String, Message> {
        let mut outputs = BTreeMap::new();
        for message in self.messages {
            outputs.insert(message.producer().to_string(), message);
        }
        outputs
    }
}
