//! Routed items and the client's outbound retry queue.

use std::hash::{Hash, Hasher};

use crate::messages::{ItemSend, PlayerId};

/// An item travelling to a player.
///
/// Identity is the pair (destination, item label): two sends of the same item
/// to the same player are the same item, wherever they were found and
/// whoever sent them.
#[derive(Debug, Clone)]
pub struct PendingItem {
    /// Destination player.
    pub to: PlayerId,
    /// Nickname of the sending player.
    pub from: String,
    /// Location label.
    pub location: String,
    /// Item label.
    pub item: String,
}

impl PendingItem {
    /// Build an item.
    pub fn new(
        to: PlayerId,
        from: impl Into<String>,
        location: impl Into<String>,
        item: impl Into<String>,
    ) -> Self {
        Self {
            to,
            from: from.into(),
            location: location.into(),
            item: item.into(),
        }
    }

    /// Whether this item has the given identity.
    pub fn matches(&self, to: PlayerId, item: &str) -> bool {
        self.to == to && self.item == item
    }
}

impl PartialEq for PendingItem {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other.to, &other.item)
    }
}

impl Eq for PendingItem {}

impl Hash for PendingItem {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to.hash(state);
        self.item.hash(state);
    }
}

/// Items sent to the server but not yet confirmed by an `ItemSendConfirm`.
///
/// Order is insertion order so resends go out in the order items were found.
#[derive(Debug, Default)]
pub struct OutboundItemQueue {
    items: Vec<PendingItem>,
}

impl OutboundItemQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an item. Returns `false` if an item with the same identity is
    /// already queued.
    pub fn push(&mut self, item: PendingItem) -> bool {
        if self.items.contains(&item) {
            return false;
        }
        self.items.push(item);
        true
    }

    /// Remove every entry matching (to, item). Returns how many were removed.
    pub fn confirm(&mut self, to: PlayerId, item: &str) -> usize {
        let before = self.items.len();
        self.items.retain(|queued| !queued.matches(to, item));
        before - self.items.len()
    }

    /// `ItemSend` messages for every queued item.
    pub fn resend_messages(&self) -> Vec<ItemSend> {
        self.items
            .iter()
            .map(|i| ItemSend {
                location: i.location.clone(),
                item: i.item.clone(),
                to: i.to,
            })
            .collect()
    }

    /// Queued items, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &PendingItem> {
        self.items.iter()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
