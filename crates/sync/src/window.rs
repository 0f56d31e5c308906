//! Paging window over a room's message stream
//!
//! The window only grows backward: `request_older` raises the limit by one
//! page and remembers which message was oldest at that moment, so the
//! boundary can be drawn at a fixed place while older history streams in.
//! New-tail detection compares the last message id across updates; the
//! message count is useless for that because it also grows with the limit.

use chorus_core::invariants::assert_limit_monotonic;
use chorus_core::Message;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct MessageWindow {
    page_size: usize,
    limit: usize,
    has_more: bool,
    oldest_id: Option<Uuid>,
    last_id: Option<Uuid>,
    primed: bool,
    dividers: Vec<Uuid>,
}

impl MessageWindow {
    pub fn new(page_size: usize) -> Self {
        let page_size = page_size.max(1);
        Self {
            page_size,
            limit: page_size,
            has_more: false,
            oldest_id: None,
            last_id: None,
            primed: false,
            dividers: Vec::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn last_id(&self) -> Option<Uuid> {
        self.last_id
    }

    /// Divider anchors in request order
    pub fn dividers(&self) -> &[Uuid] {
        &self.dividers
    }

    /// Extend the window by one page. Returns false, and records nothing,
    /// when no older history exists.
    pub fn request_older(&mut self) -> bool {
        let Some(oldest) = self.oldest_id else {
            return false;
        };
        if !self.has_more {
            return false;
        }
        if !self.dividers.contains(&oldest) {
            self.dividers.push(oldest);
        }
        let previous = self.limit;
        self.limit += self.page_size;
        assert_limit_monotonic(previous, self.limit);
        true
    }

    /// Take in a fresh snapshot. Returns true when the newest message
    /// changed since the previous snapshot; the first snapshot only primes.
    pub fn observe(&mut self, messages: &[Message], has_more: bool) -> bool {
        self.has_more = has_more;
        self.oldest_id = messages.first().map(|m| m.id);
        let last = messages.last().map(|m| m.id);

        let new_tail = self.primed && last.is_some() && last != self.last_id;
        self.last_id = last;
        self.primed = true;
        new_tail
    }
}
