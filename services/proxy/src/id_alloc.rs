//! ID Allocator.
//!
//! A monotonic `u32` counter, one per Request Relay. Collisions (only
//! possible after a full wraparound with long-outstanding requests) are
//! resolved by probing forward until the Pending Table reports a free slot.
//! See `RequestRelay::allocate_and_insert` for the probe loop; this type
//! only owns the counter itself.

use pot_protocol::TransactionId;

pub struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    /// The id that would be handed out by the next call to `advance`.
    pub fn peek(&self) -> u32 {
        self.next
    }

    /// Hand out the next candidate id and advance the counter, wrapping to
    /// zero on overflow.
    pub fn advance(&mut self) -> TransactionId {
        let id = TransactionId(self.next);
        self.next = self.next.wrapping_add(1);
        id
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_monotonically_from_zero() {
        let mut alloc = IdAllocator::new();
        assert_eq!(alloc.advance(), TransactionId(0));
        assert_eq!(alloc.advance(), TransactionId(1));
        assert_eq!(alloc.advance(), TransactionId(2));
    }

    #[test]
    fn wraps_to_zero_after_u32_max() {
        let mut alloc = IdAllocator { next: u32::MAX };
        assert_eq!(alloc.advance(), TransactionId(u32::MAX));
        assert_eq!(alloc.advance(), TransactionId(0));
    }

    #[test]
    fn peek_matches_next_advance() {
        let mut alloc = IdAllocator::new();
        alloc.advance();
        alloc.advance();
        assert_eq!(alloc.peek(), 2);
        assert_eq!(alloc.advance(), TransactionId(2));
    }
}
