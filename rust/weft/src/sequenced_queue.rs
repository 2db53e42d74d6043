//! Reassembly queue for one direction of one route.

use std::collections::VecDeque;

use weft_wire::SequenceNumber;

/// Implemented by queue elements so the queue can account for payload bytes.
pub trait Sequenced {
    fn size_in_bytes(&self) -> usize;
}

/// Reorders elements pushed with arbitrary sequence numbers back into a
/// single contiguous sequence.
///
/// The queue tracks an optional final sequence length. Once set, it never
/// moves: pushes at or beyond it are rejected, and the sequence is "fully
/// consumed" when the pop cursor reaches it.
pub struct SequencedQueue<T> {
    /// Sequence number of the next element to pop.
    base: SequenceNumber,
    /// Sparse storage for `base..`; `entries[i]` holds `base + i`.
    entries: VecDeque<Option<T>>,
    final_length: Option<SequenceNumber>,
    /// Elements poppable without a gap, starting at `base`.
    num_available: usize,
    available_bytes: usize,
    /// One past the highest sequence number ever pushed or skipped.
    highest_end: SequenceNumber,
}

impl<T: Sequenced> SequencedQueue<T> {
    pub fn new(base: SequenceNumber) -> Self {
        Self {
            base,
            entries: VecDeque::new(),
            final_length: None,
            num_available: 0,
            available_bytes: 0,
            highest_end: base,
        }
    }

    /// The next sequence number this queue will pop.
    pub fn next_sequence_number(&self) -> SequenceNumber {
        self.base
    }

    /// One past the highest sequence number observed so far. For an outbound
    /// queue this is the number the terminal router assigns next.
    pub fn current_sequence_length(&self) -> SequenceNumber {
        self.highest_end
    }

    /// End of the gap-free prefix received so far.
    pub fn contiguous_end(&self) -> SequenceNumber {
        SequenceNumber::new(self.base.value() + self.num_available as u64)
    }

    pub fn final_sequence_length(&self) -> Option<SequenceNumber> {
        self.final_length
    }

    pub fn num_available(&self) -> usize {
        self.num_available
    }

    pub fn available_bytes(&self) -> usize {
        self.available_bytes
    }

    pub fn has_next_element(&self) -> bool {
        self.num_available > 0
    }

    /// True once the final length is known and every element up to it has
    /// been popped or skipped.
    pub fn is_sequence_fully_consumed(&self) -> bool {
        self.final_length.is_some_and(|f| f <= self.base)
    }

    /// True once the final length is known and every element up to it has
    /// been received (not necessarily popped).
    pub fn is_sequence_fully_received(&self) -> bool {
        self.final_length.is_some_and(|f| f <= self.contiguous_end())
    }

    /// Insert an element. Rejects duplicates, anything before the pop
    /// cursor, and anything at or beyond a known final length.
    pub fn push(&mut self, n: SequenceNumber, element: T) -> Result<(), T> {
        if n < self.base {
            return Err(element);
        }
        if self.final_length.is_some_and(|f| n >= f) {
            return Err(element);
        }
        let index = (n.value() - self.base.value()) as usize;
        if index >= self.entries.len() {
            self.entries.resize_with(index + 1, || None);
        }
        if self.entries[index].is_some() {
            return Err(element);
        }
        self.entries[index] = Some(element);
        if n.next() > self.highest_end {
            self.highest_end = n.next();
        }
        while self.num_available < self.entries.len()
            && self.entries[self.num_available].is_some()
        {
            self.available_bytes += self.entries[self.num_available]
                .as_ref()
                .map(Sequenced::size_in_bytes)
                .unwrap_or(0);
            self.num_available += 1;
        }
        Ok(())
    }

    /// Pop the element at the front of the contiguous prefix, if any.
    pub fn pop(&mut self) -> Option<T> {
        if self.num_available == 0 {
            return None;
        }
        let element = self.entries.pop_front().flatten()?;
        self.base = self.base.next();
        self.num_available -= 1;
        self.available_bytes -= element.size_in_bytes();
        Some(element)
    }

    /// Put an element back at the front, undoing a [`pop`](Self::pop).
    pub fn restore_front(&mut self, element: T) {
        debug_assert!(self.base.value() > 0);
        self.base = SequenceNumber::new(self.base.value() - 1);
        self.available_bytes += element.size_in_bytes();
        self.num_available += 1;
        self.entries.push_front(Some(element));
    }

    /// Advance past the next sequence number without storing an element.
    /// Only valid when nothing is queued at the front.
    pub fn skip_next_sequence_number(&mut self) {
        debug_assert!(self.num_available == 0);
        debug_assert!(self.entries.front().map_or(true, Option::is_none));
        if !self.entries.is_empty() {
            self.entries.pop_front();
        }
        self.base = self.base.next();
        if self.base > self.highest_end {
            self.highest_end = self.base;
        }
    }

    /// Fix the final length of the sequence. Once a length is set, a
    /// restatement at or beyond it is a no-op carrying consistent
    /// information; a shorter length, or one below elements already seen,
    /// is a conflict.
    pub fn set_final_sequence_length(&mut self, length: SequenceNumber) -> bool {
        if let Some(current) = self.final_length {
            return length >= current;
        }
        if length < self.highest_end {
            return false;
        }
        self.final_length = Some(length);
        true
    }

    /// Terminate the sequence at whatever has been seen so far, overriding
    /// any previously negotiated final length. Used on abrupt disconnection.
    pub fn force_terminate_sequence(&mut self) {
        self.final_length = Some(self.highest_end);
        self.entries.truncate((self.highest_end.value() - self.base.value()) as usize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl Sequenced for &'static str {
        fn size_in_bytes(&self) -> usize {
            self.len()
        }
    }

    fn seq(n: u64) -> SequenceNumber {
        SequenceNumber::new(n)
    }

    #[test]
    fn out_of_order_pushes_pop_in_sequence_order() {
        let mut q = SequencedQueue::new(SequenceNumber::ZERO);
        assert!(q.push(seq(2), "two").is_ok());
        assert!(!q.has_next_element());
        assert!(q.push(seq(0), "zero").is_ok());
        assert_eq!(q.num_available(), 1);
        assert!(q.push(seq(1), "one").is_ok());
        assert_eq!(q.num_available(), 3);
        assert_eq!(q.available_bytes(), 11);

        assert_eq!(q.pop(), Some("zero"));
        assert_eq!(q.pop(), Some("one"));
        assert_eq!(q.pop(), Some("two"));
        assert_eq!(q.pop(), None);
        assert_eq!(q.next_sequence_number(), seq(3));
    }

    #[test]
    fn duplicates_and_stale_sequence_numbers_are_rejected() {
        let mut q = SequencedQueue::new(seq(5));
        assert!(q.push(seq(4), "stale").is_err());
        assert!(q.push(seq(5), "five").is_ok());
        assert!(q.push(seq(5), "again").is_err());
        q.pop().unwrap();
        assert!(q.push(seq(5), "late").is_err());
    }

    #[test]
    fn final_length_is_monotonic_and_bounds_pushes() {
        let mut q = SequencedQueue::new(SequenceNumber::ZERO);
        q.push(seq(0), "a").unwrap();
        q.push(seq(1), "b").unwrap();
        assert!(!q.set_final_sequence_length(seq(1)), "below highest seen");
        assert!(q.set_final_sequence_length(seq(3)));
        assert!(q.set_final_sequence_length(seq(4)), "consistent restatement");
        assert!(!q.set_final_sequence_length(seq(2)), "conflicting restatement");
        assert_eq!(q.final_sequence_length(), Some(seq(3)));
        assert!(q.push(seq(3), "beyond").is_err());
        assert!(q.push(seq(2), "c").is_ok());

        assert!(q.is_sequence_fully_received());
        assert!(!q.is_sequence_fully_consumed());
        q.pop();
        q.pop();
        q.pop();
        assert!(q.is_sequence_fully_consumed());
    }

    #[test]
    fn skip_advances_the_cursor_like_a_pop() {
        let mut q = SequencedQueue::<&'static str>::new(SequenceNumber::ZERO);
        q.skip_next_sequence_number();
        q.skip_next_sequence_number();
        assert_eq!(q.next_sequence_number(), seq(2));
        assert_eq!(q.current_sequence_length(), seq(2));
        assert!(q.push(seq(1), "late").is_err());
    }

    #[test]
    fn restore_front_undoes_a_pop() {
        let mut q = SequencedQueue::new(SequenceNumber::ZERO);
        q.push(seq(0), "x").unwrap();
        q.push(seq(1), "y").unwrap();
        let popped = q.pop().unwrap();
        q.restore_front(popped);
        assert_eq!(q.next_sequence_number(), seq(0));
        assert_eq!(q.pop(), Some("x"));
        assert_eq!(q.pop(), Some("y"));
    }

    #[test]
    fn force_terminate_discards_elements_beyond_known_prefix() {
        let mut q = SequencedQueue::new(SequenceNumber::ZERO);
        q.push(seq(0), "a").unwrap();
        q.push(seq(1), "b").unwrap();
        q.force_terminate_sequence();
        assert_eq!(q.final_sequence_length(), Some(seq(2)));
        assert!(q.push(seq(2), "c").is_err());
    }
}
