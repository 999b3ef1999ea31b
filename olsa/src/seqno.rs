//! Sequence numbers used to correlate requests with their replies.

use core::fmt;

/// Highest sequence number handed out to a request. Sequence numbers are 31 bit values, the most
/// significant bit is never set.
const MAX_REQUEST_SEQNO: u32 = 0x7fff_ffff;

/// The sequence number carried by unsolicited notifications. This is never a valid request
/// sequence number, so a receiver can always tell a notification burst triggered by one of its own
/// requests apart from the steady state stream.
pub const NOTIFY_SEQNO: u32 = 0;

/// Generator for the sequence numbers put in request messages. Values are handed out in the range
/// [1, 2^31 - 1], wrapping back to 1 once the range is exhausted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeqNo(u32);

impl SeqNo {
    /// Create a new `SeqNo` generator. The first value handed out is 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next sequence number from this generator.
    pub fn advance(&mut self) -> u32 {
        self.0 = if self.0 >= MAX_REQUEST_SEQNO {
            1
        } else {
            self.0 + 1
        };
        self.0
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{}", self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::SeqNo;

    #[test]
    fn first_value_is_one() {
        let mut seq = SeqNo::new();
        assert_eq!(seq.advance(), 1);
        assert_eq!(seq.advance(), 2);
    }

    #[test]
    fn wraps_back_to_one() {
        let mut seq = SeqNo(super::MAX_REQUEST_SEQNO - 1);
        assert_eq!(seq.advance(), super::MAX_REQUEST_SEQNO);
        assert_eq!(seq.advance(), 1);
    }
}
