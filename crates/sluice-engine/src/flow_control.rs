//! Link credit accounting.
//!
//! Credit is counted in whole deliveries. The sender consumes one credit per
//! delivery it starts; the receiver grants credit with Flow performatives.

/// Credit held by one end of a link
#[derive(Debug, Clone, Default)]
pub struct LinkCredit {
    credit: u32,
}

impl LinkCredit {
    /// Create a credit tracker with the specified initial credits
    pub fn new(initial_credits: u32) -> Self {
        Self {
            credit: initial_credits,
        }
    }

    /// Try to consume one credit for starting a delivery
    ///
    /// Returns true if a credit was available and consumed, false otherwise
    pub fn try_consume(&mut self) -> bool {
        if self.credit == 0 {
            return false;
        }
        self.credit -= 1;
        true
    }

    /// Grant additional credits
    pub fn grant(&mut self, amount: u32) {
        self.credit = self.credit.saturating_add(amount);
    }

    /// Get the current number of available credits
    pub fn available(&self) -> u32 {
        self.credit
    }

    /// Set credits to a specific value
    pub fn set(&mut self, value: u32) {
        self.credit = value;
    }

    /// Give up all remaining credit, returning how much there was
    pub fn drain_all(&mut self) -> u32 {
        std::mem::take(&mut self.credit)
    }
}

/// Credit a sender holds after a Flow from its receiver.
///
/// The receiver's view is `delivery_count + link_credit`; whatever the sender
/// has already sent beyond the receiver's count is deducted. Serial number
/// arithmetic wraps at 2^32.
pub fn sender_credit(flow_delivery_count: u32, flow_link_credit: u32, delivery_count: u32) -> u32 {
    let limit = flow_delivery_count.wrapping_add(flow_link_credit);
    let credit = limit.wrapping_sub(delivery_count);
    if credit > flow_link_credit {
        // The sender is ahead of the limit.
        0
    } else {
        credit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credit_consumption() {
        let mut tracker = LinkCredit::new(5);
        assert_eq!(tracker.available(), 5);

        assert!(tracker.try_consume());
        assert_eq!(tracker.available(), 4);

        assert!(tracker.try_consume());
        assert_eq!(tracker.available(), 3);
    }

    #[test]
    fn test_credit_exhaustion() {
        let mut tracker = LinkCredit::new(2);

        assert!(tracker.try_consume());
        assert!(tracker.try_consume());
        assert!(!tracker.try_consume()); // Should fail
    }

    #[test]
    fn test_credit_grant_and_drain() {
        let mut tracker = LinkCredit::new(1);

        assert!(tracker.try_consume());
        assert!(!tracker.try_consume());

        tracker.grant(5);
        assert_eq!(tracker.available(), 5);
        assert_eq!(tracker.drain_all(), 5);
        assert_eq!(tracker.available(), 0);
    }

    #[test]
    fn test_sender_credit() {
        assert_eq!(sender_credit(0, 10, 0), 10);
        assert_eq!(sender_credit(0, 10, 4), 6);
        assert_eq!(sender_credit(4, 10, 4), 10);
        assert_eq!(sender_credit(0, 2, 5), 0);
        assert_eq!(sender_credit(u32::MAX, 3, 1), 1);
    }
}
