//! ## Learning switch service
//!
//! The control-plane core of an OpenFlow 1.0 learning switch: one
//! [`session::Session`] per datapath connection, owning a source-address
//! learning table and a queue-binding table, deciding for every escalated
//! packet what output action to take and whether to install a flow so the
//! next identical packet stays in hardware.
//!
//! The core is single-threaded cooperative. A session is owned by exactly
//! one caller, none of its operations block, and it never reads a clock —
//! every time-sensitive operation takes the caller's monotonic `now`. The
//! transport, the wall clock, and the logger sit behind seams
//! ([`Link`], [`Timestamp`] parameters, the `log` facade) so the whole
//! service is testable without sockets or sleeps.

pub mod mac_learning;
pub mod queues;
pub mod session;

use bytes::Bytes;

/// Monotonic time in whole seconds, supplied by the caller.
pub type Timestamp = u64;

/// Upper bound on outbound messages in flight on one link. Further sends
/// are refused and the message is dropped: the controller prefers losing a
/// control message over stalling the datapath pipeline.
pub const TX_BACKPRESSURE_LIMIT: usize = 10;

#[derive(Debug)]
pub enum SendError {
    /// The link's transmit window is full.
    WouldBlock,
    /// The link is down; drops are silent in this state.
    NotConnected,
    Other(String),
}

impl std::error::Error for SendError {}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The reliable control-channel transport a session talks through.
///
/// An implementation accepts complete, pre-serialized OpenFlow messages and
/// delivers them in order. It owns the in-flight counter behind
/// [`pending`](Link::pending): count a message when accepting it in `send`
/// and uncount it once it has been written out. The session refuses to hand
/// over messages while the count is at [`TX_BACKPRESSURE_LIMIT`].
pub trait Link {
    /// Name of the connection, for log prefixes.
    fn name(&self) -> &str;

    /// Messages accepted but not yet written out.
    fn pending(&self) -> usize;

    /// Hand one message to the transport. Must not block.
    fn send(&mut self, message: Bytes) -> Result<(), SendError>;
}

/// Token-bucket gate for rate-limited log lines.
///
/// `rate` tokens accrue per second up to `burst`; every admitted line costs
/// one. The limiter never reads a clock, it is advanced by the caller's
/// timestamps.
///
/// # Test
///
/// ```
/// use lswitch_service::RateLimit;
///
/// let mut limit = RateLimit::new(1, 2);
///
/// assert!(limit.admit(10));
/// assert!(limit.admit(10));
/// assert!(!limit.admit(10));
/// assert!(limit.admit(11));
/// ```
#[derive(Debug)]
pub struct RateLimit {
    rate: u64,
    burst: u64,
    tokens: u64,
    filled_at: Timestamp,
}

impl RateLimit {
    pub fn new(rate: u64, burst: u64) -> Self {
        Self {
            rate,
            burst,
            tokens: burst,
            filled_at: 0,
        }
    }

    /// Whether one more line may be emitted at `now`.
    pub fn admit(&mut self, now: Timestamp) -> bool {
        if now > self.filled_at {
            let refill = (now - self.filled_at).saturating_mul(self.rate);
            self.tokens = self.tokens.saturating_add(refill).min(self.burst);
            self.filled_at = now;
        }

        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}
