//! Redirection handling.
//!
//! Each dispatch of a command ends in an [`Outcome`]. [`decide`] turns the
//! outcome and the retry bookkeeping into the next [`Action`] without doing
//! any I/O; the client carries the action out. Keeping the transitions in one
//! pure function makes every path testable without a cluster.

use std::time::Duration;

use tokio::time::Instant;

use crate::core::{Error, Result};
use crate::proto::frame::Frame;

use super::errors::parse_redis_error;
use super::topology::NodeEndpoint;

/// Upper bound on MOVED redirects that do not consume an attempt.
pub const MAX_FREE_REDIRECTS: u32 = 16;

/// How hard a command is retried.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RetryPolicy {
    /// Total dispatches allowed per command, the first included.
    pub max_attempts: u32,
    /// First backoff delay for TRYAGAIN, CLUSTERDOWN and transport failures.
    pub base_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Whether following a MOVED redirect uses up an attempt.
    pub moved_consumes_attempt: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
            moved_consumes_attempt: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows counted attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

/// Retry state of one in-flight command.
#[derive(Debug)]
pub struct PendingRetry {
    /// Slot of the command's keys, or of the last MOVED for keyless commands.
    pub slot: Option<u16>,
    /// Node the caller pinned the command to.
    pub pinned: Option<NodeEndpoint>,
    /// One-shot ASK target; the next dispatch goes there after `ASKING`.
    pub ask: Option<NodeEndpoint>,
    /// Counted dispatches so far, the current one included.
    pub attempts: u32,
    /// MOVED redirects that were not counted.
    pub free_redirects: u32,
    /// When the command was issued.
    pub started: Instant,
    /// When the command gives up.
    pub deadline: Option<Instant>,
    /// The last retried error.
    pub last_error: Option<Error>,
}

impl PendingRetry {
    /// Starts the bookkeeping for a command.
    pub fn new(slot: Option<u16>, deadline: Option<Instant>) -> Self {
        Self {
            slot,
            pinned: None,
            ask: None,
            attempts: 0,
            free_redirects: 0,
            started: Instant::now(),
            deadline,
            last_error: None,
        }
    }

    /// Total dispatches made, counted or not.
    pub fn dispatches(&self) -> u32 {
        self.attempts + self.free_redirects
    }

    /// Builds the error reported when the deadline passes.
    pub fn timeout(&mut self) -> Error {
        Error::Timeout {
            attempts: self.dispatches(),
            elapsed: self.started.elapsed(),
            last: self.last_error.take().map(Box::new),
        }
    }

    /// Builds the error reported when the budget runs out.
    pub fn exhausted(&self, last: Error) -> Error {
        Error::RetriesExhausted {
            attempts: self.dispatches(),
            elapsed: self.started.elapsed(),
            last: Box::new(last),
        }
    }
}

/// What happened to one dispatch.
#[derive(Debug)]
pub enum Outcome {
    /// The node answered with a non-error reply.
    Succeeded(Frame),
    /// `MOVED <slot> <address>`.
    Moved {
        /// Redirected slot.
        slot: u16,
        /// New owner.
        address: String,
    },
    /// `ASK <slot> <address>`.
    Asked {
        /// Migrating slot.
        slot: u16,
        /// Node importing the slot.
        address: String,
    },
    /// `TRYAGAIN`.
    TryAgain(Error),
    /// `CLUSTERDOWN`.
    ClusterDown(Error),
    /// The connection failed before a reply arrived.
    TransportFailed(Error),
    /// A command error or anything else that must not be retried.
    Failed(Error),
}

/// Sorts a dispatch result into an [`Outcome`].
pub fn classify(result: Result<Frame>) -> Outcome {
    match result {
        Ok(Frame::Error(message)) => match parse_redis_error(&message) {
            Error::Moved { slot, address } => Outcome::Moved { slot, address },
            Error::Ask { slot, address } => Outcome::Asked { slot, address },
            e @ Error::TryAgain { .. } => Outcome::TryAgain(e),
            e @ Error::ClusterDown { .. } => Outcome::ClusterDown(e),
            e => Outcome::Failed(e),
        },
        Ok(frame) => Outcome::Succeeded(frame),
        Err(e) if e.is_transport() => Outcome::TransportFailed(e),
        Err(e) => Outcome::Failed(e),
    }
}

/// Where the next dispatch goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryTarget {
    /// Resolve through the topology again.
    Route,
    /// Record the new owner of `slot`, then route.
    Moved {
        /// Redirected slot.
        slot: u16,
        /// New owner.
        address: String,
    },
    /// Send `ASKING` and the command to `address`, once.
    Ask {
        /// Migrating slot.
        slot: u16,
        /// Node importing the slot.
        address: String,
    },
}

/// A retry to carry out.
#[derive(Debug)]
pub struct Retry {
    /// Where to send next.
    pub target: RetryTarget,
    /// Reload the whole topology first.
    pub refresh: bool,
    /// Drop the failed node's pooled connections first.
    pub invalidate: bool,
    /// Stop sending to the pinned node; route by slot from now on.
    pub unpin: bool,
    /// Wait this long first.
    pub backoff: Duration,
    /// Whether the dispatch that led here counts against the budget.
    pub consumes_attempt: bool,
    /// The error being retried.
    pub cause: Error,
}

/// The next step for a command.
#[derive(Debug)]
pub enum Action {
    /// Hand the reply to the caller.
    Return(Frame),
    /// Hand the error to the caller as is.
    Fail(Error),
    /// The budget is spent; report the error as the last one observed.
    Exhausted(Error),
    /// Try again.
    Retry(Retry),
}

/// Decides what follows `outcome`. Does no I/O.
pub fn decide(pending: &PendingRetry, outcome: Outcome, policy: &RetryPolicy) -> Action {
    let retry = match outcome {
        Outcome::Succeeded(frame) => return Action::Return(frame),
        Outcome::Failed(e) => return Action::Fail(e),
        Outcome::TransportFailed(e) if pending.pinned.is_some() && pending.slot.is_none() => {
            return Action::Fail(e)
        }
        Outcome::Moved { slot, address } => Retry {
            cause: Error::Moved {
                slot,
                address: address.clone(),
            },
            target: RetryTarget::Moved { slot, address },
            refresh: false,
            invalidate: false,
            unpin: true,
            backoff: Duration::ZERO,
            consumes_attempt: policy.moved_consumes_attempt,
        },
        Outcome::Asked { slot, address } => Retry {
            cause: Error::Ask {
                slot,
                address: address.clone(),
            },
            target: RetryTarget::Ask { slot, address },
            refresh: false,
            invalidate: false,
            unpin: false,
            backoff: Duration::ZERO,
            consumes_attempt: true,
        },
        Outcome::TryAgain(e) => Retry {
            cause: e,
            target: RetryTarget::Route,
            refresh: false,
            invalidate: false,
            unpin: false,
            backoff: policy.backoff(pending.attempts),
            consumes_attempt: true,
        },
        Outcome::ClusterDown(e) => Retry {
            cause: e,
            target: RetryTarget::Route,
            refresh: true,
            invalidate: false,
            unpin: false,
            backoff: policy.backoff(pending.attempts),
            consumes_attempt: true,
        },
        // A keyed command pinned to a dead node goes to its slot's owner.
        Outcome::TransportFailed(e) => Retry {
            cause: e,
            target: RetryTarget::Route,
            refresh: true,
            invalidate: true,
            unpin: true,
            backoff: policy.backoff(pending.attempts),
            consumes_attempt: true,
        },
    };

    let spent = if retry.consumes_attempt {
        pending.attempts >= policy.max_attempts
    } else {
        pending.free_redirects >= MAX_FREE_REDIRECTS
    };
    if spent {
        return Action::Exhausted(retry.cause);
    }
    Action::Retry(retry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::topology::NodeRole;

    fn pending(attempts: u32) -> PendingRetry {
        let mut pending = PendingRetry::new(Some(14687), None);
        pending.attempts = attempts;
        pending
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert!(policy.moved_consumes_attempt);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            ..Default::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(40));
        assert_eq!(policy.backoff(4), Duration::from_millis(50));
        assert_eq!(policy.backoff(100), Duration::from_millis(50));
    }

    #[test]
    fn test_classify() {
        assert!(matches!(
            classify(Ok(Frame::bulk("bar"))),
            Outcome::Succeeded(_)
        ));
        assert!(matches!(
            classify(Ok(Frame::error("MOVED 14687 10.0.0.2:7002"))),
            Outcome::Moved { slot: 14687, .. }
        ));
        assert!(matches!(
            classify(Ok(Frame::error("ASK 3999 127.0.0.1:7001"))),
            Outcome::Asked { slot: 3999, .. }
        ));
        assert!(matches!(
            classify(Ok(Frame::error("TRYAGAIN"))),
            Outcome::TryAgain(_)
        ));
        assert!(matches!(
            classify(Ok(Frame::error("CLUSTERDOWN The cluster is down"))),
            Outcome::ClusterDown(_)
        ));
        assert!(matches!(
            classify(Ok(Frame::error("WRONGTYPE Operation against a key"))),
            Outcome::Failed(Error::Server { .. })
        ));
        assert!(matches!(
            classify(Ok(Frame::error("CROSSSLOT Keys in request"))),
            Outcome::Failed(Error::CrossSlot { .. })
        ));
        assert!(matches!(
            classify(Err(Error::connection_closed())),
            Outcome::TransportFailed(_)
        ));
    }

    #[test]
    fn test_decide_success_and_failure_pass_through() {
        let policy = RetryPolicy::default();
        assert!(matches!(
            decide(&pending(1), Outcome::Succeeded(Frame::Null), &policy),
            Action::Return(Frame::Null)
        ));
        let e = Error::Server {
            message: "ERR".to_string(),
        };
        assert!(matches!(
            decide(&pending(1), Outcome::Failed(e), &policy),
            Action::Fail(Error::Server { .. })
        ));
    }

    #[test]
    fn test_decide_moved() {
        let policy = RetryPolicy::default();
        let outcome = Outcome::Moved {
            slot: 14687,
            address: "10.0.0.2:7002".to_string(),
        };
        match decide(&pending(1), outcome, &policy) {
            Action::Retry(retry) => {
                assert_eq!(
                    retry.target,
                    RetryTarget::Moved {
                        slot: 14687,
                        address: "10.0.0.2:7002".to_string()
                    }
                );
                assert!(!retry.refresh);
                assert_eq!(retry.backoff, Duration::ZERO);
                assert!(retry.consumes_attempt);
            }
            other => panic!("expected Retry, got {:?}", other),
        }
    }

    #[test]
    fn test_decide_free_moved_is_bounded() {
        let policy = RetryPolicy {
            max_attempts: 1,
            moved_consumes_attempt: false,
            ..Default::default()
        };
        let moved = || Outcome::Moved {
            slot: 1,
            address: "127.0.0.1:7001".to_string(),
        };

        // Budget of one is spent, but MOVED is free.
        assert!(matches!(
            decide(&pending(1), moved(), &policy),
            Action::Retry(Retry {
                consumes_attempt: false,
                ..
            })
        ));

        let mut looping = pending(1);
        looping.free_redirects = MAX_FREE_REDIRECTS;
        assert!(matches!(
            decide(&looping, moved(), &policy),
            Action::Exhausted(Error::Moved { .. })
        ));
    }

    #[test]
    fn test_decide_ask_targets_once() {
        let outcome = Outcome::Asked {
            slot: 3999,
            address: "127.0.0.1:7001".to_string(),
        };
        match decide(&pending(1), outcome, &RetryPolicy::default()) {
            Action::Retry(retry) => {
                assert_eq!(
                    retry.target,
                    RetryTarget::Ask {
                        slot: 3999,
                        address: "127.0.0.1:7001".to_string()
                    }
                );
                assert!(!retry.refresh);
                assert!(!retry.unpin);
            }
            other => panic!("expected Retry, got {:?}", other),
        }
    }

    #[test]
    fn test_decide_tryagain_exhausts_on_budget() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        let tryagain = || Outcome::TryAgain(Error::TryAgain {
            message: String::new(),
        });

        assert!(matches!(decide(&pending(1), tryagain(), &policy), Action::Retry(_)));
        assert!(matches!(decide(&pending(2), tryagain(), &policy), Action::Retry(_)));
        assert!(matches!(
            decide(&pending(3), tryagain(), &policy),
            Action::Exhausted(Error::TryAgain { .. })
        ));
    }

    #[test]
    fn test_decide_clusterdown_refreshes() {
        let outcome = Outcome::ClusterDown(Error::ClusterDown {
            message: "Hash slot not served".to_string(),
        });
        match decide(&pending(2), outcome, &RetryPolicy::default()) {
            Action::Retry(retry) => {
                assert!(retry.refresh);
                assert!(!retry.invalidate);
                assert!(retry.backoff > Duration::ZERO);
            }
            other => panic!("expected Retry, got {:?}", other),
        }
    }

    #[test]
    fn test_decide_transport_failure() {
        match decide(
            &pending(1),
            Outcome::TransportFailed(Error::connection_closed()),
            &RetryPolicy::default(),
        ) {
            Action::Retry(retry) => {
                assert!(retry.refresh);
                assert!(retry.invalidate);
                assert_eq!(retry.target, RetryTarget::Route);
            }
            other => panic!("expected Retry, got {:?}", other),
        }
    }

    #[test]
    fn test_decide_transport_failure_on_pinned_node() {
        let mut pinned = PendingRetry::new(None, None);
        pinned.attempts = 1;
        pinned.pinned = Some(NodeEndpoint::from_address("127.0.0.1:7000", NodeRole::Primary).unwrap());
        assert!(matches!(
            decide(
                &pinned,
                Outcome::TransportFailed(Error::connection_closed()),
                &RetryPolicy::default()
            ),
            Action::Fail(Error::Io { .. })
        ));
    }

    #[test]
    fn test_decide_transport_failure_unpins_keyed_command() {
        let mut pinned = pending(1);
        pinned.pinned = Some(NodeEndpoint::from_address("127.0.0.1:7002", NodeRole::Primary).unwrap());
        match decide(
            &pinned,
            Outcome::TransportFailed(Error::connection_closed()),
            &RetryPolicy::default(),
        ) {
            Action::Retry(retry) => {
                assert!(retry.unpin);
                assert!(retry.refresh);
                assert_eq!(retry.target, RetryTarget::Route);
            }
            other => panic!("expected Retry, got {:?}", other),
        }

        // TRYAGAIN keeps the pin.
        let tryagain = Outcome::TryAgain(Error::TryAgain {
            message: String::new(),
        });
        assert!(matches!(
            decide(&pinned, tryagain, &RetryPolicy::default()),
            Action::Retry(Retry { unpin: false, .. })
        ));
    }

    #[test]
    fn test_pending_errors_report_dispatches() {
        let mut pending = pending(2);
        pending.free_redirects = 1;
        pending.last_error = Some(Error::TryAgain {
            message: String::new(),
        });
        match pending.timeout() {
            Error::Timeout { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert!(last.is_some());
            }
            other => panic!("expected Timeout, got {:?}", other),
        }
    }
}
