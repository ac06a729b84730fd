//! Scoped one-shot timers feeding tagged events into the replica's loop.
//!
//! The five protocol timers are single-slot handles: scheduling one again
//! replaces the previously armed deadline. Fired timers surface as
//! `TimerEvent` variants through `get_event()`, which is serviced as one
//! branch of the replica's `select!` loop, so a timer event never preempts
//! an in-flight message handler.

use crate::utils::{MonaxosError, Timer};

use tokio::time::Duration;

/// Tagged timer events of the consensus state machine.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum TimerEvent {
    /// Collect phase did not hear from the full quorum in time (leader).
    CollectTimeout,

    /// Proposal was not accepted by the full quorum in time (leader).
    AcceptTimeout,

    /// Time to refresh the lease before it runs out (leader).
    LeaseRenew,

    /// Lease was not acked by the full quorum in time (leader).
    LeaseAckTimeout,

    /// Lease expired without a renewal from the leader (peon).
    LeaseTimeout,
}

/// Registry of the five single-slot protocol timers.
pub(crate) struct TimerHub {
    collect: Timer,
    accept: Timer,
    lease_renew: Timer,
    lease_ack: Timer,
    lease: Timer,
}

impl TimerHub {
    /// Creates the five timers, all unarmed.
    pub(crate) fn new() -> Self {
        TimerHub {
            collect: Timer::new(),
            accept: Timer::new(),
            lease_renew: Timer::new(),
            lease_ack: Timer::new(),
            lease: Timer::new(),
        }
    }

    #[inline]
    fn timer_of(&self, event: TimerEvent) -> &Timer {
        match event {
            TimerEvent::CollectTimeout => &self.collect,
            TimerEvent::AcceptTimeout => &self.accept,
            TimerEvent::LeaseRenew => &self.lease_renew,
            TimerEvent::LeaseAckTimeout => &self.lease_ack,
            TimerEvent::LeaseTimeout => &self.lease,
        }
    }

    /// Arms the timer slot for `event` to fire after `dur`, cancelling and
    /// replacing any previously armed deadline in that slot.
    pub(crate) fn schedule(
        &self,
        event: TimerEvent,
        dur: Duration,
    ) -> Result<(), MonaxosError> {
        let timer = self.timer_of(event);
        timer.cancel()?;
        timer.kickoff(dur)
    }

    /// Cancels the timer slot for `event`, consuming any already-fired
    /// notification not yet serviced.
    pub(crate) fn cancel(&self, event: TimerEvent) -> Result<(), MonaxosError> {
        self.timer_of(event).cancel()
    }

    /// Cancels all five timer slots.
    pub(crate) fn cancel_all(&self) -> Result<(), MonaxosError> {
        self.collect.cancel()?;
        self.accept.cancel()?;
        self.lease_renew.cancel()?;
        self.lease_ack.cancel()?;
        self.lease.cancel()?;
        Ok(())
    }

    /// Waits for the next fired timer. Intended as a `tokio::select!`
    /// branch of the replica's event loop.
    pub(crate) async fn get_event(&self) -> TimerEvent {
        tokio::select! {
            () = self.collect.timeout() => TimerEvent::CollectTimeout,
            () = self.accept.timeout() => TimerEvent::AcceptTimeout,
            () = self.lease_renew.timeout() => TimerEvent::LeaseRenew,
            () = self.lease_ack.timeout() => TimerEvent::LeaseAckTimeout,
            () = self.lease.timeout() => TimerEvent::LeaseTimeout,
        }
    }
}
