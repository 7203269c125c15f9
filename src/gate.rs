// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Synchronization Gate
//!
//! A two-party rendezvous used to coordinate the calling thread with the
//! background event-loop thread. Each party calls [`SyncGate::wait`]; the
//! call returns once both parties have arrived, or with
//! `AmqpError::GateTimedOut` when the timeout elapses first. The gate is
//! single-shot: exactly two parties are expected, and a third `wait` fails
//! with `AmqpError::GateMisuse`.

use crate::errors::AmqpError;
use std::{
    sync::{Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Released,
    Expired,
}

#[derive(Debug)]
struct GateState {
    arrived: u8,
    phase: Phase,
}

/// Two-party rendezvous with a timeout-bounded wait.
#[derive(Debug)]
pub struct SyncGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Default for SyncGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncGate {
    pub fn new() -> SyncGate {
        SyncGate {
            state: Mutex::new(GateState {
                arrived: 0,
                phase: Phase::Waiting,
            }),
            cond: Condvar::new(),
        }
    }

    /// Blocks the calling party until the second party also calls `wait`, or
    /// until `timeout` elapses.
    ///
    /// Once the gate expired, every later `wait` returns `GateTimedOut`
    /// immediately; no party is ever left blocked past its deadline.
    pub fn wait(&self, timeout: Duration) -> Result<(), AmqpError> {
        let mut state = self.lock();

        match state.phase {
            Phase::Released => return Err(AmqpError::GateMisuse),
            Phase::Expired => return Err(AmqpError::GateTimedOut),
            Phase::Waiting => {}
        }

        state.arrived += 1;
        if state.arrived == 2 {
            state.phase = Phase::Released;
            self.cond.notify_all();
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        loop {
            match state.phase {
                Phase::Released => return Ok(()),
                Phase::Expired => return Err(AmqpError::GateTimedOut),
                Phase::Waiting => {}
            }

            let now = Instant::now();
            if now >= deadline {
                state.phase = Phase::Expired;
                self.cond.notify_all();
                return Err(AmqpError::GateTimedOut);
            }

            state = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn lone_waiter_times_out_within_deadline() {
        let gate = SyncGate::new();
        let timeout = Duration::from_millis(50);

        let started = Instant::now();
        let result = gate.wait(timeout);

        assert_eq!(result, Err(AmqpError::GateTimedOut));
        assert!(started.elapsed() >= timeout);
        assert!(started.elapsed() < timeout + Duration::from_secs(1));
    }

    #[test]
    fn two_parties_rendezvous() {
        let gate = Arc::new(SyncGate::new());

        let peer = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait(Duration::from_secs(5)))
        };

        assert_eq!(gate.wait(Duration::from_secs(5)), Ok(()));
        assert_eq!(peer.join().unwrap(), Ok(()));
    }

    #[test]
    fn third_wait_is_misuse() {
        let gate = Arc::new(SyncGate::new());

        let peer = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait(Duration::from_secs(5)))
        };
        gate.wait(Duration::from_secs(5)).unwrap();
        peer.join().unwrap().unwrap();

        assert_eq!(gate.wait(Duration::from_millis(10)), Err(AmqpError::GateMisuse));
    }

    #[test]
    fn late_arrival_after_expiry_is_released_with_timeout() {
        let gate = SyncGate::new();

        assert_eq!(
            gate.wait(Duration::from_millis(10)),
            Err(AmqpError::GateTimedOut)
        );
        assert_eq!(
            gate.wait(Duration::from_millis(10)),
            Err(AmqpError::GateTimedOut)
        );
    }
}
