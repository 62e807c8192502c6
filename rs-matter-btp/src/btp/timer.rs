/*
 *
 *    Copyright (c) 2020-2022 Project CHIP Authors
 *
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

use core::ops::{Index, IndexMut};

use embassy_time::{Duration, Instant, Timer};

use log::{trace, warn};

use crate::error::{Error, ErrorCode};

use super::layer::EndPointId;

/// The single-shot timers each BTP endpoint runs.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum TimerKind {
    /// Central: waiting for the capabilities response
    Connect = 0,
    /// Peripheral: waiting for the central to subscribe to `C2`
    ReceiveConnection = 1,
    /// Waiting for the peer to acknowledge sent fragments
    AckReceived = 2,
    /// Received fragments which must be acknowledged before this fires
    SendAck = 3,
    /// Central: waiting for the unsubscribe from `C2` to complete
    Unsubscribe = 4,
}

impl TimerKind {
    pub const VALUES: [Self; 5] = [
        Self::Connect,
        Self::ReceiveConnection,
        Self::AckReceived,
        Self::SendAck,
        Self::Unsubscribe,
    ];
}

/// A table of data associated with each distinct kind of `TimerKind`
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TimerTable<T> {
    data: [T; 5],
}

impl<T> TimerTable<T> {
    pub fn iter(&self) -> impl Iterator<Item = (TimerKind, &T)> {
        TimerKind::VALUES.iter().copied().zip(self.data.iter())
    }
}

impl TimerTable<bool> {
    /// Return `true` if any timer is marked as running.
    pub fn any(&self) -> bool {
        self.data.iter().any(|running| *running)
    }
}

impl<T> Index<TimerKind> for TimerTable<T> {
    type Output = T;

    fn index(&self, kind: TimerKind) -> &T {
        &self.data[kind as usize]
    }
}

impl<T> IndexMut<TimerKind> for TimerTable<T> {
    fn index_mut(&mut self, kind: TimerKind) -> &mut T {
        &mut self.data[kind as usize]
    }
}

/// Identifies a timer of a particular endpoint.
///
/// Tokens outlive the endpoint they were issued for; the endpoint id is generation-checked
/// when the timer fires, so a token of an endpoint which is gone is simply ignored.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TimerToken {
    pub end_point: EndPointId,
    pub kind: TimerKind,
}

/// The timer service a BTP endpoint needs.
///
/// Once a started timer expires, the owner of the facility is expected to call
/// `BleLayer::handle_timer` with the timer's token.
pub trait TimerFacility {
    /// Start (or restart) the timer identified by `token`, to fire `after` from now.
    fn start_timer(&mut self, after: Duration, token: TimerToken) -> Result<(), Error>;

    /// Cancel the timer identified by `token`. A no-op if the timer is not running.
    fn cancel_timer(&mut self, token: TimerToken);
}

/// A `TimerFacility` keeping up to `N` deadlines in memory.
///
/// Driven by polling: `poll_expired` hands out the tokens of expired timers, and
/// `wait` completes once the earliest deadline has passed.
#[derive(Debug)]
pub struct TimerQueue<const N: usize = 32> {
    pending: heapless::Vec<(Instant, TimerToken), N>,
}

impl<const N: usize> TimerQueue<N> {
    pub const fn new() -> Self {
        Self {
            pending: heapless::Vec::new(),
        }
    }

    /// Start (or restart) a timer relative to `now`.
    pub fn start_at(&mut self, now: Instant, after: Duration, token: TimerToken) -> Result<(), Error> {
        let deadline = now + after;

        if let Some(entry) = self.pending.iter_mut().find(|(_, t)| *t == token) {
            entry.0 = deadline;
        } else {
            self.pending.push((deadline, token)).map_err(|_| {
                warn!("No room for timer {:?}", token);
                ErrorCode::StartTimerFailed
            })?;
        }

        trace!("Timer {:?} armed for {}ms", token, after.as_millis());

        Ok(())
    }

    /// Return `true` if a timer identified by `token` is pending.
    pub fn is_pending(&self, token: TimerToken) -> bool {
        self.pending.iter().any(|(_, t)| *t == token)
    }

    /// The earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|(deadline, _)| *deadline).min()
    }

    /// Remove and return the token of one timer which expired at or before `now`,
    /// earliest deadline first.
    pub fn poll_expired(&mut self, now: Instant) -> Option<TimerToken> {
        let index = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .min_by_key(|(_, (deadline, _))| *deadline)
            .map(|(index, _)| index)?;

        Some(self.pending.swap_remove(index).1)
    }

    /// Wait until the earliest pending deadline has passed.
    /// Never completes if no timer is pending.
    pub async fn wait(&self) {
        if let Some(deadline) = self.next_deadline() {
            Timer::at(deadline).await;
        } else {
            core::future::pending::<()>().await;
        }
    }
}

impl<const N: usize> Default for TimerQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> TimerFacility for TimerQueue<N> {
    fn start_timer(&mut self, after: Duration, token: TimerToken) -> Result<(), Error> {
        self.start_at(Instant::now(), after, token)
    }

    fn cancel_timer(&mut self, token: TimerToken) {
        self.pending.retain(|(_, t)| *t != token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(index: u8, kind: TimerKind) -> TimerToken {
        TimerToken {
            end_point: EndPointId::new(index, 0),
            kind,
        }
    }

    #[test]
    fn test_timer_table() {
        let mut table = TimerTable::<bool>::default();
        assert!(!table.any());

        table[TimerKind::SendAck] = true;
        assert!(table.any());
        assert!(table[TimerKind::SendAck]);
        assert!(!table[TimerKind::AckReceived]);
        assert_eq!(
            table.iter().filter(|(_, r)| **r).map(|(k, _)| k).collect::<Vec<_>>(),
            [TimerKind::SendAck]
        );
    }

    #[test]
    fn test_expiry_order() {
        let mut queue = TimerQueue::<4>::new();
        let now = Instant::from_secs(100);

        queue
            .start_at(now, Duration::from_secs(15), token(0, TimerKind::Connect))
            .unwrap();
        queue
            .start_at(now, Duration::from_millis(2500), token(1, TimerKind::SendAck))
            .unwrap();
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_millis(2500)));

        assert_eq!(queue.poll_expired(now + Duration::from_secs(1)), None);
        assert_eq!(
            queue.poll_expired(now + Duration::from_secs(20)),
            Some(token(1, TimerKind::SendAck))
        );
        assert_eq!(
            queue.poll_expired(now + Duration::from_secs(20)),
            Some(token(0, TimerKind::Connect))
        );
        assert_eq!(queue.poll_expired(now + Duration::from_secs(20)), None);
    }

    #[test]
    fn test_restart_and_cancel() {
        let mut queue = TimerQueue::<2>::new();
        let now = Instant::from_secs(0);
        let ack = token(0, TimerKind::AckReceived);

        queue.start_at(now, Duration::from_secs(1), ack).unwrap();
        queue.start_at(now, Duration::from_secs(5), ack).unwrap();
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(5)));

        queue.start_at(now, Duration::from_secs(1), token(1, TimerKind::AckReceived)).unwrap();
        let err = queue
            .start_at(now, Duration::from_secs(1), token(2, TimerKind::AckReceived))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::StartTimerFailed);

        queue.cancel_timer(ack);
        assert!(!queue.is_pending(ack));
        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_wait() {
        let mut queue = TimerQueue::<2>::new();
        let ack = token(0, TimerKind::SendAck);

        queue.start_timer(Duration::from_millis(10), ack).unwrap();

        embassy_futures::block_on(queue.wait());

        assert_eq!(queue.poll_expired(Instant::now()), Some(ack));
    }
}
