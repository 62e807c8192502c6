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

use core::cell::RefCell;

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

/// The outbound message queue of a BTP endpoint.
///
/// Messages may be pushed from any execution context (hence the `RawMutex`);
/// they are popped only by the endpoint itself. The lock is held only for the
/// duration of a single push or pop.
pub struct SendQueue<M>
where
    M: RawMutex,
{
    queue: Mutex<M, RefCell<VecDeque<Vec<u8>>>>,
}

impl<M> SendQueue<M>
where
    M: RawMutex,
{
    /// Create an empty queue.
    pub const fn new() -> Self {
        Self {
            queue: Mutex::new(RefCell::new(VecDeque::new())),
        }
    }

    /// Append `msg` to the end of the queue.
    pub fn push(&self, msg: Vec<u8>) {
        self.queue.lock(|queue| queue.borrow_mut().push_back(msg));
    }

    /// Remove the oldest message from the queue.
    pub fn pop(&self) -> Option<Vec<u8>> {
        self.queue.lock(|queue| queue.borrow_mut().pop_front())
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock(|queue| queue.borrow().is_empty())
    }

    pub fn len(&self) -> usize {
        self.queue.lock(|queue| queue.borrow().len())
    }

    /// Drop all queued messages.
    pub fn clear(&self) {
        self.queue.lock(|queue| queue.borrow_mut().clear());
    }
}

impl<M> Default for SendQueue<M>
where
    M: RawMutex,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::utils::std_mutex::StdRawMutex;

    use super::SendQueue;

    #[test]
    fn test_fifo() {
        let queue = SendQueue::<StdRawMutex>::new();
        assert!(queue.is_empty());

        queue.push(vec![1]);
        queue.push(vec![2, 2]);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.pop(), Some(vec![1]));
        assert_eq!(queue.pop(), Some(vec![2, 2]));
        assert_eq!(queue.pop(), None);

        queue.push(vec![3]);
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_from_other_thread() {
        let queue = Arc::new(SendQueue::<StdRawMutex>::new());

        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..10u8 {
                    queue.push(vec![i]);
                }
            })
        };

        producer.join().unwrap();

        let drained = core::iter::from_fn(|| queue.pop()).collect::<Vec<_>>();
        assert_eq!(drained, (0..10u8).map(|i| vec![i]).collect::<Vec<_>>());
    }
}
