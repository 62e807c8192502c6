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

#![cfg(feature = "std")]

use embassy_sync::blocking_mutex::raw::RawMutex;

/// An `embassy-sync` `RawMutex` implementation using `std::sync::Mutex`.
///
/// Useful for sharing a BTP send queue between the BLE event thread and
/// application threads on hosted platforms.
#[derive(Default)]
pub struct StdRawMutex(std::sync::Mutex<()>);

impl StdRawMutex {
    pub const fn new() -> Self {
        Self(std::sync::Mutex::new(()))
    }
}

unsafe impl RawMutex for StdRawMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = StdRawMutex(std::sync::Mutex::new(()));

    fn lock<R>(&self, f: impl FnOnce() -> R) -> R {
        // The guarded unit carries no state, so a poisoned lock is still usable
        let _guard = self
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        f()
    }
}

#[cfg(test)]
mod tests {
    use core::cell::RefCell;

    use embassy_sync::blocking_mutex::Mutex;

    use super::StdRawMutex;

    #[test]
    fn test_lock_from_threads() {
        let counter = std::sync::Arc::new(Mutex::<StdRawMutex, _>::new(RefCell::new(0u32)));

        let handles = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        counter.lock(|c| *c.borrow_mut() += 1);
                    }
                })
            })
            .collect::<std::vec::Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.lock(|c| *c.borrow()), 400);
    }
}
