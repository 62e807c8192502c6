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

//! Remote receive window arithmetic.
//!
//! BTP sequence numbers are a single byte and wrap around, so the number of
//! fragments still "in the air" has to be computed modulo the sequence space.

use log::debug;

/// Size of the BTP sequence number space.
pub const SEQUENCE_NUMBER_MODULUS: u32 = 256;

/// Compute how many more fragments may be sent to the peer, given the last
/// acknowledgement received from it, the negotiated window size, and the newest
/// sequence number sent but not yet acknowledged.
///
/// When everything is acknowledged (`newest_unacked_sent_seq_num == last_received_ack`)
/// the whole window is available again.
pub fn adjust_remote_receive_window(
    last_received_ack: u8,
    max_remote_window_size: u8,
    newest_unacked_sent_seq_num: u8,
) -> u8 {
    let window = adjust_receive_window_with_modulus(
        SEQUENCE_NUMBER_MODULUS,
        last_received_ack as u32,
        max_remote_window_size as u32,
        newest_unacked_sent_seq_num as u32,
    );

    debug!(
        "Remote window: ack {}, max {}, newest unacked {} => {}",
        last_received_ack, max_remote_window_size, newest_unacked_sent_seq_num, window
    );

    // Bounded by `max_remote_window_size`, so it always fits
    window as u8
}

/// The modulus-parameterized form of [`adjust_remote_receive_window`].
///
/// The window boundary `last_ack + max_window` is computed without wrapping; if it
/// crosses the modulus while `newest_unacked` has already wrapped below `last_ack`,
/// `newest_unacked` is lifted by one modulus so both sit on the same number line.
/// The result saturates at zero and never exceeds `max_window`.
pub fn adjust_receive_window_with_modulus(
    modulus: u32,
    last_ack: u32,
    max_window: u32,
    newest_unacked: u32,
) -> u32 {
    let boundary = last_ack + max_window;

    let newest_unacked = if boundary >= modulus && newest_unacked < last_ack {
        newest_unacked + modulus
    } else {
        newest_unacked
    };

    boundary.saturating_sub(newest_unacked).min(max_window)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_acked() {
        assert_eq!(adjust_remote_receive_window(0, 6, 0), 6);
        assert_eq!(adjust_remote_receive_window(255, 6, 255), 6);
        assert_eq!(adjust_remote_receive_window(100, 0, 100), 0);
    }

    #[test]
    fn test_wrap() {
        // Sent 254, 255, 0, 1; acked 253
        assert_eq!(adjust_remote_receive_window(253, 6, 1), 2);
        // Sent 255, 0; acked 254
        assert_eq!(adjust_remote_receive_window(254, 4, 0), 2);
        // Window fully used across the wrap
        assert_eq!(adjust_remote_receive_window(252, 6, 2), 0);
    }

    #[test]
    fn test_exhaustive_within_window() {
        for max_window in 0..=255u8 {
            for last_ack in 0..=255u8 {
                for in_flight in 0..=max_window {
                    let newest = last_ack.wrapping_add(in_flight);

                    assert_eq!(
                        adjust_remote_receive_window(last_ack, max_window, newest),
                        max_window - in_flight,
                        "last_ack {last_ack}, max {max_window}, newest {newest}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_small_modulus() {
        // Same arithmetic over a 3-bit sequence space
        for max_window in 0..8 {
            for last_ack in 0..8 {
                for in_flight in 0..=max_window {
                    let newest = (last_ack + in_flight) % 8;

                    assert_eq!(
                        adjust_receive_window_with_modulus(8, last_ack, max_window, newest),
                        max_window - in_flight
                    );
                }
            }
        }
    }

    #[test]
    fn test_never_exceeds_max() {
        // `newest` behind `last_ack` without a wrapping boundary is out of range
        assert_eq!(adjust_remote_receive_window(10, 6, 5), 6);
        assert_eq!(adjust_receive_window_with_modulus(256, 10, 6, 5), 6);
    }
}
