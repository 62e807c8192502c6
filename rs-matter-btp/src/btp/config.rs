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

use embassy_time::Duration;

/// Maximum receive window a BTP endpoint will offer or accept.
pub const BLE_MAX_RECEIVE_WINDOW_SIZE: u8 = 6;

/// Time the central waits for the peripheral's capabilities response.
pub const BLE_CONNECT_TIMEOUT_MS: u64 = 15_000;
/// Time the peripheral waits for the central to subscribe to `C2`.
pub const BLE_RECEIVE_CONNECTION_TIMEOUT_MS: u64 = BLE_CONNECT_TIMEOUT_MS;
/// Time the central waits for its unsubscribe from `C2` to complete.
pub const BLE_UNSUBSCRIBE_TIMEOUT_MS: u64 = 5_000;
/// Time an endpoint waits for the peer to acknowledge a sent fragment.
pub const BTP_ACK_RECEIVED_TIMEOUT_MS: u64 = 15_000;
/// Time an endpoint may sit on unacknowledged received data before
/// sending a stand-alone ack.
pub const BTP_ACK_SEND_TIMEOUT_MS: u64 = 2_500;

/// Once the local receive window drops to this level, received fragments
/// are acknowledged immediately.
pub const BLE_CONFIG_IMMEDIATE_ACK_WINDOW_THRESHOLD: u8 = 1;
/// Once the remote receive window drops to this level, data is only sent
/// if it can carry an ack.
pub const BTP_WINDOW_NO_ACK_SEND_THRESHOLD: u8 = 1;

/// Tunables of a BTP endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtpConfig {
    pub max_receive_window_size: u8,
    pub connect_timeout: Duration,
    pub receive_connection_timeout: Duration,
    pub ack_received_timeout: Duration,
    pub send_ack_timeout: Duration,
    pub unsubscribe_timeout: Duration,
    pub immediate_ack_window_threshold: u8,
    pub no_ack_send_window_threshold: u8,
}

impl BtpConfig {
    pub const fn new() -> Self {
        Self {
            max_receive_window_size: BLE_MAX_RECEIVE_WINDOW_SIZE,
            connect_timeout: Duration::from_millis(BLE_CONNECT_TIMEOUT_MS),
            receive_connection_timeout: Duration::from_millis(BLE_RECEIVE_CONNECTION_TIMEOUT_MS),
            ack_received_timeout: Duration::from_millis(BTP_ACK_RECEIVED_TIMEOUT_MS),
            send_ack_timeout: Duration::from_millis(BTP_ACK_SEND_TIMEOUT_MS),
            unsubscribe_timeout: Duration::from_millis(BLE_UNSUBSCRIBE_TIMEOUT_MS),
            immediate_ack_window_threshold: BLE_CONFIG_IMMEDIATE_ACK_WINDOW_THRESHOLD,
            no_ack_send_window_threshold: BTP_WINDOW_NO_ACK_SEND_THRESHOLD,
        }
    }
}

impl Default for BtpConfig {
    fn default() -> Self {
        Self::new()
    }
}
