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

//! The GATT-facing side of BTP: service and characteristic identities, and the
//! delegate traits through which an endpoint talks to the BLE stack, the
//! application and the upper (Matter message) transport layer.

use core::fmt;

use alloc::vec::Vec;

use crate::error::Error;

use super::layer::EndPointId;
use super::{GATT_HEADER_SIZE, MAX_BTP_SEGMENT_SIZE};

// The 16-bit, registered Matter Service UUID, as per the Matter Core spec.
pub const MATTER_BLE_SERVICE_UUID16: u16 = 0xFFF6;
// A 128-bit expanded representation of the Matter Service UUID.
pub const MATTER_BLE_SERVICE_UUID: u128 = 0x0000FFF600001000800000805F9B34FB;

/// `C1` characteristic UUID, as per the Matter Core spec.
pub const C1_CHARACTERISTIC_UUID: u128 = 0x18EE2EF5263D4559959F4F9C429F9D11;
/// `C2` characteristic UUID, as per the Matter Core spec.
pub const C2_CHARACTERISTIC_UUID: u128 = 0x18EE2EF5263D4559959F4F9C429F9D12;
/// `C3` characteristic UUID, as per the Matter Core spec.
pub const C3_CHARACTERISTIC_UUID: u128 = 0x64630238877245F2B87D748A83218F04;

/// The maximum length of packet data written to the `C1` characteristic, as per the Matter Core spec, and as advertised in the GATT service.
pub const C1_MAX_LEN: usize = MAX_BTP_SEGMENT_SIZE + GATT_HEADER_SIZE;
/// The maximum length of packet data indicated via the `C2` characteristic, as per the Matter Core spec, and as advertised in the GATT service.
pub const C2_MAX_LEN: usize = MAX_BTP_SEGMENT_SIZE + GATT_HEADER_SIZE;

/// The address of a BLE peer, which also identifies the BLE connection to it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct BtAddr(pub [u8; 6]);

impl fmt::Display for BtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// The GATT operations a BTP endpoint needs from the platform BLE stack.
///
/// All operations are asynchronous: a `true` return only means the operation was
/// accepted. Completion is reported back via the matching `BleLayer::handle_*`
/// method (write/indication confirmations, subscribe/unsubscribe completions).
/// A `false` return means the operation was rejected outright.
pub trait BlePlatformDelegate {
    /// The negotiated ATT MTU of the connection, or 0 if unknown.
    fn mtu(&self, conn: BtAddr) -> u16;

    /// Write `data` to characteristic `char_id` of `svc_id` on the peer (central role).
    fn send_write_request(&mut self, conn: BtAddr, svc_id: u16, char_id: u128, data: &[u8])
        -> bool;

    /// Indicate `data` on characteristic `char_id` of `svc_id` to the peer (peripheral role).
    fn send_indication(&mut self, conn: BtAddr, svc_id: u16, char_id: u128, data: &[u8]) -> bool;

    /// Subscribe to indications of characteristic `char_id` (central role).
    fn subscribe_characteristic(&mut self, conn: BtAddr, svc_id: u16, char_id: u128) -> bool;

    /// Unsubscribe from indications of characteristic `char_id` (central role).
    fn unsubscribe_characteristic(&mut self, conn: BtAddr, svc_id: u16, char_id: u128) -> bool;

    /// Close the underlying BLE connection.
    fn close_connection(&mut self, conn: BtAddr) -> bool;
}

/// Application hooks for connections the BTP layer does not close itself.
pub trait BleApplicationDelegate {
    /// The BTP layer is done with `conn`; the application now owns it again.
    fn notify_chip_connection_closed(&mut self, conn: BtAddr);
}

/// The upper transport layer riding on top of BTP.
pub trait BleTransport {
    /// The BTP handshake of `end_point` completed, successfully or not.
    fn on_connect_complete(&mut self, end_point: EndPointId, result: Result<(), Error>);

    /// A complete message was reassembled on `end_point`.
    fn on_message_received(&mut self, end_point: EndPointId, msg: Vec<u8>);

    /// `end_point` was closed after its connection had been established.
    fn on_connection_closed(&mut self, end_point: EndPointId, result: Result<(), Error>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bt_addr_display() {
        let addr = BtAddr([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]);

        assert_eq!(format!("{}", addr), "de:ad:be:ef:00:01");
    }
}
