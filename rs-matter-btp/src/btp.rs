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

//! The BLE Transport Protocol (BTP) connection endpoint.
//!
//! The entry point is [`BleLayer`], which owns all [`BleEndPoint`] instances and routes
//! GATT platform callbacks and timer expirations to them. Platform integration happens via the
//! [`BlePlatformDelegate`], [`BleApplicationDelegate`], [`BleTransport`] and [`TimerFacility`] traits.

pub use config::*;
pub use endpoint::{BleEndPoint, ConnectionFlags, EndPointState, Role};
pub use engine::{BtpEngine, BtpState};
pub use gatt::*;
pub use layer::{BleLayer, EndPointId, MAX_BLE_END_POINTS};
pub use queue::SendQueue;
pub use timer::{TimerFacility, TimerKind, TimerQueue, TimerTable, TimerToken};

mod config;
mod endpoint;
mod engine;
mod gatt;
mod layer;
pub mod packet;
mod queue;
mod timer;
pub mod window;

/// The maximum size of a BTP segment.
pub const MAX_BTP_SEGMENT_SIZE: usize = 244;
/// The size of the GATT header. `MAX_BTP_SEGMENT_SIZE` + `GATT_HEADER_SIZE` is 247 bytes, which is the maximum ATT MTU size supported by the BTP protocol.
pub const GATT_HEADER_SIZE: usize = 3;

/// The minimum MTU that can be used as per specification.
pub const MIN_MTU: u16 = (20 + GATT_HEADER_SIZE) as u16;
/// The maximum MTU that can be used as per specification.
pub const MAX_MTU: u16 = (MAX_BTP_SEGMENT_SIZE + GATT_HEADER_SIZE) as u16;

/// Fragment size used when the ATT MTU is unknown (`MIN_MTU` minus the GATT header).
pub const DEFAULT_FRAGMENT_SIZE: u16 = MIN_MTU - GATT_HEADER_SIZE as u16;

/// Oldest BTP protocol version this implementation speaks.
pub const MIN_SUPPORTED_PROTOCOL_VERSION: u8 = 4;
/// Newest BTP protocol version this implementation speaks.
pub const MAX_SUPPORTED_PROTOCOL_VERSION: u8 = 4;
/// Selected version in a capabilities response when no common version exists.
pub const PROTOCOL_VERSION_NONE: u8 = 0;
