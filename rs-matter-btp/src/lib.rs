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

//! An implementation of the BLE Transport Protocol (BTP) connection endpoint.
//!
//! BTP provides reliable, windowed, fragmented message delivery on top of a
//! GATT link, as used by Matter for commissioning over Bluetooth LE.
//!
//! The crate is `no_std` + `alloc`. All platform interaction (GATT operations,
//! timers, the upper transport layer) happens through traits found in the
//! [`btp`] module, so the protocol logic itself is platform neutral.

#![cfg_attr(not(feature = "std"), no_std)]
#![allow(clippy::new_without_default)]

extern crate alloc;

pub mod btp;
pub mod error;
pub mod utils;

pub use btp::*;
