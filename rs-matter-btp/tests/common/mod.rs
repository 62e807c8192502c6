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


#![allow(dead_code)]

use std::collections::VecDeque;

use rs_matter_btp::error::Error;
use rs_matter_btp::utils::std_mutex::StdRawMutex;
use rs_matter_btp::{
    BleApplicationDelegate, BleLayer, BlePlatformDelegate, BleTransport, BtAddr, EndPointId,
    TimerQueue,
};

pub const CENTRAL_ADDR: BtAddr = BtAddr([0xc0, 0, 0, 0, 0, 1]);
pub const PERIPHERAL_ADDR: BtAddr = BtAddr([0xd0, 0, 0, 0, 0, 2]);

pub fn init_env_logger() {
    #[cfg(all(feature = "std", not(target_os = "espidf")))]
    {
        let _ = env_logger::try_init_from_env(
            env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
        );
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Gatt {
    Write(Vec<u8>),
    Indicate(Vec<u8>),
    Subscribe,
    Unsubscribe,
    Close,
}

/// A GATT "radio" which just queues everything sent over it.
#[derive(Default)]
pub struct Radio {
    pub mtu: u16,
    pub outbox: VecDeque<Gatt>,
}

impl BlePlatformDelegate for Radio {
    fn mtu(&self, _conn: BtAddr) -> u16 {
        self.mtu
    }

    fn send_write_request(&mut self, _conn: BtAddr, _svc_id: u16, _char_id: u128, data: &[u8]) -> bool {
        self.outbox.push_back(Gatt::Write(data.to_vec()));
        true
    }

    fn send_indication(&mut self, _conn: BtAddr, _svc_id: u16, _char_id: u128, data: &[u8]) -> bool {
        self.outbox.push_back(Gatt::Indicate(data.to_vec()));
        true
    }

    fn subscribe_characteristic(&mut self, _conn: BtAddr, _svc_id: u16, _char_id: u128) -> bool {
        self.outbox.push_back(Gatt::Subscribe);
        true
    }

    fn unsubscribe_characteristic(&mut self, _conn: BtAddr, _svc_id: u16, _char_id: u128) -> bool {
        self.outbox.push_back(Gatt::Unsubscribe);
        true
    }

    fn close_connection(&mut self, _conn: BtAddr) -> bool {
        self.outbox.push_back(Gatt::Close);
        true
    }
}

pub struct NoApp;

impl BleApplicationDelegate for NoApp {
    fn notify_chip_connection_closed(&mut self, _conn: BtAddr) {}
}

/// Collects what the BTP layer reports upwards.
#[derive(Default)]
pub struct Inbox {
    pub connected: Vec<EndPointId>,
    pub failed: Vec<EndPointId>,
    pub messages: Vec<Vec<u8>>,
    pub closed: Vec<EndPointId>,
}

impl BleTransport for Inbox {
    fn on_connect_complete(&mut self, end_point: EndPointId, result: Result<(), Error>) {
        match result {
            Ok(()) => self.connected.push(end_point),
            Err(_) => self.failed.push(end_point),
        }
    }

    fn on_message_received(&mut self, _end_point: EndPointId, msg: Vec<u8>) {
        self.messages.push(msg);
    }

    fn on_connection_closed(&mut self, end_point: EndPointId, _result: Result<(), Error>) {
        self.closed.push(end_point);
    }
}

pub type Layer = BleLayer<Radio, TimerQueue<8>, NoApp, Inbox, StdRawMutex>;

pub fn layer(mtu: u16) -> Layer {
    BleLayer::new(
        Radio {
            mtu,
            ..Default::default()
        },
        TimerQueue::new(),
        NoApp,
        Inbox::default(),
    )
}

/// Move GATT traffic between `central` and `peripheral` until both are quiet.
///
/// Every write and indication is confirmed right after delivery.
pub fn pump(central: &mut Layer, peripheral: &mut Layer) {
    loop {
        if let Some(op) = central.platform_mut().outbox.pop_front() {
            match op {
                Gatt::Write(data) => {
                    let _ = peripheral.handle_write_received(CENTRAL_ADDR, &data);
                    let _ = central.handle_write_confirmation(PERIPHERAL_ADDR);
                }
                Gatt::Subscribe => {
                    let _ = peripheral.handle_subscribe_received(CENTRAL_ADDR);
                    let _ = central.handle_subscribe_complete(PERIPHERAL_ADDR);
                }
                Gatt::Unsubscribe => {
                    let _ = peripheral.handle_unsubscribe_received(CENTRAL_ADDR);
                    let _ = central.handle_unsubscribe_complete(PERIPHERAL_ADDR);
                }
                Gatt::Close | Gatt::Indicate(_) => (),
            }
        } else if let Some(op) = peripheral.platform_mut().outbox.pop_front() {
            if let Gatt::Indicate(data) = op {
                let _ = central.handle_indication_received(PERIPHERAL_ADDR, &data);
                let _ = peripheral.handle_indication_confirmation(CENTRAL_ADDR);
            }
        } else {
            break;
        }
    }
}
