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


use core::fmt;

use alloc::sync::Arc;
use alloc::vec::Vec;

use cfg_if::cfg_if;

use embassy_sync::blocking_mutex::raw::RawMutex;

use log::{debug, info, warn};

use crate::error::{Error, ErrorCode};

use super::endpoint::{BleEndPoint, Ctx, EndPointEvent, EndPointState, Role};
use super::gatt::{BleApplicationDelegate, BlePlatformDelegate, BleTransport, BtAddr};
use super::queue::SendQueue;
use super::timer::{TimerFacility, TimerToken};
use super::BtpConfig;

cfg_if! {
    if #[cfg(feature = "max-ble-end-points-8")] {
        /// The maximum number of BTP endpoints that can be alive at any given time.
        pub const MAX_BLE_END_POINTS: usize = 8;
    } else if #[cfg(feature = "max-ble-end-points-4")] {
        /// The maximum number of BTP endpoints that can be alive at any given time.
        pub const MAX_BLE_END_POINTS: usize = 4;
    } else if #[cfg(feature = "max-ble-end-points-2")] {
        /// The maximum number of BTP endpoints that can be alive at any given time.
        pub const MAX_BLE_END_POINTS: usize = 2;
    } else if #[cfg(feature = "max-ble-end-points-1")] {
        /// The maximum number of BTP endpoints that can be alive at any given time.
        pub const MAX_BLE_END_POINTS: usize = 1;
    } else {
        /// The maximum number of BTP endpoints that can be alive at any given time.
        pub const MAX_BLE_END_POINTS: usize = 1;
    }
}

/// A handle to an endpoint owned by a `BleLayer`.
///
/// The generation changes every time a slot is reused, so a stale id (or a stale
/// `TimerToken`) never reaches the endpoint which took over the slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct EndPointId {
    index: u8,
    generation: u16,
}

impl EndPointId {
    pub const fn new(index: u8, generation: u16) -> Self {
        Self { index, generation }
    }

    pub const fn index(&self) -> usize {
        self.index as usize
    }

    pub const fn generation(&self) -> u16 {
        self.generation
    }
}

impl fmt::Display for EndPointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EP{}/{}", self.index, self.generation)
    }
}

struct Slot<M>
where
    M: RawMutex,
{
    generation: u16,
    end_point: Option<BleEndPoint<M>>,
}

/// Owns the BTP endpoints of a device and routes platform events to them.
///
/// All platform callbacks (GATT events, timer expirations) and all application calls
/// (connect, send, close) go through the layer, which dispatches them to the endpoint
/// identified by the BLE connection or by an `EndPointId`.
pub struct BleLayer<P, T, A, U, M>
where
    M: RawMutex,
{
    platform: P,
    timers: T,
    app: A,
    transport: U,
    config: BtpConfig,
    slots: [Slot<M>; MAX_BLE_END_POINTS],
}

impl<P, T, A, U, M> BleLayer<P, T, A, U, M>
where
    P: BlePlatformDelegate,
    T: TimerFacility,
    A: BleApplicationDelegate,
    U: BleTransport,
    M: RawMutex,
{
    /// Create a new layer with the default `BtpConfig`.
    pub fn new(platform: P, timers: T, app: A, transport: U) -> Self {
        Self::with_config(platform, timers, app, transport, BtpConfig::new())
    }

    pub fn with_config(platform: P, timers: T, app: A, transport: U, config: BtpConfig) -> Self {
        Self {
            platform,
            timers,
            app,
            transport,
            config,
            slots: core::array::from_fn(|_| Slot {
                generation: 0,
                end_point: None,
            }),
        }
    }

    pub fn config(&self) -> &BtpConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn timers(&self) -> &T {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut T {
        &mut self.timers
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn transport(&self) -> &U {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut U {
        &mut self.transport
    }

    /// Open a BTP connection as a central over the already established BLE connection `conn`.
    ///
    /// With `auto_close` the BLE connection is closed once the endpoint is done with it;
    /// otherwise it is handed back via `BleApplicationDelegate::notify_chip_connection_closed`.
    /// Completion is reported via `BleTransport::on_connect_complete`.
    pub fn new_central_connection(
        &mut self,
        conn: BtAddr,
        auto_close: bool,
    ) -> Result<EndPointId, Error> {
        if self.find(conn).is_some() {
            warn!("BTP endpoint for {} exists already", conn);
            Err(ErrorCode::InvalidState)?;
        }

        let id = self.alloc(Role::Central, conn, auto_close)?;

        self.dispatch(id, |end_point, ctx| end_point.start_connect(ctx))?;

        Ok(id)
    }

    /// A write to `C1` arrived from the central `conn` (peripheral role).
    ///
    /// The first write on a connection creates the peripheral endpoint.
    pub fn handle_write_received(&mut self, conn: BtAddr, data: &[u8]) -> Result<(), Error> {
        let id = match self.find(conn) {
            Some(id) => id,
            None => {
                info!("New BTP connection from {}", conn);
                self.alloc(Role::Peripheral, conn, true)?
            }
        };

        self.dispatch(id, |end_point, ctx| {
            end_point.handle_event(ctx, EndPointEvent::DataReceived(data))
        })
    }

    /// An indication on `C2` arrived from the peripheral `conn` (central role).
    pub fn handle_indication_received(&mut self, conn: BtAddr, data: &[u8]) -> Result<(), Error> {
        self.dispatch_conn(conn, EndPointEvent::DataReceived(data))
    }

    /// The platform confirmed our last write to `C1` on `conn`.
    pub fn handle_write_confirmation(&mut self, conn: BtAddr) -> Result<(), Error> {
        self.dispatch_conn(conn, EndPointEvent::GattConfirmed)
    }

    /// The platform confirmed our last indication on `C2` on `conn`.
    pub fn handle_indication_confirmation(&mut self, conn: BtAddr) -> Result<(), Error> {
        self.dispatch_conn(conn, EndPointEvent::GattConfirmed)
    }

    pub fn handle_subscribe_received(&mut self, conn: BtAddr) -> Result<(), Error> {
        self.dispatch_conn(conn, EndPointEvent::SubscribeReceived)
    }

    pub fn handle_subscribe_complete(&mut self, conn: BtAddr) -> Result<(), Error> {
        self.dispatch_conn(conn, EndPointEvent::SubscribeComplete)
    }

    pub fn handle_unsubscribe_received(&mut self, conn: BtAddr) -> Result<(), Error> {
        self.dispatch_conn(conn, EndPointEvent::UnsubscribeReceived)
    }

    pub fn handle_unsubscribe_complete(&mut self, conn: BtAddr) -> Result<(), Error> {
        self.dispatch_conn(conn, EndPointEvent::UnsubscribeComplete)
    }

    /// The BLE connection `conn` failed with `code`, e.g. `ErrorCode::RemoteDeviceDisconnected`.
    pub fn handle_connection_error(&mut self, conn: BtAddr, code: ErrorCode) -> Result<(), Error> {
        self.dispatch_conn(conn, EndPointEvent::ConnectionError(code))
    }

    /// A timer started via the `TimerFacility` expired.
    ///
    /// Tokens of endpoints which are gone are ignored.
    pub fn handle_timer(&mut self, token: TimerToken) -> Result<(), Error> {
        if !self.is_live(token.end_point) {
            debug!("Ignoring {:?} timer of stale {}", token.kind, token.end_point);
            return Ok(());
        }

        self.dispatch(token.end_point, |end_point, ctx| {
            end_point.handle_event(ctx, EndPointEvent::TimerFired(token.kind))
        })
    }

    /// Send `msg` on a connected endpoint.
    pub fn send(&mut self, id: EndPointId, msg: Vec<u8>) -> Result<(), Error> {
        self.dispatch(id, |end_point, ctx| end_point.send(ctx, msg))
    }

    /// Send whatever was pushed into the endpoint's `SendQueue` directly.
    pub fn drive(&mut self, id: EndPointId) -> Result<(), Error> {
        self.dispatch(id, |end_point, ctx| {
            end_point.handle_event(ctx, EndPointEvent::Drive)
        })
    }

    /// Close gracefully once all queued messages are sent and acknowledged.
    /// No more transport callbacks are made for the endpoint.
    pub fn close(&mut self, id: EndPointId) -> Result<(), Error> {
        self.dispatch(id, |end_point, ctx| {
            end_point.close(ctx);
            Ok(())
        })
    }

    /// Close immediately, dropping all queued messages.
    /// No more transport callbacks are made for the endpoint.
    pub fn abort(&mut self, id: EndPointId) -> Result<(), Error> {
        self.dispatch(id, |end_point, ctx| {
            end_point.abort(ctx);
            Ok(())
        })
    }

    pub fn end_point(&self, id: EndPointId) -> Option<&BleEndPoint<M>> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.end_point.as_ref())
    }

    pub fn state(&self, id: EndPointId) -> Option<EndPointState> {
        self.end_point(id).map(BleEndPoint::state)
    }

    pub fn send_queue(&self, id: EndPointId) -> Option<Arc<SendQueue<M>>> {
        self.end_point(id).map(|end_point| end_point.send_queue().clone())
    }

    /// The endpoint bound to BLE connection `conn`, if any.
    pub fn find(&self, conn: BtAddr) -> Option<EndPointId> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            slot.end_point
                .as_ref()
                .filter(|end_point| end_point.connection() == Some(conn))
                .map(|_| EndPointId::new(index as u8, slot.generation))
        })
    }

    /// The number of live endpoints.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.end_point.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_live(&self, id: EndPointId) -> bool {
        self.end_point(id).is_some()
    }

    fn alloc(&mut self, role: Role, conn: BtAddr, auto_close: bool) -> Result<EndPointId, Error> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.end_point.is_none())
            .ok_or_else(|| {
                warn!("No free BTP endpoint for {}", conn);
                ErrorCode::NoEndPoint
            })?;

        slot.end_point = Some(BleEndPoint::new(
            role,
            conn,
            auto_close,
            self.config.clone(),
        ));

        let id = EndPointId::new(index as u8, slot.generation);

        debug!("{}: allocated as {:?} for {}", id, role, conn);

        Ok(id)
    }

    fn dispatch_conn(&mut self, conn: BtAddr, event: EndPointEvent<'_>) -> Result<(), Error> {
        let id = self.find(conn).ok_or_else(|| {
            warn!("No BTP endpoint for {}, dropping {:?}", conn, event);
            ErrorCode::NoEndPoint
        })?;

        self.dispatch(id, |end_point, ctx| end_point.handle_event(ctx, event))
    }

    fn dispatch<F, R>(&mut self, id: EndPointId, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut BleEndPoint<M>, &mut Ctx<'_>) -> Result<R, Error>,
    {
        let slot = self
            .slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation)
            .ok_or(ErrorCode::NoEndPoint)?;

        let end_point = slot.end_point.as_mut().ok_or(ErrorCode::NoEndPoint)?;

        let mut ctx = Ctx {
            id,
            platform: &mut self.platform,
            app: &mut self.app,
            transport: &mut self.transport,
            timers: &mut self.timers,
        };

        let result = f(end_point, &mut ctx);

        if end_point.is_freed() {
            slot.end_point = None;
            slot.generation = slot.generation.wrapping_add(1);

            debug!("{}: slot released", id);
        }

        result
    }
}
