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

//! The BTP connection endpoint: handshake, flow control, acknowledgements and teardown
//! of a single BTP connection over a BLE link.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::Duration;

use log::{debug, error, info, warn};

use crate::error::{Error, ErrorCode};
use crate::utils::writebuf::WriteBuf;

use super::engine::{BtpEngine, BtpState};
use super::gatt::{
    BleApplicationDelegate, BlePlatformDelegate, BleTransport, BtAddr, C1_CHARACTERISTIC_UUID,
    C2_CHARACTERISTIC_UUID, MATTER_BLE_SERVICE_UUID16,
};
use super::layer::EndPointId;
use super::packet::{
    highest_supported_version, CapabilitiesRequest, CapabilitiesResponse,
    CAPABILITIES_REQUEST_LEN, STANDALONE_ACK_LEN,
};
use super::queue::SendQueue;
use super::timer::{TimerFacility, TimerKind, TimerTable, TimerToken};
use super::window::adjust_remote_receive_window;
use super::{
    BtpConfig, DEFAULT_FRAGMENT_SIZE, GATT_HEADER_SIZE, MAX_BTP_SEGMENT_SIZE,
    MAX_SUPPORTED_PROTOCOL_VERSION, MIN_SUPPORTED_PROTOCOL_VERSION, PROTOCOL_VERSION_NONE,
};

/// The GATT role of the local device on a BTP connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    /// Writes to `C1`, receives indications on `C2`.
    Central,
    /// Indicates on `C2`, receives writes to `C1`.
    Peripheral,
}

/// The connection state of a BTP endpoint.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EndPointState {
    Ready,
    Connecting,
    Connected,
    /// Closed by the application; waiting for queued data to be sent and acknowledged.
    Closing,
    /// Peripheral only: the handshake found no common protocol version, and the endpoint
    /// is waiting to deliver a capabilities response saying so before closing.
    Aborting,
    Closed,
}

bitflags! {
    /// Progress of the handshake and of GATT operations on a connection.
    #[repr(transparent)]
    #[derive(Default, Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct ConnectionFlags: u8 {
        const CAPABILITIES_MSG_RECEIVED = 0x01;
        const CAPABILITIES_CONF_RECEIVED = 0x02;
        const DID_BEGIN_SUBSCRIBE = 0x04;
        const GATT_OPERATION_IN_FLIGHT = 0x08;
        const STANDALONE_ACK_IN_FLIGHT = 0x10;
        const AUTO_CLOSE = 0x20;
    }
}

bitflags! {
    /// Upper layer callbacks still armed on an endpoint.
    #[repr(transparent)]
    #[derive(Default, Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub(crate) struct Callbacks: u8 {
        const CONNECT_COMPLETE = 0x01;
        const MESSAGE_RECEIVED = 0x02;
        const CONNECTION_CLOSED = 0x04;
    }
}

bitflags! {
    #[repr(transparent)]
    #[derive(Default, Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub(crate) struct CloseFlags: u8 {
        const SUPPRESS_CALLBACK = 0x01;
        const ABORT_TRANSMISSION = 0x02;
    }
}

/// Everything an endpoint interacts with while handling an event.
pub(crate) struct Ctx<'a> {
    pub id: EndPointId,
    pub platform: &'a mut dyn BlePlatformDelegate,
    pub app: &'a mut dyn BleApplicationDelegate,
    pub transport: &'a mut dyn BleTransport,
    pub timers: &'a mut dyn TimerFacility,
}

/// The inputs of the endpoint state machine.
#[derive(Debug, Clone)]
pub(crate) enum EndPointEvent<'a> {
    /// A `C1` write (peripheral) or `C2` indication (central) arrived.
    DataReceived(&'a [u8]),
    /// The platform confirmed our last write or indication.
    GattConfirmed,
    /// The central subscribed to `C2` (peripheral).
    SubscribeReceived,
    /// Our subscription to `C2` completed (central).
    SubscribeComplete,
    /// The central unsubscribed from `C2` (peripheral).
    UnsubscribeReceived,
    /// Our unsubscribe from `C2` completed (central).
    UnsubscribeComplete,
    /// The BLE connection failed or was torn down.
    ConnectionError(ErrorCode),
    TimerFired(TimerKind),
    /// Messages were pushed into the send queue from outside; try sending them.
    Drive,
}

/// What `gatt_send` transmits.
enum Outbound {
    Handshake,
    Fragment,
    StandaloneAck([u8; STANDALONE_ACK_LEN]),
}

/// A BTP connection endpoint.
///
/// Endpoints are owned by a `BleLayer`, which feeds them GATT and timer events.
pub struct BleEndPoint<M>
where
    M: RawMutex,
{
    conn: Option<BtAddr>,
    role: Role,
    state: EndPointState,
    flags: ConnectionFlags,
    timers: TimerTable<bool>,
    callbacks: Callbacks,
    engine: BtpEngine,
    send_queue: Arc<SendQueue<M>>,
    /// Encoded capabilities request or response, until the handshake GATT operation is confirmed.
    handshake: Option<heapless::Vec<u8, CAPABILITIES_REQUEST_LEN>>,
    ack_to_send: bool,
    local_receive_window_size: u8,
    remote_receive_window_size: u8,
    receive_window_max_size: u8,
    config: BtpConfig,
    freed: bool,
}

impl<M> BleEndPoint<M>
where
    M: RawMutex,
{
    pub(crate) fn new(role: Role, conn: BtAddr, auto_close: bool, config: BtpConfig) -> Self {
        let mut engine = BtpEngine::new();
        engine.init(role == Role::Peripheral);

        let mut flags = ConnectionFlags::empty();
        flags.set(ConnectionFlags::AUTO_CLOSE, auto_close);

        let window = config.max_receive_window_size;

        Self {
            conn: Some(conn),
            role,
            state: EndPointState::Ready,
            flags,
            timers: TimerTable::default(),
            callbacks: Callbacks::all(),
            engine,
            send_queue: Arc::new(SendQueue::new()),
            handshake: None,
            ack_to_send: false,
            local_receive_window_size: window,
            remote_receive_window_size: window,
            receive_window_max_size: window,
            config,
            freed: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> EndPointState {
        self.state
    }

    /// The BLE connection of the endpoint; `None` once it was released.
    pub fn connection(&self) -> Option<BtAddr> {
        self.conn
    }

    pub fn flags(&self) -> ConnectionFlags {
        self.flags
    }

    pub fn local_receive_window_size(&self) -> u8 {
        self.local_receive_window_size
    }

    pub fn remote_receive_window_size(&self) -> u8 {
        self.remote_receive_window_size
    }

    pub fn receive_window_max_size(&self) -> u8 {
        self.receive_window_max_size
    }

    pub fn is_timer_running(&self, kind: TimerKind) -> bool {
        self.timers[kind]
    }

    pub fn engine(&self) -> &BtpEngine {
        &self.engine
    }

    /// The outbound message queue. Messages pushed into it directly are picked up
    /// on the next GATT confirmation or after `BleLayer::drive`.
    pub fn send_queue(&self) -> &Arc<SendQueue<M>> {
        &self.send_queue
    }

    /// `true` if the connection is usable for sending, i.e. `Connected` or `Closing`.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            EndPointState::Connected | EndPointState::Closing
        )
    }

    pub(crate) fn is_freed(&self) -> bool {
        self.freed
    }

    /// Central only: initiate the BTP handshake by writing a capabilities request to `C1`.
    pub(crate) fn start_connect(&mut self, ctx: &mut Ctx<'_>) -> Result<(), Error> {
        let result = self.send_capabilities_request(ctx);

        if let Err(err) = &result {
            self.stop_timer(ctx, TimerKind::Connect);
            self.do_close(ctx, CloseFlags::ABORT_TRANSMISSION, Err(err.clone()));
        }

        result
    }

    /// Queue `msg` for sending and send as much of it as the window allows.
    pub(crate) fn send(&mut self, ctx: &mut Ctx<'_>, msg: Vec<u8>) -> Result<(), Error> {
        if !self.is_connected() {
            warn!("{}: cannot send in state {:?}", ctx.id, self.state);
            Err(ErrorCode::InvalidState)?;
        }

        self.send_queue.push(msg);

        let result = self.drive_sending(ctx);
        self.close_on_error(ctx, result)
    }

    /// Close gracefully: queued messages are still delivered, but no more callbacks are made.
    pub(crate) fn close(&mut self, ctx: &mut Ctx<'_>) {
        self.callbacks = Callbacks::empty();
        self.do_close(ctx, CloseFlags::SUPPRESS_CALLBACK, Ok(()));
    }

    /// Close immediately, dropping queued messages. No more callbacks are made.
    pub(crate) fn abort(&mut self, ctx: &mut Ctx<'_>) {
        self.callbacks = Callbacks::empty();
        self.do_close(
            ctx,
            CloseFlags::SUPPRESS_CALLBACK | CloseFlags::ABORT_TRANSMISSION,
            Ok(()),
        );
    }

    /// Feed an event into the state machine.
    ///
    /// Any error tears the connection down (abortively) before being returned.
    pub(crate) fn handle_event(
        &mut self,
        ctx: &mut Ctx<'_>,
        event: EndPointEvent<'_>,
    ) -> Result<(), Error> {
        let result = match event {
            EndPointEvent::DataReceived(data) => self.receive(ctx, data),
            EndPointEvent::GattConfirmed => self.handle_gatt_send_confirmation(ctx),
            EndPointEvent::SubscribeReceived => self.handle_subscribe_received(ctx),
            EndPointEvent::SubscribeComplete => self.handle_subscribe_complete(ctx),
            EndPointEvent::UnsubscribeReceived => {
                info!("{}: central unsubscribed", ctx.id);
                Err(ErrorCode::CentralUnsubscribed.into())
            }
            EndPointEvent::UnsubscribeComplete => {
                info!("{}: unsubscribe complete", ctx.id);
                self.free(ctx);
                Ok(())
            }
            EndPointEvent::ConnectionError(code) => Err(code.into()),
            EndPointEvent::TimerFired(kind) => self.handle_timeout(ctx, kind),
            EndPointEvent::Drive => {
                if self.is_connected() {
                    self.drive_sending(ctx)
                } else {
                    Ok(())
                }
            }
        };

        self.close_on_error(ctx, result)
    }

    fn close_on_error(&mut self, ctx: &mut Ctx<'_>, result: Result<(), Error>) -> Result<(), Error> {
        if let Err(err) = &result {
            self.do_close(ctx, CloseFlags::ABORT_TRANSMISSION, Err(err.clone()));
        }

        result
    }

    fn send_capabilities_request(&mut self, ctx: &mut Ctx<'_>) -> Result<(), Error> {
        if self.role != Role::Central || self.state != EndPointState::Ready {
            Err(ErrorCode::InvalidState)?;
        }

        let conn = self.conn.ok_or(ErrorCode::InvalidState)?;

        self.state = EndPointState::Connecting;

        let mut req = CapabilitiesRequest::new(ctx.platform.mtu(conn), self.config.max_receive_window_size);

        // Newest version first
        for (index, version) in (MIN_SUPPORTED_PROTOCOL_VERSION..=MAX_SUPPORTED_PROTOCOL_VERSION)
            .rev()
            .enumerate()
        {
            req.set_supported_version(index, version)?;
        }

        let mut buf = [0; CAPABILITIES_REQUEST_LEN];
        let mut wb = WriteBuf::new(&mut buf);
        req.encode(&mut wb)?;
        self.stash_handshake(wb.as_slice())?;

        self.start_timer(ctx, TimerKind::Connect)?;
        self.gatt_send(ctx, Outbound::Handshake)?;

        info!(
            "{}: sent capabilities request, MTU {}, window {}",
            ctx.id, req.mtu, req.window_size
        );

        Ok(())
    }

    fn stash_handshake(&mut self, data: &[u8]) -> Result<(), Error> {
        self.handshake = Some(heapless::Vec::from_slice(data).map_err(|_| ErrorCode::NoSpace)?);

        Ok(())
    }

    fn receive(&mut self, ctx: &mut Ctx<'_>, data: &[u8]) -> Result<(), Error> {
        if !self.flags.contains(ConnectionFlags::CAPABILITIES_MSG_RECEIVED) {
            return match (self.role, self.state) {
                (Role::Central, EndPointState::Connecting) => {
                    self.flags.insert(ConnectionFlags::CAPABILITIES_MSG_RECEIVED);
                    self.handle_capabilities_response_received(ctx, data)
                }
                (Role::Peripheral, EndPointState::Ready) => {
                    self.flags.insert(ConnectionFlags::CAPABILITIES_MSG_RECEIVED);

                    let result = self.handle_capabilities_request_received(ctx, data);
                    if let Err(err) = &result {
                        // The central finds out via its connect timeout, or via the connection
                        // closing if the application decides so
                        self.do_close(
                            ctx,
                            CloseFlags::ABORT_TRANSMISSION | CloseFlags::SUPPRESS_CALLBACK,
                            Err(err.clone()),
                        );
                    }

                    result
                }
                (role, state) => {
                    warn!(
                        "{}: unexpected handshake packet, role {:?}, state {:?}",
                        ctx.id, role, state
                    );
                    Err(ErrorCode::InvalidState.into())
                }
            };
        }

        if !self.is_connected() {
            error!("{}: received BTP packet in state {:?}", ctx.id, self.state);
            Err(ErrorCode::InvalidState)?;
        }

        let received_ack = self.engine.handle_characteristic_received(data);
        if received_ack.is_err() {
            self.engine.log_state();
        }
        let received_ack = received_ack?;

        self.local_receive_window_size = self.local_receive_window_size.saturating_sub(1);
        debug!(
            "{}: local window shrunk to {}",
            ctx.id, self.local_receive_window_size
        );

        if let Some(ack_num) = received_ack {
            if !self.engine.expecting_ack() {
                self.stop_timer(ctx, TimerKind::AckReceived);

                if self.state == EndPointState::Closing
                    && self.send_queue.is_empty()
                    && self.engine.tx_state() == BtpState::Idle
                {
                    self.finalize_close(
                        ctx,
                        EndPointState::Closing,
                        CloseFlags::SUPPRESS_CALLBACK,
                        Ok(()),
                    );
                    return Ok(());
                }
            } else {
                self.restart_timer(ctx, TimerKind::AckReceived)?;
            }

            self.remote_receive_window_size = adjust_remote_receive_window(
                ack_num,
                self.receive_window_max_size,
                self.engine.newest_unacked_sent_seq_num(),
            );

            self.drive_sending(ctx)?;

            if self.state == EndPointState::Closed {
                return Ok(());
            }
        }

        // The sending above might have piggybacked the ack already
        if self.engine.has_unacked_data() {
            if self.local_receive_window_size <= self.config.immediate_ack_window_threshold
                && !self.flags.contains(ConnectionFlags::GATT_OPERATION_IN_FLIGHT)
            {
                self.drive_standalone_ack(ctx)?;
            } else {
                self.start_timer(ctx, TimerKind::SendAck)?;
            }
        }

        if let Some(msg) = self.engine.take_rx_packet() {
            debug!("{}: received message of {} bytes", ctx.id, msg.len());

            if self.state != EndPointState::Closing
                && self.callbacks.contains(Callbacks::MESSAGE_RECEIVED)
            {
                ctx.transport.on_message_received(ctx.id, msg);
            }
        }

        Ok(())
    }

    fn handle_capabilities_request_received(
        &mut self,
        ctx: &mut Ctx<'_>,
        data: &[u8],
    ) -> Result<(), Error> {
        self.state = EndPointState::Connecting;

        let req = CapabilitiesRequest::decode(data)?;
        let conn = self.conn.ok_or(ErrorCode::InvalidState)?;

        let mtu = if req.mtu > 0 {
            req.mtu
        } else {
            ctx.platform.mtu(conn)
        };

        let fragment_size = if mtu > GATT_HEADER_SIZE as u16 {
            (mtu - GATT_HEADER_SIZE as u16).min(MAX_BTP_SEGMENT_SIZE as u16)
        } else {
            info!(
                "{}: cannot determine ATT MTU; selecting default fragment size {}",
                ctx.id, DEFAULT_FRAGMENT_SIZE
            );
            DEFAULT_FRAGMENT_SIZE
        };

        let window = req.window_size.min(self.config.max_receive_window_size);
        self.receive_window_max_size = window;
        self.local_receive_window_size = window;
        self.remote_receive_window_size = window;

        let selected_protocol_version = highest_supported_version(&req);

        info!(
            "{}: selected BTP version {}, fragment size {}, window {}",
            ctx.id, selected_protocol_version, fragment_size, window
        );

        if selected_protocol_version == PROTOCOL_VERSION_NONE {
            error!(
                "{}: incompatible BTP versions; peripheral expected between {} and {}",
                ctx.id, MIN_SUPPORTED_PROTOCOL_VERSION, MAX_SUPPORTED_PROTOCOL_VERSION
            );
            self.state = EndPointState::Aborting;
        } else {
            self.engine.set_rx_fragment_size(fragment_size);
            self.engine.set_tx_fragment_size(fragment_size);
        }

        let resp = CapabilitiesResponse {
            selected_protocol_version,
            fragment_size,
            window_size: window,
        };

        let mut buf = [0; CAPABILITIES_REQUEST_LEN];
        let mut wb = WriteBuf::new(&mut buf);
        resp.encode(&mut wb)?;

        // Indicated once the central subscribes
        self.stash_handshake(wb.as_slice())?;

        self.start_timer(ctx, TimerKind::ReceiveConnection)
    }

    fn handle_capabilities_response_received(
        &mut self,
        ctx: &mut Ctx<'_>,
        data: &[u8],
    ) -> Result<(), Error> {
        let resp = CapabilitiesResponse::decode(data)?;

        if resp.fragment_size == 0 {
            Err(ErrorCode::InvalidFragmentSize)?;
        }

        info!(
            "{}: peripheral chose BTP version {}; central expected between {} and {}",
            ctx.id,
            resp.selected_protocol_version,
            MIN_SUPPORTED_PROTOCOL_VERSION,
            MAX_SUPPORTED_PROTOCOL_VERSION
        );

        if !(MIN_SUPPORTED_PROTOCOL_VERSION..=MAX_SUPPORTED_PROTOCOL_VERSION)
            .contains(&resp.selected_protocol_version)
        {
            Err(ErrorCode::IncompatibleProtocolVersions)?;
        }

        let fragment_size = resp.fragment_size.min(MAX_BTP_SEGMENT_SIZE as u16);
        self.engine.set_rx_fragment_size(fragment_size);
        self.engine.set_tx_fragment_size(fragment_size);

        self.receive_window_max_size = resp.window_size;
        self.remote_receive_window_size = resp.window_size;
        // The capabilities response indication itself awaits our ack
        self.local_receive_window_size = resp.window_size.saturating_sub(1);

        info!(
            "{}: fragment size {}, window {}",
            ctx.id, fragment_size, resp.window_size
        );

        self.start_timer(ctx, TimerKind::SendAck)?;

        self.handle_connect_complete(ctx);

        Ok(())
    }

    fn handle_connect_complete(&mut self, ctx: &mut Ctx<'_>) {
        self.state = EndPointState::Connected;
        self.stop_timer(ctx, TimerKind::Connect);

        if self.callbacks.contains(Callbacks::CONNECT_COMPLETE) {
            ctx.transport.on_connect_complete(ctx.id, Ok(()));
        }
    }

    fn handle_receive_connection_complete(&mut self, ctx: &mut Ctx<'_>) {
        self.state = EndPointState::Connected;
        self.stop_timer(ctx, TimerKind::ReceiveConnection);

        if self.callbacks.contains(Callbacks::CONNECT_COMPLETE) {
            ctx.transport.on_connect_complete(ctx.id, Ok(()));
        }
    }

    fn handle_subscribe_received(&mut self, ctx: &mut Ctx<'_>) -> Result<(), Error> {
        if !matches!(
            self.state,
            EndPointState::Connecting | EndPointState::Aborting
        ) || self.handshake.is_none()
        {
            warn!("{}: unexpected subscribe in state {:?}", ctx.id, self.state);
            Err(ErrorCode::InvalidState)?;
        }

        if let Err(err) = self.gatt_send(ctx, Outbound::Handshake) {
            error!("{}: capabilities response indication failed", ctx.id);
            self.handshake = None;
            Err(err)?;
        }

        self.remote_receive_window_size = self.remote_receive_window_size.saturating_sub(1);

        self.start_timer(ctx, TimerKind::AckReceived)?;

        debug!("{}: got subscribe, indicated capabilities response", ctx.id);

        // A central may write data before our indication is confirmed, so be ready for it now
        if self.state != EndPointState::Aborting {
            self.handle_receive_connection_complete(ctx);
        }

        Ok(())
    }

    fn handle_subscribe_complete(&mut self, ctx: &mut Ctx<'_>) -> Result<(), Error> {
        info!("{}: subscribe complete", ctx.id);

        self.flags.remove(ConnectionFlags::GATT_OPERATION_IN_FLIGHT);

        self.drive_sending(ctx)
    }

    fn handle_gatt_send_confirmation(&mut self, ctx: &mut Ctx<'_>) -> Result<(), Error> {
        self.flags.remove(ConnectionFlags::GATT_OPERATION_IN_FLIGHT);

        if !self.flags.contains(ConnectionFlags::CAPABILITIES_CONF_RECEIVED) {
            self.flags.insert(ConnectionFlags::CAPABILITIES_CONF_RECEIVED);
            self.handle_handshake_confirmation_received(ctx)
        } else {
            self.handle_fragment_confirmation_received(ctx)
        }
    }

    fn handle_handshake_confirmation_received(&mut self, ctx: &mut Ctx<'_>) -> Result<(), Error> {
        self.handshake = None;

        match self.role {
            Role::Central => {
                let conn = self.conn.ok_or(ErrorCode::InvalidState)?;

                // Prompts the peripheral to indicate its capabilities response
                if !ctx.platform.subscribe_characteristic(
                    conn,
                    MATTER_BLE_SERVICE_UUID16,
                    C2_CHARACTERISTIC_UUID,
                ) {
                    Err(ErrorCode::GattSubscribeFailed)?;
                }

                self.flags.insert(
                    ConnectionFlags::DID_BEGIN_SUBSCRIBE
                        | ConnectionFlags::GATT_OPERATION_IN_FLIGHT,
                );

                Ok(())
            }
            Role::Peripheral => match self.state {
                EndPointState::Connected => {
                    if self.local_receive_window_size <= self.config.immediate_ack_window_threshold
                        && self.send_queue.is_empty()
                    {
                        self.drive_standalone_ack(ctx)
                    } else {
                        // The application might have sent something before the confirmation
                        self.drive_sending(ctx)
                    }
                }
                EndPointState::Aborting => {
                    let err = Error::new(ErrorCode::IncompatibleProtocolVersions);

                    self.do_close(
                        ctx,
                        CloseFlags::ABORT_TRANSMISSION | CloseFlags::SUPPRESS_CALLBACK,
                        Err(err.clone()),
                    );

                    Err(err)
                }
                _ => Ok(()),
            },
        }
    }

    fn handle_fragment_confirmation_received(&mut self, ctx: &mut Ctx<'_>) -> Result<(), Error> {
        if self.timers[TimerKind::Unsubscribe] {
            debug!("{}: unsubscribe pending, ignoring confirmation", ctx.id);
            return Ok(());
        }

        if !self.is_connected() {
            warn!(
                "{}: unexpected GATT confirmation in state {:?}",
                ctx.id, self.state
            );
            Err(ErrorCode::InvalidState)?;
        }

        if self.flags.contains(ConnectionFlags::STANDALONE_ACK_IN_FLIGHT) {
            self.ack_to_send = false;
            self.flags.remove(ConnectionFlags::STANDALONE_ACK_IN_FLIGHT);
        }

        // Either the window shrank while the ack was in flight, or an immediate ack was
        // deferred in `receive` because a fragment was in flight
        if self.local_receive_window_size <= self.config.immediate_ack_window_threshold
            && self.send_queue.is_empty()
            && self.engine.tx_state() != BtpState::InProgress
        {
            self.drive_standalone_ack(ctx)
        } else {
            self.drive_sending(ctx)
        }
    }

    fn drive_standalone_ack(&mut self, ctx: &mut Ctx<'_>) -> Result<(), Error> {
        self.stop_timer(ctx, TimerKind::SendAck);

        self.ack_to_send = true;

        self.drive_sending(ctx)
    }

    fn drive_sending(&mut self, ctx: &mut Ctx<'_>) -> Result<(), Error> {
        if (self.remote_receive_window_size <= self.config.no_ack_send_window_threshold
            && !self.timers[TimerKind::SendAck]
            && !self.engine.has_unacked_data())
            || self.remote_receive_window_size == 0
            || self.flags.contains(ConnectionFlags::GATT_OPERATION_IN_FLIGHT)
        {
            debug!(
                "{}: not sending now, remote window {}, GATT operation in flight: {}",
                ctx.id,
                self.remote_receive_window_size,
                self.flags.contains(ConnectionFlags::GATT_OPERATION_IN_FLIGHT)
            );
            return Ok(());
        }

        if self.ack_to_send && !self.flags.contains(ConnectionFlags::STANDALONE_ACK_IN_FLIGHT) {
            return self.send_standalone_ack(ctx);
        }

        match self.engine.tx_state() {
            BtpState::Idle => match self.send_queue.pop() {
                Some(msg) => self.send_next_fragment(ctx, Some(msg)),
                None => Ok(()),
            },
            BtpState::InProgress => self.send_next_fragment(ctx, None),
            BtpState::Complete => {
                self.engine.take_tx_packet();

                if let Some(msg) = self.send_queue.pop() {
                    self.send_next_fragment(ctx, Some(msg))
                } else {
                    if self.state == EndPointState::Closing && !self.engine.expecting_ack() {
                        self.finalize_close(
                            ctx,
                            EndPointState::Closing,
                            CloseFlags::SUPPRESS_CALLBACK,
                            Ok(()),
                        );
                    }

                    Ok(())
                }
            }
            BtpState::Error => Err(ErrorCode::InvalidState.into()),
        }
    }

    fn send_next_fragment(&mut self, ctx: &mut Ctx<'_>, msg: Option<Vec<u8>>) -> Result<(), Error> {
        let send_ack = self.engine.has_unacked_data();
        if send_ack {
            self.local_receive_window_size = self.receive_window_max_size;
        }

        self.engine
            .handle_characteristic_send(msg, send_ack)
            .map_err(|err| {
                warn!("{}: fragmentation failed: {}", ctx.id, err);
                Error::new(ErrorCode::ProtocolAbort)
            })?;
        self.send_characteristic(ctx, Outbound::Fragment)?;

        if send_ack {
            self.stop_timer(ctx, TimerKind::SendAck);
        }

        self.start_timer(ctx, TimerKind::AckReceived)
    }

    fn send_standalone_ack(&mut self, ctx: &mut Ctx<'_>) -> Result<(), Error> {
        let ack = self.engine.encode_standalone_ack();
        self.send_characteristic(ctx, Outbound::StandaloneAck(ack))?;

        debug!("{}: sent stand-alone ack {:02x?}", ctx.id, ack);

        self.local_receive_window_size = self.receive_window_max_size;
        self.flags.insert(ConnectionFlags::STANDALONE_ACK_IN_FLIGHT);

        self.start_timer(ctx, TimerKind::AckReceived)
    }

    /// Transmit a post-handshake packet, consuming one slot of the remote window.
    fn send_characteristic(&mut self, ctx: &mut Ctx<'_>, packet: Outbound) -> Result<(), Error> {
        self.gatt_send(ctx, packet)?;

        self.remote_receive_window_size = self.remote_receive_window_size.saturating_sub(1);
        debug!(
            "{}: remote window shrunk to {}",
            ctx.id, self.remote_receive_window_size
        );

        Ok(())
    }

    fn gatt_send(&mut self, ctx: &mut Ctx<'_>, packet: Outbound) -> Result<(), Error> {
        let conn = self.conn.ok_or(ErrorCode::InvalidState)?;

        let data: &[u8] = match &packet {
            Outbound::Handshake => self
                .handshake
                .as_deref()
                .ok_or(ErrorCode::InvalidState)?,
            Outbound::Fragment => self.engine.borrow_tx_packet(),
            Outbound::StandaloneAck(ack) => ack,
        };

        match self.role {
            Role::Central => {
                if !ctx.platform.send_write_request(
                    conn,
                    MATTER_BLE_SERVICE_UUID16,
                    C1_CHARACTERISTIC_UUID,
                    data,
                ) {
                    Err(ErrorCode::GattWriteFailed)?;
                }
            }
            Role::Peripheral => {
                if !ctx.platform.send_indication(
                    conn,
                    MATTER_BLE_SERVICE_UUID16,
                    C2_CHARACTERISTIC_UUID,
                    data,
                ) {
                    Err(ErrorCode::GattIndicateFailed)?;
                }
            }
        }

        self.flags.insert(ConnectionFlags::GATT_OPERATION_IN_FLIGHT);

        Ok(())
    }

    fn handle_timeout(&mut self, ctx: &mut Ctx<'_>, kind: TimerKind) -> Result<(), Error> {
        if !self.timers[kind] {
            debug!("{}: ignoring {:?} timer which is not running", ctx.id, kind);
            return Ok(());
        }

        self.timers[kind] = false;

        match kind {
            TimerKind::Connect => {
                error!("{}: connect handshake timed out", ctx.id);
                Err(ErrorCode::ConnectTimedOut.into())
            }
            TimerKind::ReceiveConnection => {
                error!("{}: receive handshake timed out", ctx.id);
                Err(ErrorCode::ReceiveTimedOut.into())
            }
            TimerKind::AckReceived => {
                error!("{}: no ack received in time", ctx.id);
                Err(ErrorCode::FragmentAckTimedOut.into())
            }
            TimerKind::SendAck => {
                if !self.flags.contains(ConnectionFlags::STANDALONE_ACK_IN_FLIGHT) {
                    self.drive_standalone_ack(ctx)
                } else {
                    Ok(())
                }
            }
            TimerKind::Unsubscribe => {
                info!("{}: unsubscribe timed out", ctx.id);
                self.free(ctx);
                Ok(())
            }
        }
    }

    fn timeout(&self, kind: TimerKind) -> Duration {
        match kind {
            TimerKind::Connect => self.config.connect_timeout,
            TimerKind::ReceiveConnection => self.config.receive_connection_timeout,
            TimerKind::AckReceived => self.config.ack_received_timeout,
            TimerKind::SendAck => self.config.send_ack_timeout,
            TimerKind::Unsubscribe => self.config.unsubscribe_timeout,
        }
    }

    /// Start a timer unless it is already running.
    fn start_timer(&mut self, ctx: &mut Ctx<'_>, kind: TimerKind) -> Result<(), Error> {
        if !self.timers[kind] {
            let token = TimerToken {
                end_point: ctx.id,
                kind,
            };

            ctx.timers
                .start_timer(self.timeout(kind), token)
                .map_err(|err| {
                    error!("{}: failed to start {:?} timer: {}", ctx.id, kind, err);
                    ErrorCode::StartTimerFailed
                })?;

            self.timers[kind] = true;
        }

        Ok(())
    }

    fn restart_timer(&mut self, ctx: &mut Ctx<'_>, kind: TimerKind) -> Result<(), Error> {
        if !self.timers[kind] {
            Err(ErrorCode::InvalidState)?;
        }

        self.stop_timer(ctx, kind);
        self.start_timer(ctx, kind)
    }

    fn stop_timer(&mut self, ctx: &mut Ctx<'_>, kind: TimerKind) {
        ctx.timers.cancel_timer(TimerToken {
            end_point: ctx.id,
            kind,
        });

        self.timers[kind] = false;
    }

    fn do_close(&mut self, ctx: &mut Ctx<'_>, flags: CloseFlags, result: Result<(), Error>) {
        let old_state = self.state;

        if !matches!(old_state, EndPointState::Closed | EndPointState::Closing)
            || (old_state == EndPointState::Closing
                && flags.contains(CloseFlags::ABORT_TRANSMISSION))
        {
            match &result {
                Ok(()) => info!("{}: closing in state {:?}", ctx.id, old_state),
                Err(err) => error!("{}: closing in state {:?}: {}", ctx.id, old_state, err),
            }

            match self.role {
                Role::Central => self.stop_timer(ctx, TimerKind::Connect),
                Role::Peripheral => self.stop_timer(ctx, TimerKind::ReceiveConnection),
            }

            if flags.contains(CloseFlags::ABORT_TRANSMISSION)
                || (self.engine.tx_state() == BtpState::Idle && self.send_queue.is_empty())
            {
                self.finalize_close(ctx, old_state, flags, result);
            } else {
                // Linger until everything queued was sent and acknowledged
                self.state = EndPointState::Closing;

                if !flags.contains(CloseFlags::SUPPRESS_CALLBACK) {
                    self.do_close_callback(ctx, old_state, result);
                }
            }
        }
    }

    fn finalize_close(
        &mut self,
        ctx: &mut Ctx<'_>,
        old_state: EndPointState,
        flags: CloseFlags,
        result: Result<(), Error>,
    ) {
        self.state = EndPointState::Closed;

        self.send_queue.clear();
        self.ack_to_send = false;

        if old_state != EndPointState::Closing && !flags.contains(CloseFlags::SUPPRESS_CALLBACK) {
            self.do_close_callback(ctx, old_state, result.clone());
        }

        if result.as_ref().is_err_and(|err| err.is_connection_gone()) {
            // Nothing left to release
            self.conn = None;
            self.free(ctx);
        } else if self.role == Role::Central
            && self.flags.contains(ConnectionFlags::DID_BEGIN_SUBSCRIBE)
        {
            self.stop_timer(ctx, TimerKind::AckReceived);
            self.stop_timer(ctx, TimerKind::SendAck);

            // Signal the close to the peripheral, and keep the endpoint around until the
            // unsubscribe completes so that the link is not torn down underneath it
            let unsubscribed = self.conn.is_some_and(|conn| {
                ctx.platform.unsubscribe_characteristic(
                    conn,
                    MATTER_BLE_SERVICE_UUID16,
                    C2_CHARACTERISTIC_UUID,
                )
            });

            if !unsubscribed {
                error!("{}: {}", ctx.id, Error::new(ErrorCode::GattUnsubscribeFailed));
                self.free(ctx);
            } else if self.start_timer(ctx, TimerKind::Unsubscribe).is_err() {
                self.free(ctx);
            } else {
                self.flags.insert(ConnectionFlags::GATT_OPERATION_IN_FLIGHT);
            }
        } else {
            self.free(ctx);
        }
    }

    fn do_close_callback(
        &mut self,
        ctx: &mut Ctx<'_>,
        old_state: EndPointState,
        result: Result<(), Error>,
    ) {
        if old_state == EndPointState::Connecting {
            if self.callbacks.contains(Callbacks::CONNECT_COMPLETE) {
                ctx.transport.on_connect_complete(ctx.id, result);
            }
        } else if self.callbacks.contains(Callbacks::CONNECTION_CLOSED) {
            ctx.transport.on_connection_closed(ctx.id, result);
        }

        // Fires once per endpoint lifetime
        self.callbacks
            .remove(Callbacks::CONNECT_COMPLETE | Callbacks::CONNECTION_CLOSED);
    }

    fn release_ble_connection(&mut self, ctx: &mut Ctx<'_>) {
        if let Some(conn) = self.conn.take() {
            if self.flags.contains(ConnectionFlags::AUTO_CLOSE) {
                info!("{}: auto-closing BLE connection {}", ctx.id, conn);

                if !ctx.platform.close_connection(conn) {
                    warn!("{}: closing BLE connection {} failed", ctx.id, conn);
                }
            } else {
                info!("{}: releasing BLE connection {} to the application", ctx.id, conn);
                ctx.app.notify_chip_connection_closed(conn);
            }
        }
    }

    fn free(&mut self, ctx: &mut Ctx<'_>) {
        self.release_ble_connection(ctx);

        self.engine = BtpEngine::new();
        self.handshake = None;
        self.ack_to_send = false;

        for kind in TimerKind::VALUES {
            if self.timers[kind] {
                self.stop_timer(ctx, kind);
            }
        }

        self.callbacks = Callbacks::empty();
        self.freed = true;

        debug!("{}: freed", ctx.id);
    }
}
