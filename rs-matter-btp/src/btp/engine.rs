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

//! BTP fragmentation and reassembly.

use alloc::vec::Vec;

use log::{debug, trace, warn};

use crate::error::{Error, ErrorCode};
use crate::utils::writebuf::WriteBuf;

use super::packet::{self, BtpHdr, STANDALONE_ACK_LEN};
use super::{DEFAULT_FRAGMENT_SIZE, MAX_BTP_SEGMENT_SIZE};

/// State of one direction (rx or tx) of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BtpState {
    /// No message is being sent/reassembled.
    Idle,
    /// Some fragments of a message were sent/received.
    InProgress,
    /// The last fragment of a message was sent/received and the message
    /// has not yet been taken out of the engine.
    Complete,
    /// Reassembly failed; the engine is unusable.
    Error,
}

/// Splits outbound messages into fragments and reassembles inbound fragments
/// into messages, keeping track of sequence numbers and acknowledgements in
/// both directions.
#[derive(Debug)]
pub struct BtpEngine {
    rx_state: BtpState,
    rx_length: u16,
    rx_buf: Vec<u8>,
    rx_next_seq_num: u8,
    rx_newest_unacked_seq_num: u8,
    rx_oldest_unacked_seq_num: u8,
    rx_fragment_size: u16,

    tx_state: BtpState,
    tx_buf: Vec<u8>,
    tx_offset: usize,
    tx_packet: heapless::Vec<u8, MAX_BTP_SEGMENT_SIZE>,
    tx_next_seq_num: u8,
    tx_newest_unacked_seq_num: u8,
    tx_oldest_unacked_seq_num: u8,
    expecting_ack: bool,
    tx_fragment_size: u16,
}

impl BtpEngine {
    pub const fn new() -> Self {
        Self {
            rx_state: BtpState::Idle,
            rx_length: 0,
            rx_buf: Vec::new(),
            rx_next_seq_num: 0,
            rx_newest_unacked_seq_num: 0,
            rx_oldest_unacked_seq_num: 0,
            rx_fragment_size: DEFAULT_FRAGMENT_SIZE,
            tx_state: BtpState::Idle,
            tx_buf: Vec::new(),
            tx_offset: 0,
            tx_packet: heapless::Vec::new(),
            tx_next_seq_num: 0,
            tx_newest_unacked_seq_num: 0,
            tx_oldest_unacked_seq_num: 0,
            expecting_ack: false,
            tx_fragment_size: DEFAULT_FRAGMENT_SIZE,
        }
    }

    /// Reset the engine for a new connection.
    ///
    /// The handshake exchange implicitly uses sequence number 0 of the
    /// peripheral-to-central direction: the peripheral (`expect_first_ack = true`)
    /// treats its capabilities response as sent and awaiting an ack, while the
    /// central treats it as received and owes the ack.
    pub fn init(&mut self, expect_first_ack: bool) {
        *self = Self::new();

        if expect_first_ack {
            self.tx_next_seq_num = 1;
            self.expecting_ack = true;
        } else {
            self.rx_next_seq_num = 1;
        }
    }

    pub fn rx_state(&self) -> BtpState {
        self.rx_state
    }

    pub fn tx_state(&self) -> BtpState {
        self.tx_state
    }

    pub fn rx_fragment_size(&self) -> u16 {
        self.rx_fragment_size
    }

    pub fn tx_fragment_size(&self) -> u16 {
        self.tx_fragment_size
    }

    pub fn set_rx_fragment_size(&mut self, size: u16) {
        self.rx_fragment_size = size.min(MAX_BTP_SEGMENT_SIZE as u16);
    }

    pub fn set_tx_fragment_size(&mut self, size: u16) {
        self.tx_fragment_size = size.min(MAX_BTP_SEGMENT_SIZE as u16);
    }

    /// Return `true` if fragments were received which we have not acknowledged yet.
    pub fn has_unacked_data(&self) -> bool {
        self.rx_oldest_unacked_seq_num != self.rx_next_seq_num
    }

    /// Return `true` if fragments were sent which the peer has not acknowledged yet.
    pub fn expecting_ack(&self) -> bool {
        self.expecting_ack
    }

    pub fn newest_unacked_sent_seq_num(&self) -> u8 {
        self.tx_newest_unacked_seq_num
    }

    fn get_and_increment_next_tx_seq_num(&mut self) -> u8 {
        let seq_num = self.tx_next_seq_num;

        if !self.expecting_ack {
            self.expecting_ack = true;
            self.tx_oldest_unacked_seq_num = seq_num;
        }

        self.tx_newest_unacked_seq_num = seq_num;
        self.tx_next_seq_num = seq_num.wrapping_add(1);

        seq_num
    }

    fn get_and_record_rx_ack_seq_num(&mut self) -> u8 {
        self.rx_oldest_unacked_seq_num = self.rx_next_seq_num;

        self.rx_newest_unacked_seq_num
    }

    fn is_valid_ack(&self, ack_num: u8) -> bool {
        if !self.expecting_ack {
            return false;
        }

        if self.tx_newest_unacked_seq_num >= self.tx_oldest_unacked_seq_num {
            (self.tx_oldest_unacked_seq_num..=self.tx_newest_unacked_seq_num).contains(&ack_num)
        } else {
            // The unacked range wraps around
            ack_num >= self.tx_oldest_unacked_seq_num || ack_num <= self.tx_newest_unacked_seq_num
        }
    }

    fn handle_ack_received(&mut self, ack_num: u8) -> Result<(), Error> {
        if !self.is_valid_ack(ack_num) {
            warn!(
                "Invalid ack {}, unacked range [{}, {}], expecting ack: {}",
                ack_num,
                self.tx_oldest_unacked_seq_num,
                self.tx_newest_unacked_seq_num,
                self.expecting_ack
            );
            Err(ErrorCode::InvalidAck)?;
        }

        if ack_num == self.tx_newest_unacked_seq_num {
            self.expecting_ack = false;
        }

        self.tx_oldest_unacked_seq_num = ack_num.wrapping_add(1);

        Ok(())
    }

    /// Process one inbound fragment.
    ///
    /// Returns the acknowledgement number carried by the fragment, if any.
    /// On error the rx side enters `BtpState::Error`.
    pub fn handle_characteristic_received(&mut self, data: &[u8]) -> Result<Option<u8>, Error> {
        let result = self.receive(data);

        if let Err(err) = &result {
            warn!("Failed to process inbound fragment: {}", err);
            self.rx_state = BtpState::Error;
        }

        result
    }

    fn receive(&mut self, data: &[u8]) -> Result<Option<u8>, Error> {
        let data = &data[..data.len().min(self.rx_fragment_size as usize)];

        let hdr = BtpHdr::from(data.iter().copied())?;

        if hdr.is_handshake() {
            Err(ErrorCode::InvalidHeaderFlags)?;
        }

        let ack_num = hdr.get_ack();
        if let Some(ack_num) = ack_num {
            self.handle_ack_received(ack_num)?;
        }

        let seq_num = hdr.get_seq().ok_or(ErrorCode::InvalidHeaderFlags)?;
        if seq_num != self.rx_next_seq_num {
            warn!(
                "Unexpected sequence number {}, expected {}",
                seq_num, self.rx_next_seq_num
            );
            Err(ErrorCode::InvalidSequenceNumber)?;
        }

        self.rx_newest_unacked_seq_num = seq_num;
        self.rx_next_seq_num = seq_num.wrapping_add(1);

        if hdr.is_standalone_ack() {
            trace!("Stand-alone ack {:?}, seq {}", ack_num, seq_num);
            return Ok(ack_num);
        }

        let payload = &data[hdr.len()..];

        match self.rx_state {
            BtpState::Idle => {
                let msg_len = hdr.get_msg_len().ok_or(ErrorCode::InvalidHeaderFlags)?;

                self.rx_length = msg_len;
                self.rx_buf.clear();
                self.rx_buf.reserve(msg_len as usize);
                self.rx_state = BtpState::InProgress;
                self.append_rx(&hdr, payload)?;
            }
            BtpState::InProgress => {
                if hdr.is_beginning() || !(hdr.is_continue() || hdr.is_final()) {
                    Err(ErrorCode::InvalidHeaderFlags)?;
                }

                self.append_rx(&hdr, payload)?;
            }
            BtpState::Complete | BtpState::Error => {
                Err(ErrorCode::ReassemblerIncorrectState)?;
            }
        }

        if hdr.is_final() {
            // The last fragment might carry trailing padding
            self.rx_buf.truncate(self.rx_length as usize);

            if self.rx_buf.len() != self.rx_length as usize {
                warn!(
                    "Reassembled {} bytes, message length is {}",
                    self.rx_buf.len(),
                    self.rx_length
                );
                Err(ErrorCode::ReassemblerMissingData)?;
            }

            debug!("Reassembled message of {} bytes", self.rx_length);
            self.rx_state = BtpState::Complete;
        }

        Ok(ack_num)
    }

    /// Only the ending segment may carry bytes past the declared message length (padding).
    fn append_rx(&mut self, hdr: &BtpHdr, payload: &[u8]) -> Result<(), Error> {
        if !hdr.is_final() && self.rx_buf.len() + payload.len() > self.rx_length as usize {
            warn!(
                "Fragment overflows message: {} + {} bytes, message length is {}",
                self.rx_buf.len(),
                payload.len(),
                self.rx_length
            );
            Err(ErrorCode::MessageTooLong)?;
        }

        self.rx_buf.extend_from_slice(payload);

        Ok(())
    }

    /// Take the reassembled message out of the engine, returning the rx side to `Idle`.
    pub fn take_rx_packet(&mut self) -> Option<Vec<u8>> {
        if self.rx_state == BtpState::Complete {
            self.rx_state = BtpState::Idle;
            self.rx_length = 0;
            Some(core::mem::take(&mut self.rx_buf))
        } else {
            None
        }
    }

    /// Produce the next outbound fragment.
    ///
    /// `msg` must be `Some` when the tx side is idle (starting a new message) and `None`
    /// when continuing a message in progress. If `send_ack` is `true`, the fragment
    /// piggybacks an acknowledgement of all data received so far.
    ///
    /// The fragment is available via `borrow_tx_packet` until the next call.
    pub fn handle_characteristic_send(
        &mut self,
        msg: Option<Vec<u8>>,
        send_ack: bool,
    ) -> Result<(), Error> {
        let mut hdr = BtpHdr::new();

        match (self.tx_state, msg) {
            (BtpState::Idle, Some(msg)) => {
                let msg_len = u16::try_from(msg.len()).map_err(|_| ErrorCode::MessageTooLong)?;

                self.tx_buf = msg;
                self.tx_offset = 0;

                hdr.set_msg_len(msg_len);
            }
            (BtpState::InProgress, None) => {
                hdr.set_continue();
            }
            (state, _) => {
                warn!("Cannot send fragment in tx state {:?}", state);
                Err(ErrorCode::InvalidState)?;
            }
        }

        if send_ack {
            let ack_num = self.get_and_record_rx_ack_seq_num();
            hdr.set_ack(Some(ack_num));
        }

        hdr.set_seq(self.get_and_increment_next_tx_seq_num());

        let remaining = self.tx_buf.len() - self.tx_offset;
        let room = (self.tx_fragment_size as usize).saturating_sub(hdr.len());

        if room == 0 && remaining > 0 {
            Err(ErrorCode::InvalidFragmentSize)?;
        }

        let chunk = if remaining <= room {
            hdr.set_final();
            self.tx_state = BtpState::Complete;
            remaining
        } else {
            self.tx_state = BtpState::InProgress;
            room
        };

        self.tx_packet.clear();
        self.tx_packet
            .resize_default(hdr.len() + chunk)
            .map_err(|_| ErrorCode::NoSpace)?;

        let mut wb = WriteBuf::new(&mut self.tx_packet);
        hdr.encode(&mut wb)?;
        wb.append(&self.tx_buf[self.tx_offset..self.tx_offset + chunk])?;

        self.tx_offset += chunk;

        trace!(
            "Fragment {}: {} of {} bytes sent",
            hdr,
            self.tx_offset,
            self.tx_buf.len()
        );

        Ok(())
    }

    /// The last fragment produced by `handle_characteristic_send`.
    pub fn borrow_tx_packet(&self) -> &[u8] {
        &self.tx_packet
    }

    /// Take the fully sent message out of the engine, returning the tx side to `Idle`.
    pub fn take_tx_packet(&mut self) -> Option<Vec<u8>> {
        if self.tx_state == BtpState::Complete {
            self.tx_state = BtpState::Idle;
            self.tx_offset = 0;
            Some(core::mem::take(&mut self.tx_buf))
        } else {
            None
        }
    }

    /// Encode a stand-alone acknowledgement of all data received so far.
    ///
    /// Consumes a tx sequence number, so the ack itself must be acknowledged by the peer.
    pub fn encode_standalone_ack(&mut self) -> [u8; STANDALONE_ACK_LEN] {
        let ack_num = self.get_and_record_rx_ack_seq_num();
        let seq_num = self.get_and_increment_next_tx_seq_num();

        packet::encode_standalone_ack(ack_num, seq_num)
    }

    /// Log the sequence numbers of both directions.
    pub fn log_state(&self) {
        debug!(
            "rx: {:?} next {} unacked [{}, {}]; tx: {:?} next {} unacked [{}, {}] expecting ack {}",
            self.rx_state,
            self.rx_next_seq_num,
            self.rx_oldest_unacked_seq_num,
            self.rx_newest_unacked_seq_num,
            self.tx_state,
            self.tx_next_seq_num,
            self.tx_oldest_unacked_seq_num,
            self.tx_newest_unacked_seq_num,
            self.expecting_ack
        );
    }
}

impl Default for BtpEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engines(fragment_size: u16) -> (BtpEngine, BtpEngine) {
        let mut central = BtpEngine::new();
        central.init(false);
        central.set_rx_fragment_size(fragment_size);
        central.set_tx_fragment_size(fragment_size);

        let mut peripheral = BtpEngine::new();
        peripheral.init(true);
        peripheral.set_rx_fragment_size(fragment_size);
        peripheral.set_tx_fragment_size(fragment_size);

        (central, peripheral)
    }

    #[test]
    fn test_init() {
        let (central, peripheral) = engines(20);

        assert!(central.has_unacked_data());
        assert!(!central.expecting_ack());
        assert!(!peripheral.has_unacked_data());
        assert!(peripheral.expecting_ack());
        assert_eq!(peripheral.newest_unacked_sent_seq_num(), 0);
    }

    #[test]
    fn test_single_fragment_boundary() {
        let (mut central, mut peripheral) = engines(20);

        // 20 - (flags + ack + seq + len) = 15 bytes fit
        central
            .handle_characteristic_send(Some(vec![0xaa; 15]), true)
            .unwrap();
        assert_eq!(central.tx_state(), BtpState::Complete);
        assert_eq!(central.borrow_tx_packet().len(), 20);
        assert_eq!(&central.borrow_tx_packet()[..5], [0x0d, 0, 0, 15, 0]);
        assert!(!central.has_unacked_data());

        assert_eq!(
            peripheral
                .handle_characteristic_received(central.borrow_tx_packet())
                .unwrap(),
            Some(0)
        );
        assert!(!peripheral.expecting_ack());
        assert_eq!(peripheral.rx_state(), BtpState::Complete);
        assert_eq!(peripheral.take_rx_packet().unwrap(), vec![0xaa; 15]);
        assert_eq!(peripheral.rx_state(), BtpState::Idle);
        assert_eq!(central.take_tx_packet().unwrap(), vec![0xaa; 15]);
    }

    #[test]
    fn test_one_byte_over() {
        let (mut central, mut peripheral) = engines(20);

        central
            .handle_characteristic_send(Some(vec![0x55; 16]), true)
            .unwrap();
        assert_eq!(central.tx_state(), BtpState::InProgress);
        assert_eq!(central.borrow_tx_packet()[0], 0x09);
        peripheral
            .handle_characteristic_received(central.borrow_tx_packet())
            .unwrap();
        assert_eq!(peripheral.rx_state(), BtpState::InProgress);

        central.handle_characteristic_send(None, false).unwrap();
        assert_eq!(central.tx_state(), BtpState::Complete);
        assert_eq!(central.borrow_tx_packet(), [0x06, 1, 0x55]);
        peripheral
            .handle_characteristic_received(central.borrow_tx_packet())
            .unwrap();

        assert_eq!(peripheral.take_rx_packet().unwrap(), vec![0x55; 16]);
        assert!(peripheral.has_unacked_data());
    }

    #[test]
    fn test_zero_length() {
        let (mut central, mut peripheral) = engines(20);

        central.handle_characteristic_send(Some(vec![]), false).unwrap();
        assert_eq!(central.tx_state(), BtpState::Complete);
        assert_eq!(central.borrow_tx_packet(), [0x05, 0, 0, 0]);

        peripheral
            .handle_characteristic_received(central.borrow_tx_packet())
            .unwrap();
        assert_eq!(peripheral.take_rx_packet().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_multi_fragment_with_padding() {
        let (mut central, mut peripheral) = engines(20);
        let msg = (0..40u8).collect::<Vec<_>>();

        central.handle_characteristic_send(Some(msg.clone()), false).unwrap();
        loop {
            let mut fragment = central.borrow_tx_packet().to_vec();
            if central.tx_state() == BtpState::Complete {
                // Trailing padding beyond the message length is ignored
                fragment.extend_from_slice(&[0xff, 0xff]);
            }

            peripheral.handle_characteristic_received(&fragment).unwrap();

            if central.tx_state() == BtpState::Complete {
                break;
            }

            central.handle_characteristic_send(None, false).unwrap();
        }

        assert_eq!(peripheral.take_rx_packet().unwrap(), msg);
    }

    #[test]
    fn test_message_too_long() {
        let (mut central, _) = engines(20);

        let err = central
            .handle_characteristic_send(Some(vec![0; u16::MAX as usize + 1]), false)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MessageTooLong);
        assert_eq!(central.tx_state(), BtpState::Idle);
    }

    #[test]
    fn test_invalid_sequence_number() {
        let (_, mut peripheral) = engines(20);

        let err = peripheral
            .handle_characteristic_received(&[0x05, 1, 0, 0])
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidSequenceNumber);
        assert_eq!(peripheral.rx_state(), BtpState::Error);
    }

    #[test]
    fn test_invalid_ack() {
        let (_, mut peripheral) = engines(20);

        // Only seq 0 is unacked
        let err = peripheral
            .handle_characteristic_received(&[0x08, 3, 0])
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidAck);
    }

    #[test]
    fn test_missing_beginning() {
        let (_, mut peripheral) = engines(20);

        let err = peripheral
            .handle_characteristic_received(&[0x04, 0, 1, 2])
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidHeaderFlags);
    }

    #[test]
    fn test_missing_data() {
        let (_, mut peripheral) = engines(20);

        let err = peripheral
            .handle_characteristic_received(&[0x05, 0, 5, 0, 1, 2])
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ReassemblerMissingData);
    }

    #[test]
    fn test_fragment_overflows_message() {
        let (_, mut peripheral) = engines(20);

        // Beginning segment declaring a 2-byte message already carrying 3 bytes
        let err = peripheral
            .handle_characteristic_received(&[0x01, 0, 2, 0, 1, 2, 3])
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MessageTooLong);
        assert_eq!(peripheral.rx_state(), BtpState::Error);

        let (_, mut peripheral) = engines(20);

        peripheral
            .handle_characteristic_received(&[0x01, 0, 1, 0, 0xaa])
            .unwrap();
        let err = peripheral
            .handle_characteristic_received(&[0x02, 1, 0xaa, 0xaa])
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MessageTooLong);
        assert!(peripheral.take_rx_packet().is_none());
    }

    #[test]
    fn test_final_fragment_padding() {
        let (_, mut peripheral) = engines(20);

        peripheral
            .handle_characteristic_received(&[0x01, 0, 3, 0, 1, 2])
            .unwrap();
        peripheral
            .handle_characteristic_received(&[0x04, 1, 3, 0, 0, 0])
            .unwrap();
        assert_eq!(peripheral.take_rx_packet().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_standalone_ack() {
        let (mut central, mut peripheral) = engines(20);

        let ack = central.encode_standalone_ack();
        assert_eq!(ack, [0x08, 0, 0]);
        assert!(!central.has_unacked_data());
        assert!(central.expecting_ack());

        assert_eq!(
            peripheral.handle_characteristic_received(&ack).unwrap(),
            Some(0)
        );
        assert!(!peripheral.expecting_ack());
        assert!(peripheral.has_unacked_data());
        assert_eq!(peripheral.rx_state(), BtpState::Idle);
    }

    #[test]
    fn test_sequence_wrap() {
        let (mut central, mut peripheral) = engines(20);

        for round in 0..300u32 {
            central
                .handle_characteristic_send(Some(vec![round as u8]), true)
                .unwrap();
            peripheral
                .handle_characteristic_received(central.borrow_tx_packet())
                .unwrap();
            central.take_tx_packet().unwrap();
            peripheral.take_rx_packet().unwrap();

            let ack = peripheral.encode_standalone_ack();
            central.handle_characteristic_received(&ack).unwrap();
            assert!(!central.expecting_ack());
        }
    }
}
