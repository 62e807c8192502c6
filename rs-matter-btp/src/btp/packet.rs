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

//! Wire formats of the BTP protocol: the fragment header, the handshake
//! (capabilities) request and response, and the stand-alone acknowledgement.

use core::fmt;

use bitflags::bitflags;

use log::trace;

use crate::error::{Error, ErrorCode};
use crate::utils::writebuf::WriteBuf;

use super::{MAX_SUPPORTED_PROTOCOL_VERSION, MIN_SUPPORTED_PROTOCOL_VERSION, PROTOCOL_VERSION_NONE};

/// Management opcode carried by both handshake messages.
pub const HANDSHAKE_OPCODE: u8 = 0x6C;

/// Encoded length of a capabilities request, header included.
pub const CAPABILITIES_REQUEST_LEN: usize = 9;
/// Encoded length of a capabilities response, header included.
pub const CAPABILITIES_RESPONSE_LEN: usize = 6;
/// Encoded length of a stand-alone acknowledgement.
pub const STANDALONE_ACK_LEN: usize = 3;

/// Number of version slots (nibbles) in a capabilities request.
pub const NUM_SUPPORTED_PROTOCOL_VERSIONS: usize = 8;

bitflags! {
    /// Models the flags in the BTP header.
    ///
    /// Consult the Matter Core Specification for more information.
    #[repr(transparent)]
    #[derive(Default, Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct BtpFlags: u8 {
        const HANDSHAKE = 0x40;
        const MANAGEMENT = 0x20;
        const ACK = 0x08;
        const ENDING_SEGMENT = 0x04;
        // Not documented in the Matter Core Spec, but used by all implementations
        const CONTINUE = 0x02;
        const BEGINNING_SEGMENT = 0x01;
    }
}

impl fmt::Display for BtpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = false;
        for (flag, str) in [
            (Self::HANDSHAKE, "H"),
            (Self::MANAGEMENT, "M"),
            (Self::ACK, "A"),
            (Self::BEGINNING_SEGMENT, "B"),
            (Self::CONTINUE, "C"),
            (Self::ENDING_SEGMENT, "E"),
        ] {
            if self.contains(flag) {
                if sep {
                    write!(f, "|")?;
                }

                write!(f, "{}", str)?;
                sep = true;
            }
        }

        Ok(())
    }
}

/// Models the BTP header.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BtpHdr {
    flags: BtpFlags,
    opcode: u8,
    ack_num: u8,
    seq_num: u8,
    msg_len: u16,
}

impl BtpHdr {
    /// Create a new, empty BTP header.
    #[inline(always)]
    pub const fn new() -> Self {
        Self {
            flags: BtpFlags::empty(),
            opcode: 0,
            ack_num: 0,
            seq_num: 0,
            msg_len: 0,
        }
    }

    /// Decode a BTP header from an iterator of bytes.
    pub fn from<I>(msg: I) -> Result<Self, Error>
    where
        I: Iterator<Item = u8>,
    {
        let mut hdr = Self::new();

        hdr.decode(msg)?;

        Ok(hdr)
    }

    pub fn flags(&self) -> BtpFlags {
        self.flags
    }

    /// Return `true` if the BTP header indicates a handshake message (request or response).
    pub fn is_handshake(&self) -> bool {
        self.flags.contains(BtpFlags::HANDSHAKE)
    }

    /// Set the BTP header to indicate a handshake message (request or response).
    pub fn set_handshake(&mut self) {
        self.flags |= BtpFlags::HANDSHAKE
            | BtpFlags::MANAGEMENT
            | BtpFlags::BEGINNING_SEGMENT
            | BtpFlags::ENDING_SEGMENT;
        self.opcode = HANDSHAKE_OPCODE;
    }

    /// Get the opcode from the BTP header.
    /// An opcode will be present only if the header indicates a management message.
    pub fn get_opcode(&self) -> Option<u8> {
        self.flags
            .contains(BtpFlags::MANAGEMENT)
            .then_some(self.opcode)
    }

    /// Get the acknowledgement number from the BTP header.
    pub fn get_ack(&self) -> Option<u8> {
        self.flags.contains(BtpFlags::ACK).then_some(self.ack_num)
    }

    /// Set (or clear) the acknowledgement number in the BTP header.
    /// This automatically marks/unmarks the message with the acknowledgement flag.
    pub fn set_ack(&mut self, ack_num: Option<u8>) {
        if let Some(ack_num) = ack_num {
            self.flags |= BtpFlags::ACK;
            self.ack_num = ack_num;
        } else {
            self.flags.remove(BtpFlags::ACK);
            self.ack_num = 0;
        }
    }

    /// Get the sequence number from the BTP header.
    /// A sequence number will be present only if the header does not indicate a handshake message.
    pub fn get_seq(&self) -> Option<u8> {
        (!self.flags.contains(BtpFlags::HANDSHAKE)).then_some(self.seq_num)
    }

    pub fn set_seq(&mut self, seq_num: u8) {
        self.flags.remove(BtpFlags::HANDSHAKE);
        self.seq_num = seq_num;
    }

    /// Return `true` if the header carries no message data, only an acknowledgement.
    pub fn is_standalone_ack(&self) -> bool {
        !self.is_handshake()
            && self.flags.contains(BtpFlags::ACK)
            && !self.flags.intersects(
                BtpFlags::BEGINNING_SEGMENT | BtpFlags::CONTINUE | BtpFlags::ENDING_SEGMENT,
            )
    }

    /// Get the message length from the BTP header.
    /// A message length will be present only on the beginning segment of a non-handshake message.
    pub fn get_msg_len(&self) -> Option<u16> {
        (self.flags.contains(BtpFlags::BEGINNING_SEGMENT)
            && !self.flags.contains(BtpFlags::HANDSHAKE))
        .then_some(self.msg_len)
    }

    /// Mark the header as the beginning segment of a message of `msg_len` bytes.
    pub fn set_msg_len(&mut self, msg_len: u16) {
        self.flags |= BtpFlags::BEGINNING_SEGMENT;
        self.msg_len = msg_len;
    }

    pub fn is_beginning(&self) -> bool {
        self.flags.contains(BtpFlags::BEGINNING_SEGMENT)
    }

    pub fn is_continue(&self) -> bool {
        self.flags.contains(BtpFlags::CONTINUE)
    }

    pub fn set_continue(&mut self) {
        self.flags |= BtpFlags::CONTINUE;
    }

    /// Return `true` if the BTP header indicates the final segment of a message.
    pub fn is_final(&self) -> bool {
        self.flags.contains(BtpFlags::ENDING_SEGMENT)
    }

    pub fn set_final(&mut self) {
        self.flags |= BtpFlags::ENDING_SEGMENT;
    }

    fn decode<I>(&mut self, mut msg: I) -> Result<(), Error>
    where
        I: Iterator<Item = u8>,
    {
        self.flags = BtpFlags::from_bits_truncate(msg.next().ok_or(ErrorCode::Invalid)?);

        if self.flags.contains(BtpFlags::MANAGEMENT) {
            self.opcode = msg.next().ok_or(ErrorCode::Invalid)?;
        }

        if self.flags.contains(BtpFlags::ACK) {
            self.ack_num = msg.next().ok_or(ErrorCode::Invalid)?;
        }

        if !self.flags.contains(BtpFlags::HANDSHAKE) {
            self.seq_num = msg.next().ok_or(ErrorCode::Invalid)?;
        }

        if self.flags.contains(BtpFlags::BEGINNING_SEGMENT)
            && !self.flags.contains(BtpFlags::HANDSHAKE)
        {
            let msg_len = [
                msg.next().ok_or(ErrorCode::Invalid)?,
                msg.next().ok_or(ErrorCode::Invalid)?,
            ];

            self.msg_len = u16::from_le_bytes(msg_len);
        }

        trace!("[decode] {}", self);
        Ok(())
    }

    /// Encode the header into a byte buffer.
    pub fn encode(&self, buf: &mut WriteBuf) -> Result<(), Error> {
        trace!("[encode] {}", self);

        buf.le_u8(self.flags.bits())?;

        if self.flags.contains(BtpFlags::MANAGEMENT) {
            buf.le_u8(self.opcode)?;
        }

        if self.flags.contains(BtpFlags::ACK) {
            buf.le_u8(self.ack_num)?;
        }

        if !self.flags.contains(BtpFlags::HANDSHAKE) {
            buf.le_u8(self.seq_num)?;
        }

        if self.flags.contains(BtpFlags::BEGINNING_SEGMENT)
            && !self.flags.contains(BtpFlags::HANDSHAKE)
        {
            buf.le_u16(self.msg_len)?;
        }

        Ok(())
    }

    /// Return the length of the encoded header in bytes.
    pub fn len(&self) -> usize {
        let mut len = 1; // Flags

        if self.flags.contains(BtpFlags::MANAGEMENT) {
            len += 1;
        }

        if self.flags.contains(BtpFlags::ACK) {
            len += 1;
        }

        if !self.flags.contains(BtpFlags::HANDSHAKE) {
            len += 1;
        }

        if self.flags.contains(BtpFlags::BEGINNING_SEGMENT)
            && !self.flags.contains(BtpFlags::HANDSHAKE)
        {
            len += 2;
        }

        len
    }

    fn check_handshake(&self) -> Result<(), Error> {
        if self.is_handshake()
            && self.get_opcode() == Some(HANDSHAKE_OPCODE)
            && self.is_beginning()
            && self.is_final()
        {
            Ok(())
        } else {
            Err(ErrorCode::InvalidMessage.into())
        }
    }
}

impl fmt::Display for BtpHdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.flags.is_empty() {
            write!(f, "{}", self.flags)?;
        }

        if let Some(opcode) = self.get_opcode() {
            write!(f, ",OP:{:x}", opcode)?;
        }

        if let Some(ack_num) = self.get_ack() {
            write!(f, ",ACTR:{:x}", ack_num)?;
        }

        if let Some(seq_num) = self.get_seq() {
            write!(f, ",CTR:{:x}", seq_num)?;
        }

        if let Some(msg_len) = self.get_msg_len() {
            write!(f, ",LEN:{:x}", msg_len)?;
        }

        Ok(())
    }
}

/// Models the BTP handshake request, sent by the central over `C1`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CapabilitiesRequest {
    /// Supported versions, one per nibble; slot 0 is the low nibble of the first byte.
    versions: u32,
    /// The ATT MTU observed by the central. 0 means "unknown".
    pub mtu: u16,
    /// The receive window size the central offers.
    pub window_size: u8,
}

impl CapabilitiesRequest {
    pub const fn new(mtu: u16, window_size: u8) -> Self {
        Self {
            versions: 0,
            mtu,
            window_size,
        }
    }

    /// Decode a capabilities request from the complete handshake packet.
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        Self::decode_inner(data).map_err(Error::map_invalid_message)
    }

    fn decode_inner(data: &[u8]) -> Result<Self, Error> {
        if data.len() < CAPABILITIES_REQUEST_LEN {
            Err(ErrorCode::InvalidMessage)?;
        }

        let mut msg = data.iter().copied();

        BtpHdr::from(&mut msg)?.check_handshake()?;

        let versions = u32::from_le_bytes([
            msg.next().ok_or(ErrorCode::Invalid)?,
            msg.next().ok_or(ErrorCode::Invalid)?,
            msg.next().ok_or(ErrorCode::Invalid)?,
            msg.next().ok_or(ErrorCode::Invalid)?,
        ]);
        let mtu = u16::from_le_bytes([
            msg.next().ok_or(ErrorCode::Invalid)?,
            msg.next().ok_or(ErrorCode::Invalid)?,
        ]);
        let window_size = msg.next().ok_or(ErrorCode::Invalid)?;

        Ok(Self {
            versions,
            mtu,
            window_size,
        })
    }

    /// Set the version advertised in slot `index` (0..8).
    pub fn set_supported_version(&mut self, index: usize, version: u8) -> Result<(), Error> {
        if index >= NUM_SUPPORTED_PROTOCOL_VERSIONS || version > 0x0f {
            Err(ErrorCode::InvalidArgument)?;
        }

        let shift = index * 4;
        self.versions &= !(0x0f << shift);
        self.versions |= (version as u32) << shift;

        Ok(())
    }

    /// Return an iterator over the non-zero versions in the request, in slot order.
    pub fn versions(&self) -> impl Iterator<Item = u8> + '_ {
        (0..NUM_SUPPORTED_PROTOCOL_VERSIONS)
            .map(|index| ((self.versions >> (index * 4)) & 0x0f) as u8)
            .filter(|version| *version != PROTOCOL_VERSION_NONE)
    }

    /// Encode the complete handshake packet.
    pub fn encode(&self, buf: &mut WriteBuf) -> Result<(), Error> {
        let mut hdr = BtpHdr::new();
        hdr.set_handshake();
        hdr.encode(buf)?;

        buf.le_u32(self.versions)?;
        buf.le_u16(self.mtu)?;
        buf.le_u8(self.window_size)?;

        Ok(())
    }
}

/// Models the BTP handshake response, indicated by the peripheral over `C2`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CapabilitiesResponse {
    /// The version selected by the peripheral, or `PROTOCOL_VERSION_NONE`.
    pub selected_protocol_version: u8,
    /// The fragment size selected by the peripheral.
    pub fragment_size: u16,
    /// The window size selected by the peripheral.
    pub window_size: u8,
}

impl CapabilitiesResponse {
    /// Decode a capabilities response from the complete handshake packet.
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        Self::decode_inner(data).map_err(Error::map_invalid_message)
    }

    fn decode_inner(data: &[u8]) -> Result<Self, Error> {
        if data.len() < CAPABILITIES_RESPONSE_LEN {
            Err(ErrorCode::InvalidMessage)?;
        }

        let mut msg = data.iter().copied();

        BtpHdr::from(&mut msg)?.check_handshake()?;

        let selected_protocol_version = msg.next().ok_or(ErrorCode::Invalid)?;
        let fragment_size = u16::from_le_bytes([
            msg.next().ok_or(ErrorCode::Invalid)?,
            msg.next().ok_or(ErrorCode::Invalid)?,
        ]);
        let window_size = msg.next().ok_or(ErrorCode::Invalid)?;

        Ok(Self {
            selected_protocol_version,
            fragment_size,
            window_size,
        })
    }

    /// Encode the complete handshake packet.
    pub fn encode(&self, buf: &mut WriteBuf) -> Result<(), Error> {
        let mut hdr = BtpHdr::new();
        hdr.set_handshake();
        hdr.encode(buf)?;

        buf.le_u8(self.selected_protocol_version)?;
        buf.le_u16(self.fragment_size)?;
        buf.le_u8(self.window_size)?;

        Ok(())
    }
}

/// Return the highest version offered in `req` which this implementation supports,
/// or `PROTOCOL_VERSION_NONE` if there is none.
pub fn highest_supported_version(req: &CapabilitiesRequest) -> u8 {
    req.versions()
        .filter(|version| {
            (MIN_SUPPORTED_PROTOCOL_VERSION..=MAX_SUPPORTED_PROTOCOL_VERSION).contains(version)
        })
        .max()
        .unwrap_or(PROTOCOL_VERSION_NONE)
}

/// Encode a stand-alone acknowledgement packet.
pub fn encode_standalone_ack(ack_num: u8, seq_num: u8) -> [u8; STANDALONE_ACK_LEN] {
    [BtpFlags::ACK.bits(), ack_num, seq_num]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hdr_decode() {
        let hdr = BtpHdr::from([0x0d, 0x03, 0x07, 0x2a, 0x01].into_iter()).unwrap();

        assert_eq!(hdr.get_ack(), Some(3));
        assert_eq!(hdr.get_seq(), Some(7));
        assert_eq!(hdr.get_msg_len(), Some(0x012a));
        assert!(hdr.is_beginning());
        assert!(hdr.is_final());
        assert!(!hdr.is_standalone_ack());
        assert_eq!(hdr.len(), 5);

        let hdr = BtpHdr::from([0x08, 0x05, 0x06].into_iter()).unwrap();
        assert!(hdr.is_standalone_ack());
        assert_eq!(hdr.get_msg_len(), None);
        assert_eq!(hdr.len(), 3);

        // No segment flags and no ack carries nothing at all
        let hdr = BtpHdr::from([0x00, 0x05].into_iter()).unwrap();
        assert!(!hdr.is_standalone_ack());

        assert!(BtpHdr::from([0x01, 0x00, 0x10].into_iter()).is_err());
    }

    #[test]
    fn test_hdr_encode() {
        let mut hdr = BtpHdr::new();
        hdr.set_msg_len(300);
        hdr.set_ack(Some(9));
        hdr.set_seq(10);

        let mut buf = [0; 8];
        let mut wb = WriteBuf::new(&mut buf);
        hdr.encode(&mut wb).unwrap();

        assert_eq!(wb.as_slice(), [0x09, 9, 10, 0x2c, 0x01]);
        assert_eq!(hdr.len(), wb.as_slice().len());
        assert_eq!(format!("{}", hdr), "A|B,ACTR:9,CTR:a,LEN:12c");
    }

    #[test]
    fn test_capabilities_request() {
        let mut req = CapabilitiesRequest::new(185, 6);
        req.set_supported_version(0, 4).unwrap();
        req.set_supported_version(1, 3).unwrap();
        assert!(req.set_supported_version(8, 4).is_err());

        let mut buf = [0; CAPABILITIES_REQUEST_LEN];
        let mut wb = WriteBuf::new(&mut buf);
        req.encode(&mut wb).unwrap();

        assert_eq!(
            wb.as_slice(),
            [0x65, 0x6c, 0x34, 0x00, 0x00, 0x00, 0xb9, 0x00, 0x06]
        );

        let decoded = CapabilitiesRequest::decode(&buf).unwrap();
        assert_eq!(decoded, req);
        assert_eq!(decoded.versions().collect::<Vec<_>>(), [4, 3]);
        assert_eq!(highest_supported_version(&decoded), 4);
    }

    #[test]
    fn test_capabilities_request_malformed() {
        let err = CapabilitiesRequest::decode(&[0x65, 0x6c, 0x04]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidMessage);

        // Wrong opcode
        let err = CapabilitiesRequest::decode(&[0x65, 0x6d, 4, 0, 0, 0, 23, 0, 4]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidMessage);

        // Not a handshake at all
        let err = CapabilitiesRequest::decode(&[0x05, 0x00, 4, 0, 0, 0, 23, 0, 4]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidMessage);
    }

    #[test]
    fn test_no_common_version() {
        let mut req = CapabilitiesRequest::new(0, 4);
        req.set_supported_version(0, 3).unwrap();
        req.set_supported_version(1, 2).unwrap();

        assert_eq!(highest_supported_version(&req), PROTOCOL_VERSION_NONE);
        assert_eq!(
            highest_supported_version(&CapabilitiesRequest::new(0, 4)),
            PROTOCOL_VERSION_NONE
        );
    }

    #[test]
    fn test_capabilities_response() {
        let resp = CapabilitiesResponse {
            selected_protocol_version: 4,
            fragment_size: 244,
            window_size: 5,
        };

        let mut buf = [0; CAPABILITIES_RESPONSE_LEN];
        let mut wb = WriteBuf::new(&mut buf);
        resp.encode(&mut wb).unwrap();

        assert_eq!(wb.as_slice(), [0x65, 0x6c, 0x04, 0xf4, 0x00, 0x05]);
        assert_eq!(CapabilitiesResponse::decode(&buf).unwrap(), resp);

        let err = CapabilitiesResponse::decode(&buf[..5]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidMessage);
    }

    #[test]
    fn test_standalone_ack() {
        assert_eq!(encode_standalone_ack(0x11, 0x22), [0x08, 0x11, 0x22]);
    }
}
