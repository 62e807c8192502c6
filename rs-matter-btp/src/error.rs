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

use core::{array::TryFromSliceError, fmt};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorCode {
    // Generic
    BufferTooSmall,
    Invalid,
    InvalidArgument,
    InvalidData,
    InvalidState,
    NoEndPoint,
    NoSpace,
    StdIoError,
    RwLock,
    // Handshake
    IncompatibleProtocolVersions,
    InvalidMessage,
    InvalidFragmentSize,
    // Fragmentation and reassembly
    InvalidAck,
    InvalidSequenceNumber,
    InvalidHeaderFlags,
    ReassemblerMissingData,
    ReassemblerIncorrectState,
    MessageTooLong,
    ProtocolAbort,
    // GATT
    GattWriteFailed,
    GattIndicateFailed,
    GattSubscribeFailed,
    GattUnsubscribeFailed,
    // Timers
    StartTimerFailed,
    ConnectTimedOut,
    ReceiveTimedOut,
    FragmentAckTimedOut,
    // Connection teardown
    RemoteDeviceDisconnected,
    CentralUnsubscribed,
    AppClosedConnection,
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Self::new(code)
    }
}

pub struct Error {
    code: ErrorCode,
    #[cfg(all(feature = "std", feature = "backtrace"))]
    backtrace: std::backtrace::Backtrace,
    #[cfg(all(feature = "std", feature = "backtrace"))]
    inner: Option<std::boxed::Box<dyn std::error::Error + Send>>,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            #[cfg(all(feature = "std", feature = "backtrace"))]
            backtrace: std::backtrace::Backtrace::capture(),
            #[cfg(all(feature = "std", feature = "backtrace"))]
            inner: None,
        }
    }

    #[cfg(all(feature = "std", feature = "backtrace"))]
    pub fn new_with_details(
        code: ErrorCode,
        detailed_err: std::boxed::Box<dyn std::error::Error + Send>,
    ) -> Self {
        Self {
            code,
            backtrace: std::backtrace::Backtrace::capture(),
            inner: Some(detailed_err),
        }
    }

    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    #[cfg(all(feature = "std", feature = "backtrace"))]
    pub const fn backtrace(&self) -> &std::backtrace::Backtrace {
        &self.backtrace
    }

    #[cfg(all(feature = "std", feature = "backtrace"))]
    pub fn details(&self) -> Option<&(dyn std::error::Error + Send)> {
        self.inner.as_ref().map(|err| err.as_ref())
    }

    pub fn remap<F>(self, matcher: F, to: Self) -> Self
    where
        F: FnOnce(&Self) -> bool,
    {
        if matcher(&self) {
            to
        } else {
            self
        }
    }

    /// Collapse decoding failures of a handshake payload into `ErrorCode::InvalidMessage`.
    pub fn map_invalid_message(self) -> Self {
        self.remap(
            |e| {
                matches!(
                    e.code(),
                    ErrorCode::Invalid | ErrorCode::InvalidData | ErrorCode::BufferTooSmall
                )
            },
            Error::new(ErrorCode::InvalidMessage),
        )
    }

    /// Return `true` if the error means the underlying BLE connection is already gone,
    /// so that it must not be released (closed or handed back to the application) again.
    pub fn is_connection_gone(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::RemoteDeviceDisconnected | ErrorCode::AppClosedConnection
        )
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Self::new(self.code)
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

impl Eq for Error {}

#[cfg(all(feature = "std", feature = "backtrace"))]
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::new_with_details(ErrorCode::StdIoError, std::boxed::Box::new(e))
    }
}

#[cfg(all(feature = "std", not(feature = "backtrace")))]
impl From<std::io::Error> for Error {
    fn from(_e: std::io::Error) -> Self {
        Self::new(ErrorCode::StdIoError)
    }
}

#[cfg(feature = "std")]
impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_e: std::sync::PoisonError<T>) -> Self {
        Self::new(ErrorCode::RwLock)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(_e: TryFromSliceError) -> Self {
        Self::new(ErrorCode::Invalid)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[cfg(not(all(feature = "std", feature = "backtrace")))]
        {
            write!(f, "Error::{}", self)?;
        }

        #[cfg(all(feature = "std", feature = "backtrace"))]
        {
            writeln!(f, "Error::{} {{", self)?;
            write!(f, "{}", self.backtrace())?;
            writeln!(f, "}}")?;
        }

        Ok(())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[cfg(all(feature = "std", feature = "backtrace"))]
        {
            match self.inner.as_ref() {
                Some(err) => write!(f, "{:?}: {}", self.code(), err),
                None => write!(f, "{:?}", self.code()),
            }
        }
        #[cfg(not(all(feature = "std", feature = "backtrace")))]
        {
            write!(f, "{:?}", self.code())
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_invalid_message() {
        let err: Error = ErrorCode::Invalid.into();
        assert_eq!(err.map_invalid_message().code(), ErrorCode::InvalidMessage);

        let err: Error = ErrorCode::GattWriteFailed.into();
        assert_eq!(
            err.map_invalid_message().code(),
            ErrorCode::GattWriteFailed
        );
    }

    #[test]
    fn test_connection_gone() {
        assert!(Error::new(ErrorCode::RemoteDeviceDisconnected).is_connection_gone());
        assert!(Error::new(ErrorCode::AppClosedConnection).is_connection_gone());
        assert!(!Error::new(ErrorCode::ConnectTimedOut).is_connection_gone());
    }
}
