// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport backend
//!
//! Forwards blocks straight to a live link instead of storing them. The
//! link's payload size is renegotiated at runtime and drops to 0 while
//! disconnected; the TDF logger above resizes its pending block to
//! match.

use crate::error::LoggerError;
use crate::logger::{BlockHeader, LoggerBackend};

/// Outbound link seam
pub trait Transport: Send {
    /// Current payload capacity per send, 0 while disconnected
    fn payload_size(&self) -> usize;
    fn send(&mut self, block_type: u8, payload: &[u8]) -> Result<(), LoggerError>;
}

/// Non-persistent block logger backend over a [`Transport`]
pub struct TransportBackend<T: Transport> {
    transport: T,
}

impl<T: Transport> TransportBackend<T> {
    pub fn new(transport: T) -> Self {
        TransportBackend { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

impl<T: Transport> LoggerBackend for TransportBackend<T> {
    fn logical_blocks(&self) -> u32 {
        u32::MAX
    }

    fn physical_blocks(&self) -> u32 {
        u32::MAX
    }

    fn block_size(&self) -> usize {
        self.transport.payload_size()
    }

    fn block_overhead(&self) -> usize {
        0
    }

    fn erase_blocks(&self) -> u32 {
        1
    }

    fn persistent(&self) -> bool {
        false
    }

    fn connected(&self) -> bool {
        self.transport.payload_size() > 0
    }

    fn read_header(&mut self, _phys: u32) -> Result<BlockHeader, LoggerError> {
        Err(LoggerError::Invalid)
    }

    fn write_block(
        &mut self,
        _phys: u32,
        header: BlockHeader,
        payload: &[u8],
    ) -> Result<(), LoggerError> {
        self.transport.send(header.block_type, payload)
    }

    fn read(&mut self, _phys: u32, _offset: usize, _out: &mut [u8]) -> Result<(), LoggerError> {
        Err(LoggerError::Invalid)
    }

    fn erase_range(&mut self, _phys: u32, _count: u32) -> Result<(), LoggerError> {
        Err(LoggerError::Invalid)
    }
}

/// Scriptable transport shared by the backend and TDF logger tests
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    pub(crate) inner: std::sync::Arc<parking_lot::Mutex<MockTransportState>>,
}

#[cfg(test)]
#[derive(Default)]
pub(crate) struct MockTransportState {
    pub(crate) payload_size: usize,
    pub(crate) sent: Vec<(u8, Vec<u8>)>,
}

#[cfg(test)]
impl Transport for MockTransport {
    fn payload_size(&self) -> usize {
        self.inner.lock().payload_size
    }

    fn send(&mut self, block_type: u8, payload: &[u8]) -> Result<(), LoggerError> {
        let mut state = self.inner.lock();
        if state.payload_size == 0 {
            return Err(LoggerError::NotConnected);
        }
        state.sent.push((block_type, payload.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::DataLogger;

    #[test]
    fn test_send_and_disconnect() {
        let transport = MockTransport::default();
        transport.inner.lock().payload_size = 32;
        let mut logger =
            DataLogger::new(TransportBackend::new(transport.clone())).expect("logger");

        logger.write(9, &[1, 2, 3]).expect("write");
        assert_eq!(logger.current_block(), 1);
        assert_eq!(logger.bytes_logged(), 3);
        assert_eq!(transport.inner.lock().sent, vec![(9, vec![1, 2, 3])]);

        transport.inner.lock().payload_size = 0;
        assert_eq!(logger.write(9, &[4]), Err(LoggerError::NotConnected));

        // No persistence: reads and erases are meaningless
        let mut out = [0u8; 4];
        assert_eq!(logger.read(0, 0, &mut out), Err(LoggerError::Invalid));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let transport = MockTransport::default();
        transport.inner.lock().payload_size = 8;
        let mut logger =
            DataLogger::new(TransportBackend::new(transport)).expect("logger");
        assert_eq!(logger.write(9, &[0u8; 9]), Err(LoggerError::Invalid));
    }
}
