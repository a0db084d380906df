#![forbid(unsafe_code)]

//! The Ethernet MAC/PHY driver contract consumed by the embernet stack.
//!
//! The chip driver (register banks, SPI opcodes, reset sequencing) lives
//! behind this trait. It owes the stack three things: a synchronous
//! [`EthernetDriver::send_frame`] that blocks until the transmit request is
//! accepted by the hardware, delivery of each fully-validated inbound frame
//! (CRC-checked, sanely sized) into `Adapter::frame_arrived`, and link
//! up/down notifications into `Adapter::link_changed`. While the link is
//! down, outbound frames are dropped, not queued.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    #[error("link is down")]
    LinkDown,
    #[error("transmit request timed out")]
    Timeout,
}

pub trait EthernetDriver: Send + Sync {
    /// Hands one complete Ethernet frame to the hardware.
    fn send_frame(&self, frame: &[u8]) -> Result<(), SendError>;

    /// Current PHY link state.
    fn link_up(&self) -> bool;
}

/// In-memory driver for tests: captures transmitted frames and lets the
/// test toggle link state.
#[derive(Default)]
pub struct TestDriver {
    frames: Mutex<VecDeque<Vec<u8>>>,
    link: AtomicBool,
}

impl TestDriver {
    pub fn new() -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            link: AtomicBool::new(true),
        }
    }

    pub fn set_link(&self, up: bool) {
        self.link.store(up, Ordering::SeqCst);
    }

    /// Removes and returns every frame transmitted so far, oldest first.
    pub fn drain_frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().drain(..).collect()
    }

    pub fn sent_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }
}

impl EthernetDriver for TestDriver {
    fn send_frame(&self, frame: &[u8]) -> Result<(), SendError> {
        if !self.link_up() {
            return Err(SendError::LinkDown);
        }
        self.frames.lock().unwrap().push_back(frame.to_vec());
        Ok(())
    }

    fn link_up(&self) -> bool {
        self.link.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_queues_in_order() {
        let driver = TestDriver::new();
        driver.send_frame(&[1]).unwrap();
        driver.send_frame(&[2, 2]).unwrap();
        assert_eq!(driver.sent_count(), 2);
        assert_eq!(driver.drain_frames(), vec![vec![1], vec![2, 2]]);
        assert_eq!(driver.sent_count(), 0);
    }

    #[test]
    fn down_link_drops_sends() {
        let driver = TestDriver::new();
        driver.set_link(false);
        assert_eq!(driver.send_frame(&[1]), Err(SendError::LinkDown));
        assert_eq!(driver.sent_count(), 0);
    }
}
