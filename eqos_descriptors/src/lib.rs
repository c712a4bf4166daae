//! Transmit and receive descriptor layouts for the EQOS DMA engine.
//!
//! Each descriptor is 16 bytes: four 32-bit words that both the driver and
//! the device read and write, so every field access goes through [`Volatile`].
//! A descriptor has two formats sharing the same memory: the *read* format
//! the driver programs, and the *write-back* format the hardware overwrites
//! it with on completion. Word 3 carries the OWN bit in both formats.
//!
//! The ownership handoff is the load-bearing part of this crate:
//! - the driver fills in words 0..=2 first, then a [`Release`] fence, then
//!   writes word 3 with OWN set, so the device can never observe a
//!   half-written descriptor;
//! - the driver treats a descriptor as completed only after reading word 3
//!   with OWN clear, followed by an [`Acquire`] fence, so the write-back
//!   fields it reads afterwards are the ones the device actually wrote.
//!
//! [`Release`]: Ordering::Release
//! [`Acquire`]: Ordering::Acquire

#![no_std]

use core::fmt;
use core::sync::atomic::{fence, Ordering};

use bit_field::BitField;
use static_assertions::const_assert_eq;
use volatile::Volatile;

use eqos_buffers::DeviceAddress;

/// Alignment required for the base of a descriptor ring, in bytes.
/// The DMA engine fetches descriptors in bus bursts of this size.
pub const RING_ALIGNMENT: usize = 64;

/// Largest buffer length one descriptor can carry (TDES2 B1L field).
pub const MAX_BUFFER_LEN: usize = TDES2_B1L_MASK as usize;

/* Transmit descriptor, read format (driver -> device) */
/// TDES2: interrupt on completion of this descriptor.
pub const TDES2_IOC: u32 = 1 << 31;
/// TDES2: buffer 1 length field.
pub const TDES2_B1L_MASK: u32 = 0x3FFF;
/// TDES3: descriptor is owned by the device.
pub const TDES3_OWN: u32 = 1 << 31;
/// TDES3: first descriptor of a frame.
pub const TDES3_FD: u32 = 1 << 29;
/// TDES3: last descriptor of a frame.
pub const TDES3_LD: u32 = 1 << 28;
/// TDES3: total frame length field (read format, first descriptor only).
pub const TDES3_FL_MASK: u32 = 0x7FFF;

/* Transmit descriptor, write-back format (device -> driver) */
/// TDES3 write-back: error summary.
pub const TDES3_ES: u32 = 1 << 15;
/// TDES3 write-back: the device could not fetch this descriptor.
pub const TDES3_DE: u32 = 1 << 23;
/// TDES3 write-back: transmit FIFO underflow while sending the frame.
pub const TDES3_UF: u32 = 1 << 2;

/* Receive descriptor, read format (driver -> device) */
/// RDES3: descriptor is owned by the device.
pub const RDES3_OWN: u32 = 1 << 31;
/// RDES3: interrupt on completion of this descriptor.
pub const RDES3_IOC: u32 = 1 << 30;
/// RDES3: buffer 1 address is valid.
pub const RDES3_BUF1V: u32 = 1 << 24;

/* Receive descriptor, write-back format (device -> driver) */
/// RDES3 write-back: first descriptor of a frame.
pub const RDES3_FD: u32 = 1 << 29;
/// RDES3 write-back: last descriptor of a frame.
pub const RDES3_LD: u32 = 1 << 28;
/// RDES3 write-back: error summary.
pub const RDES3_ES: u32 = 1 << 15;
/// RDES3 write-back: packet length field.
pub const RDES3_PL_MASK: u32 = 0x7FFF;

/// One transmit descriptor. There is one instance of this struct per ring
/// slot; a multi-fragment frame occupies a run of consecutive slots.
#[repr(C)]
pub struct TxDescriptor {
    /// Buffer address, low 32 bits (read format).
    pub tdes0: Volatile<u32>,
    /// Buffer address, high 32 bits (read format).
    pub tdes1: Volatile<u32>,
    /// Buffer length and interrupt control.
    pub tdes2: Volatile<u32>,
    /// OWN, frame delimiters, frame length / write-back status.
    pub tdes3: Volatile<u32>,
}

const_assert_eq!(core::mem::size_of::<TxDescriptor>(), 16);

impl TxDescriptor {
    /// Zeroes the descriptor, leaving it owned by the driver.
    pub fn clear(&mut self) {
        self.tdes0.write(0);
        self.tdes1.write(0);
        self.tdes2.write(0);
        self.tdes3.write(0);
    }

    /// Programs the descriptor with one fragment of a frame and hands it to
    /// the device.
    ///
    /// `first`/`last` mark the frame delimiters; `frame_len` is the total
    /// length of the whole frame and is only meaningful on the first
    /// descriptor. The OWN bit is written last, after a release fence, so the
    /// device never fetches a partially-programmed descriptor.
    pub fn publish(&mut self, addr: DeviceAddress, len: usize, first: bool, last: bool, frame_len: u16) {
        self.tdes0.write(addr.lower_32());
        self.tdes1.write(addr.upper_32());
        let mut tdes2 = (len as u32) & TDES2_B1L_MASK;
        if last {
            // Interrupt only on the final fragment, one interrupt per frame.
            tdes2 |= TDES2_IOC;
        }
        self.tdes2.write(tdes2);

        let mut tdes3 = 0;
        if first {
            tdes3 |= TDES3_FD | (u32::from(frame_len) & TDES3_FL_MASK);
        }
        if last {
            tdes3 |= TDES3_LD;
        }
        fence(Ordering::Release);
        self.tdes3.write(tdes3 | TDES3_OWN);
    }

    /// Whether the device still owns this descriptor.
    ///
    /// When this returns `false`, an acquire fence has already been issued,
    /// so the write-back accessors below read what the device wrote.
    pub fn is_owned_by_hw(&self) -> bool {
        let owned = self.tdes3.read().get_bit(31);
        if !owned {
            fence(Ordering::Acquire);
        }
        owned
    }

    /// Write-back: the device reported an error sending this frame.
    pub fn has_error(&self) -> bool {
        self.tdes3.read() & TDES3_ES != 0
    }

    /// Write-back: the device could not fetch this descriptor's contents.
    pub fn descriptor_error(&self) -> bool {
        self.tdes3.read() & TDES3_DE != 0
    }

    /// Write-back: transmit FIFO underflow.
    pub fn underflow_error(&self) -> bool {
        self.tdes3.read() & TDES3_UF != 0
    }
}

impl fmt::Debug for TxDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{tdes0: {:#X}, tdes1: {:#X}, tdes2: {:#X}, tdes3: {:#X}}}",
            self.tdes0.read(), self.tdes1.read(), self.tdes2.read(), self.tdes3.read())
    }
}

/// One receive descriptor. The driver arms it with an empty buffer; the
/// device overwrites it with the completed frame's status and length.
#[repr(C)]
pub struct RxDescriptor {
    /// Buffer address, low 32 bits (read format).
    pub rdes0: Volatile<u32>,
    /// Buffer address, high 32 bits (read format).
    pub rdes1: Volatile<u32>,
    /// Reserved in the read format; extended status in write-back.
    pub rdes2: Volatile<u32>,
    /// OWN and control / write-back status.
    pub rdes3: Volatile<u32>,
}

const_assert_eq!(core::mem::size_of::<RxDescriptor>(), 16);

impl RxDescriptor {
    /// Zeroes the descriptor, leaving it owned by the driver.
    pub fn clear(&mut self) {
        self.rdes0.write(0);
        self.rdes1.write(0);
        self.rdes2.write(0);
        self.rdes3.write(0);
    }

    /// Points the descriptor at an empty receive buffer and hands it to the
    /// device. The OWN bit is written last, after a release fence.
    pub fn arm(&mut self, addr: DeviceAddress) {
        self.rdes0.write(addr.lower_32());
        self.rdes1.write(addr.upper_32());
        self.rdes2.write(0);
        fence(Ordering::Release);
        self.rdes3.write(RDES3_OWN | RDES3_IOC | RDES3_BUF1V);
    }

    /// Whether the device still owns this descriptor.
    ///
    /// When this returns `false`, an acquire fence has already been issued,
    /// so the write-back accessors below read what the device wrote.
    pub fn is_owned_by_hw(&self) -> bool {
        let owned = self.rdes3.read().get_bit(31);
        if !owned {
            fence(Ordering::Acquire);
        }
        owned
    }

    /// Write-back: length in bytes of the received frame.
    pub fn frame_len(&self) -> u16 {
        (self.rdes3.read() & RDES3_PL_MASK) as u16
    }

    /// Write-back: the device reported an error receiving this frame.
    pub fn has_error(&self) -> bool {
        self.rdes3.read() & RDES3_ES != 0
    }

    /// Write-back: this descriptor holds the end of a frame. With buffers
    /// sized to the maximum frame, every completed frame sets this.
    pub fn is_last_of_frame(&self) -> bool {
        self.rdes3.read() & RDES3_LD != 0
    }
}

impl fmt::Debug for RxDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{rdes0: {:#X}, rdes1: {:#X}, rdes2: {:#X}, rdes3: {:#X}}}",
            self.rdes0.read(), self.rdes1.read(), self.rdes2.read(), self.rdes3.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed_tx() -> TxDescriptor {
        TxDescriptor {
            tdes0: Volatile::new(0),
            tdes1: Volatile::new(0),
            tdes2: Volatile::new(0),
            tdes3: Volatile::new(0),
        }
    }

    fn zeroed_rx() -> RxDescriptor {
        RxDescriptor {
            rdes0: Volatile::new(0),
            rdes1: Volatile::new(0),
            rdes2: Volatile::new(0),
            rdes3: Volatile::new(0),
        }
    }

    #[test]
    fn publish_single_fragment_frame() {
        let mut desc = zeroed_tx();
        desc.publish(DeviceAddress::new(0x1_2345_6789), 64, true, true, 64);
        assert_eq!(desc.tdes0.read(), 0x2345_6789);
        assert_eq!(desc.tdes1.read(), 0x1);
        assert_eq!(desc.tdes2.read(), 64 | TDES2_IOC);
        assert_eq!(desc.tdes3.read(), TDES3_OWN | TDES3_FD | TDES3_LD | 64);
        assert!(desc.is_owned_by_hw());
    }

    #[test]
    fn publish_middle_fragment_has_no_delimiters_or_ioc() {
        let mut desc = zeroed_tx();
        desc.publish(DeviceAddress::new(0x1000), 100, false, false, 300);
        assert_eq!(desc.tdes2.read(), 100);
        assert_eq!(desc.tdes3.read(), TDES3_OWN);
    }

    #[test]
    fn publish_first_fragment_carries_frame_len() {
        let mut desc = zeroed_tx();
        desc.publish(DeviceAddress::new(0x1000), 100, true, false, 300);
        assert_eq!(desc.tdes3.read(), TDES3_OWN | TDES3_FD | 300);
    }

    #[test]
    fn tx_writeback_status_decodes() {
        let mut desc = zeroed_tx();
        desc.tdes3.write(TDES3_ES | TDES3_DE | TDES3_LD);
        assert!(!desc.is_owned_by_hw());
        assert!(desc.has_error());
        assert!(desc.descriptor_error());
        assert!(!desc.underflow_error());
    }

    #[test]
    fn arm_and_writeback_roundtrip() {
        let mut desc = zeroed_rx();
        desc.arm(DeviceAddress::new(0xABCD_0000));
        assert_eq!(desc.rdes0.read(), 0xABCD_0000);
        assert_eq!(desc.rdes3.read(), RDES3_OWN | RDES3_IOC | RDES3_BUF1V);
        assert!(desc.is_owned_by_hw());

        // What the device writes back for a clean 1500-byte frame.
        desc.rdes3.write(RDES3_FD | RDES3_LD | 1500);
        assert!(!desc.is_owned_by_hw());
        assert!(!desc.has_error());
        assert!(desc.is_last_of_frame());
        assert_eq!(desc.frame_len(), 1500);
    }

    #[test]
    fn clear_releases_ownership() {
        let mut desc = zeroed_rx();
        desc.arm(DeviceAddress::new(0x1000));
        desc.clear();
        assert!(!desc.is_owned_by_hw());
        assert_eq!(desc.rdes0.read(), 0);
    }
}
