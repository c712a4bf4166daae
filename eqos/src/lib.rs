//! Driver for the DMA engine of the Synopsys EQOS Ethernet controller.
//!
//! This crate ties the transmit and receive ring engines together into one
//! driver object: ring lifecycle (allocate, start, stop, destroy), the
//! interrupt dispatcher that routes channel status bits to the right ring,
//! and the outward-facing enqueue/reclaim/drain operations. All hardware
//! access goes through capability traits injected at construction, so the
//! whole driver runs unmodified against fake registers in tests.
//!
//! Locking: `state` is acquired first and held across both ring locks during
//! lifecycle transitions (always `tx` before `rx`). Data-path operations hold
//! at most one ring lock at a time, and the control-register lock is never
//! held while a ring lock is held.

#![no_std]

extern crate alloc;

mod counters;

pub use counters::{CounterSnapshot, EqosCounters};
pub use eqos_ring::rx::{DrainBatch, RxRingRegisters};
pub use eqos_ring::tx::{EnqueueResult, RejectReason, TxCompletion, TxRingRegisters, TxStatus};

use alloc::vec::Vec;

use bitflags::bitflags;
use log::{debug, error, warn};
use spin::Mutex;

use eqos_buffers::{DmaMapper, ReceiveBuffer, RxBufferAllocator, TransmitBuffer};
use eqos_ring::rx::RxRing;
use eqos_ring::tx::TxRing;

/// How many times `stop` polls the channel for idleness before giving up and
/// resetting the rings anyway.
const IDLE_POLL_LIMIT: u32 = 1000;

bitflags! {
    /// The per-channel DMA interrupt status register, as read (and cleared)
    /// by the dispatcher.
    pub struct DmaStatus: u32 {
        /// A frame with interrupt-on-completion finished transmitting.
        const TRANSMIT_COMPLETE             = 1 << 0;
        /// The transmit process stopped.
        const TRANSMIT_STOPPED              = 1 << 1;
        /// The transmit ring ran out of device-owned descriptors.
        const TRANSMIT_BUFFER_UNAVAILABLE   = 1 << 2;
        /// A frame was received.
        const RECEIVE_COMPLETE              = 1 << 6;
        /// The receive ring ran out of device-owned descriptors.
        const RECEIVE_BUFFER_UNAVAILABLE    = 1 << 7;
        /// The receive process stopped.
        const RECEIVE_STOPPED               = 1 << 8;
        /// The device hit an unrecoverable bus error.
        const FATAL_BUS_ERROR               = 1 << 12;
        /// Summary of the abnormal interrupt causes.
        const ABNORMAL_SUMMARY              = 1 << 14;
        /// Summary of the normal interrupt causes.
        const NORMAL_SUMMARY                = 1 << 15;
    }
}

impl DmaStatus {
    fn wants_rx_service(&self) -> bool {
        self.intersects(
            DmaStatus::RECEIVE_COMPLETE
                | DmaStatus::RECEIVE_BUFFER_UNAVAILABLE
                | DmaStatus::RECEIVE_STOPPED,
        )
    }

    fn wants_tx_service(&self) -> bool {
        self.intersects(
            DmaStatus::TRANSMIT_COMPLETE
                | DmaStatus::TRANSMIT_STOPPED
                | DmaStatus::TRANSMIT_BUFFER_UNAVAILABLE,
        )
    }
}

/// The channel's control and status registers, beyond the per-ring ones.
pub trait DmaControlRegisters {
    /// Reads the DMA channel status register and acknowledges every bit that
    /// was set.
    fn read_and_clear_dma_status(&mut self) -> DmaStatus;
    /// Reads and acknowledges the MAC interrupt status (link events and the
    /// like, not serviced by this driver beyond logging).
    fn read_and_clear_mac_status(&mut self) -> u32;
    /// Reads and acknowledges the MTL queue interrupt status.
    fn read_and_clear_mtl_status(&mut self) -> u32;
    /// Unmasks the channel's transmit and receive interrupts.
    fn enable_channel_interrupts(&mut self);
    /// Masks all of the channel's interrupts.
    fn disable_channel_interrupts(&mut self);
}

/// Ring sizes for one channel. Capacities must be powers of two so ring
/// arithmetic wraps cleanly.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RingConfig {
    pub tx_capacity: u16,
    pub rx_capacity: u16,
    /// Most descriptors one transmit frame may scatter across.
    pub tx_scatter_limit: u16,
}

impl Default for RingConfig {
    fn default() -> RingConfig {
        RingConfig {
            tx_capacity: 128,
            rx_capacity: 128,
            tx_scatter_limit: 16,
        }
    }
}

impl RingConfig {
    pub fn validate(&self) -> Result<(), &'static str> {
        valid_capacity(self.tx_capacity)?;
        valid_capacity(self.rx_capacity)?;
        if self.tx_scatter_limit == 0 {
            return Err("tx scatter limit must be nonzero");
        }
        Ok(())
    }
}

fn valid_capacity(capacity: u16) -> Result<(), &'static str> {
    if (2..=1024).contains(&capacity) && capacity.is_power_of_two() {
        Ok(())
    } else {
        Err("ring capacity must be a power of two between 2 and 1024")
    }
}

/// Where the driver is in its lifecycle.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LifecycleState {
    /// Rings allocated, DMA not yet started.
    Allocated,
    /// DMA running; the data path is open.
    Running,
    /// DMA stopped; in-flight work was discarded. May be started again.
    Stopped,
}

/// An unrecoverable fault surfaced by the interrupt dispatcher. The caller is
/// expected to stop the driver and reset or replace the device.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Fault {
    /// The device reported a fatal bus error; descriptor or buffer DMA can no
    /// longer be trusted.
    BusError,
}

/// One receive-ring event, as reported by [`EqosDriver::rx_drain`].
pub enum RxOutcome {
    /// A completed frame, trimmed to its received length.
    Frame(ReceiveBuffer),
    /// A ring slot left unarmed because no receive buffer was available. The
    /// slot is re-armed automatically once the pool refills.
    Stalled,
}

/// Everything one interrupt produced.
#[derive(Default)]
pub struct InterruptOutcome {
    /// Frames received, oldest first.
    pub received: Vec<ReceiveBuffer>,
    /// Transmit frames completed, oldest first.
    pub completions: Vec<TxCompletion>,
    /// Whether reclamation freed transmit descriptors, i.e. a previously
    /// deferred frame is worth retrying now.
    pub tx_space_freed: bool,
    /// Set when the device raised a fatal error; the rings were deliberately
    /// left untouched.
    pub fault: Option<Fault>,
}

/// One EQOS DMA channel: both rings, the control registers, and the platform
/// services, behind the locks that serialize them.
pub struct EqosDriver<TR, RR, CR, M, A>
where
    TR: TxRingRegisters,
    RR: RxRingRegisters,
    CR: DmaControlRegisters,
    M: DmaMapper,
    A: RxBufferAllocator,
{
    state: Mutex<LifecycleState>,
    tx: Mutex<TxRing<TR>>,
    rx: Mutex<RxRing<RR>>,
    ctrl: Mutex<CR>,
    mapper: M,
    allocator: A,
    counters: EqosCounters,
}

impl<TR, RR, CR, M, A> EqosDriver<TR, RR, CR, M, A>
where
    TR: TxRingRegisters,
    RR: RxRingRegisters,
    CR: DmaControlRegisters,
    M: DmaMapper,
    A: RxBufferAllocator,
{
    /// Allocates both rings and takes ownership of the channel's registers.
    /// Nothing is programmed into the device until [`start`](Self::start).
    pub fn new(
        config: RingConfig,
        tx_regs: TR,
        rx_regs: RR,
        ctrl_regs: CR,
        mapper: M,
        allocator: A,
    ) -> Result<EqosDriver<TR, RR, CR, M, A>, &'static str> {
        config.validate()?;
        let tx = TxRing::new(config.tx_capacity, config.tx_scatter_limit, tx_regs, &mapper)?;
        let rx = RxRing::new(config.rx_capacity, rx_regs, &mapper)?;
        Ok(EqosDriver {
            state: Mutex::new(LifecycleState::Allocated),
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
            ctrl: Mutex::new(ctrl_regs),
            mapper,
            allocator,
            counters: EqosCounters::default(),
        })
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Transmit descriptors currently free for new frames.
    pub fn tx_available(&self) -> u16 {
        self.tx.lock().available()
    }

    /// Fills the receive ring, programs both rings into the device, and opens
    /// the data path.
    ///
    /// If the receive ring cannot be fully armed the partial arming is rolled
    /// back and the driver stays in its previous state.
    pub fn start(&self) -> Result<(), &'static str> {
        let mut state = self.state.lock();
        if *state == LifecycleState::Running {
            return Err("eqos: already running");
        }
        {
            let mut rx = self.rx.lock();
            if let Err(e) = rx.fill_all(&self.mapper, &self.allocator) {
                rx.reset(&self.mapper);
                return Err(e);
            }
            rx.start();
        }
        self.tx.lock().start();
        self.ctrl.lock().enable_channel_interrupts();
        *state = LifecycleState::Running;
        Ok(())
    }

    /// Closes the data path and discards all in-flight work: queued transmit
    /// frames are dropped and every receive buffer goes back to its pool.
    ///
    /// The channel is asked to stop first and polled for idleness, bounded,
    /// so a wedged device cannot hang the caller.
    pub fn stop(&self) -> Result<(), &'static str> {
        let mut state = self.state.lock();
        if *state != LifecycleState::Running {
            return Err("eqos: not running");
        }
        self.ctrl.lock().disable_channel_interrupts();

        let mut tx = self.tx.lock();
        let mut rx = self.rx.lock();
        tx.disable();
        rx.disable();
        let mut polls = 0;
        while !(tx.is_idle() && rx.is_idle()) {
            polls += 1;
            if polls >= IDLE_POLL_LIMIT {
                warn!("eqos: dma still busy after {} idle polls, resetting rings anyway", polls);
                break;
            }
            core::hint::spin_loop();
        }
        tx.reset(&self.mapper);
        rx.reset(&self.mapper);
        *state = LifecycleState::Stopped;
        Ok(())
    }

    /// Consumes the driver, releasing rings, buffers, and registers. Refused
    /// while the data path is open; the driver is handed back unchanged so
    /// the caller can [`stop`](Self::stop) it first.
    pub fn destroy(self) -> Result<(), EqosDriver<TR, RR, CR, M, A>> {
        let running = { *self.state.lock() == LifecycleState::Running };
        if running {
            return Err(self);
        }
        // A stopped ring is already clean; an allocated-but-never-started one
        // holds no mappings. Reset anyway so no path leaks a mapping.
        self.tx.lock().reset(&self.mapper);
        self.rx.lock().reset(&self.mapper);
        Ok(())
    }

    /// Queues a frame for transmission.
    ///
    /// `Deferred` hands the buffer back for retry once
    /// [`InterruptOutcome::tx_space_freed`] reports room; `Rejected` means
    /// the frame can never be sent as-is.
    pub fn try_enqueue(&self, buffer: TransmitBuffer) -> EnqueueResult {
        if self.state() != LifecycleState::Running {
            self.counters.count_tx_rejected();
            return EnqueueResult::Rejected(RejectReason::RingStopped, buffer);
        }
        let result = self.tx.lock().try_enqueue(buffer, &self.mapper);
        match &result {
            EnqueueResult::Enqueued { .. } => {}
            EnqueueResult::Deferred(_) => self.counters.count_tx_deferred(),
            EnqueueResult::Rejected(..) => self.counters.count_tx_rejected(),
        }
        result
    }

    /// Collects completed transmit frames, oldest first.
    pub fn tx_reclaim(&self) -> Vec<TxCompletion> {
        self.reclaim_tx().0
    }

    /// Collects received frames and re-arms the receive ring. Each stalled
    /// slot is reported so the caller can see backpressure building.
    pub fn rx_drain(&self) -> Vec<RxOutcome> {
        let batch = self.drain_rx();
        let mut outcomes: Vec<RxOutcome> =
            batch.frames.into_iter().map(RxOutcome::Frame).collect();
        for _ in 0..batch.stalled {
            outcomes.push(RxOutcome::Stalled);
        }
        outcomes
    }

    /// Services one interrupt: reads and acknowledges the channel status,
    /// then routes to the rings it implicates.
    ///
    /// A fatal bus error short-circuits: the rings are left untouched (their
    /// contents are no longer trustworthy) and the fault is surfaced for the
    /// caller to act on.
    pub fn on_interrupt(&self) -> InterruptOutcome {
        let mut outcome = InterruptOutcome::default();
        if self.state() != LifecycleState::Running {
            return outcome;
        }

        let (dma, mac, mtl) = {
            let mut ctrl = self.ctrl.lock();
            (
                ctrl.read_and_clear_dma_status(),
                ctrl.read_and_clear_mac_status(),
                ctrl.read_and_clear_mtl_status(),
            )
        };
        if mac != 0 || mtl != 0 {
            debug!("eqos: mac status {:#X}, mtl status {:#X}", mac, mtl);
        }

        if dma.contains(DmaStatus::FATAL_BUS_ERROR) {
            error!("eqos: fatal bus error (dma status {:?})", dma);
            self.counters.count_fatal_fault();
            outcome.fault = Some(Fault::BusError);
            return outcome;
        }

        if dma.wants_rx_service() {
            let batch = self.drain_rx();
            outcome.received = batch.frames;
        }
        if dma.wants_tx_service() {
            let (completions, freed) = self.reclaim_tx();
            outcome.completions = completions;
            outcome.tx_space_freed = freed;
        }
        outcome
    }

    fn drain_rx(&self) -> DrainBatch {
        let batch = self.rx.lock().drain(&self.mapper, &self.allocator);
        self.counters.add_rx_frames(batch.frames.len() as u64);
        self.counters.add_rx_errored(batch.errored as u64);
        self.counters.add_rx_empty(batch.empty as u64);
        if batch.stalled > 0 {
            self.counters.count_rx_stall();
        }
        batch
    }

    fn reclaim_tx(&self) -> (Vec<TxCompletion>, bool) {
        let completions;
        let freed;
        {
            let mut tx = self.tx.lock();
            let queued_before = tx.queued();
            completions = tx.reclaim(&self.mapper);
            freed = tx.queued() < queued_before;
        }
        for completion in &completions {
            match completion.status {
                TxStatus::Sent => self.counters.count_tx_sent(),
                TxStatus::TransmitError => self.counters.count_tx_errored(),
                TxStatus::DescriptorError => {
                    // The channel is suspect once it fails a descriptor
                    // fetch; count it with the fatal faults.
                    self.counters.count_tx_errored();
                    self.counters.count_fatal_fault();
                }
            }
        }
        (completions, freed)
    }
}
