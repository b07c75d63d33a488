//! Simulated SD card for host tests: a byte-level model of the SPI wire
//! protocol behind [`SpiOps`], with a recorded trace of chip-select edges
//! and decoded command frames.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration as StdDuration, Instant as StdInstant};

use embedded_hal::digital::{ErrorType, OutputPin};

use crate::config::BLOCK_SIZE;
use crate::platform::{CardDetect, SpiOps};
use crate::types::SdError;
use crate::SdCard;

thread_local! {
    static IN_ISR: Cell<bool> = const { Cell::new(false) };
}

/// Pretend the current thread is an interrupt handler for the duration of
/// the returned guard.
pub(crate) fn isr_context() -> IsrGuard {
    IN_ISR.with(|flag| flag.set(true));
    IsrGuard
}

pub(crate) struct IsrGuard;

impl Drop for IsrGuard {
    fn drop(&mut self) {
        IN_ISR.with(|flag| flag.set(false));
    }
}

/// Serializes tests that register a DMA owner; the owner cell is process
/// global while the card model is per test.
pub(crate) fn dma_owner_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CardKind {
    Sdsc,
    Sdhc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TraceEvent {
    Select,
    Deselect,
    Cmd { cmd: u8, arg: u32 },
    StopTran,
}

struct ReadStream {
    next_lba: u32,
    remaining: u32,
}

struct WriteState {
    lba: u32,
    multi: bool,
    got_token: bool,
    bytes: Vec<u8>,
}

pub(crate) struct CardSim {
    kind: CardKind,
    cs_low: bool,
    ready: bool,
    /// Idle responses left before ACMD41 reports ready.
    pub(crate) acmd41_idle_polls: u32,
    csd: [u8; 16],
    blocks: HashMap<u32, Vec<u8>>,
    out: VecDeque<u8>,
    frame: Vec<u8>,
    read_stream: Option<ReadStream>,
    write_state: Option<WriteState>,
    busy_until: Option<StdInstant>,
    holding_busy: bool,
    /// MISO-low time the card inserts after accepting a write.
    pub(crate) busy_ms_per_write: u64,
    /// Keep MISO low after a write until the host deasserts chip select,
    /// as a card whose programming outlasts the host's patience.
    pub(crate) hold_busy: bool,
    /// Data response the card answers writes with (low 5 bits).
    pub(crate) data_response: u8,
    pub(crate) trace: Vec<TraceEvent>,
}

impl CardSim {
    fn new(kind: CardKind) -> Self {
        Self {
            kind,
            cs_low: false,
            ready: false,
            acmd41_idle_polls: 1,
            csd: match kind {
                CardKind::Sdhc => csd_v2(15_363),
                CardKind::Sdsc => csd_v1_1gb(),
            },
            blocks: HashMap::new(),
            out: VecDeque::new(),
            frame: Vec::new(),
            read_stream: None,
            write_state: None,
            busy_until: None,
            holding_busy: false,
            busy_ms_per_write: 0,
            hold_busy: false,
            data_response: 0x05,
            trace: Vec::new(),
        }
    }

    pub(crate) fn commands(&self) -> Vec<(u8, u32)> {
        self.trace
            .iter()
            .filter_map(|event| match event {
                TraceEvent::Cmd { cmd, arg } => Some((*cmd, *arg)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn block(&self, lba: u32) -> Vec<u8> {
        self.blocks
            .get(&lba)
            .cloned()
            .unwrap_or_else(|| default_block(lba))
    }

    fn set_cs(&mut self, low: bool) {
        if self.cs_low == low {
            return;
        }
        self.cs_low = low;
        self.trace.push(if low {
            TraceEvent::Select
        } else {
            TraceEvent::Deselect
        });
        if !low {
            self.frame.clear();
            self.holding_busy = false;
        }
    }

    fn busy(&self) -> bool {
        if self.holding_busy {
            return true;
        }
        match self.busy_until {
            Some(until) => StdInstant::now() < until,
            None => false,
        }
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        if !self.cs_low {
            return 0xFF;
        }

        self.consume(mosi);
        self.produce()
    }

    fn consume(&mut self, mosi: u8) {
        if self.write_state.is_some() {
            self.feed_write(mosi);
            return;
        }
        if self.frame.is_empty() {
            if mosi & 0xC0 == 0x40 {
                self.frame.push(mosi);
            }
            return;
        }
        self.frame.push(mosi);
        if self.frame.len() == 6 {
            let cmd = self.frame[0] & 0x3F;
            let arg = u32::from_be_bytes([self.frame[1], self.frame[2], self.frame[3], self.frame[4]]);
            self.frame.clear();
            self.handle_command(cmd, arg);
        }
    }

    fn produce(&mut self) -> u8 {
        if let Some(byte) = self.out.pop_front() {
            return byte;
        }
        if self.busy() {
            return 0x00;
        }
        if let Some(mut stream) = self.read_stream.take() {
            let lba = stream.next_lba;
            stream.next_lba += 1;
            stream.remaining -= 1;
            if stream.remaining > 0 {
                self.read_stream = Some(stream);
            }
            let data = self.block(lba);
            self.out.push_back(0xFE);
            self.out.extend(data);
            self.out.push_back(0xAA);
            self.out.push_back(0xBB);
            // The byte being clocked right now is still a gap byte.
            return 0xFF;
        }
        0xFF
    }

    fn handle_command(&mut self, cmd: u8, arg: u32) {
        self.trace.push(TraceEvent::Cmd { cmd, arg });
        match cmd {
            0 => {
                self.ready = false;
                self.respond(&[0x01]);
            }
            8 => match self.kind {
                CardKind::Sdhc => self.respond(&[0x01, 0x00, 0x00, 0x01, 0xAA]),
                CardKind::Sdsc => self.respond(&[0x05]),
            },
            55 => {
                let r1 = if self.ready { 0x00 } else { 0x01 };
                self.respond(&[r1]);
            }
            41 => {
                if self.acmd41_idle_polls > 0 {
                    self.acmd41_idle_polls -= 1;
                    self.respond(&[0x01]);
                } else {
                    self.ready = true;
                    self.respond(&[0x00]);
                }
            }
            58 => {
                let ocr0 = match self.kind {
                    CardKind::Sdhc => 0xC0,
                    CardKind::Sdsc => 0x80,
                };
                self.respond(&[0x00, ocr0, 0xFF, 0x80, 0x00]);
            }
            16 => self.respond(&[0x00]),
            9 => {
                self.respond(&[0x00]);
                self.out.push_back(0xFF);
                self.out.push_back(0xFE);
                let csd = self.csd;
                self.out.extend(csd);
                self.out.push_back(0xAA);
                self.out.push_back(0xBB);
            }
            17 => {
                self.respond(&[0x00]);
                self.read_stream = Some(ReadStream {
                    next_lba: self.lba_from_address(arg),
                    remaining: 1,
                });
            }
            18 => {
                self.respond(&[0x00]);
                self.read_stream = Some(ReadStream {
                    next_lba: self.lba_from_address(arg),
                    remaining: u32::MAX,
                });
            }
            12 => {
                self.read_stream = None;
                self.out.clear();
                self.respond(&[0xFF, 0x00]);
            }
            24 => {
                self.respond(&[0x00]);
                self.write_state = Some(WriteState {
                    lba: self.lba_from_address(arg),
                    multi: false,
                    got_token: false,
                    bytes: Vec::new(),
                });
            }
            25 => {
                self.respond(&[0x00]);
                self.write_state = Some(WriteState {
                    lba: self.lba_from_address(arg),
                    multi: true,
                    got_token: false,
                    bytes: Vec::new(),
                });
            }
            _ => self.respond(&[0x04]),
        }
    }

    fn respond(&mut self, bytes: &[u8]) {
        // One turnaround byte before R1, as a real card inserts.
        self.out.push_back(0xFF);
        self.out.extend(bytes.iter().copied());
    }

    fn feed_write(&mut self, mosi: u8) {
        let Some(mut state) = self.write_state.take() else {
            return;
        };

        if !state.got_token {
            match mosi {
                0xFF => {
                    self.write_state = Some(state);
                }
                0xFD if state.multi => {
                    // Stop-tran token: leave multi-write, program busy.
                    self.trace.push(TraceEvent::StopTran);
                    self.start_busy();
                }
                0xFE | 0xFC => {
                    state.got_token = true;
                    self.write_state = Some(state);
                }
                _ => {
                    // Unexpected token byte; stay armed for the next one.
                    self.write_state = Some(state);
                }
            }
            return;
        }

        state.bytes.push(mosi);
        if state.bytes.len() < BLOCK_SIZE + 2 {
            self.write_state = Some(state);
            return;
        }

        // Payload plus CRC filler received; answer with the data response.
        let response = self.data_response;
        self.respond_data(response);
        if response & 0x1F == 0x05 {
            state.bytes.truncate(BLOCK_SIZE);
            self.blocks.insert(state.lba, core::mem::take(&mut state.bytes));
            self.start_busy();
        }
        if state.multi {
            self.write_state = Some(WriteState {
                lba: state.lba + 1,
                multi: true,
                got_token: false,
                bytes: Vec::new(),
            });
        }
    }

    fn respond_data(&mut self, response: u8) {
        // One turnaround byte before the response, as with `respond()`: the
        // card can't present the result on the same clock edge it was
        // decided on.
        self.out.push_back(0xFF);
        self.out.push_back(response);
    }

    fn start_busy(&mut self) {
        if self.hold_busy {
            self.holding_busy = true;
        } else if self.busy_ms_per_write > 0 {
            self.busy_until =
                Some(StdInstant::now() + StdDuration::from_millis(self.busy_ms_per_write));
        }
    }

    fn lba_from_address(&self, address: u32) -> u32 {
        match self.kind {
            CardKind::Sdhc => address,
            CardKind::Sdsc => address / BLOCK_SIZE as u32,
        }
    }
}

pub(crate) fn default_block(lba: u32) -> Vec<u8> {
    (0..BLOCK_SIZE)
        .map(|i| (lba as usize + i) as u8)
        .collect()
}

pub(crate) fn csd_v2(c_size: u32) -> [u8; 16] {
    let mut csd = [0u8; 16];
    csd[0] = 0x40;
    csd[7] = (c_size >> 16) as u8 & 0x3F;
    csd[8] = (c_size >> 8) as u8;
    csd[9] = c_size as u8;
    csd
}

/// CSD v1 for a 1 GB card: READ_BL_LEN 9, C_SIZE 4095, C_SIZE_MULT 7.
pub(crate) fn csd_v1_1gb() -> [u8; 16] {
    let mut csd = [0u8; 16];
    csd[5] = 0x09;
    csd[6] = 0x03;
    csd[7] = 0xFF;
    csd[8] = 0xC0;
    csd[9] = 0x03;
    csd[10] = 0x80;
    csd
}

pub(crate) struct SimSpi {
    card: Rc<RefCell<CardSim>>,
    pub(crate) dma_transfers: Rc<Cell<u32>>,
    pub(crate) dma_aborts: Rc<Cell<u32>>,
    pub(crate) cache_ops: Rc<RefCell<Vec<(&'static str, usize, usize)>>>,
    /// Refuse to start DMA, as a peripheral reporting an issue error.
    pub(crate) fail_dma_start: Rc<Cell<bool>>,
    /// Skip the completion interrupt so the rendezvous times out.
    pub(crate) swallow_dma_completion: Rc<Cell<bool>>,
}

impl SpiOps for SimSpi {
    fn transmit_polled(&mut self, tx: &[u8], _timeout_ms: u64) -> Result<(), SdError> {
        let mut card = self.card.borrow_mut();
        for &byte in tx {
            card.exchange(byte);
        }
        Ok(())
    }

    fn transfer_polled(
        &mut self,
        tx: &[u8],
        rx: &mut [u8],
        _timeout_ms: u64,
    ) -> Result<(), SdError> {
        let mut card = self.card.borrow_mut();
        for (tx_byte, rx_byte) in tx.iter().zip(rx.iter_mut()) {
            *rx_byte = card.exchange(*tx_byte);
        }
        Ok(())
    }

    fn dma_start_transmit(&mut self, tx: &[u8]) -> Result<(), SdError> {
        if self.fail_dma_start.get() {
            return Err(SdError::Error);
        }
        self.dma_transfers.set(self.dma_transfers.get() + 1);
        {
            let mut card = self.card.borrow_mut();
            for &byte in tx {
                card.exchange(byte);
            }
        }
        if !self.swallow_dma_completion.get() {
            crate::dma::on_spi_tx_complete();
        }
        Ok(())
    }

    fn dma_start_transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), SdError> {
        if self.fail_dma_start.get() {
            return Err(SdError::Error);
        }
        self.dma_transfers.set(self.dma_transfers.get() + 1);
        {
            let mut card = self.card.borrow_mut();
            for (tx_byte, rx_byte) in tx.iter().zip(rx.iter_mut()) {
                *rx_byte = card.exchange(*tx_byte);
            }
        }
        if !self.swallow_dma_completion.get() {
            crate::dma::on_spi_txrx_complete();
        }
        Ok(())
    }

    fn dma_abort(&mut self) {
        self.dma_aborts.set(self.dma_aborts.get() + 1);
    }

    fn cache_clean(&mut self, addr: usize, len: usize) {
        self.cache_ops.borrow_mut().push(("clean", addr, len));
    }

    fn cache_invalidate(&mut self, addr: usize, len: usize) {
        self.cache_ops.borrow_mut().push(("invalidate", addr, len));
    }

    fn in_isr() -> bool {
        IN_ISR.with(|flag| flag.get())
    }
}

pub(crate) struct SimCs {
    card: Rc<RefCell<CardSim>>,
}

impl ErrorType for SimCs {
    type Error = core::convert::Infallible;
}

impl OutputPin for SimCs {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.card.borrow_mut().set_cs(true);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.card.borrow_mut().set_cs(false);
        Ok(())
    }
}

pub(crate) struct SimDetect {
    present: Rc<Cell<bool>>,
}

impl CardDetect for SimDetect {
    fn card_present(&self) -> bool {
        self.present.get()
    }
}

/// A handle wired to a fresh simulated card, plus the knobs tests poke.
pub(crate) struct Rig {
    pub(crate) sd: SdCard<SimSpi, SimCs, SimDetect>,
    pub(crate) card: Rc<RefCell<CardSim>>,
    pub(crate) present: Rc<Cell<bool>>,
    pub(crate) dma_transfers: Rc<Cell<u32>>,
    pub(crate) dma_aborts: Rc<Cell<u32>>,
    pub(crate) cache_ops: Rc<RefCell<Vec<(&'static str, usize, usize)>>>,
    pub(crate) fail_dma_start: Rc<Cell<bool>>,
    pub(crate) swallow_dma_completion: Rc<Cell<bool>>,
}

pub(crate) fn rig(kind: CardKind, use_dma: bool) -> Rig {
    let card = Rc::new(RefCell::new(CardSim::new(kind)));
    let present = Rc::new(Cell::new(true));
    let dma_transfers = Rc::new(Cell::new(0));
    let dma_aborts = Rc::new(Cell::new(0));
    let cache_ops = Rc::new(RefCell::new(Vec::new()));
    let fail_dma_start = Rc::new(Cell::new(false));
    let swallow_dma_completion = Rc::new(Cell::new(false));

    let spi = SimSpi {
        card: card.clone(),
        dma_transfers: dma_transfers.clone(),
        dma_aborts: dma_aborts.clone(),
        cache_ops: cache_ops.clone(),
        fail_dma_start: fail_dma_start.clone(),
        swallow_dma_completion: swallow_dma_completion.clone(),
    };
    let cs = SimCs { card: card.clone() };
    let detect = SimDetect {
        present: present.clone(),
    };

    Rig {
        sd: SdCard::with_card_detect(spi, cs, use_dma, detect),
        card,
        present,
        dma_transfers,
        dma_aborts,
        cache_ops,
        fail_dma_start,
        swallow_dma_completion,
    }
}
