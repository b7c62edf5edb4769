//! DMA channel state and arbitration.
//!
//! The four channels are programmed through 0x040000B0..0x040000DF and
//! arbitrate by index: channel 0 always wins. Channels are armed into
//! per-occasion bitsets (immediate, HBlank, VBlank, video, FIFO); when an
//! occasion fires every armed channel gets a 2-cycle startup event, and a
//! higher-priority channel becoming runnable preempts a running one at the
//! next unit boundary through `early_exit_trigger`.
//!
//! The transfer loop itself lives on the bus, which owns the memory the
//! channels copy through; this module only tracks programming, latches and
//! the runnable set.

use logger::log;
use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;
use crate::scheduler::{EventHandle, HardwareEvent, Scheduler};

pub const FIFO_A_ADDRESS: u32 = 0x0400_00A0;
pub const FIFO_B_ADDRESS: u32 = 0x0400_00A4;

/// Source/destination step per (size, address control).
const SRC_MODIFY: [[i32; 4]; 2] = [[2, -2, 0, 0], [4, -4, 0, 0]];
const DST_MODIFY: [[i32; 4]; 2] = [[2, -2, 0, 2], [4, -4, 0, 4]];

/// Writable address bits; channel 0 cannot reach the GamePak.
const SRC_MASK: [u32; 4] = [0x07FF_FFFF, 0x0FFF_FFFF, 0x0FFF_FFFF, 0x0FFF_FFFF];
const DST_MASK: [u32; 4] = [0x07FF_FFFF, 0x07FF_FFFF, 0x07FF_FFFF, 0x0FFF_FFFF];

/// Length masks; a programmed length of 0 means the full range.
const LEN_MASK: [u32; 4] = [0x3FFF, 0x3FFF, 0x3FFF, 0xFFFF];

/// Highest-priority (lowest-index) channel in a 4-bit channel set.
const FROM_BITSET: [Option<usize>; 16] = [
    None,
    Some(0),
    Some(1),
    Some(0),
    Some(2),
    Some(0),
    Some(1),
    Some(0),
    Some(3),
    Some(0),
    Some(1),
    Some(0),
    Some(2),
    Some(0),
    Some(1),
    Some(0),
];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressControl {
    #[default]
    Increment = 0,
    Decrement = 1,
    Fixed = 2,
    /// Increments during the transfer, reloads the latch on repeat.
    IncrementReload = 3,
}

impl From<u16> for AddressControl {
    fn from(value: u16) -> Self {
        match value & 3 {
            0 => Self::Increment,
            1 => Self::Decrement,
            2 => Self::Fixed,
            _ => Self::IncrementReload,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitSize {
    #[default]
    HalfWord = 0,
    Word = 1,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timing {
    #[default]
    Immediate = 0,
    VBlank = 1,
    HBlank = 2,
    Special = 3,
}

/// Occasions that can start armed channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occasion {
    HBlank,
    VBlank,
    Video,
    Fifo0,
    Fifo1,
}

/// Shadow copies taken when a channel is enabled, advanced while it runs.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct ChannelLatch {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub length: u32,
    /// Last value this channel moved over the bus; sourced for reads from
    /// open-bus addresses below 0x02000000.
    pub bus: u32,
}

#[derive(Default, Serialize, Deserialize)]
pub struct Channel {
    pub id: usize,
    pub enable: bool,
    pub repeat: bool,
    pub interrupt: bool,
    /// DRQ bit, channel 3 only. Stored for readback.
    pub gamepak: bool,
    pub src_addr: u32,
    pub dst_addr: u32,
    pub length: u16,
    pub dst_control: AddressControl,
    pub src_control: AddressControl,
    pub size: UnitSize,
    pub timing: Timing,
    pub is_fifo_dma: bool,
    pub latch: ChannelLatch,
    #[serde(skip)]
    startup_event: Option<EventHandle>,
}

impl Channel {
    pub fn src_step(&self) -> i32 {
        SRC_MODIFY[self.size as usize][self.src_control as usize]
    }

    pub fn dst_step(&self) -> i32 {
        if self.is_fifo_dma {
            0
        } else {
            DST_MODIFY[self.size as usize][self.dst_control as usize]
        }
    }

    pub fn transfer_size(&self) -> UnitSize {
        if self.is_fifo_dma {
            UnitSize::Word
        } else {
            self.size
        }
    }

    fn latched_length(&self) -> u32 {
        let length = u32::from(self.length) & LEN_MASK[self.id];
        if length == 0 {
            LEN_MASK[self.id] + 1
        } else {
            length
        }
    }
}

#[derive(Default, Serialize, Deserialize)]
pub struct Dma {
    pub channels: [Channel; 4],
    hblank_set: u8,
    vblank_set: u8,
    video_set: u8,
    runnable_set: u8,
    active_channel: Option<usize>,
    pub early_exit_trigger: bool,
    /// Most recent word any channel moved; the machine-wide DMA open-bus
    /// value.
    pub latch: u32,
}

impl Dma {
    pub fn reset(&mut self) {
        *self = Self::default();
        for (id, channel) in self.channels.iter_mut().enumerate() {
            channel.id = id;
        }
    }

    pub fn is_running(&self) -> bool {
        self.active_channel.is_some()
    }

    pub const fn active_channel(&self) -> Option<usize> {
        self.active_channel
    }

    pub fn select_next_channel(&mut self) {
        self.active_channel = FROM_BITSET[self.runnable_set as usize];
    }

    /// Arms every channel in `bitset` with the 2-cycle startup delay.
    fn schedule_channels(&mut self, mut bitset: u8, scheduler: &mut Scheduler) {
        while let Some(id) = FROM_BITSET[bitset as usize] {
            bitset.set_bit_off(id as u8);
            if let Some(event) = self.channels[id].startup_event.take() {
                scheduler.cancel(event);
            }
            self.channels[id].startup_event =
                Some(scheduler.add(2, HardwareEvent::DmaStartup(id)));
        }
    }

    /// Handles a drained [`HardwareEvent::DmaStartup`].
    pub fn handle_startup(&mut self, id: usize) {
        self.channels[id].startup_event = None;

        match self.active_channel {
            None => self.active_channel = Some(id),
            Some(active) if id < active => {
                self.active_channel = Some(id);
                self.early_exit_trigger = true;
            }
            Some(_) => {}
        }

        self.runnable_set.set_bit_on(id as u8);
    }

    pub fn request(&mut self, occasion: Occasion, scheduler: &mut Scheduler) {
        match occasion {
            Occasion::HBlank => self.schedule_channels(self.hblank_set, scheduler),
            Occasion::VBlank => self.schedule_channels(self.vblank_set, scheduler),
            Occasion::Video => self.schedule_channels(self.video_set, scheduler),
            Occasion::Fifo0 | Occasion::Fifo1 => {
                let address = if occasion == Occasion::Fifo0 {
                    FIFO_A_ADDRESS
                } else {
                    FIFO_B_ADDRESS
                };
                for id in 1..=2 {
                    let channel = &self.channels[id];
                    if channel.enable
                        && channel.timing == Timing::Special
                        && channel.dst_addr == address
                    {
                        self.schedule_channels(1 << id, scheduler);
                    }
                }
            }
        }
    }

    /// Video-capture DMA stops itself once the transfer window has passed
    /// (scanline 162).
    pub fn stop_video_transfer(&mut self) {
        let channel = &mut self.channels[3];

        if channel.enable && channel.timing == Timing::Special {
            channel.enable = false;
            self.runnable_set.set_bit_off(3);
            self.video_set.set_bit_off(3);
            self.select_next_channel();
        }
    }

    /// Completion bookkeeping once a channel has drained its latch.
    /// Returns true when the channel's IRQ should be raised.
    pub fn complete_channel(&mut self, id: usize) -> bool {
        self.runnable_set.set_bit_off(id as u8);

        let channel = &mut self.channels[id];
        let raise_irq = channel.interrupt;

        if channel.repeat {
            channel.latch.length = if channel.is_fifo_dma {
                4
            } else {
                channel.latched_length()
            };

            if channel.dst_control == AddressControl::IncrementReload && !channel.is_fifo_dma {
                let mask = match channel.size {
                    UnitSize::Word => !3,
                    UnitSize::HalfWord => !1,
                };
                channel.latch.dst_addr = channel.dst_addr & mask;
            }
        } else {
            channel.enable = false;
            self.hblank_set.set_bit_off(id as u8);
            self.vblank_set.set_bit_off(id as u8);
            self.video_set.set_bit_off(id as u8);
        }

        self.select_next_channel();
        raise_irq
    }

    pub fn read_register_byte(&self, offset: usize) -> u8 {
        let (id, reg) = Self::decode_offset(offset);
        let channel = &self.channels[id];

        // Only DMAXCNT_H reads back; addresses and length are write-only.
        match reg {
            10 => ((channel.dst_control as u8) << 5) | ((channel.src_control as u8) << 7),
            11 => {
                ((channel.src_control as u8) >> 1)
                    | ((channel.size as u8) << 2)
                    | ((channel.timing as u8) << 4)
                    | (u8::from(channel.repeat) << 1)
                    | (u8::from(channel.gamepak) << 3)
                    | (u8::from(channel.interrupt) << 6)
                    | (u8::from(channel.enable) << 7)
            }
            _ => 0,
        }
    }

    pub fn write_register_byte(&mut self, offset: usize, value: u8, scheduler: &mut Scheduler) {
        let (id, reg) = Self::decode_offset(offset);
        let channel = &mut self.channels[id];

        match reg {
            0..=3 => {
                let shift = reg * 8;
                channel.src_addr &= !(0xFF << shift);
                channel.src_addr |= (u32::from(value) << shift) & SRC_MASK[id];
            }
            4..=7 => {
                let shift = (reg - 4) * 8;
                channel.dst_addr &= !(0xFF << shift);
                channel.dst_addr |= (u32::from(value) << shift) & DST_MASK[id];
            }
            8 => channel.length.set_byte(0, value),
            9 => channel.length.set_byte(1, value),
            10 => {
                channel.dst_control = AddressControl::from((u16::from(value) >> 5) & 3);
                let src_high = channel.src_control as u16 & 0b10;
                channel.src_control = AddressControl::from(src_high | (u16::from(value) >> 7));
            }
            11 => {
                let enable_old = channel.enable;

                let src_low = channel.src_control as u16 & 0b01;
                channel.src_control = AddressControl::from(src_low | ((u16::from(value) & 1) << 1));
                channel.size = if value.get_bit(2) {
                    UnitSize::Word
                } else {
                    UnitSize::HalfWord
                };
                channel.timing = match (value >> 4) & 3 {
                    0 => Timing::Immediate,
                    1 => Timing::VBlank,
                    2 => Timing::HBlank,
                    _ => Timing::Special,
                };
                channel.repeat = value.get_bit(1) && channel.timing != Timing::Immediate;
                channel.gamepak = value.get_bit(3) && id == 3;
                channel.interrupt = value.get_bit(6);
                channel.enable = value.get_bit(7);

                self.on_channel_written(id, enable_old, scheduler);
            }
            _ => unreachable!(),
        }
    }

    fn on_channel_written(&mut self, id: usize, enable_old: bool, scheduler: &mut Scheduler) {
        // Occasion membership is regenerated below when still enabled.
        self.hblank_set.set_bit_off(id as u8);
        self.vblank_set.set_bit_off(id as u8);
        self.video_set.set_bit_off(id as u8);

        if !self.channels[id].enable {
            self.runnable_set.set_bit_off(id as u8);

            // Disable raced the startup delay.
            if let Some(event) = self.channels[id].startup_event.take() {
                log(format!("DMA{id} was cancelled before its startup completed"));
                scheduler.cancel(event);
            }

            // Channel self-disable through its own control register.
            if self.active_channel == Some(id) {
                log(format!("DMA{id} triggered self-disable"));
                self.early_exit_trigger = true;
                self.select_next_channel();
            }
            return;
        }

        match self.channels[id].timing {
            Timing::HBlank => self.hblank_set.set_bit_on(id as u8),
            Timing::VBlank => self.vblank_set.set_bit_on(id as u8),
            Timing::Special if id == 3 => self.video_set.set_bit_on(3),
            _ => {}
        }

        if enable_old {
            return;
        }

        let channel = &mut self.channels[id];
        channel.latch.src_addr = channel.src_addr;
        channel.latch.dst_addr = channel.dst_addr;

        // The GamePak bus cannot run backwards.
        if unaliased_page(channel.src_addr >> 24) == 0x08 {
            channel.src_control = AddressControl::Increment;
        }

        let is_fifo = channel.timing == Timing::Special
            && (id == 1 || id == 2)
            && (channel.dst_addr == FIFO_A_ADDRESS || channel.dst_addr == FIFO_B_ADDRESS);

        if is_fifo {
            channel.is_fifo_dma = true;
            channel.size = UnitSize::Word;
            channel.latch.length = 4;
            channel.latch.src_addr &= !3;
            channel.latch.dst_addr &= !3;
        } else {
            channel.is_fifo_dma = false;

            let mask = match channel.size {
                UnitSize::Word => !3,
                UnitSize::HalfWord => !1,
            };
            channel.latch.src_addr &= mask;
            channel.latch.dst_addr &= mask;
            channel.latch.length = channel.latched_length();

            if channel.timing == Timing::Immediate {
                self.schedule_channels(1 << id, scheduler);
            }
        }
    }

    fn decode_offset(offset: usize) -> (usize, usize) {
        let relative = offset - 0xB0;
        (relative / 12, relative % 12)
    }
}

/// Collapses the three ROM waitstate mirrors onto one page.
pub fn unaliased_page(page: u32) -> u32 {
    match page {
        0x09..=0x0D => 0x08,
        page => page,
    }
}
