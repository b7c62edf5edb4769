//! Memory bus.
//!
//! Decodes 32-bit addresses by their top nibble, charges every access the
//! wait cycles of its region through the scheduler, dispatches MMIO at
//! byte granularity and owns the hardware behind it all. The bus is also
//! the DMA engine's execution environment: while a channel is runnable the
//! CPU is off the bus and the transfer loop below drives it.

use logger::log;
use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;
use crate::devices::{AudioDevice, NullAudioDevice, NullVideoDevice, VideoDevice};
use crate::hardware::dma::{unaliased_page, Dma, Occasion, UnitSize};
use crate::hardware::gamepak::GamePak;
use crate::hardware::interrupt_control::{Interrupt, InterruptControl};
use crate::hardware::keypad::{Key, Keypad};
use crate::hardware::lcd::Lcd;
use crate::hardware::serial::Serial;
use crate::hardware::sound::Sound;
use crate::hardware::timers::Timers;
use crate::scheduler::{HardwareEvent, Scheduler};

/// Bus access kind: an access adjacent to and same-width as the previous
/// one is sequential and pays the cheaper wait states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    NonSequential,
    Sequential,
}

/// Guest-visible CPU power state, written through HALTCNT.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaltControl {
    #[default]
    Run,
    Halt,
    Stop,
}

#[derive(Clone, Copy)]
enum Width {
    Byte = 1,
    Half = 2,
    Word = 4,
}

/// Non-sequential ROM/SRAM wait states by WAITCNT setting.
const WS_NONSEQ: [u32; 4] = [4, 3, 2, 8];

/// Sequential wait states per waitstate region.
const WS_SEQ0: [u32; 2] = [2, 1];
const WS_SEQ1: [u32; 2] = [4, 1];
const WS_SEQ2: [u32; 2] = [8, 1];

pub struct Bus {
    pub scheduler: Scheduler,
    pub interrupt_control: InterruptControl,
    pub lcd: Lcd,
    pub dma: Dma,
    pub timers: Timers,
    pub sound: Sound,
    pub serial: Serial,
    pub keypad: Keypad,
    pub gamepak: GamePak,

    /// From 0x00000000 to 0x00003FFF (16 KiB).
    bios: Vec<u8>,
    /// From 0x02000000 to 0x0203FFFF (256 KiB), mirrored.
    working_ram: Vec<u8>,
    /// From 0x03000000 to 0x03007FFF (32 KiB), mirrored.
    working_iram: Vec<u8>,

    /// BIOS data reads outside BIOS execution return the last fetched
    /// BIOS word.
    bios_latch: u32,

    pub haltcnt: HaltControl,

    /// WAITCNT raw value; the cycle tables below are derived from it.
    waitcnt: u16,
    cycles16: [[u32; 16]; 2],
    cycles32: [[u32; 16]; 2],

    /// Last opcode fetch, for open-bus reads off the code bus.
    last_fetch_address: u32,
    last_fetch_value: u32,

    bus_is_controlled_by_dma: bool,

    video_device: Box<dyn VideoDevice>,
    audio_device: Box<dyn AudioDevice>,
}

impl Default for Bus {
    fn default() -> Self {
        let mut bus = Self {
            scheduler: Scheduler::new(),
            interrupt_control: InterruptControl::default(),
            lcd: Lcd::default(),
            dma: Dma::default(),
            timers: Timers::default(),
            sound: Sound::default(),
            serial: Serial::default(),
            keypad: Keypad::default(),
            gamepak: GamePak::default(),
            bios: vec![0; 0x4000],
            working_ram: vec![0; 0x4_0000],
            working_iram: vec![0; 0x8000],
            bios_latch: 0,
            haltcnt: HaltControl::Run,
            waitcnt: 0,
            cycles16: [[0; 16]; 2],
            cycles32: [[0; 16]; 2],
            last_fetch_address: 0,
            last_fetch_value: 0,
            bus_is_controlled_by_dma: false,
            video_device: Box::new(NullVideoDevice),
            audio_device: Box::new(NullAudioDevice),
        };
        bus.reset();
        bus
    }
}

impl Bus {
    pub fn set_video_device(&mut self, device: Box<dyn VideoDevice>) {
        self.video_device = device;
    }

    pub fn set_audio_device(&mut self, device: Box<dyn AudioDevice>) {
        self.audio_device = device;
    }

    pub fn load_bios(&mut self, image: Vec<u8>) {
        debug_assert_eq!(image.len(), 0x4000);
        self.bios = image;
    }

    /// Re-initializes every subsystem and re-seeds the LCD state machine.
    pub fn reset(&mut self) {
        self.working_ram.fill(0);
        self.working_iram.fill(0);
        self.bios_latch = 0;
        self.haltcnt = HaltControl::Run;
        self.waitcnt = 0;
        self.last_fetch_address = 0;
        self.last_fetch_value = 0;
        self.bus_is_controlled_by_dma = false;
        self.gamepak.prefetch.flush();

        self.cycles16 = [[1, 1, 3, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0]; 2];
        self.cycles32 = [[1, 1, 6, 1, 1, 2, 2, 1, 0, 0, 0, 0, 0, 0, 0, 0]; 2];
        self.update_memory_delay_table();

        self.scheduler.reset();
        self.interrupt_control = InterruptControl::default();
        self.dma.reset();
        self.timers = Timers::default();
        self.sound = Sound::default();
        self.serial = Serial::default();
        self.keypad = Keypad::default();

        let Self {
            lcd,
            scheduler,
            interrupt_control,
            dma,
            video_device,
            ..
        } = self;
        lcd.reset(scheduler, interrupt_control, dma, video_device.as_mut());
    }

    /// Rebuilds the wait-state tables from WAITCNT, per the published GBA
    /// timing formulas.
    fn update_memory_delay_table(&mut self) {
        let waitcnt = self.waitcnt;
        let sram_cycles = 1 + WS_NONSEQ[waitcnt.get_bits(0..=1) as usize];

        for access in 0..2 {
            self.cycles16[access][0xE] = sram_cycles;
            self.cycles32[access][0xE] = sram_cycles;
            self.cycles16[access][0xF] = sram_cycles;
            self.cycles32[access][0xF] = sram_cycles;
        }

        let nonseq = 0;
        let seq = 1;
        for i in 0..2 {
            // ROM: WS0/WS1/WS2 non-sequential timing.
            self.cycles16[nonseq][0x8 + i] = 1 + WS_NONSEQ[waitcnt.get_bits(2..=3) as usize];
            self.cycles16[nonseq][0xA + i] = 1 + WS_NONSEQ[waitcnt.get_bits(5..=6) as usize];
            self.cycles16[nonseq][0xC + i] = 1 + WS_NONSEQ[waitcnt.get_bits(8..=9) as usize];

            // ROM: WS0/WS1/WS2 sequential timing.
            self.cycles16[seq][0x8 + i] = 1 + WS_SEQ0[usize::from(waitcnt.get_bit(4))];
            self.cycles16[seq][0xA + i] = 1 + WS_SEQ1[usize::from(waitcnt.get_bit(7))];
            self.cycles16[seq][0xC + i] = 1 + WS_SEQ2[usize::from(waitcnt.get_bit(10))];

            // 32-bit ROM access: 1N + 1S, or 2S when sequential.
            for ws in [0x8, 0xA, 0xC] {
                self.cycles32[nonseq][ws + i] =
                    self.cycles16[nonseq][ws] + self.cycles16[seq][ws];
                self.cycles32[seq][ws + i] = self.cycles16[seq][ws] * 2;
            }
        }
    }

    fn prefetch_enabled(&self) -> bool {
        self.waitcnt.get_bit(14)
    }

    /// Advances time; events whose timestamp has been reached fire here,
    /// in timestamp then insertion order.
    pub fn tick(&mut self, cycles: u64) {
        self.scheduler.add_cycles(cycles);
        while let Some((event, cycles_late)) = self.scheduler.pop_due() {
            self.dispatch(event, cycles_late);
        }
    }

    /// One internal CPU cycle: the bus is idle, the prefetcher is not.
    pub fn idle(&mut self) {
        self.prefetch_step_ram(1);
    }

    /// Skips ahead to the next scheduled event. Used while halted.
    pub fn fast_forward(&mut self) {
        let cycles = self.scheduler.remaining_cycle_count();
        self.tick(cycles);
    }

    fn dispatch(&mut self, event: HardwareEvent, cycles_late: u64) {
        match event {
            HardwareEvent::ScanlineComplete => {
                self.lcd.on_scanline_complete(
                    cycles_late,
                    &mut self.scheduler,
                    &mut self.interrupt_control,
                    &mut self.dma,
                );
            }
            HardwareEvent::HblankComplete => {
                self.lcd.on_hblank_complete(
                    cycles_late,
                    &mut self.scheduler,
                    &mut self.interrupt_control,
                    &mut self.dma,
                    self.video_device.as_mut(),
                );
            }
            HardwareEvent::VblankScanlineComplete => {
                self.lcd.on_vblank_scanline_complete(
                    cycles_late,
                    &mut self.scheduler,
                    &mut self.interrupt_control,
                    &mut self.dma,
                );
            }
            HardwareEvent::VblankHblankComplete => {
                self.lcd.on_vblank_hblank_complete(
                    cycles_late,
                    &mut self.scheduler,
                    &mut self.interrupt_control,
                );
            }
            HardwareEvent::DmaStartup(id) => self.dma.handle_startup(id),
            HardwareEvent::TimerOverflow(id) => {
                let output = self.timers.handle_overflow(id, cycles_late, &mut self.scheduler);
                for timer in 0..4 {
                    if output.raise_irq[timer] {
                        self.interrupt_control.raise(Interrupt::Timer(timer));
                    }
                }
                for timer in 0..2 {
                    if output.overflowed[timer] {
                        let fifo = self.sound.tick_fifo(timer);
                        if let Some(frame) = fifo.frame {
                            self.audio_device.enqueue_samples(&[frame]);
                        }
                        if fifo.request_fifo_a {
                            self.dma.request(Occasion::Fifo0, &mut self.scheduler);
                        }
                        if fifo.request_fifo_b {
                            self.dma.request(Occasion::Fifo1, &mut self.scheduler);
                        }
                    }
                }
            }
        }
    }

    /// Pushes a host key transition into KEYINPUT and evaluates the keypad
    /// interrupt condition.
    pub fn set_key(&mut self, key: Key, pressed: bool) {
        self.keypad.set_key(key, pressed);
        if self.keypad.interrupt_condition_met() {
            self.interrupt_control.raise(Interrupt::Keypad);
        }
    }

    // -------------------------------------------------------------------
    // Typed data accessors.

    pub fn read_byte(&mut self, address: u32, access: Access) -> u8 {
        self.read_internal(address, access, Width::Byte, false) as u8
    }

    pub fn read_half(&mut self, address: u32, access: Access) -> u16 {
        self.read_internal(address, access, Width::Half, false) as u16
    }

    pub fn read_word(&mut self, address: u32, access: Access) -> u32 {
        self.read_internal(address, access, Width::Word, false)
    }

    /// THUMB opcode fetch. Feeds the prefetcher and the open-bus latch.
    pub fn fetch_half(&mut self, address: u32, access: Access) -> u16 {
        let value = self.read_internal(address, access, Width::Half, true) as u16;
        self.last_fetch_address = address;
        self.last_fetch_value = u32::from(value) * 0x0001_0001;
        value
    }

    /// ARM opcode fetch.
    pub fn fetch_word(&mut self, address: u32, access: Access) -> u32 {
        let value = self.read_internal(address, access, Width::Word, true);
        self.last_fetch_address = address;
        self.last_fetch_value = value;
        value
    }

    pub fn write_byte(&mut self, address: u32, value: u8, access: Access) {
        self.write_internal(address, u32::from(value), access, Width::Byte);
    }

    pub fn write_half(&mut self, address: u32, value: u16, access: Access) {
        self.write_internal(address, u32::from(value), access, Width::Half);
    }

    pub fn write_word(&mut self, address: u32, value: u32, access: Access) {
        self.write_internal(address, value, access, Width::Word);
    }

    // -------------------------------------------------------------------
    // Region decode.

    fn wait_cycles(&self, page: u32, access: Access, width: Width) -> u64 {
        let kind = match access {
            Access::NonSequential => 0,
            Access::Sequential => 1,
        };
        let table = match width {
            Width::Word => &self.cycles32,
            _ => &self.cycles16,
        };
        u64::from(table[kind][page as usize])
    }

    fn read_internal(&mut self, address: u32, access: Access, width: Width, code: bool) -> u32 {
        if address >> 24 > 0xF {
            self.prefetch_step_ram(1);
            return self.extract_unused(address, width);
        }

        let page = address >> 24;
        let mut address = address;
        let mut access = access;

        if page != 0xE && page != 0xF {
            address &= !(width as u32 - 1);
        }

        // A 128 KiB boundary always breaks a sequential burst.
        if address & 0x1_FFFF == 0 {
            access = Access::NonSequential;
        }

        let cycles = self.wait_cycles(page, access, width);

        match page {
            0x0 => {
                self.prefetch_step_ram(cycles);
                let word = self.read_bios(address);
                extract(word, address, width)
            }
            0x2 => {
                self.prefetch_step_ram(cycles);
                read_slice(&self.working_ram, (address & 0x3_FFFF) as usize, width)
            }
            0x3 => {
                self.prefetch_step_ram(cycles);
                read_slice(&self.working_iram, (address & 0x7FFF) as usize, width)
            }
            0x4 => {
                self.prefetch_step_ram(cycles);
                let mut value = 0_u32;
                for i in 0..width as u32 {
                    value |= u32::from(self.read_mmio_byte(address + i)) << (i * 8);
                }
                value
            }
            0x5 => {
                self.prefetch_step_ram(cycles);
                read_slice(&*self.lcd.palette_ram, (address & 0x3FF) as usize, width)
            }
            0x6 => {
                self.prefetch_step_ram(cycles);
                read_slice(&*self.lcd.video_ram, vram_offset(address), width)
            }
            0x7 => {
                self.prefetch_step_ram(cycles);
                read_slice(&*self.lcd.obj_attributes, (address & 0x3FF) as usize, width)
            }
            0x8..=0xD => {
                self.rom_access_cycles(address, page, access, width, code);
                let address = address & 0x01FF_FFFF;
                match width {
                    Width::Byte => u32::from(self.gamepak.read_rom_byte(address)),
                    Width::Half => u32::from(self.gamepak.read_rom_half(address)),
                    Width::Word => self.gamepak.read_rom_word(address),
                }
            }
            0xE | 0xF => {
                self.gamepak.prefetch.flush();
                self.tick(cycles);
                // 8-bit bus: wider reads see the byte replicated.
                let byte = u32::from(self.gamepak.read_sram(address & 0x00FF_FFFF));
                match width {
                    Width::Byte => byte,
                    Width::Half => byte * 0x0101,
                    Width::Word => byte * 0x0101_0101,
                }
            }
            _ => {
                self.prefetch_step_ram(cycles.max(1));
                self.extract_unused(address, width)
            }
        }
    }

    fn write_internal(&mut self, address: u32, value: u32, access: Access, width: Width) {
        if address >> 24 > 0xF {
            self.prefetch_step_ram(1);
            log(format!("write on unused memory {address:#010X}"));
            return;
        }

        let page = address >> 24;
        let mut address = address;
        let mut access = access;

        if page != 0xE && page != 0xF {
            address &= !(width as u32 - 1);
        }

        if address & 0x1_FFFF == 0 {
            access = Access::NonSequential;
        }

        let cycles = self.wait_cycles(page, access, width);

        match page {
            // BIOS is mask ROM; writes die on the bus.
            0x0 => self.prefetch_step_ram(cycles),
            0x2 => {
                self.prefetch_step_ram(cycles);
                write_slice(&mut self.working_ram, (address & 0x3_FFFF) as usize, value, width);
            }
            0x3 => {
                self.prefetch_step_ram(cycles);
                write_slice(&mut self.working_iram, (address & 0x7FFF) as usize, value, width);
            }
            0x4 => {
                self.prefetch_step_ram(cycles);
                for i in 0..width as u32 {
                    self.write_mmio_byte(address + i, (value >> (i * 8)) as u8);
                }
            }
            0x5 => {
                self.prefetch_step_ram(cycles);
                // 8-bit writes are broadcast to the enclosing halfword.
                if let Width::Byte = width {
                    let offset = (address & 0x3FE) as usize;
                    let value = (value & 0xFF) as u8;
                    self.lcd.palette_ram[offset] = value;
                    self.lcd.palette_ram[offset + 1] = value;
                } else {
                    write_slice(
                        &mut *self.lcd.palette_ram,
                        (address & 0x3FF) as usize,
                        value,
                        width,
                    );
                }
            }
            0x6 => {
                self.prefetch_step_ram(cycles);
                let offset = vram_offset(address);
                if let Width::Byte = width {
                    // Same halfword broadcast as palette RAM, but only in
                    // the background region; OBJ tile bytes are dropped.
                    let limit = if self.lcd.registers.bg_mode() >= 3 {
                        0x14000
                    } else {
                        0x10000
                    };
                    if offset < limit {
                        let offset = offset & !1;
                        let value = (value & 0xFF) as u8;
                        self.lcd.video_ram[offset] = value;
                        self.lcd.video_ram[offset + 1] = value;
                    }
                } else {
                    write_slice(&mut *self.lcd.video_ram, offset, value, width);
                }
            }
            0x7 => {
                self.prefetch_step_ram(cycles);
                // 8-bit OAM writes are ignored by the hardware.
                if !matches!(width, Width::Byte) {
                    write_slice(
                        &mut *self.lcd.obj_attributes,
                        (address & 0x3FF) as usize,
                        value,
                        width,
                    );
                }
            }
            0x8..=0xD => {
                self.gamepak.prefetch.flush();
                self.tick(cycles);
                tracing::debug!("attempted write to ROM at {address:#010X}");
            }
            0xE | 0xF => {
                self.gamepak.prefetch.flush();
                self.tick(cycles);
                let value = value >> ((address & (width as u32 - 1)) * 8);
                self.gamepak.write_sram(address & 0x00FF_FFFF, value as u8);
            }
            _ => {
                self.prefetch_step_ram(cycles.max(1));
                log(format!("write on unused memory {address:#010X}"));
            }
        }
    }

    /// BIOS is only readable while executing inside it; data reads from
    /// outside return the last fetched BIOS word.
    fn read_bios(&mut self, address: u32) -> u32 {
        if address >= 0x4000 {
            return self.unused_word(address);
        }

        if self.last_fetch_address < 0x4000 {
            let offset = (address & !3) as usize;
            self.bios_latch = u32::from_le_bytes([
                self.bios[offset],
                self.bios[offset + 1],
                self.bios[offset + 2],
                self.bios[offset + 3],
            ]);
        }

        self.bios_latch
    }

    /// Open-bus value: the DMA latch while DMA owns the bus, the last
    /// fetched opcode otherwise.
    fn unused_word(&self, address: u32) -> u32 {
        tracing::warn!("open-bus read at {address:#010X}");
        if self.bus_is_controlled_by_dma || self.dma.is_running() {
            self.dma.latch
        } else {
            self.last_fetch_value
        }
    }

    fn extract_unused(&self, address: u32, width: Width) -> u32 {
        extract(self.unused_word(address), address, width)
    }

    // -------------------------------------------------------------------
    // GamePak prefetch.

    /// The bus is busy off the GamePak: the prefetcher keeps its burst
    /// running in the background.
    fn prefetch_step_ram(&mut self, cycles: u64) {
        if self.prefetch_enabled() {
            self.gamepak.prefetch.step(cycles as i32);
        }
        self.tick(cycles);
    }

    /// ROM access cycle accounting, collapsing code fetches onto the
    /// prefetch buffer when it can serve them.
    fn rom_access_cycles(
        &mut self,
        address: u32,
        page: u32,
        access: Access,
        width: Width,
        code: bool,
    ) {
        if self.bus_is_controlled_by_dma {
            // The prefetcher was flushed when DMA took the bus.
            self.tick(self.wait_cycles(page, access, width));
            return;
        }

        if code && self.prefetch_enabled() {
            if self.gamepak.prefetch.hits_head(address) {
                self.gamepak.prefetch.consume_head();
                self.tick(1);
                return;
            }

            if self.gamepak.prefetch.hits_in_flight(address) {
                let owed = self.gamepak.prefetch.complete_in_flight();
                self.tick(owed as u64);
                return;
            }

            // Miss: restart the burst right behind this fetch.
            self.gamepak.prefetch.flush();
            self.tick(self.wait_cycles(page, Access::NonSequential, width));

            let opcode_width = width as u32;
            let duty = self.cycles16[1][page as usize] as i32;
            self.gamepak.prefetch.arm(address, opcode_width, duty);
            return;
        }

        // Data access (or prefetch disabled): the buffer's burst is lost
        // and the access pays its own timing; CPU data traffic is always
        // non-sequential on the cartridge bus.
        self.gamepak.prefetch.flush();
        let access = if code { access } else { Access::NonSequential };
        self.tick(self.wait_cycles(page, access, width));
    }

    // -------------------------------------------------------------------
    // MMIO dispatch, byte granular.

    fn read_mmio_byte(&mut self, address: u32) -> u8 {
        let offset = (address & 0x00FF_FFFF) as usize;

        match offset {
            0x000..=0x05F => self.lcd.registers.read_register_byte(offset),
            0x060..=0x0AF => self.sound.read_register_byte(offset),
            0x0B0..=0x0DF => self.dma.read_register_byte(offset),
            0x100..=0x10F => self.timers.read_register_byte(offset, self.scheduler.now()),
            0x120..=0x12F | 0x134..=0x15F => self.serial.read_register_byte(offset),
            0x130 => self.keypad.keyinput.get_byte(0),
            0x131 => self.keypad.keyinput.get_byte(1),
            0x132 => self.keypad.keycnt.get_byte(0),
            0x133 => self.keypad.keycnt.get_byte(1),
            0x204 => self.waitcnt.get_byte(0),
            0x205 => self.waitcnt.get_byte(1),
            0x200..=0x203 | 0x208..=0x209 | 0x300 => {
                self.interrupt_control.read_register_byte(offset)
            }
            _ => {
                tracing::warn!("read from unmapped MMIO {address:#010X}");
                // Unmapped MMIO: zero in the low byte, open bus above.
                if address & 3 == 0 {
                    0
                } else {
                    self.unused_word(address).get_byte((address & 3) as u8)
                }
            }
        }
    }

    fn write_mmio_byte(&mut self, address: u32, value: u8) {
        let offset = (address & 0x00FF_FFFF) as usize;

        match offset {
            0x000..=0x05F => self.lcd.registers.write_register_byte(offset, value),
            0x060..=0x0AF => self.sound.write_register_byte(offset, value),
            0x0B0..=0x0DF => self
                .dma
                .write_register_byte(offset, value, &mut self.scheduler),
            0x100..=0x10F => self
                .timers
                .write_register_byte(offset, value, &mut self.scheduler),
            0x120..=0x12F | 0x134..=0x15F => self.serial.write_register_byte(offset, value),
            0x130..=0x131 => {}
            0x132 => self.keypad.keycnt.set_byte(0, value),
            0x133 => self.keypad.keycnt.set_byte(1, value),
            0x204 => {
                self.waitcnt.set_byte(0, value);
                self.update_memory_delay_table();
            }
            0x205 => {
                self.waitcnt.set_byte(1, value);
                self.update_memory_delay_table();
            }
            0x200..=0x203 | 0x208..=0x209 | 0x300 => {
                self.interrupt_control.write_register_byte(offset, value);
            }
            0x301 => {
                self.haltcnt = if value.get_bit(7) {
                    HaltControl::Stop
                } else {
                    HaltControl::Halt
                };
            }
            _ => {
                tracing::warn!("write to unmapped MMIO {address:#010X} = {value:#04X}");
            }
        }
    }

    // -------------------------------------------------------------------
    // DMA execution.

    pub fn dma_is_running(&self) -> bool {
        self.dma.is_running()
    }

    /// Runs DMA until no channel is runnable. The CPU is suspended for the
    /// whole interval.
    pub fn run_dma(&mut self) {
        if !self.dma.is_running() {
            return;
        }

        // Conservative choice: DMA taking the bus discards the prefetch
        // burst outright.
        self.gamepak.prefetch.flush();
        self.bus_is_controlled_by_dma = true;

        let mut first = true;
        while let Some(id) = self.dma.active_channel() {
            self.run_dma_channel(id, first);
            first = false;
        }

        self.bus_is_controlled_by_dma = false;
    }

    fn run_dma_channel(&mut self, id: usize, first: bool) {
        let size = self.dma.channels[id].transfer_size();
        let src_step = self.dma.channels[id].src_step();
        let dst_step = self.dma.channels[id].dst_step();

        // Internal transfer time when the cartridge bus is not involved.
        let src_page = unaliased_page(self.dma.channels[id].latch.src_addr >> 24);
        let dst_page = unaliased_page(self.dma.channels[id].latch.dst_addr >> 24);
        if first && src_page != 0x08 && dst_page != 0x08 {
            self.idle();
            self.idle();
        }

        let mut access = Access::NonSequential;

        while self.dma.channels[id].latch.length != 0 {
            if self.dma.early_exit_trigger {
                self.dma.early_exit_trigger = false;
                return;
            }

            let src_addr = self.dma.channels[id].latch.src_addr;
            let dst_addr = self.dma.channels[id].latch.dst_addr;

            match size {
                UnitSize::HalfWord => {
                    let value = if src_addr >= 0x0200_0000 {
                        let value = self.read_half(src_addr, access);
                        let replicated = u32::from(value) * 0x0001_0001;
                        self.dma.channels[id].latch.bus = replicated;
                        self.dma.latch = replicated;
                        value
                    } else {
                        // BIOS-side source: serve from the channel's bus
                        // latch without driving the bus.
                        self.idle();
                        let latch = self.dma.channels[id].latch.bus;
                        if dst_addr & 2 != 0 {
                            (latch >> 16) as u16
                        } else {
                            latch as u16
                        }
                    };
                    self.write_half(dst_addr, value, access);
                }
                UnitSize::Word => {
                    if src_addr >= 0x0200_0000 {
                        let value = self.read_word(src_addr, access);
                        self.dma.channels[id].latch.bus = value;
                        self.dma.latch = value;
                    } else {
                        self.idle();
                    }
                    let value = self.dma.channels[id].latch.bus;
                    self.write_word(dst_addr, value, access);
                }
            }

            let latch = &mut self.dma.channels[id].latch;
            latch.src_addr = latch.src_addr.wrapping_add_signed(src_step);
            latch.dst_addr = latch.dst_addr.wrapping_add_signed(dst_step);
            latch.length -= 1;

            access = Access::Sequential;
        }

        if self.dma.complete_channel(id) {
            self.interrupt_control.raise(Interrupt::Dma(id));
        }
    }
}

/// VRAM mirroring: 96 KiB mapped into a 128 KiB window, with the upper
/// 32 KiB appearing twice.
fn vram_offset(address: u32) -> usize {
    let mut offset = (address & 0x1_FFFF) as usize;
    if offset >= 0x18000 {
        offset &= !0x8000;
    }
    offset
}

fn extract(word: u32, address: u32, width: Width) -> u32 {
    match width {
        Width::Byte => u32::from((word >> ((address & 3) * 8)) as u8),
        Width::Half => u32::from((word >> ((address & 2) * 8)) as u16),
        Width::Word => word,
    }
}

fn read_slice(memory: &[u8], offset: usize, width: Width) -> u32 {
    match width {
        Width::Byte => u32::from(memory[offset]),
        Width::Half => u32::from(u16::from_le_bytes([memory[offset], memory[offset + 1]])),
        Width::Word => u32::from_le_bytes([
            memory[offset],
            memory[offset + 1],
            memory[offset + 2],
            memory[offset + 3],
        ]),
    }
}

fn write_slice(memory: &mut [u8], offset: usize, value: u32, width: Width) {
    match width {
        Width::Byte => memory[offset] = value as u8,
        Width::Half => memory[offset..offset + 2].copy_from_slice(&(value as u16).to_le_bytes()),
        Width::Word => memory[offset..offset + 4].copy_from_slice(&value.to_le_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::gamepak::GamePak;

    fn bus_with_rom(rom: Vec<u8>) -> Bus {
        let mut bus = Bus::default();
        bus.gamepak = GamePak::load(rom, None);
        bus
    }

    fn charged(bus: &mut Bus, f: impl FnOnce(&mut Bus)) -> u64 {
        let start = bus.scheduler.now();
        f(bus);
        bus.scheduler.now() - start
    }

    #[test]
    fn region_wait_states_match_the_tables() {
        let mut bus = Bus::default();

        // IWRAM: single cycle.
        assert_eq!(
            charged(&mut bus, |bus| {
                bus.read_word(0x0300_0000, Access::NonSequential);
            }),
            1
        );

        // EWRAM: 3 cycles for 16-bit, 6 for 32-bit.
        assert_eq!(
            charged(&mut bus, |bus| {
                bus.read_half(0x0200_0010, Access::NonSequential);
            }),
            3
        );
        assert_eq!(
            charged(&mut bus, |bus| {
                bus.read_word(0x0200_0010, Access::NonSequential);
            }),
            6
        );

        // Default ROM WS0: 1 + 4 nonsequential, 1 + 2 sequential.
        let mut bus = bus_with_rom(vec![0; 0x1000]);
        assert_eq!(
            charged(&mut bus, |bus| {
                bus.read_half(0x0800_0010, Access::NonSequential);
            }),
            5
        );
        // Data access pays non-sequential timing regardless.
        assert_eq!(
            charged(&mut bus, |bus| {
                bus.read_half(0x0800_0012, Access::Sequential);
            }),
            5
        );
    }

    #[test]
    fn waitcnt_reshapes_rom_timing() {
        let mut bus = bus_with_rom(vec![0; 0x1000]);

        // WS0 nonseq 2, seq 1.
        bus.write_half(0x0400_0204, (2 << 2) | (1 << 4), Access::NonSequential);

        assert_eq!(
            charged(&mut bus, |bus| {
                bus.read_half(0x0800_0100, Access::NonSequential);
            }),
            3
        );
        assert_eq!(
            charged(&mut bus, |bus| {
                bus.fetch_half(0x0800_0200, Access::Sequential);
            }),
            2
        );
    }

    #[test]
    fn pram_byte_writes_broadcast_to_halfword() {
        let mut bus = Bus::default();
        bus.write_byte(0x0500_0001, 0xAB, Access::NonSequential);

        assert_eq!(bus.lcd.palette_ram[0], 0xAB);
        assert_eq!(bus.lcd.palette_ram[1], 0xAB);
    }

    #[test]
    fn vram_byte_writes_broadcast_only_in_bg_region() {
        let mut bus = Bus::default();
        bus.write_byte(0x0600_0003, 0x5A, Access::NonSequential);
        assert_eq!(bus.lcd.video_ram[2], 0x5A);
        assert_eq!(bus.lcd.video_ram[3], 0x5A);

        // OBJ tile region: dropped.
        bus.write_byte(0x0601_2000, 0x77, Access::NonSequential);
        assert_eq!(bus.lcd.video_ram[0x12000], 0);
    }

    #[test]
    fn oam_byte_writes_are_ignored() {
        let mut bus = Bus::default();
        bus.write_byte(0x0700_0000, 0x12, Access::NonSequential);
        assert_eq!(bus.lcd.obj_attributes[0], 0);

        bus.write_half(0x0700_0000, 0x1234, Access::NonSequential);
        assert_eq!(bus.lcd.obj_attributes[0], 0x34);
    }

    #[test]
    fn sram_reads_replicate_the_byte() {
        let mut rom = vec![0_u8; 64];
        rom[0..7].copy_from_slice(b"SRAM_V1");
        let mut bus = bus_with_rom(rom);

        bus.write_byte(0x0E00_0000, 0x42, Access::NonSequential);
        assert_eq!(bus.read_half(0x0E00_0000, Access::NonSequential), 0x4242);
        assert_eq!(
            bus.read_word(0x0E00_0000, Access::NonSequential),
            0x4242_4242
        );
    }

    #[test]
    fn ram_mirrors_wrap() {
        let mut bus = Bus::default();

        bus.write_word(0x0204_0000, 0xDEAD_BEEF, Access::NonSequential);
        assert_eq!(bus.read_word(0x0200_0000, Access::NonSequential), 0xDEAD_BEEF);

        bus.write_byte(0x0300_8000, 0x99, Access::NonSequential);
        assert_eq!(bus.read_byte(0x0300_0000, Access::NonSequential), 0x99);
    }

    #[test]
    fn open_bus_returns_last_fetch() {
        let mut bus = Bus::default();
        bus.working_iram[0x100..0x104].copy_from_slice(&0xCAFE_BABE_u32.to_le_bytes());
        bus.fetch_word(0x0300_0100, Access::NonSequential);

        assert_eq!(
            bus.read_word(0x0100_0000, Access::NonSequential),
            0xCAFE_BABE
        );
    }

    #[test]
    fn bios_data_reads_outside_bios_return_latch() {
        let mut bus = Bus::default();
        let mut bios = vec![0_u8; 0x4000];
        bios[0..4].copy_from_slice(&0x1111_2222_u32.to_le_bytes());
        bios[4..8].copy_from_slice(&0x3333_4444_u32.to_le_bytes());
        bus.load_bios(bios);

        // Executing inside the BIOS: reads are live and latch.
        bus.fetch_word(0x0000_0000, Access::NonSequential);
        assert_eq!(bus.read_word(0x0000_0004, Access::NonSequential), 0x3333_4444);

        // Executing from IWRAM: the BIOS hands out the latched word.
        bus.fetch_word(0x0300_0000, Access::NonSequential);
        assert_eq!(bus.read_word(0x0000_0000, Access::NonSequential), 0x3333_4444);
    }

    #[test]
    fn prefetch_warm_burst_serves_single_cycle_fetches() {
        let mut bus = bus_with_rom(vec![0xAB; 0x1000]);
        // WS0 nonseq 3 (-> 1+2=3... setting 2), seq 1 (-> 2 cycles),
        // prefetch on.
        bus.write_half(
            0x0400_0204,
            (2 << 2) | (1 << 4) | (1 << 14),
            Access::NonSequential,
        );

        // First fetch: non-sequential cost, arms the burst.
        let first = charged(&mut bus, |bus| {
            bus.fetch_half(0x0800_0000, Access::NonSequential);
        });
        assert_eq!(first, 3);

        // Busy off-ROM long enough for the burst to fill.
        charged(&mut bus, |bus| {
            for _ in 0..16 {
                bus.read_word(0x0300_0000, Access::Sequential);
            }
        });

        // Warm fetches cost a single cycle each.
        for i in 1..8 {
            let cycles = charged(&mut bus, |bus| {
                bus.fetch_half(0x0800_0000 + i * 2, Access::Sequential);
            });
            assert_eq!(cycles, 1, "fetch {i} should hit the buffer");
        }
    }

    #[test]
    fn prefetch_data_access_flushes_the_burst() {
        let mut bus = bus_with_rom(vec![0xAB; 0x1000]);
        bus.write_half(0x0400_0204, 1 << 14, Access::NonSequential);

        bus.fetch_half(0x0800_0000, Access::NonSequential);
        charged(&mut bus, |bus| {
            for _ in 0..32 {
                bus.read_word(0x0300_0000, Access::Sequential);
            }
        });
        assert!(bus.gamepak.prefetch.count > 0);

        // A data read from ROM kills the burst.
        bus.read_half(0x0800_0800, Access::NonSequential);
        assert_eq!(bus.gamepak.prefetch.count, 0);

        // The next fetch pays the full non-sequential cost again.
        let cycles = charged(&mut bus, |bus| {
            bus.fetch_half(0x0800_0002, Access::Sequential);
        });
        assert_eq!(cycles, 5);
    }

    #[test]
    fn hblank_dma_transfers_each_scanline() {
        // Scenario: channel 0, 4 halfwords from EWRAM to VRAM on HBlank,
        // repeating. After a full frame 160 bursts of 8 bytes moved.
        let mut bus = Bus::default();
        for i in 0..8_u32 {
            bus.write_byte(0x0200_0000 + i, 0x10 + i as u8, Access::NonSequential);
        }

        bus.write_word(0x0400_00B0, 0x0200_0000, Access::NonSequential);
        bus.write_word(0x0400_00B4, 0x0600_0000, Access::NonSequential);
        // Length 4, HBlank timing, repeat, source/destination increment.
        bus.write_word(0x0400_00B8, 4 | (0xA200 << 16), Access::NonSequential);

        let frame_cycles = 280_896;
        let limit = bus.scheduler.now() + frame_cycles;
        while bus.scheduler.now() < limit {
            if bus.dma_is_running() {
                bus.run_dma();
            } else {
                bus.fast_forward();
            }
        }

        // 160 visible HBlanks, destination incremented 8 bytes each.
        assert_eq!(bus.dma.channels[0].latch.dst_addr, 0x0600_0000 + 160 * 8);
        assert_eq!(bus.lcd.video_ram[0], 0x10);
        assert_eq!(bus.lcd.video_ram[7], 0x17);
        assert!(bus.dma.channels[0].enable);
    }

    #[test]
    fn simultaneous_dmas_run_in_priority_order() {
        let mut bus = Bus::default();

        bus.write_byte(0x0200_0000, 0xAA, Access::NonSequential);
        bus.write_byte(0x0200_0100, 0xBB, Access::NonSequential);

        // Channel 1 writes 0xBB to 0x0300_0000; channel 0 writes 0xAA to
        // the same address. Both immediate.
        bus.write_word(0x0400_00BC, 0x0200_0100, Access::NonSequential);
        bus.write_word(0x0400_00C0, 0x0300_0000, Access::NonSequential);
        bus.write_word(0x0400_00C4, 1 | (0x8000 << 16), Access::NonSequential);

        bus.write_word(0x0400_00B0, 0x0200_0000, Access::NonSequential);
        bus.write_word(0x0400_00B4, 0x0300_0000, Access::NonSequential);
        bus.write_word(0x0400_00B8, 1 | (0x8000 << 16), Access::NonSequential);

        bus.tick(4);
        assert!(bus.dma_is_running());
        bus.run_dma();

        // Channel 0 ran first; channel 1 wrote last.
        assert_eq!(bus.read_byte(0x0300_0000, Access::NonSequential), 0xBB);
        assert!(!bus.dma.channels[0].enable);
        assert!(!bus.dma.channels[1].enable);
    }

    #[test]
    fn dma_completion_raises_its_interrupt() {
        let mut bus = Bus::default();

        bus.write_word(0x0400_00B0, 0x0200_0000, Access::NonSequential);
        bus.write_word(0x0400_00B4, 0x0300_0000, Access::NonSequential);
        // IRQ enable + enable, immediate, length 1.
        bus.write_word(0x0400_00B8, 1 | (0xC000 << 16), Access::NonSequential);

        bus.tick(4);
        bus.run_dma();

        assert_ne!(bus.interrupt_control.interrupt_request & (1 << 8), 0);
    }

    #[test]
    fn keypad_irq_fires_on_configured_combination() {
        let mut bus = Bus::default();
        // Enable keypad IRQ on A (OR mode).
        bus.write_half(0x0400_0132, (1 << 14) | 1, Access::NonSequential);

        bus.set_key(Key::B, true);
        assert_eq!(bus.interrupt_control.interrupt_request & (1 << 12), 0);

        bus.set_key(Key::A, true);
        assert_ne!(bus.interrupt_control.interrupt_request & (1 << 12), 0);

        // KEYINPUT reads back active-low.
        let keys = bus.read_half(0x0400_0130, Access::NonSequential);
        assert_eq!(keys & 0x3FF, 0x3FF & !0b11);
    }

    #[test]
    fn timer_overflow_reaches_the_interrupt_controller() {
        let mut bus = Bus::default();
        // Timer 0: reload 0xFFF0, IRQ enable, start.
        bus.write_half(0x0400_0100, 0xFFF0, Access::NonSequential);
        bus.write_half(0x0400_0102, 0x00C0, Access::NonSequential);

        bus.tick(16);
        assert_ne!(bus.interrupt_control.interrupt_request & (1 << 3), 0);
    }
}
