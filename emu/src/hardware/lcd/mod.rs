//! Scanline PPU.
//!
//! The LCD runs entirely off scheduler events. A visible scanline is 1006
//! cycles of draw time followed by 226 cycles of HBlank; 160 visible lines
//! and 68 VBlank lines give the 228 x 1232 = 280896 cycle frame. Rendering
//! happens a full scanline at a time at the end of the visible portion,
//! into per-layer line buffers that the composer folds into the RGBA
//! output frame.

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::devices::VideoDevice;
use crate::hardware::dma::{Dma, Occasion};
use crate::hardware::interrupt_control::{Interrupt, InterruptControl};
use crate::scheduler::{HardwareEvent, Scheduler};

pub mod registers;

mod background;
mod compose;
mod object;
mod object_attributes;

pub use registers::Registers;

/// GBA display width
pub const LCD_WIDTH: usize = 240;

/// GBA display height
pub const LCD_HEIGHT: usize = 160;

/// Cycles of visible draw time per scanline.
const CYCLES_HDRAW: u64 = 1006;

/// Cycles of horizontal blank per scanline.
const CYCLES_HBLANK: u64 = 226;

/// RGB555 value with the transparency sentinel bit.
pub(crate) const COLOR_TRANSPARENT: u16 = 0x8000;

/// One sprite pixel staged for composition.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ObjectPixel {
    pub color: u16,
    pub priority: u8,
    pub alpha: bool,
    pub window: bool,
}

impl Default for ObjectPixel {
    fn default() -> Self {
        Self {
            color: COLOR_TRANSPARENT,
            priority: 4,
            alpha: false,
            window: false,
        }
    }
}

/// Per-line scratch and the output frame; transient render state that is
/// rebuilt every scanline and deliberately kept out of serialized state.
pub(crate) struct RenderBuffers {
    pub bg: [[u16; LCD_WIDTH]; 4],
    pub obj: [ObjectPixel; LCD_WIDTH],
    pub win: [[bool; LCD_WIDTH]; 2],
    pub output: Box<[u32]>,
}

impl Default for RenderBuffers {
    fn default() -> Self {
        Self {
            bg: [[COLOR_TRANSPARENT; LCD_WIDTH]; 4],
            obj: [ObjectPixel::default(); LCD_WIDTH],
            win: [[false; LCD_WIDTH]; 2],
            output: vec![0; LCD_WIDTH * LCD_HEIGHT].into_boxed_slice(),
        }
    }
}

#[serde_as]
#[derive(Serialize, Deserialize)]
pub struct Lcd {
    pub registers: Registers,

    /// From 0x05000000 to 0x050003FF (1 KiB, BG then OBJ palettes).
    #[serde_as(as = "Box<[_; 1024]>")]
    pub palette_ram: Box<[u8; 0x400]>,
    /// From 0x06000000 to 0x06017FFF (96 KiB).
    #[serde_as(as = "Box<[_; 98304]>")]
    pub video_ram: Box<[u8; 0x18000]>,
    /// From 0x07000000 to 0x070003FF (1 KiB).
    #[serde_as(as = "Box<[_; 1024]>")]
    pub obj_attributes: Box<[u8; 0x400]>,

    /// Vertical mosaic counters, advanced per scanline.
    bg_mosaic_counter_y: u16,
    obj_mosaic_counter_y: u16,

    /// Whether each rectangular window covers the current scanline.
    window_scanline_enable: [bool; 2],

    /// Set while staging sprites when any pixel uses semi-transparency.
    line_contains_alpha_obj: bool,

    #[serde(skip)]
    pub(crate) buffers: RenderBuffers,
}

impl Default for Lcd {
    fn default() -> Self {
        Self {
            registers: Registers::default(),
            palette_ram: Box::new([0; 0x400]),
            video_ram: Box::new([0; 0x18000]),
            obj_attributes: Box::new([0; 0x400]),
            bg_mosaic_counter_y: 0,
            obj_mosaic_counter_y: 0,
            window_scanline_enable: [false; 2],
            line_contains_alpha_obj: false,
            buffers: RenderBuffers::default(),
        }
    }
}

impl Lcd {
    /// Re-seeds the scanline state machine: the LCD starts as if the last
    /// HBlank of the previous frame just completed, which rolls VCOUNT over
    /// to 0 and schedules the first visible line.
    pub fn reset(
        &mut self,
        scheduler: &mut Scheduler,
        interrupt_control: &mut InterruptControl,
        dma: &mut Dma,
        video_device: &mut dyn VideoDevice,
    ) {
        let buffers = std::mem::take(&mut self.buffers);
        *self = Self {
            buffers,
            ..Self::default()
        };

        self.registers.vcount = 0xFF;
        self.on_hblank_complete(0, scheduler, interrupt_control, dma, video_device);
    }

    pub fn output(&self) -> &[u32] {
        &self.buffers.output
    }

    /// End of the visible portion of a scanline.
    pub fn on_scanline_complete(
        &mut self,
        cycles_late: u64,
        scheduler: &mut Scheduler,
        interrupt_control: &mut InterruptControl,
        dma: &mut Dma,
    ) {
        self.render_scanline();

        scheduler.add(CYCLES_HBLANK - cycles_late, HardwareEvent::HblankComplete);

        self.registers.set_hblank_flag(true);
        if self.registers.hblank_irq_enable() {
            interrupt_control.raise(Interrupt::HBlank);
        }

        dma.request(Occasion::HBlank, scheduler);
        if self.registers.vcount >= 2 {
            dma.request(Occasion::Video, scheduler);
        }

        let (_, bg_mosaic_h, _, obj_mosaic_h) = self.registers.mosaic_sizes();
        self.bg_mosaic_counter_y += 1;
        if self.bg_mosaic_counter_y == bg_mosaic_h {
            self.bg_mosaic_counter_y = 0;
        }
        self.obj_mosaic_counter_y += 1;
        if self.obj_mosaic_counter_y == obj_mosaic_h {
            self.obj_mosaic_counter_y = 0;
        }

        // Mode 0 has no affine backgrounds and leaves the internal
        // reference registers untouched.
        if self.registers.bg_mode() != 0 {
            for i in 0..2 {
                if self.registers.bg_mosaic_enable(2 + i) {
                    if self.bg_mosaic_counter_y == 0 {
                        let step = i32::from(bg_mosaic_h);
                        self.registers.bgx[i].current +=
                            step * i32::from(self.registers.bgpb[i] as i16);
                        self.registers.bgy[i].current +=
                            step * i32::from(self.registers.bgpd[i] as i16);
                    }
                } else {
                    self.registers.bgx[i].current += i32::from(self.registers.bgpb[i] as i16);
                    self.registers.bgy[i].current += i32::from(self.registers.bgpd[i] as i16);
                }
            }
        }
    }

    /// End of HBlank on a visible scanline.
    pub fn on_hblank_complete(
        &mut self,
        cycles_late: u64,
        scheduler: &mut Scheduler,
        interrupt_control: &mut InterruptControl,
        dma: &mut Dma,
        video_device: &mut dyn VideoDevice,
    ) {
        self.registers.set_hblank_flag(false);
        self.registers.vcount = self.registers.vcount.wrapping_add(1);
        self.check_vcount_irq(interrupt_control);

        if self.registers.win0_enabled() {
            self.render_window(0);
        }
        if self.registers.win1_enabled() {
            self.render_window(1);
        }

        if self.registers.vcount == 160 {
            video_device.draw(&self.buffers.output);

            scheduler.add(
                CYCLES_HDRAW - cycles_late,
                HardwareEvent::VblankScanlineComplete,
            );
            dma.request(Occasion::VBlank, scheduler);
            self.registers.set_vblank_flag(true);

            if self.registers.vblank_irq_enable() {
                interrupt_control.raise(Interrupt::VBlank);
            }

            self.bg_mosaic_counter_y = 0;
            self.obj_mosaic_counter_y = 0;

            for i in 0..2 {
                self.registers.bgx[i].reload();
                self.registers.bgy[i].reload();
            }
        } else {
            scheduler.add(CYCLES_HDRAW - cycles_late, HardwareEvent::ScanlineComplete);

            // Sprites are staged one line ahead of composition.
            if self.registers.obj_enabled() {
                self.render_objects(u16::from(self.registers.vcount));
            }
        }
    }

    /// End of the draw-time window on a VBlank scanline.
    pub fn on_vblank_scanline_complete(
        &mut self,
        cycles_late: u64,
        scheduler: &mut Scheduler,
        interrupt_control: &mut InterruptControl,
        dma: &mut Dma,
    ) {
        scheduler.add(
            CYCLES_HBLANK - cycles_late,
            HardwareEvent::VblankHblankComplete,
        );

        self.registers.set_hblank_flag(true);

        if self.registers.vcount < 162 {
            dma.request(Occasion::Video, scheduler);
        } else if self.registers.vcount == 162 {
            dma.stop_video_transfer();
        }

        if self.registers.hblank_irq_enable() {
            interrupt_control.raise(Interrupt::HBlank);
        }
    }

    /// End of HBlank on a VBlank scanline.
    pub fn on_vblank_hblank_complete(
        &mut self,
        cycles_late: u64,
        scheduler: &mut Scheduler,
        interrupt_control: &mut InterruptControl,
    ) {
        self.registers.set_hblank_flag(false);

        if self.registers.vcount == 227 {
            self.registers.vcount = 0;
            scheduler.add(CYCLES_HDRAW - cycles_late, HardwareEvent::ScanlineComplete);

            if self.registers.obj_enabled() {
                self.render_objects(0);
            }
        } else {
            self.registers.vcount += 1;
            scheduler.add(
                CYCLES_HDRAW - cycles_late,
                HardwareEvent::VblankScanlineComplete,
            );

            // The last VBlank line already reads back as "not blanking".
            if self.registers.vcount == 227 {
                self.registers.set_vblank_flag(false);
            }
        }

        if self.registers.win0_enabled() {
            self.render_window(0);
        }
        if self.registers.win1_enabled() {
            self.render_window(1);
        }

        self.check_vcount_irq(interrupt_control);
    }

    /// Edge-triggered VCOUNT match interrupt.
    fn check_vcount_irq(&mut self, interrupt_control: &mut InterruptControl) {
        let matches = self.registers.vcount == self.registers.vcount_setting();

        if self.registers.vcount_irq_enable() && !self.registers.vcount_flag() && matches {
            interrupt_control.raise(Interrupt::VCount);
        }

        self.registers.set_vcount_flag(matches);
    }

    fn render_scanline(&mut self) {
        let line = usize::from(self.registers.vcount);
        if self.registers.forced_blank() {
            let white = compose::convert_color(0x7FFF);
            self.buffers.output[line * LCD_WIDTH..(line + 1) * LCD_WIDTH].fill(white);
            return;
        }

        match self.registers.bg_mode() {
            // Text mode on all four backgrounds.
            0 => {
                for id in 0..4 {
                    if self.registers.bg_enabled(id) {
                        self.render_layer_text(id);
                    }
                }
                self.compose_scanline(0, 3);
            }
            // BG0/BG1 text, BG2 affine.
            1 => {
                for id in 0..2 {
                    if self.registers.bg_enabled(id) {
                        self.render_layer_text(id);
                    }
                }
                if self.registers.bg_enabled(2) {
                    self.render_layer_affine(0);
                }
                self.compose_scanline(0, 2);
            }
            // BG2/BG3 affine.
            2 => {
                for i in 0..2 {
                    if self.registers.bg_enabled(2 + i) {
                        self.render_layer_affine(i);
                    }
                }
                self.compose_scanline(2, 3);
            }
            // 240x160 direct color bitmap.
            3 => {
                if self.registers.bg_enabled(2) {
                    self.render_layer_bitmap_mode3();
                }
                self.compose_scanline(2, 2);
            }
            // 240x160 paletted, double buffered.
            4 => {
                if self.registers.bg_enabled(2) {
                    self.render_layer_bitmap_mode4();
                }
                self.compose_scanline(2, 2);
            }
            // 160x128 direct color, double buffered.
            5 => {
                if self.registers.bg_enabled(2) {
                    self.render_layer_bitmap_mode5();
                }
                self.compose_scanline(2, 2);
            }
            // Invalid modes show the backdrop.
            _ => {
                let backdrop = compose::convert_color(self.read_palette(0, 0));
                self.buffers.output[line * LCD_WIDTH..(line + 1) * LCD_WIDTH].fill(backdrop);
            }
        }
    }

    /// BG palette lookup; bank 0 with a full palette, the entry's bank in
    /// 4bpp mode.
    pub(crate) fn read_palette(&self, palette: u16, index: u16) -> u16 {
        let offset = usize::from((palette * 16 + index) * 2);
        u16::from_le_bytes([self.palette_ram[offset], self.palette_ram[offset + 1]]) & 0x7FFF
    }

    /// OBJ palette lookup (second half of palette RAM).
    pub(crate) fn read_obj_palette(&self, palette: u16, index: u16) -> u16 {
        let offset = 0x200 + usize::from((palette * 16 + index) * 2);
        u16::from_le_bytes([self.palette_ram[offset], self.palette_ram[offset + 1]]) & 0x7FFF
    }

    pub(crate) fn vertical_bg_mosaic(&self, id: usize) -> u16 {
        if self.registers.bg_mosaic_enable(id) {
            self.bg_mosaic_counter_y
        } else {
            0
        }
    }

    pub(crate) const fn vertical_obj_mosaic(&self) -> u16 {
        self.obj_mosaic_counter_y
    }

    /// Computes the per-line masks for rectangular window `id`.
    fn render_window(&mut self, id: usize) {
        let line = u16::from(self.registers.vcount);
        let (v_min, v_max) = self.registers.win_v_bounds(id);
        let (h_min, h_max) = self.registers.win_h_bounds(id);

        self.window_scanline_enable[id] =
            range_contains(u16::from(v_min), u16::from(v_max), line);

        for x in 0..LCD_WIDTH {
            self.buffers.win[id][x] =
                range_contains(u16::from(h_min), u16::from(h_max), x as u16);
        }
    }

    pub(crate) fn window_covers_scanline(&self, id: usize) -> bool {
        self.window_scanline_enable[id]
    }

    pub(crate) fn set_line_contains_alpha_obj(&mut self, value: bool) {
        self.line_contains_alpha_obj = value;
    }

    pub(crate) const fn line_has_alpha_obj(&self) -> bool {
        self.line_contains_alpha_obj
    }
}

/// `min <= v < max` with wrap-around when min > max; empty when equal.
fn range_contains(min: u16, max: u16, v: u16) -> bool {
    match max.cmp(&min) {
        std::cmp::Ordering::Greater => v >= min && v < max,
        std::cmp::Ordering::Less => v >= min || v < max,
        std::cmp::Ordering::Equal => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitwise::Bits;
    use crate::devices::NullVideoDevice;

    struct CountingVideoDevice {
        frames: usize,
    }

    impl VideoDevice for CountingVideoDevice {
        fn draw(&mut self, buffer: &[u32]) {
            assert_eq!(buffer.len(), LCD_WIDTH * LCD_HEIGHT);
            self.frames += 1;
        }
    }

    fn fixture() -> (Lcd, Scheduler, InterruptControl, Dma) {
        let mut lcd = Lcd::default();
        let mut scheduler = Scheduler::new();
        let mut interrupt_control = InterruptControl::default();
        let mut dma = Dma::default();
        dma.reset();
        lcd.reset(
            &mut scheduler,
            &mut interrupt_control,
            &mut dma,
            &mut NullVideoDevice,
        );
        (lcd, scheduler, interrupt_control, dma)
    }

    fn run_frame(
        lcd: &mut Lcd,
        scheduler: &mut Scheduler,
        interrupt_control: &mut InterruptControl,
        dma: &mut Dma,
        video_device: &mut dyn VideoDevice,
        cycles: u64,
    ) {
        let limit = scheduler.now() + cycles;
        while scheduler.now() < limit {
            let step = scheduler.remaining_cycle_count().min(limit - scheduler.now());
            scheduler.add_cycles(step);
            while let Some((event, late)) = scheduler.pop_due() {
                match event {
                    HardwareEvent::ScanlineComplete => {
                        lcd.on_scanline_complete(late, scheduler, interrupt_control, dma);
                    }
                    HardwareEvent::HblankComplete => {
                        lcd.on_hblank_complete(late, scheduler, interrupt_control, dma, video_device);
                    }
                    HardwareEvent::VblankScanlineComplete => {
                        lcd.on_vblank_scanline_complete(late, scheduler, interrupt_control, dma);
                    }
                    HardwareEvent::VblankHblankComplete => {
                        lcd.on_vblank_hblank_complete(late, scheduler, interrupt_control);
                    }
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn frame_is_228_scanlines_of_1232_cycles() {
        let (mut lcd, mut scheduler, mut interrupt_control, mut dma) = fixture();

        assert_eq!(lcd.registers.vcount, 0);
        let start = scheduler.now();

        let mut video = NullVideoDevice;
        run_frame(
            &mut lcd,
            &mut scheduler,
            &mut interrupt_control,
            &mut dma,
            &mut video,
            228 * 1232,
        );

        assert_eq!(scheduler.now() - start, 280_896);
        assert_eq!(lcd.registers.vcount, 0);
    }

    #[test]
    fn draws_exactly_once_per_frame() {
        let (mut lcd, mut scheduler, mut interrupt_control, mut dma) = fixture();
        let mut video = CountingVideoDevice { frames: 0 };

        run_frame(
            &mut lcd,
            &mut scheduler,
            &mut interrupt_control,
            &mut dma,
            &mut video,
            2 * 228 * 1232,
        );

        assert_eq!(video.frames, 2);
    }

    #[test]
    fn vblank_irq_raised_at_line_160() {
        let (mut lcd, mut scheduler, mut interrupt_control, mut dma) = fixture();
        lcd.registers.dispstat.set_bit(3, true);

        let mut video = NullVideoDevice;
        // 160 full scanlines reach the 159 -> 160 transition.
        run_frame(
            &mut lcd,
            &mut scheduler,
            &mut interrupt_control,
            &mut dma,
            &mut video,
            160 * 1232,
        );

        assert_eq!(
            interrupt_control.interrupt_request & 1,
            1,
            "VBlank must be pending"
        );
        assert!(lcd.registers.dispstat.get_bit(0), "VBlank flag set");
    }

    #[test]
    fn vcount_match_raises_irq_once() {
        let (mut lcd, mut scheduler, mut interrupt_control, mut dma) = fixture();
        // Match line 100, IRQ enabled.
        lcd.registers.dispstat = (100 << 8) | (1 << 5);

        let mut video = NullVideoDevice;
        run_frame(
            &mut lcd,
            &mut scheduler,
            &mut interrupt_control,
            &mut dma,
            &mut video,
            100 * 1232,
        );

        assert_eq!(lcd.registers.vcount, 100);
        assert_ne!(interrupt_control.interrupt_request & (1 << 2), 0);
        assert!(lcd.registers.vcount_flag());
    }

    #[test]
    fn forced_blank_renders_white() {
        let (mut lcd, mut scheduler, mut interrupt_control, mut dma) = fixture();
        lcd.registers.dispcnt.set_bit(7, true);

        let mut video = NullVideoDevice;
        run_frame(
            &mut lcd,
            &mut scheduler,
            &mut interrupt_control,
            &mut dma,
            &mut video,
            2 * 1232,
        );

        assert!(lcd.buffers.output[..LCD_WIDTH]
            .iter()
            .all(|&pixel| pixel == 0xFFFF_FFFF));
    }

    #[test]
    fn window_masks_follow_bounds_with_wrap() {
        let (mut lcd, ..) = fixture();
        lcd.registers.dispcnt.set_bit(13, true);

        // Window 0: x in [8, 16), y in [0, 160).
        lcd.registers.winh[0] = (8 << 8) | 16;
        lcd.registers.winv[0] = 160;
        lcd.registers.vcount = 10;
        lcd.render_window(0);

        assert!(lcd.window_covers_scanline(0));
        assert!(!lcd.buffers.win[0][7]);
        assert!(lcd.buffers.win[0][8]);
        assert!(lcd.buffers.win[0][15]);
        assert!(!lcd.buffers.win[0][16]);

        // Wrapped horizontal range [200, 16).
        lcd.registers.winh[0] = (200 << 8) | 16;
        lcd.render_window(0);
        assert!(lcd.buffers.win[0][210]);
        assert!(lcd.buffers.win[0][8]);
        assert!(!lcd.buffers.win[0][100]);
    }
}
