//! Scanline composition: windows, priority resolution and color effects.

use super::{Lcd, COLOR_TRANSPARENT, LCD_WIDTH};

/// Composition layer numbers; 0-3 are backgrounds.
const LAYER_OBJ: usize = 4;
/// Backdrop and the SFX enable bit share slot 5 in the enable vectors.
const LAYER_BACKDROP: usize = 5;
const LAYER_SFX: usize = 5;

const EFFECT_NONE: u8 = 0;
const EFFECT_ALPHA: u8 = 1;
const EFFECT_BRIGHTEN: u8 = 2;
const EFFECT_DARKEN: u8 = 3;

/// RGB555 to RGBA8888 with 5-to-8 bit replication; 0x7FFF maps to opaque
/// white 0xFFFFFFFF.
pub(crate) fn convert_color(color: u16) -> u32 {
    let expand = |channel: u32| (channel << 3) | (channel >> 2);

    let red = expand(u32::from(color) & 0x1F);
    let green = expand((u32::from(color) >> 5) & 0x1F);
    let blue = expand((u32::from(color) >> 10) & 0x1F);

    0xFF00_0000 | (blue << 16) | (green << 8) | red
}

impl Lcd {
    /// Folds the staged layer buffers into the output line.
    ///
    /// Only backgrounds in `bg_min..=bg_max` exist in the current mode.
    pub(crate) fn compose_scanline(&mut self, bg_min: usize, bg_max: usize) {
        let line = usize::from(self.registers.vcount);
        let backdrop = self.read_palette(0, 0);

        let registers = &self.registers;

        let win0_active = registers.win0_enabled() && self.window_scanline_enable[0];
        let win1_active = registers.win1_enabled() && self.window_scanline_enable[1];
        let winobj_active = registers.winobj_enabled();
        let no_windows = !registers.any_window_enabled();

        let winin0 = registers.winin_enable(0);
        let winin1 = registers.winin_enable(1);
        let winout = registers.winout_enable();
        let winobj = registers.winobj_enable();

        // Enabled backgrounds ordered worst-to-best priority, so a forward
        // scan leaves the top-most layer in slot 0.
        let mut bg_list = [0_usize; 4];
        let mut bg_count = 0;
        for priority in (0..4).rev() {
            for bg in (bg_min..=bg_max).rev() {
                if registers.bg_enabled(bg) && registers.bg_priority(bg) == priority {
                    bg_list[bg_count] = bg;
                    bg_count += 1;
                }
            }
        }

        let obj_enabled = registers.obj_enabled();
        let effect = registers.blend_effect();
        let targets_first = registers.blend_targets(0);
        let targets_second = registers.blend_targets(1);
        let eva = registers.blend_eva();
        let evb = registers.blend_evb();
        let evy = registers.blend_evy();

        for x in 0..LCD_WIDTH {
            // Highest-priority window claiming this pixel picks the
            // layer-enable vector.
            let win_enable = if win0_active && self.buffers.win[0][x] {
                &winin0
            } else if win1_active && self.buffers.win[1][x] {
                &winin1
            } else if winobj_active && self.buffers.obj[x].window {
                &winobj
            } else {
                &winout
            };

            // Capture the top two visible layers.
            let mut layer = [LAYER_BACKDROP; 2];
            let mut priority = [4_u8; 2];

            for &bg in &bg_list[..bg_count] {
                if (no_windows || win_enable[bg])
                    && self.buffers.bg[bg][x] != COLOR_TRANSPARENT
                {
                    layer[1] = layer[0];
                    layer[0] = bg;
                    priority[1] = priority[0];
                    priority[0] = self.registers.bg_priority(bg);
                }
            }

            let obj = self.buffers.obj[x];
            if obj_enabled
                && obj.color != COLOR_TRANSPARENT
                && (no_windows || win_enable[LAYER_OBJ])
            {
                if obj.priority <= priority[0] {
                    layer[1] = layer[0];
                    layer[0] = LAYER_OBJ;
                } else if obj.priority <= priority[1] {
                    layer[1] = LAYER_OBJ;
                }
            }

            let resolve = |layer: usize| match layer {
                0..=3 => self.buffers.bg[layer][x],
                LAYER_OBJ => obj.color,
                _ => backdrop,
            };
            let mut pixel = [resolve(layer[0]), resolve(layer[1])];

            // A semi-transparent OBJ on top forces alpha blending against
            // any second target, ignoring the configured effect.
            let is_alpha_obj = layer[0] == LAYER_OBJ && obj.alpha;

            if no_windows || win_enable[LAYER_SFX] || is_alpha_obj {
                let first_is_target = targets_first[layer[0]];
                let second_is_target = targets_second[layer[1]];

                if is_alpha_obj && second_is_target {
                    pixel[0] = alpha_blend(pixel[0], pixel[1], eva, evb);
                } else if first_is_target && effect != EFFECT_NONE {
                    match effect {
                        EFFECT_ALPHA => {
                            if second_is_target {
                                pixel[0] = alpha_blend(pixel[0], pixel[1], eva, evb);
                            }
                        }
                        EFFECT_BRIGHTEN => pixel[0] = brighten(pixel[0], evy),
                        EFFECT_DARKEN => pixel[0] = darken(pixel[0], evy),
                        _ => {}
                    }
                }
            }

            self.buffers.output[line * LCD_WIDTH + x] = convert_color(pixel[0]);
        }
    }
}

fn split_channels(color: u16) -> (u16, u16, u16) {
    (color & 0x1F, (color >> 5) & 0x1F, (color >> 10) & 0x1F)
}

fn pack_channels(red: u16, green: u16, blue: u16) -> u16 {
    red | (green << 5) | (blue << 10)
}

/// `min(31, (c1 * eva + c2 * evb) >> 4)` per channel.
fn alpha_blend(first: u16, second: u16, eva: u16, evb: u16) -> u16 {
    let (r1, g1, b1) = split_channels(first);
    let (r2, g2, b2) = split_channels(second);

    pack_channels(
        ((r1 * eva + r2 * evb) >> 4).min(31),
        ((g1 * eva + g2 * evb) >> 4).min(31),
        ((b1 * eva + b2 * evb) >> 4).min(31),
    )
}

/// `c + ((31 - c) * evy >> 4)` per channel.
fn brighten(color: u16, evy: u16) -> u16 {
    let (r, g, b) = split_channels(color);

    pack_channels(
        r + (((31 - r) * evy) >> 4),
        g + (((31 - g) * evy) >> 4),
        b + (((31 - b) * evy) >> 4),
    )
}

/// `c - (c * evy >> 4)` per channel.
fn darken(color: u16, evy: u16) -> u16 {
    let (r, g, b) = split_channels(color);

    pack_channels(r - ((r * evy) >> 4), g - ((g * evy) >> 4), b - ((b * evy) >> 4))
}

#[cfg(test)]
mod tests {
    use super::super::ObjectPixel;
    use super::*;

    fn set_backdrop(lcd: &mut Lcd, color: u16) {
        lcd.palette_ram[0..2].copy_from_slice(&color.to_le_bytes());
    }

    #[test]
    fn convert_replicates_channel_bits() {
        assert_eq!(convert_color(0x7FFF), 0xFFFF_FFFF);
        assert_eq!(convert_color(0x0000), 0xFF00_0000);
        // Pure 5-bit red becomes pure 8-bit red.
        assert_eq!(convert_color(0x001F), 0xFF00_00FF);
    }

    #[test]
    fn backdrop_shows_through_transparent_layers() {
        let mut lcd = Lcd::default();
        set_backdrop(&mut lcd, 0x0333);
        lcd.registers.vcount = 0;

        lcd.compose_scanline(0, 3);
        assert_eq!(lcd.buffers.output[0], convert_color(0x0333));
    }

    #[test]
    fn higher_priority_background_wins() {
        let mut lcd = Lcd::default();
        lcd.registers.dispcnt = (1 << 8) | (1 << 9);
        lcd.registers.bgcnt[0] = 1; // priority 1
        lcd.registers.bgcnt[1] = 0; // priority 0
        lcd.buffers.bg[0] = [0x001F; LCD_WIDTH];
        lcd.buffers.bg[1] = [0x03E0; LCD_WIDTH];

        lcd.compose_scanline(0, 3);
        assert_eq!(lcd.buffers.output[0], convert_color(0x03E0));
    }

    #[test]
    fn equal_priority_backgrounds_resolve_by_index() {
        let mut lcd = Lcd::default();
        lcd.registers.dispcnt = (1 << 8) | (1 << 9);
        lcd.buffers.bg[0] = [0x001F; LCD_WIDTH];
        lcd.buffers.bg[1] = [0x03E0; LCD_WIDTH];

        lcd.compose_scanline(0, 3);
        assert_eq!(lcd.buffers.output[0], convert_color(0x001F));
    }

    #[test]
    fn alpha_blend_mixes_top_two_targets() {
        let mut lcd = Lcd::default();
        lcd.registers.dispcnt = (1 << 8) | (1 << 9);
        lcd.registers.bgcnt[0] = 0;
        lcd.registers.bgcnt[1] = 1;
        lcd.buffers.bg[0] = [pack_channels(31, 0, 0); LCD_WIDTH];
        lcd.buffers.bg[1] = [pack_channels(0, 31, 0); LCD_WIDTH];

        // Alpha blend BG0 over BG1 at 8/16 + 8/16.
        lcd.registers.bldcnt = 1 | (1 << 9) | (1 << 6);
        lcd.registers.bldalpha = 8 | (8 << 8);

        lcd.compose_scanline(0, 3);
        assert_eq!(
            lcd.buffers.output[0],
            convert_color(pack_channels(15, 15, 0))
        );
    }

    #[test]
    fn brighten_and_darken_follow_evy() {
        let mut lcd = Lcd::default();
        lcd.registers.dispcnt = 1 << 8;
        lcd.buffers.bg[0] = [pack_channels(8, 16, 31); LCD_WIDTH];
        lcd.registers.bldcnt = 1 | (2 << 6);
        lcd.registers.bldy = 8;

        lcd.compose_scanline(0, 3);
        let expected = pack_channels(8 + ((31 - 8) * 8 >> 4), 16 + ((31 - 16) * 8 >> 4), 31);
        assert_eq!(lcd.buffers.output[0], convert_color(expected));

        lcd.registers.bldcnt = 1 | (3 << 6);
        lcd.compose_scanline(0, 3);
        let expected = pack_channels(8 - (8 * 8 >> 4), 16 - (16 * 8 >> 4), 31 - (31 * 8 >> 4));
        assert_eq!(lcd.buffers.output[0], convert_color(expected));
    }

    #[test]
    fn semi_transparent_obj_forces_alpha() {
        let mut lcd = Lcd::default();
        lcd.registers.dispcnt = (1 << 8) | (1 << 12);
        lcd.buffers.bg[0] = [pack_channels(0, 31, 0); LCD_WIDTH];
        lcd.buffers.obj[0] = ObjectPixel {
            color: pack_channels(31, 0, 0),
            priority: 0,
            alpha: true,
            window: false,
        };

        // Effect disabled, but BG0 is a second target.
        lcd.registers.bldcnt = 1 << 8;
        lcd.registers.bldalpha = 8 | (8 << 8);

        lcd.compose_scanline(0, 3);
        assert_eq!(
            lcd.buffers.output[0],
            convert_color(pack_channels(15, 15, 0))
        );
        // Pixels without the OBJ stay unblended.
        assert_eq!(lcd.buffers.output[1], convert_color(pack_channels(0, 31, 0)));
    }

    #[test]
    fn window_disables_layers_per_pixel() {
        let mut lcd = Lcd::default();
        set_backdrop(&mut lcd, 0);
        // BG0 enabled, window 0 enabled.
        lcd.registers.dispcnt = (1 << 8) | (1 << 13);
        lcd.buffers.bg[0] = [0x001F; LCD_WIDTH];

        // Window 0 covers x < 100 and disables BG0 inside; outside shows it.
        lcd.window_scanline_enable[0] = true;
        for x in 0..100 {
            lcd.buffers.win[0][x] = true;
        }
        lcd.registers.winin = 0;
        lcd.registers.winout = 0b0000_0001;

        lcd.compose_scanline(0, 3);
        assert_eq!(lcd.buffers.output[0], convert_color(0));
        assert_eq!(lcd.buffers.output[100], convert_color(0x001F));
    }

    #[test]
    fn obj_window_uses_its_own_enables() {
        let mut lcd = Lcd::default();
        set_backdrop(&mut lcd, 0);
        lcd.registers.dispcnt = (1 << 8) | (1 << 12) | (1 << 15);
        lcd.buffers.bg[0] = [0x001F; LCD_WIDTH];
        lcd.buffers.obj[5] = ObjectPixel {
            color: COLOR_TRANSPARENT,
            priority: 4,
            alpha: false,
            window: true,
        };

        // Outside: BG0 visible; inside OBJ window: BG0 hidden.
        lcd.registers.winout = 0b0000_0001;

        lcd.compose_scanline(0, 3);
        assert_eq!(lcd.buffers.output[4], convert_color(0x001F));
        assert_eq!(lcd.buffers.output[5], convert_color(0));
    }
}
