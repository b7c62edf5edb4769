//! OAM sprite renderer.
//!
//! Sprites are staged into a line buffer one scanline ahead of
//! composition. Each visible object paints `{color, priority, alpha,
//! window}` pixels; between overlapping objects the better (numerically
//! lower) priority wins and the lower OAM index breaks ties, which the
//! ascending scan realizes with a strict comparison.

use super::object_attributes::{ColorMode, GfxMode, ObjAttributes, ObjMode, RotationScaling};
use super::{Lcd, ObjectPixel, COLOR_TRANSPARENT, LCD_WIDTH};

/// Sprite tiles live in the last 32 KiB of VRAM.
const OBJ_TILE_BASE: u32 = 0x10000;

/// Sprites wrap vertically inside a 256 line world.
const WORLD_HEIGHT: u16 = 256;

/// Sprites wrap horizontally inside a 512 pixel world.
const WORLD_WIDTH: u16 = 512;

impl Lcd {
    /// Stages every object intersecting `line` into the OBJ line buffer.
    pub(crate) fn render_objects(&mut self, line: u16) {
        self.buffers.obj = [ObjectPixel::default(); LCD_WIDTH];
        self.set_line_contains_alpha_obj(false);

        // In bitmap modes the low tile numbers overlap the frame buffer
        // and are not rendered.
        let bitmap_mode = self.registers.bg_mode() >= 3;
        let one_dimensional = self.registers.obj_one_dimensional();
        let (_, _, obj_mosaic_x, _) = self.registers.mosaic_sizes();

        for index in 0..128 {
            let obj = ObjAttributes::from_oam(&self.obj_attributes, index);

            if obj.obj_mode == ObjMode::Disabled || obj.gfx_mode == GfxMode::Prohibited {
                continue;
            }
            if bitmap_mode && obj.tile_number < 512 {
                continue;
            }

            let (width, height) = obj.dimensions();
            let double = obj.obj_mode == ObjMode::AffineDouble;
            let screen_width = if double { width * 2 } else { width };
            let screen_height = if double { height * 2 } else { height };

            // Vertical hit test inside the wrapping sprite world.
            let mut local_y = line.wrapping_sub(obj.y_coordinate) % WORLD_HEIGHT;
            if local_y >= screen_height {
                continue;
            }

            if obj.mosaic {
                local_y = local_y.saturating_sub(self.vertical_obj_mosaic());
            }

            let params = if obj.is_affine() {
                Some(RotationScaling::from_oam(
                    &self.obj_attributes,
                    obj.affine_parameter,
                ))
            } else {
                None
            };

            for local_x in 0..screen_width {
                let screen_x = obj.x_coordinate.wrapping_add(local_x) % WORLD_WIDTH;
                if screen_x >= LCD_WIDTH as u16 {
                    continue;
                }

                let mut sample_x = local_x;
                if obj.mosaic && obj_mosaic_x > 1 {
                    sample_x = local_x.saturating_sub(screen_x % obj_mosaic_x);
                }

                let Some((texture_x, texture_y)) = texture_coordinates(
                    &obj,
                    params.as_ref(),
                    sample_x,
                    local_y,
                    width,
                    height,
                    screen_width,
                    screen_height,
                ) else {
                    continue;
                };

                let color = self.fetch_obj_color(&obj, texture_x, texture_y, one_dimensional);
                if color == COLOR_TRANSPARENT {
                    continue;
                }

                let pixel = &mut self.buffers.obj[usize::from(screen_x)];

                if obj.gfx_mode == GfxMode::ObjectWindow {
                    pixel.window = true;
                    continue;
                }

                if obj.priority < pixel.priority || pixel.color == COLOR_TRANSPARENT {
                    let alpha = obj.gfx_mode == GfxMode::AlphaBlending;
                    *pixel = ObjectPixel {
                        color,
                        priority: obj.priority,
                        alpha,
                        window: pixel.window,
                    };
                    if alpha {
                        self.set_line_contains_alpha_obj(true);
                    }
                }
            }
        }
    }

    fn fetch_obj_color(
        &self,
        obj: &ObjAttributes,
        texture_x: u16,
        texture_y: u16,
        one_dimensional: bool,
    ) -> u16 {
        let (width, _) = obj.dimensions();
        let tile_x = u32::from(texture_x) / 8;
        let tile_y = u32::from(texture_y) / 8;
        let pixel_x = u32::from(texture_x) % 8;
        let pixel_y = u32::from(texture_y) % 8;
        let width_tiles = u32::from(width) / 8;
        let tile_number = u32::from(obj.tile_number);

        match obj.color_mode {
            ColorMode::Palette4bpp => {
                let tile = tile_number
                    + if one_dimensional {
                        tile_y * width_tiles + tile_x
                    } else {
                        tile_y * 32 + tile_x
                    };

                let offset = OBJ_TILE_BASE + (tile & 0x3FF) * 32 + pixel_y * 4 + pixel_x / 2;
                let mut data = self.video_ram[offset as usize];
                if pixel_x & 1 != 0 {
                    data >>= 4;
                } else {
                    data &= 15;
                }

                if data == 0 {
                    COLOR_TRANSPARENT
                } else {
                    self.read_obj_palette(obj.palette_number, u16::from(data))
                }
            }
            ColorMode::Palette8bpp => {
                // 8bpp sprites consume even tile numbers.
                let tile = tile_number
                    + if one_dimensional {
                        (tile_y * width_tiles + tile_x) * 2
                    } else {
                        tile_y * 32 + tile_x * 2
                    };

                let offset = OBJ_TILE_BASE + (tile & 0x3FF) * 32 + pixel_y * 8 + pixel_x;
                let data = self.video_ram[offset as usize];

                if data == 0 {
                    COLOR_TRANSPARENT
                } else {
                    self.read_obj_palette(0, u16::from(data))
                }
            }
        }
    }
}

/// Maps a sprite-local screen position into texture space, applying the
/// affine matrix or the flip bits. Returns None when the transformed
/// position falls outside the sprite.
#[allow(clippy::too_many_arguments)]
fn texture_coordinates(
    obj: &ObjAttributes,
    params: Option<&RotationScaling>,
    local_x: u16,
    local_y: u16,
    width: u16,
    height: u16,
    screen_width: u16,
    screen_height: u16,
) -> Option<(u16, u16)> {
    match params {
        Some(params) => {
            // The matrix rotates around the center of the screen-space
            // rectangle, mapping onto the center of the texture.
            let center_x = i32::from(screen_width) / 2;
            let center_y = i32::from(screen_height) / 2;
            let dx = i32::from(local_x) - center_x;
            let dy = i32::from(local_y) - center_y;

            let texture_x =
                ((i32::from(params.pa) * dx + i32::from(params.pb) * dy) >> 8)
                    + i32::from(width) / 2;
            let texture_y =
                ((i32::from(params.pc) * dx + i32::from(params.pd) * dy) >> 8)
                    + i32::from(height) / 2;

            if texture_x < 0
                || texture_x >= i32::from(width)
                || texture_y < 0
                || texture_y >= i32::from(height)
            {
                None
            } else {
                Some((texture_x as u16, texture_y as u16))
            }
        }
        None => {
            let texture_x = if obj.h_flip {
                width - 1 - local_x
            } else {
                local_x
            };
            let texture_y = if obj.v_flip {
                height - 1 - local_y
            } else {
                local_y
            };
            Some((texture_x, texture_y))
        }
    }
}
