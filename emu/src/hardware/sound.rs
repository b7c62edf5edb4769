//! Sound register bank and direct-sound FIFO plumbing.
//!
//! Audio mixing lives outside the core; what remains here is the part that
//! participates in the cycle economy: the two direct-sound FIFOs, fed by
//! the guest through 0x040000A0/A4 and drained by timer overflows. A drain
//! that leaves a FIFO half empty asks the DMA engine for a refill burst.
//! The PSG channel registers are plain storage so guests read back their
//! own configuration.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;

/// FIFO capacity in bytes (8 words).
const FIFO_CAPACITY: usize = 32;

/// Refill threshold: half the FIFO, the level at which hardware asserts the
/// DMA request line.
const FIFO_REFILL_LEVEL: usize = 16;

#[derive(Default, Serialize, Deserialize)]
pub struct SoundFifo {
    samples: VecDeque<i8>,
}

impl SoundFifo {
    pub fn push(&mut self, value: u8) {
        if self.samples.len() < FIFO_CAPACITY {
            self.samples.push_back(value as i8);
        }
    }

    pub fn pop(&mut self) -> i8 {
        self.samples.pop_front().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Result of feeding a timer overflow into the direct-sound channels.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct FifoTick {
    /// Stereo frame to hand to the audio sink (sample A left, sample B
    /// right when both run; a lone channel plays on both sides).
    pub frame: Option<(i16, i16)>,
    pub request_fifo_a: bool,
    pub request_fifo_b: bool,
}

#[derive(Default, Serialize, Deserialize)]
pub struct Sound {
    /// Channel 1 Sweep (SOUND1CNT_L)
    pub channel1_sweep: u16,
    /// Channel 1 Duty/Length/Envelope (SOUND1CNT_H)
    pub channel1_duty_length_envelope: u16,
    /// Channel 1 Frequency/Control (SOUND1CNT_X)
    pub channel1_frequency_control: u16,
    /// Channel 2 Duty/Length/Envelope
    pub channel2_duty_length_envelope: u16,
    /// Channel 2 Frequency/Control
    pub channel2_frequency_control: u16,
    /// Channel 3 Stop/Wave RAM select
    pub channel3_stop_wave_ram_select: u16,
    /// Channel 3 Length/Volume
    pub channel3_length_volume: u16,
    /// Channel 3 Frequency/Control
    pub channel3_frequency_control: u16,
    /// Channel 4 Length/Envelope
    pub channel4_length_envelope: u16,
    /// Channel 4 Frequency/Control
    pub channel4_frequency_control: u16,
    /// SOUNDCNT_L, stereo volume and PSG enables
    pub control_stereo_volume_enable: u16,
    /// SOUNDCNT_H, mixing and direct-sound DMA control
    pub control_mixing_dma_control: u16,
    /// SOUNDCNT_X, master enable
    pub control_sound_on_off: u16,
    /// SOUNDBIAS
    pub sound_pwm_control: u16,
    /// Channel 3 wave pattern RAM
    pub channel3_wave_pattern_ram: [u8; 16],

    pub fifo_a: SoundFifo,
    pub fifo_b: SoundFifo,

    latch_a: i8,
    latch_b: i8,
}

impl Sound {
    fn master_enabled(&self) -> bool {
        self.control_sound_on_off.get_bit(7)
    }

    /// SOUNDCNT_H bit 10/14 select which timer (0 or 1) paces each FIFO.
    fn fifo_a_timer(&self) -> usize {
        usize::from(self.control_mixing_dma_control.get_bit(10))
    }

    fn fifo_b_timer(&self) -> usize {
        usize::from(self.control_mixing_dma_control.get_bit(14))
    }

    /// Drains the FIFOs paced by the overflowed timer.
    pub fn tick_fifo(&mut self, timer_id: usize) -> FifoTick {
        let mut output = FifoTick::default();

        if !self.master_enabled() || timer_id > 1 {
            return output;
        }

        let mut any = false;
        if self.fifo_a_timer() == timer_id {
            self.latch_a = self.fifo_a.pop();
            output.request_fifo_a = self.fifo_a.len() <= FIFO_REFILL_LEVEL;
            any = true;
        }
        if self.fifo_b_timer() == timer_id {
            self.latch_b = self.fifo_b.pop();
            output.request_fifo_b = self.fifo_b.len() <= FIFO_REFILL_LEVEL;
            any = true;
        }

        if any {
            // Raw 8-bit samples widened to the sink's 16-bit range.
            output.frame = Some((
                i16::from(self.latch_a) << 8,
                i16::from(self.latch_b) << 8,
            ));
        }

        output
    }

    pub fn read_register_byte(&self, offset: usize) -> u8 {
        match offset {
            0x60 => self.channel1_sweep.get_byte(0),
            0x61 => self.channel1_sweep.get_byte(1),
            0x62 => self.channel1_duty_length_envelope.get_byte(0),
            0x63 => self.channel1_duty_length_envelope.get_byte(1),
            0x64 => self.channel1_frequency_control.get_byte(0),
            0x65 => self.channel1_frequency_control.get_byte(1),
            0x68 => self.channel2_duty_length_envelope.get_byte(0),
            0x69 => self.channel2_duty_length_envelope.get_byte(1),
            0x6C => self.channel2_frequency_control.get_byte(0),
            0x6D => self.channel2_frequency_control.get_byte(1),
            0x70 => self.channel3_stop_wave_ram_select.get_byte(0),
            0x71 => self.channel3_stop_wave_ram_select.get_byte(1),
            0x72 => self.channel3_length_volume.get_byte(0),
            0x73 => self.channel3_length_volume.get_byte(1),
            0x74 => self.channel3_frequency_control.get_byte(0),
            0x75 => self.channel3_frequency_control.get_byte(1),
            0x78 => self.channel4_length_envelope.get_byte(0),
            0x79 => self.channel4_length_envelope.get_byte(1),
            0x7C => self.channel4_frequency_control.get_byte(0),
            0x7D => self.channel4_frequency_control.get_byte(1),
            0x80 => self.control_stereo_volume_enable.get_byte(0),
            0x81 => self.control_stereo_volume_enable.get_byte(1),
            0x82 => self.control_mixing_dma_control.get_byte(0),
            0x83 => self.control_mixing_dma_control.get_byte(1),
            0x84 => self.control_sound_on_off.get_byte(0),
            0x85 => self.control_sound_on_off.get_byte(1),
            0x88 => self.sound_pwm_control.get_byte(0),
            0x89 => self.sound_pwm_control.get_byte(1),
            0x90..=0x9F => self.channel3_wave_pattern_ram[offset - 0x90],
            _ => 0,
        }
    }

    pub fn write_register_byte(&mut self, offset: usize, value: u8) {
        match offset {
            0x60 => self.channel1_sweep.set_byte(0, value),
            0x61 => self.channel1_sweep.set_byte(1, value),
            0x62 => self.channel1_duty_length_envelope.set_byte(0, value),
            0x63 => self.channel1_duty_length_envelope.set_byte(1, value),
            0x64 => self.channel1_frequency_control.set_byte(0, value),
            0x65 => self.channel1_frequency_control.set_byte(1, value),
            0x68 => self.channel2_duty_length_envelope.set_byte(0, value),
            0x69 => self.channel2_duty_length_envelope.set_byte(1, value),
            0x6C => self.channel2_frequency_control.set_byte(0, value),
            0x6D => self.channel2_frequency_control.set_byte(1, value),
            0x70 => self.channel3_stop_wave_ram_select.set_byte(0, value),
            0x71 => self.channel3_stop_wave_ram_select.set_byte(1, value),
            0x72 => self.channel3_length_volume.set_byte(0, value),
            0x73 => self.channel3_length_volume.set_byte(1, value),
            0x74 => self.channel3_frequency_control.set_byte(0, value),
            0x75 => self.channel3_frequency_control.set_byte(1, value),
            0x78 => self.channel4_length_envelope.set_byte(0, value),
            0x79 => self.channel4_length_envelope.set_byte(1, value),
            0x7C => self.channel4_frequency_control.set_byte(0, value),
            0x7D => self.channel4_frequency_control.set_byte(1, value),
            0x80 => self.control_stereo_volume_enable.set_byte(0, value),
            0x81 => self.control_stereo_volume_enable.set_byte(1, value),
            0x82 => {
                self.control_mixing_dma_control.set_byte(0, value);
            }
            0x83 => {
                self.control_mixing_dma_control.set_byte(1, value);
                // Bits 11/15 reset the FIFOs; they read back as zero.
                if self.control_mixing_dma_control.get_bit(11) {
                    self.fifo_a.clear();
                    self.control_mixing_dma_control.set_bit_off(11);
                }
                if self.control_mixing_dma_control.get_bit(15) {
                    self.fifo_b.clear();
                    self.control_mixing_dma_control.set_bit_off(15);
                }
            }
            0x84 => self.control_sound_on_off.set_byte(0, value),
            0x85 => self.control_sound_on_off.set_byte(1, value),
            0x88 => self.sound_pwm_control.set_byte(0, value),
            0x89 => self.sound_pwm_control.set_byte(1, value),
            0x90..=0x9F => self.channel3_wave_pattern_ram[offset - 0x90] = value,
            0xA0..=0xA3 => self.fifo_a.push(value),
            0xA4..=0xA7 => self.fifo_b.push(value),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled_sound() -> Sound {
        let mut sound = Sound::default();
        sound.write_register_byte(0x84, 0x80);
        sound
    }

    #[test]
    fn fifo_drain_requests_dma_at_half_level() {
        let mut sound = enabled_sound();

        for i in 0..17 {
            sound.write_register_byte(0xA0, i);
        }
        assert_eq!(sound.fifo_a.len(), 17);

        // Timer 0 paces FIFO A by default.
        let tick = sound.tick_fifo(0);
        assert_eq!(tick.frame, Some((0, 0)));
        assert!(tick.request_fifo_a);
        assert!(!tick.request_fifo_b);
    }

    #[test]
    fn fifo_respects_timer_select() {
        let mut sound = enabled_sound();
        // FIFO A paced by timer 1.
        sound.write_register_byte(0x82, 0x00);
        sound.write_register_byte(0x83, 0x04);

        assert_eq!(sound.tick_fifo(0), FifoTick::default());
        assert!(sound.tick_fifo(1).frame.is_some());
    }

    #[test]
    fn fifo_reset_bits_clear_queues() {
        let mut sound = enabled_sound();
        sound.write_register_byte(0xA0, 0x12);
        sound.write_register_byte(0xA4, 0x34);

        sound.write_register_byte(0x83, 0x88);

        assert!(sound.fifo_a.is_empty());
        assert!(sound.fifo_b.is_empty());
    }

    #[test]
    fn master_disable_silences_fifo_ticks() {
        let mut sound = Sound::default();
        sound.write_register_byte(0xA0, 0x55);

        assert_eq!(sound.tick_fifo(0), FifoTick::default());
    }
}
