//! The four 16-bit timers.
//!
//! Timers never tick cycle by cycle: a running timer schedules a single
//! overflow event at the cycle its counter wraps, and counter reads are
//! reconstructed from the cycle distance to the latched start timestamp.
//! Cascade timers carry no event at all; they advance when their
//! predecessor overflows.

use serde::{Deserialize, Serialize};

use crate::bitwise::Bits;
use crate::scheduler::{EventHandle, HardwareEvent, Scheduler};

/// Prescaler shift per TMxCNT_H frequency selection (1, 64, 256, 1024).
const PRESCALER_SHIFT: [u8; 4] = [0, 6, 8, 10];

#[derive(Default, Serialize, Deserialize)]
pub struct Timer {
    /// TMxCNT_L write value, loaded into the counter on (re)start and on
    /// every overflow.
    pub reload: u16,
    /// TMxCNT_H.
    pub control: u16,
    /// Counter value latched at `start_time` (running) or frozen (stopped).
    counter: u16,
    start_time: u64,
    #[serde(skip)]
    overflow_event: Option<EventHandle>,
}

impl Timer {
    fn enabled(&self) -> bool {
        self.control.get_bit(7)
    }

    fn cascade(&self) -> bool {
        self.control.get_bit(2)
    }

    fn irq_enabled(&self) -> bool {
        self.control.get_bit(6)
    }

    fn prescaler_shift(&self) -> u8 {
        PRESCALER_SHIFT[self.control.get_bits(0..=1) as usize]
    }

    fn cycles_until_overflow(&self) -> u64 {
        (0x1_0000 - u64::from(self.counter)) << self.prescaler_shift()
    }

    fn current_counter(&self, now: u64) -> u16 {
        if self.enabled() && !self.cascade() {
            let elapsed = (now - self.start_time) >> self.prescaler_shift();
            self.counter.wrapping_add(elapsed as u16)
        } else {
            self.counter
        }
    }
}

#[derive(Default, Serialize, Deserialize)]
pub struct Timers {
    pub timers: [Timer; 4],
}

/// What a drained overflow event asks the bus to do.
#[derive(Default, Debug, PartialEq, Eq)]
pub struct OverflowOutput {
    /// Timers whose IRQ should be raised (the overflowed one plus any
    /// cascade timers that wrapped with it).
    pub raise_irq: [bool; 4],
    /// Timers that overflowed this drain; timers 0/1 feed the sound FIFOs.
    pub overflowed: [bool; 4],
}

impl Timers {
    pub fn read_register_byte(&self, offset: usize, now: u64) -> u8 {
        let id = (offset - 0x100) / 4;
        let timer = &self.timers[id];

        match (offset - 0x100) % 4 {
            0 => timer.current_counter(now).get_byte(0),
            1 => timer.current_counter(now).get_byte(1),
            2 => timer.control.get_byte(0),
            3 => timer.control.get_byte(1),
            _ => unreachable!(),
        }
    }

    pub fn write_register_byte(&mut self, offset: usize, value: u8, scheduler: &mut Scheduler) {
        let id = (offset - 0x100) / 4;

        match (offset - 0x100) % 4 {
            0 => self.timers[id].reload.set_byte(0, value),
            1 => self.timers[id].reload.set_byte(1, value),
            2 => self.write_control(id, value, scheduler),
            3 => self.timers[id].control.set_byte(1, value),
            _ => unreachable!(),
        }
    }

    fn write_control(&mut self, id: usize, value: u8, scheduler: &mut Scheduler) {
        let was_enabled = self.timers[id].enabled();
        let now = scheduler.now();

        // Freeze the live counter before the control bits change under it.
        self.timers[id].counter = self.timers[id].current_counter(now);
        if let Some(event) = self.timers[id].overflow_event.take() {
            scheduler.cancel(event);
        }

        self.timers[id].control.set_byte(0, value);
        let timer = &mut self.timers[id];

        if timer.enabled() {
            if !was_enabled {
                timer.counter = timer.reload;
            }
            timer.start_time = now;
            if !timer.cascade() {
                let delay = timer.cycles_until_overflow();
                timer.overflow_event =
                    Some(scheduler.add(delay, HardwareEvent::TimerOverflow(id)));
            }
        }
    }

    /// Handles a drained [`HardwareEvent::TimerOverflow`].
    pub fn handle_overflow(
        &mut self,
        id: usize,
        cycles_late: u64,
        scheduler: &mut Scheduler,
    ) -> OverflowOutput {
        let mut output = OverflowOutput::default();

        let timer = &mut self.timers[id];
        timer.overflow_event = None;
        if !timer.enabled() || timer.cascade() {
            // Stale event that raced a control write; the write already
            // cancelled or reconfigured the timer.
            return output;
        }

        timer.counter = timer.reload;
        timer.start_time = scheduler.now() - cycles_late;
        let delay = timer.cycles_until_overflow().saturating_sub(cycles_late);
        timer.overflow_event = Some(scheduler.add(delay, HardwareEvent::TimerOverflow(id)));

        self.note_overflow(id, &mut output);
        output
    }

    fn note_overflow(&mut self, id: usize, output: &mut OverflowOutput) {
        output.overflowed[id] = true;
        if self.timers[id].irq_enabled() {
            output.raise_irq[id] = true;
        }

        // Feed the next timer if it counts up on our overflow.
        if id < 3 {
            let next = &mut self.timers[id + 1];
            if next.enabled() && next.cascade() {
                let (counter, wrapped) = next.counter.overflowing_add(1);
                next.counter = if wrapped { next.reload } else { counter };
                if wrapped {
                    self.note_overflow(id + 1, output);
                }
            }
        }
    }
}
