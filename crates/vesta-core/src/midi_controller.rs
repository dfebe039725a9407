//! Per-channel log of MIDI controller changes.
//!
//! The host-side MIDI parser calls [`MidiController::change`] with a time
//! offset relative to the start of the next block. Parameters assigned to the
//! controller turn the queued changes into smoothed ramps while they render;
//! block-evaluated parameters simply read the latest value. The owner calls
//! [`MidiController::clear`] once every parameter had its chance to see the
//! round's events.

use crate::producer::Event;
use crate::queue::Queue;
use crate::{Number, Seconds};

/// Number of MIDI channels.
pub const MIDI_CHANNELS: usize = 16;

/// Channel byte of events that apply to every channel.
pub const ALL_CHANNELS: u8 = 0xff;

/// Channel used by parameters that are not tied to a per-note channel.
/// Voices move their parameters to the note's channel in MPE setups.
pub const PARAM_DEFAULT_MPE_CHANNEL: u8 = 0;

/// Event type of a controller change: `number_param_1` is the ratio,
/// `byte_param_1` the channel.
pub const EVT_CHANGE: u8 = 1;

/// Controller values and the changes queued for the current block.
#[derive(Debug, Clone)]
pub struct MidiController {
    events: Queue<Event>,
    values: [Number; MIDI_CHANNELS],
    change_indices: [u32; MIDI_CHANNELS],
    assignments: usize,
}

impl Default for MidiController {
    fn default() -> Self {
        Self::new()
    }
}

impl MidiController {
    /// Controller resting at 0 on every channel.
    pub fn new() -> Self {
        Self::with_initial_value(0.0)
    }

    /// Controller resting at `ratio` on every channel (0.5 for pitch wheels).
    pub fn with_initial_value(ratio: Number) -> Self {
        Self {
            events: Queue::with_capacity(64),
            values: [ratio.clamp(0.0, 1.0); MIDI_CHANNELS],
            change_indices: [0; MIDI_CHANNELS],
            assignments: 0,
        }
    }

    /// Store a new value for `channel` and queue it at `time_offset`.
    pub fn change(&mut self, channel: u8, time_offset: Seconds, ratio: Number) {
        let ratio = ratio.clamp(0.0, 1.0);
        let index = channel as usize % MIDI_CHANNELS;

        self.events.push(
            Event::new(EVT_CHANGE, time_offset)
                .with_numbers(ratio, 0.0)
                .with_bytes(index as u8, 0),
        );
        self.values[index] = ratio;
        self.change_indices[index] = self.change_indices[index].wrapping_add(1);
    }

    /// Store a new value for every channel and queue a single event.
    pub fn change_all_channels(&mut self, time_offset: Seconds, ratio: Number) {
        let ratio = ratio.clamp(0.0, 1.0);

        self.events.push(
            Event::new(EVT_CHANGE, time_offset)
                .with_numbers(ratio, 0.0)
                .with_bytes(ALL_CHANNELS, 0),
        );

        for (value, change_index) in self.values.iter_mut().zip(&mut self.change_indices) {
            *value = ratio;
            *change_index = change_index.wrapping_add(1);
        }
    }

    /// Latest value on `channel`.
    #[inline]
    pub fn value(&self, channel: u8) -> Number {
        self.values[channel as usize % MIDI_CHANNELS]
    }

    /// Change counter of `channel`.
    #[inline]
    pub fn change_index(&self, channel: u8) -> u32 {
        self.change_indices[channel as usize % MIDI_CHANNELS]
    }

    /// Changes queued since the last [`clear`](Self::clear).
    #[inline]
    pub fn events(&self) -> &Queue<Event> {
        &self.events
    }

    /// Whether an event applies to `channel`.
    #[inline]
    pub fn is_event_for(event: &Event, channel: u8) -> bool {
        event.byte_param_1 == ALL_CHANNELS || event.byte_param_1 == channel
    }

    /// Drop queued events; values are kept.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Count a parameter assignment.
    pub fn assigned(&mut self) {
        self.assignments += 1;
    }

    /// Count a parameter release.
    pub fn released(&mut self) {
        self.assignments = self.assignments.saturating_sub(1);
    }

    /// Whether any parameter uses this controller.
    pub fn is_assigned(&self) -> bool {
        self.assignments != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changes_are_stored_per_channel() {
        let mut controller = MidiController::new();

        controller.change(2, 0.0, 0.75);

        assert_eq!(controller.value(2), 0.75);
        assert_eq!(controller.value(3), 0.0);
        assert_eq!(controller.change_index(2), 1);
        assert_eq!(controller.change_index(3), 0);
    }

    #[test]
    fn broadcast_reaches_every_channel() {
        let mut controller = MidiController::with_initial_value(0.5);

        controller.change_all_channels(0.1, 1.5);

        assert!((0..16).all(|ch| controller.value(ch) == 1.0));

        let event = controller.events().front().copied().expect("queued");
        assert!(MidiController::is_event_for(&event, 9));
    }

    #[test]
    fn clear_keeps_values() {
        let mut controller = MidiController::new();
        controller.change(0, 0.0, 0.3);
        controller.change(0, 0.01, 0.4);

        assert_eq!(controller.events().len(), 2);

        controller.clear();

        assert!(controller.events().is_empty());
        assert_eq!(controller.value(0), 0.4);
    }

    #[test]
    fn assignments_are_counted() {
        let mut controller = MidiController::new();

        controller.assigned();
        controller.assigned();
        controller.released();
        assert!(controller.is_assigned());

        controller.released();
        controller.released();
        assert!(!controller.is_assigned());
    }
}
