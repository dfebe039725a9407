//! DAHDSR envelopes and per-voice snapshots.
//!
//! An [`Envelope`] is a bundle of block-evaluated parameters. Voices never
//! read it directly while a note plays: when a note starts, the parameter
//! that uses the envelope freezes the current settings into an
//! [`EnvelopeSnapshot`], applying the voice's random offsets for time and
//! value inaccuracy, and renders from that snapshot. Editing the envelope
//! therefore only affects running notes when the [`UpdateMode`] says so.
//!
//! ```text
//! initial ─delay─▶ initial ─attack─▶ peak ─hold─▶ peak ─decay─▶ sustain ··· ─release─▶ final
//! ```

use crate::param::{ByteParam, FloatParam};
use crate::queue::Queue;
use crate::shape::EnvelopeShape;
use crate::{Number, Seconds};

/// Upper limit of the random time offset added by time inaccuracy.
pub const TIME_INACCURACY_MAX: Seconds = 0.3;

/// Number of random values a voice provides per envelope.
pub const ENVELOPE_RANDOMS: usize = 9;

/// Per-voice random numbers in `[0, 1)`, consumed by snapshots.
pub type EnvelopeRandoms = [Number; ENVELOPE_RANDOMS];

/// The voice played the most recent note.
pub const VOICE_STATUS_LAST: u8 = 1;
/// The voice holds the oldest sounding note.
pub const VOICE_STATUS_OLDEST: u8 = 2;
/// The voice holds the lowest sounding note.
pub const VOICE_STATUS_LOWEST: u8 = 4;
/// The voice holds the highest sounding note.
pub const VOICE_STATUS_HIGHEST: u8 = 8;

/// When edits reach notes that are already playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum UpdateMode {
    /// Settings are frozen at note start.
    #[default]
    Static = 0,
    /// Release settings are read again when the note ends.
    End = 1,
    /// Every running note follows edits.
    Dynamic = 2,
    /// Only the most recent note follows edits.
    DynamicLast = 3,
    /// Only the oldest note follows edits.
    DynamicOldest = 4,
    /// Only the lowest note follows edits.
    DynamicLowest = 5,
    /// Only the highest note follows edits.
    DynamicHighest = 6,
}

impl UpdateMode {
    /// Decode a byte parameter value; unknown values mean static.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            1 => Self::End,
            2 => Self::Dynamic,
            3 => Self::DynamicLast,
            4 => Self::DynamicOldest,
            5 => Self::DynamicLowest,
            6 => Self::DynamicHighest,
            _ => Self::Static,
        }
    }

    /// Whether running notes with `voice_status` follow edits.
    pub fn is_dynamic_for(self, voice_status: u8) -> bool {
        match self {
            Self::Static | Self::End => false,
            Self::Dynamic => true,
            Self::DynamicLast => voice_status & VOICE_STATUS_LAST != 0,
            Self::DynamicOldest => voice_status & VOICE_STATUS_OLDEST != 0,
            Self::DynamicLowest => voice_status & VOICE_STATUS_LOWEST != 0,
            Self::DynamicHighest => voice_status & VOICE_STATUS_HIGHEST != 0,
        }
    }
}

/// Frozen envelope settings for one voice. Values are ratios already
/// multiplied by the envelope's scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvelopeSnapshot {
    /// Value during the delay stage.
    pub initial_value: Number,
    /// Value reached by the attack.
    pub peak_value: Number,
    /// Value held after the decay.
    pub sustain_value: Number,
    /// Value reached by the release.
    pub final_value: Number,
    /// Delay stage length.
    pub delay_time: Seconds,
    /// Attack stage length.
    pub attack_time: Seconds,
    /// Hold stage length.
    pub hold_time: Seconds,
    /// Decay stage length.
    pub decay_time: Seconds,
    /// Release stage length.
    pub release_time: Seconds,
    /// Attack curve.
    pub attack_shape: EnvelopeShape,
    /// Decay curve.
    pub decay_shape: EnvelopeShape,
    /// Release curve.
    pub release_shape: EnvelopeShape,
    /// Change index of the envelope when the snapshot was made.
    pub change_index: u32,
}

impl Default for EnvelopeSnapshot {
    fn default() -> Self {
        Self {
            initial_value: 0.0,
            peak_value: 1.0,
            sustain_value: 0.7,
            final_value: 0.0,
            delay_time: 0.0,
            attack_time: 0.02,
            hold_time: 0.3,
            decay_time: 0.6,
            release_time: 0.1,
            attack_shape: EnvelopeShape::Linear,
            decay_shape: EnvelopeShape::Linear,
            release_shape: EnvelopeShape::Linear,
            change_index: 0,
        }
    }
}

impl EnvelopeSnapshot {
    /// Delay, attack, hold and decay together.
    #[inline]
    pub fn dahd_length(&self) -> Seconds {
        self.delay_time + self.attack_time + self.hold_time + self.decay_time
    }
}

/// Arena of snapshots addressed by id; freed ids are reused.
#[derive(Debug, Clone)]
pub struct SnapshotArena {
    snapshots: Vec<EnvelopeSnapshot>,
    free_ids: Queue<usize>,
    is_free: Vec<bool>,
}

impl Default for SnapshotArena {
    fn default() -> Self {
        Self::with_capacity(4)
    }
}

impl SnapshotArena {
    /// Arena with room for `capacity` snapshots before it grows.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            snapshots: Vec::with_capacity(capacity),
            free_ids: Queue::with_capacity(capacity),
            is_free: Vec::with_capacity(capacity),
        }
    }

    /// Store a snapshot and return its id.
    pub fn insert(&mut self, snapshot: EnvelopeSnapshot) -> usize {
        if let Some(id) = self.free_ids.pop() {
            self.snapshots[id] = snapshot;
            self.is_free[id] = false;
            return id;
        }

        self.snapshots.push(snapshot);
        self.is_free.push(false);
        self.snapshots.len() - 1
    }

    /// Return an id to the free list; unknown and already free ids are
    /// ignored.
    pub fn release(&mut self, id: usize) {
        if let Some(is_free) = self.is_free.get_mut(id)
            && !*is_free
        {
            *is_free = true;
            self.free_ids.push(id);
        }
    }

    /// A live snapshot.
    pub fn get(&self, id: usize) -> Option<&EnvelopeSnapshot> {
        self.is_live(id).then(|| &self.snapshots[id])
    }

    /// A live snapshot, mutably.
    pub fn get_mut(&mut self, id: usize) -> Option<&mut EnvelopeSnapshot> {
        if self.is_live(id) {
            Some(&mut self.snapshots[id])
        } else {
            None
        }
    }

    /// Whether `id` refers to a snapshot that was not released.
    pub fn is_live(&self, id: usize) -> bool {
        self.is_free.get(id).is_some_and(|is_free| !is_free)
    }

    /// Number of live snapshots.
    pub fn live_count(&self) -> usize {
        self.is_free.iter().filter(|is_free| !**is_free).count()
    }

    /// Number of ids handed out so far, live or free.
    pub fn slot_count(&self) -> usize {
        self.is_free.len()
    }

    /// Release every snapshot.
    pub fn clear(&mut self) {
        self.snapshots.clear();
        self.is_free.clear();
        self.free_ids.clear();
    }
}

/// A DAHDSR envelope definition.
#[derive(Debug)]
pub struct Envelope {
    /// [`UpdateMode`] selector.
    pub update_mode: ByteParam,
    /// Multiplier applied to every value.
    pub scale: FloatParam,
    /// Value during the delay stage.
    pub initial_value: FloatParam,
    /// Delay stage length.
    pub delay_time: FloatParam,
    /// Attack stage length.
    pub attack_time: FloatParam,
    /// Value reached by the attack.
    pub peak_value: FloatParam,
    /// Hold stage length.
    pub hold_time: FloatParam,
    /// Decay stage length.
    pub decay_time: FloatParam,
    /// Value held after the decay.
    pub sustain_value: FloatParam,
    /// Release stage length.
    pub release_time: FloatParam,
    /// Value reached by the release.
    pub final_value: FloatParam,
    /// Random time offset amount.
    pub time_inaccuracy: FloatParam,
    /// Random value scaling amount.
    pub value_inaccuracy: FloatParam,
    /// [`EnvelopeShape`] of the attack.
    pub attack_shape: ByteParam,
    /// [`EnvelopeShape`] of the decay.
    pub decay_shape: ByteParam,
    /// [`EnvelopeShape`] of the release.
    pub release_shape: ByteParam,
    seen_change_indices: [u32; 16],
    change_index: u32,
}

impl Envelope {
    /// Envelope with default settings; parameter names are prefixed with
    /// `name`.
    pub fn new(name: &str) -> Self {
        let linear = EnvelopeShape::Linear as u8;
        let shapes = (EnvelopeShape::ALL.len() - 1) as u8;

        let mut envelope = Self {
            update_mode: ByteParam::new(format!("{name}UPD"), 0, 6, UpdateMode::Static as u8),
            scale: FloatParam::block(format!("{name}AMT"), 0.0, 1.0, 1.0),
            initial_value: FloatParam::block(format!("{name}INI"), 0.0, 1.0, 0.0),
            delay_time: FloatParam::block(format!("{name}DEL"), 0.0, 6.0, 0.0),
            attack_time: FloatParam::block(format!("{name}ATK"), 0.0, 6.0, 0.02),
            peak_value: FloatParam::block(format!("{name}PK"), 0.0, 1.0, 1.0),
            hold_time: FloatParam::block(format!("{name}HLD"), 0.0, 12.0, 0.3),
            decay_time: FloatParam::block(format!("{name}DEC"), 0.0, 15.0, 0.6),
            sustain_value: FloatParam::block(format!("{name}SUS"), 0.0, 1.0, 0.7),
            release_time: FloatParam::block(format!("{name}REL"), 0.0, 6.0, 0.1),
            final_value: FloatParam::block(format!("{name}FIN"), 0.0, 1.0, 0.0),
            time_inaccuracy: FloatParam::block(format!("{name}TIN"), 0.0, 1.0, 0.0),
            value_inaccuracy: FloatParam::block(format!("{name}VIN"), 0.0, 1.0, 0.0),
            attack_shape: ByteParam::new(format!("{name}ASH"), 0, shapes, linear),
            decay_shape: ByteParam::new(format!("{name}DSH"), 0, shapes, linear),
            release_shape: ByteParam::new(format!("{name}RSH"), 0, shapes, linear),
            seen_change_indices: [u32::MAX; 16],
            change_index: 0,
        };

        envelope.update();
        envelope
    }

    /// Poll every setting and bump the change index if any of them moved.
    pub fn update(&mut self) {
        let current = self.current_change_indices();
        let mut is_dirty = false;

        for (seen, current) in self.seen_change_indices.iter_mut().zip(current) {
            if *seen != current {
                *seen = current;
                is_dirty = true;
            }
        }

        if is_dirty {
            self.change_index = self.change_index.wrapping_add(1);
        }
    }

    /// Wrapping counter of observed changes, valid after [`update`](Self::update).
    #[inline]
    pub fn change_index(&self) -> u32 {
        self.change_index
    }

    /// Current update mode.
    pub fn update_mode(&self) -> UpdateMode {
        UpdateMode::from_byte(self.update_mode.value())
    }

    /// Whether the envelope is frozen at note start.
    pub fn is_static(&self) -> bool {
        self.update_mode() == UpdateMode::Static
    }

    /// Freeze the current settings, varied by `randoms`.
    pub fn make_snapshot(&self, randoms: &EnvelopeRandoms) -> EnvelopeSnapshot {
        let mut snapshot = EnvelopeSnapshot {
            change_index: self.change_index,
            attack_shape: EnvelopeShape::from_byte(self.attack_shape.value()),
            decay_shape: EnvelopeShape::from_byte(self.decay_shape.value()),
            ..EnvelopeSnapshot::default()
        };

        snapshot.initial_value = self.randomize_value(&self.initial_value, randoms[0]);
        snapshot.peak_value = self.randomize_value(&self.peak_value, randoms[1]);
        snapshot.sustain_value = self.randomize_value(&self.sustain_value, randoms[2]);
        snapshot.delay_time = self.randomize_time(&self.delay_time, randoms[4]);
        snapshot.attack_time = self.randomize_time(&self.attack_time, randoms[5]);
        snapshot.hold_time = self.randomize_time(&self.hold_time, randoms[6]);
        snapshot.decay_time = self.randomize_time(&self.decay_time, randoms[7]);

        self.make_end_snapshot(randoms, &mut snapshot);

        snapshot
    }

    /// Refresh only the release settings of `snapshot`.
    pub fn make_end_snapshot(&self, randoms: &EnvelopeRandoms, snapshot: &mut EnvelopeSnapshot) {
        snapshot.change_index = self.change_index;
        snapshot.final_value = self.randomize_value(&self.final_value, randoms[3]);
        snapshot.release_time = self.randomize_time(&self.release_time, randoms[8]);
        snapshot.release_shape = EnvelopeShape::from_byte(self.release_shape.value());
    }

    fn randomize_value(&self, param: &FloatParam, random: Number) -> Number {
        let value_inaccuracy = self.value_inaccuracy.value();
        let scaled = self.scale.value() * param.value();

        if value_inaccuracy > 0.000001 {
            (((random - 0.5) * value_inaccuracy + 1.0) * scaled).min(1.0)
        } else {
            scaled
        }
    }

    fn randomize_time(&self, param: &FloatParam, random: Number) -> Seconds {
        let time_inaccuracy = self.time_inaccuracy.value();

        if time_inaccuracy > 0.000001 {
            (param.value() + random * time_inaccuracy * TIME_INACCURACY_MAX).min(param.max())
        } else {
            param.value()
        }
    }

    fn current_change_indices(&self) -> [u32; 16] {
        [
            self.update_mode.change_index(),
            self.scale.change_index(),
            self.initial_value.change_index(),
            self.delay_time.change_index(),
            self.attack_time.change_index(),
            self.peak_value.change_index(),
            self.hold_time.change_index(),
            self.decay_time.change_index(),
            self.sustain_value.change_index(),
            self.release_time.change_index(),
            self.final_value.change_index(),
            self.time_inaccuracy.change_index(),
            self.value_inaccuracy.change_index(),
            self.attack_shape.change_index(),
            self.decay_shape.change_index(),
            self.release_shape.change_index(),
        ]
    }
}
