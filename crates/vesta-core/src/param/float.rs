use std::rc::Rc;

use super::log_scale::LogScale;
use super::ramp::Ramp;
use super::{Evaluation, Param, ToggleParam, is_on};
use crate::envelope::{
    Envelope, EnvelopeRandoms, EnvelopeSnapshot, ENVELOPE_RANDOMS, SnapshotArena, UpdateMode,
};
use crate::lfo::{Lfo, LfoEnvelopeMapping};
use crate::macro_control::Macro;
use crate::midi_controller::{MidiController, PARAM_DEFAULT_MPE_CHANNEL};
use crate::producer::{
    Buffer, EVT_CANCEL, Event, ProducerState, Rendering, Round, Shared, SignalProducer, produce,
};
use crate::shape::EnvelopeShape;
use crate::{Number, Sample, Seconds};

/// Jump to `number_param_2`.
pub const EVT_SET_VALUE: u8 = 1;
/// Linear ramp over `number_param_1` seconds towards `number_param_2`.
pub const EVT_LINEAR_RAMP: u8 = 2;
/// Same as [`EVT_LINEAR_RAMP`], interpolated in ratio space.
pub const EVT_LOG_RAMP: u8 = 3;
/// Ramp shaped by the [`EnvelopeShape`] in `byte_param_1`.
pub const EVT_CURVED_RAMP: u8 = 4;
/// Envelope starts from the snapshot in `int_param`.
pub const EVT_ENVELOPE_START: u8 = 5;
/// Envelope releases with the snapshot in `int_param`.
pub const EVT_ENVELOPE_END: u8 = 6;
/// Envelope is cut short with the snapshot in `int_param`.
pub const EVT_ENVELOPE_CANCEL: u8 = 7;

/// Smoothing time for a controller sweep over the full range.
pub const MIDI_CTL_BIG_CHANGE_DURATION: Seconds = 0.2;
/// Minimum smoothing time for controller changes; also the window in which
/// controller events are merged.
pub const MIDI_CTL_SMALL_CHANGE_DURATION: Seconds = MIDI_CTL_BIG_CHANGE_DURATION / 2.5;
/// Transition time when a dynamic envelope changes while sustaining.
pub const DYNAMIC_ENVELOPE_RAMP_TIME: Seconds = 0.1;

/// Where a parameter's envelope is within its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvelopeStage {
    /// No envelope started.
    #[default]
    None,
    /// Delay, attack, hold or decay.
    Dahd,
    /// Holding the sustain value.
    Sustain,
    /// Moving towards the final value.
    Release,
    /// Release complete.
    Released,
}

/// A schedulable, automatable floating point parameter.
///
/// The value of a `FloatParam` comes from the first source that applies:
///
/// 1. an LFO, optionally multiplied by a per-voice amplitude envelope;
/// 2. a MIDI controller, its changes smoothed into ramps;
/// 3. a macro, smoothed the same way;
/// 4. an envelope, scheduled as a chain of ramps from a per-voice snapshot;
/// 5. events scheduled on the parameter itself;
/// 6. the stored value.
///
/// A follower created with [`FloatParam::follower`] takes its configuration
/// (controller, macro, LFO, envelope) from a leader. As long as it has no
/// per-voice state of its own it renders by copying the leader's output.
#[derive(Debug)]
pub struct FloatParam {
    state: ProducerState,
    param: Param<Number>,
    evaluation: Evaluation,
    round_to: Number,
    round_to_inv: Number,
    log_scale: Option<(Rc<LogScale>, Shared<ToggleParam>)>,
    leader: Option<Shared<FloatParam>>,
    midi_controller: Option<Shared<MidiController>>,
    midi_channel: u8,
    macro_: Option<Shared<Macro>>,
    macro_change_index: Option<u32>,
    lfo: Option<Shared<Lfo>>,
    lfo_buffer: Vec<Sample>,
    is_rendering_lfo: bool,
    lfo_envelope: Option<Box<FloatParam>>,
    lfo_envelope_active: bool,
    envelope: Option<Shared<Envelope>>,
    envelope_change_index: Option<u32>,
    snapshots: SnapshotArena,
    live_snapshots: Vec<usize>,
    referenced_snapshots: Vec<usize>,
    active_snapshot: Option<usize>,
    latest_snapshot: Option<usize>,
    envelope_randoms: EnvelopeRandoms,
    envelope_stage: EnvelopeStage,
    envelope_position: Seconds,
    envelope_end_scheduled: bool,
    envelope_end_time_offset: Seconds,
    envelope_canceled: bool,
    envelope_cancel_duration: Seconds,
    voice_status: u8,
    ramp: Option<Ramp>,
    constantness_round: Option<Round>,
    constantness: bool,
}

impl FloatParam {
    /// Sample-evaluated parameter.
    pub fn new(name: impl Into<String>, min: Number, max: Number, default: Number) -> Self {
        Self::with_evaluation(name, min, max, default, Evaluation::Sample)
    }

    /// Block-evaluated parameter: one value per block, no buffer.
    pub fn block(name: impl Into<String>, min: Number, max: Number, default: Number) -> Self {
        Self::with_evaluation(name, min, max, default, Evaluation::Block)
    }

    fn with_evaluation(
        name: impl Into<String>,
        min: Number,
        max: Number,
        default: Number,
        evaluation: Evaluation,
    ) -> Self {
        let channels = match evaluation {
            Evaluation::Block => 0,
            Evaluation::Sample => 1,
        };

        Self {
            state: ProducerState::with_event_capacity(channels, 32),
            param: Param::new(name, min, max, default),
            evaluation,
            round_to: 0.0,
            round_to_inv: 0.0,
            log_scale: None,
            leader: None,
            midi_controller: None,
            midi_channel: PARAM_DEFAULT_MPE_CHANNEL,
            macro_: None,
            macro_change_index: None,
            lfo: None,
            lfo_buffer: Vec::new(),
            is_rendering_lfo: false,
            lfo_envelope: None,
            lfo_envelope_active: false,
            envelope: None,
            envelope_change_index: None,
            snapshots: SnapshotArena::default(),
            live_snapshots: Vec::with_capacity(8),
            referenced_snapshots: Vec::with_capacity(8),
            active_snapshot: None,
            latest_snapshot: None,
            envelope_randoms: [0.5; ENVELOPE_RANDOMS],
            envelope_stage: EnvelopeStage::None,
            envelope_position: 0.0,
            envelope_end_scheduled: false,
            envelope_end_time_offset: 0.0,
            envelope_canceled: false,
            envelope_cancel_duration: 0.0,
            voice_status: 0,
            ramp: None,
            constantness_round: None,
            constantness: false,
        }
    }

    /// Sample-evaluated follower of `leader`: same bounds, scale and
    /// rounding, configuration read from the leader, own rendering state.
    pub fn follower(leader: &Shared<FloatParam>) -> Self {
        let mut follower = {
            let leader = leader.borrow();
            let mut follower = Self::new(
                leader.name().to_owned(),
                leader.min(),
                leader.max(),
                leader.default_value(),
            );

            follower.round_to = leader.round_to;
            follower.round_to_inv = leader.round_to_inv;
            follower.log_scale = leader.log_scale.clone();
            follower.param.set_value(leader.param.value());
            follower
        };

        follower.leader = Some(Rc::clone(leader));
        follower.lfo_envelope = Some(Box::new(Self::new("", 0.0, 1.0, 0.0)));
        follower
    }

    /// Quantize every value to a multiple of `round_to`.
    pub fn with_round_to(mut self, round_to: Number) -> Self {
        if round_to > 0.0 {
            self.round_to = round_to;
            self.round_to_inv = 1.0 / round_to;
        }

        self
    }

    /// Map ratios exponentially while `toggle` is on.
    pub fn with_log_scale(mut self, scale: Rc<LogScale>, toggle: Shared<ToggleParam>) -> Self {
        self.log_scale = Some((scale, toggle));
        self
    }

    /// Identifier.
    pub fn name(&self) -> &str {
        self.param.name()
    }

    /// Lower bound.
    #[inline]
    pub fn min(&self) -> Number {
        self.param.min()
    }

    /// Upper bound.
    #[inline]
    pub fn max(&self) -> Number {
        self.param.max()
    }

    /// Initial value.
    #[inline]
    pub fn default_value(&self) -> Number {
        self.param.default_value()
    }

    /// Per-block or per-sample evaluation.
    #[inline]
    pub fn evaluation(&self) -> Evaluation {
        self.evaluation
    }

    /// The leader this parameter follows, if any.
    pub fn leader(&self) -> Option<&Shared<FloatParam>> {
        self.leader.as_ref()
    }

    /// Whether ratios currently map exponentially.
    pub fn is_logarithmic(&self) -> bool {
        self.log_scale
            .as_ref()
            .is_some_and(|(_, toggle)| toggle.try_borrow().is_ok_and(|toggle| is_on(&toggle)))
    }

    /// Map a ratio onto `[min, max]`.
    #[inline]
    pub fn ratio_to_value(&self, ratio: Number) -> Number {
        match &self.log_scale {
            Some((scale, _)) if self.is_logarithmic() => {
                self.param.clamp(scale.ratio_to_value(ratio))
            }
            _ => self.param.ratio_to_value(ratio),
        }
    }

    /// Map a value onto `[0, 1]`.
    #[inline]
    pub fn value_to_ratio(&self, value: Number) -> Number {
        match &self.log_scale {
            Some((scale, _)) if self.is_logarithmic() => scale.value_to_ratio(value),
            _ => self.param.value_to_ratio(value),
        }
    }

    /// Current value: the controller's or macro's target when one is
    /// assigned, the leader's while following it, the stored value otherwise.
    pub fn value(&self) -> Number {
        if let Some(leader) = self.followed_leader() {
            if let Ok(leader) = leader.try_borrow() {
                return leader.value();
            }
        }

        if let Some(controller) = &self.midi_controller
            && let Ok(controller) = controller.try_borrow()
        {
            return self.round_value(self.ratio_to_value(controller.value(self.midi_channel)));
        }

        if let Some(macro_) = &self.macro_
            && let Some(ratio) = updated_macro_ratio(macro_)
        {
            return self.round_value(self.ratio_to_value(ratio));
        }

        self.param.value()
    }

    /// Value stored by the last render or `set_value`.
    #[inline]
    pub fn raw_value(&self) -> Number {
        self.param.value()
    }

    /// Store a value immediately, dropping any ramp in progress.
    pub fn set_value(&mut self, value: Number) {
        self.ramp = None;
        self.param.set_value(self.round_value(value));
    }

    /// Current value as a ratio.
    pub fn ratio(&self) -> Number {
        if let Some(leader) = self.followed_leader()
            && let Ok(leader) = leader.try_borrow()
        {
            return leader.ratio();
        }

        if let Some(controller) = &self.midi_controller
            && let Ok(controller) = controller.try_borrow()
        {
            return controller.value(self.midi_channel);
        }

        if let Some(macro_) = &self.macro_
            && let Some(ratio) = updated_macro_ratio(macro_)
        {
            return ratio;
        }

        self.value_to_ratio(self.param.value()).clamp(0.0, 1.0)
    }

    /// Default value as a ratio.
    pub fn default_ratio(&self) -> Number {
        self.value_to_ratio(self.param.default_value())
    }

    /// Set the value through its ratio.
    pub fn set_ratio(&mut self, ratio: Number) {
        self.set_value(self.ratio_to_value(ratio));
    }

    /// Change counter; follows the leader, controller or macro that drives
    /// the value.
    pub fn change_index(&self) -> u32 {
        if let Some(leader) = self.followed_leader()
            && let Ok(leader) = leader.try_borrow()
        {
            return leader.change_index();
        }

        if let Some(controller) = &self.midi_controller
            && let Ok(controller) = controller.try_borrow()
        {
            return controller.change_index(self.midi_channel);
        }

        if let Some(macro_) = &self.macro_ {
            if let Ok(mut macro_) = macro_.try_borrow_mut() {
                macro_.update();
                return macro_.change_index();
            }

            if let Ok(macro_) = macro_.try_borrow() {
                return macro_.change_index();
            }
        }

        self.param.change_index()
    }

    fn round_value(&self, value: Number) -> Number {
        if self.round_to > 0.0 {
            libm::round(value * self.round_to_inv) * self.round_to
        } else {
            value
        }
    }

    fn should_round(&self) -> bool {
        self.round_to > 0.0
    }

    // Configuration

    /// Assign or remove a MIDI controller. The value jumps to the
    /// controller's current position.
    pub fn set_midi_controller(&mut self, controller: Option<Shared<MidiController>>) {
        if let Some(previous) = self.midi_controller.take()
            && let Ok(mut previous) = previous.try_borrow_mut()
        {
            previous.released();
            let value = self.ratio_to_value(previous.value(self.midi_channel));
            self.set_value(value);
        }

        if let Some(controller) = &controller
            && let Ok(mut controller) = controller.try_borrow_mut()
        {
            controller.assigned();
            let value = self.ratio_to_value(controller.value(self.midi_channel));
            self.set_value(value);
        }

        self.midi_controller = controller;
    }

    /// The assigned MIDI controller, from the leader for followers.
    pub fn midi_controller(&self) -> Option<Shared<MidiController>> {
        match &self.leader {
            Some(leader) => leader.try_borrow().ok()?.midi_controller(),
            None => self.midi_controller.clone(),
        }
    }

    /// Channel used to read channel-specific controller values.
    pub fn set_midi_channel(&mut self, channel: u8) {
        self.midi_channel = channel;
    }

    /// Channel used to read channel-specific controller values.
    pub fn midi_channel(&self) -> u8 {
        self.midi_channel
    }

    /// Assign or remove a macro. The value jumps to the macro's output.
    pub fn set_macro(&mut self, macro_: Option<Shared<Macro>>) {
        if let Some(previous) = self.macro_.take()
            && let Some(ratio) = updated_macro_ratio(&previous)
        {
            self.set_value(self.ratio_to_value(ratio));
        }

        self.macro_change_index = None;

        if let Some(new_macro) = &macro_
            && let Ok(mut new_macro) = new_macro.try_borrow_mut()
        {
            new_macro.update();
            self.macro_change_index = Some(new_macro.change_index());
            let value = self.ratio_to_value(new_macro.value());
            self.set_value(value);
        }

        self.macro_ = macro_;
    }

    /// The assigned macro, from the leader for followers.
    pub fn macro_(&self) -> Option<Shared<Macro>> {
        match &self.leader {
            Some(leader) => leader.try_borrow().ok()?.macro_(),
            None => self.macro_.clone(),
        }
    }

    /// Let an LFO drive the value.
    pub fn set_lfo(&mut self, lfo: Option<Shared<Lfo>>) {
        self.lfo = lfo;
    }

    /// The driving LFO, from the leader for followers.
    pub fn lfo(&self) -> Option<Shared<Lfo>> {
        match &self.leader {
            Some(leader) => leader.try_borrow().ok()?.lfo(),
            None => self.lfo.clone(),
        }
    }

    /// Assign or remove the envelope; running envelope state is dropped.
    pub fn set_envelope(&mut self, envelope: Option<Shared<Envelope>>) {
        self.envelope_change_index = envelope
            .as_ref()
            .and_then(|envelope| envelope.try_borrow_mut().ok())
            .map(|mut envelope| {
                envelope.update();
                envelope.change_index()
            });
        self.envelope = envelope;
        self.clear_envelope_state();
    }

    /// The envelope, from the leader for followers.
    pub fn envelope(&self) -> Option<Shared<Envelope>> {
        match &self.leader {
            Some(leader) => leader.try_borrow().ok()?.envelope(),
            None => self.envelope.clone(),
        }
    }

    /// Random values varying this voice's envelope snapshots.
    pub fn set_envelope_randoms(&mut self, randoms: EnvelopeRandoms) {
        self.envelope_randoms = randoms;
    }

    /// Voice status flags, matched against dynamic envelope update modes.
    pub fn set_voice_status(&mut self, voice_status: u8) {
        self.voice_status = voice_status;
    }

    /// Lifecycle stage of the envelope.
    pub fn envelope_stage(&self) -> EnvelopeStage {
        self.envelope_stage
    }

    /// Snapshot currently shaping the envelope.
    pub fn active_envelope_snapshot(&self) -> Option<&EnvelopeSnapshot> {
        self.active_snapshot.and_then(|id| self.snapshots.get(id))
    }

    /// Whether the envelope's value stays below `threshold` for good: it is
    /// sustaining (or done releasing) at a level within `threshold` of zero.
    pub fn has_envelope_decayed(&self, threshold: Number) -> bool {
        matches!(
            self.envelope_stage,
            EnvelopeStage::Sustain | EnvelopeStage::Released
        ) && self.ramp.is_none_or(|ramp| ramp.is_done())
            && !self.state.has_events()
            && self.param.value().abs() <= threshold
    }

    fn followed_leader(&self) -> Option<&Shared<FloatParam>> {
        self.leader.as_ref().filter(|_| self.is_following_leader())
    }

    /// Whether rendering is delegated to the leader: true while this
    /// parameter has no per-voice state.
    pub fn is_following_leader(&self) -> bool {
        let Some(leader) = &self.leader else {
            return false;
        };

        let Ok(leader) = leader.try_borrow() else {
            return false;
        };

        leader.envelope.is_none()
            && !self.lfo_envelope_active
            && (leader.midi_controller.is_none() || leader.midi_channel == self.midi_channel)
    }

    // Scheduling

    /// Jump to `value` at `time_offset` seconds from now.
    pub fn schedule_value(&mut self, time_offset: Seconds, value: Number) {
        self.state
            .schedule(Event::new(EVT_SET_VALUE, time_offset).with_numbers(0.0, value));
    }

    /// Ramp from the value at the last scheduled event towards `target` over
    /// `duration`. Targets beyond the bounds shorten the ramp so that its
    /// slope is kept.
    pub fn schedule_linear_ramp(&mut self, duration: Seconds, target: Number) {
        let start = self.state.last_event_time_offset();
        let kind = if self.is_logarithmic() {
            EVT_LOG_RAMP
        } else {
            EVT_LINEAR_RAMP
        };

        self.state
            .schedule(Event::new(kind, start).with_numbers(duration, target));
        self.schedule_value(start + duration, target);
    }

    /// Same as [`schedule_linear_ramp`](Self::schedule_linear_ramp), shaped
    /// by `shape`. Logarithmic parameters are shaped in ratio space.
    pub fn schedule_curved_ramp(&mut self, duration: Seconds, target: Number, shape: EnvelopeShape) {
        if shape == EnvelopeShape::Linear {
            self.schedule_linear_ramp(duration, target);
            return;
        }

        let start = self.state.last_event_time_offset();

        self.state.schedule(
            Event::new(EVT_CURVED_RAMP, start)
                .with_numbers(duration, target)
                .with_bytes(shape as u8, 0),
        );
        self.schedule_value(start + duration, target);
    }

    /// Drop events at or after `time_offset`; a ramp in progress stops at its
    /// value at that time.
    pub fn cancel_events_at(&mut self, time_offset: Seconds) {
        self.state.cancel_events_at(time_offset);
    }

    /// Drop every scheduled event.
    pub fn cancel_events(&mut self) {
        self.state.cancel_events();
    }

    // Envelope lifecycle

    /// Start the envelope at `time_offset`: freeze a snapshot and schedule
    /// the delay, attack, hold and decay stages. No-op without an envelope.
    pub fn start_envelope(&mut self, time_offset: Seconds) {
        let Some(envelope) = self.envelope() else {
            return;
        };

        let snapshot = {
            let Ok(mut envelope) = envelope.try_borrow_mut() else {
                return;
            };

            envelope.update();
            self.envelope_change_index = Some(envelope.change_index());
            envelope.make_snapshot(&self.envelope_randoms)
        };

        self.envelope_end_scheduled = false;
        self.envelope_canceled = false;
        self.envelope_end_time_offset = 0.0;

        self.state.cancel_events_after(time_offset);

        let id = self.insert_snapshot(snapshot);

        self.state
            .schedule(Event::new(EVT_ENVELOPE_START, time_offset).with_int(id as i64));

        let initial = self.ratio_to_value(snapshot.initial_value);
        let peak = self.ratio_to_value(snapshot.peak_value);
        let sustain = self.ratio_to_value(snapshot.sustain_value);

        self.schedule_value(time_offset, initial);

        let mut next_time_offset = time_offset + snapshot.delay_time;
        self.schedule_value(next_time_offset, initial);
        self.schedule_curved_ramp(snapshot.attack_time, peak, snapshot.attack_shape);

        next_time_offset += snapshot.attack_time + snapshot.hold_time;
        self.schedule_value(next_time_offset, peak);
        self.schedule_curved_ramp(snapshot.decay_time, sustain, snapshot.decay_shape);
    }

    /// Start the per-voice amplitude envelope of the driving LFO, if the
    /// mapping assigns one to it.
    pub fn start_lfo_envelope(&mut self, time_offset: Seconds, mapping: &LfoEnvelopeMapping) {
        self.lfo_envelope_active = false;

        let Some(lfo) = self.lfo() else {
            return;
        };

        let Some(envelope) = mapping.envelope_for(&lfo) else {
            return;
        };

        let randoms = self.envelope_randoms;

        if let Some(lfo_envelope) = self.lfo_envelope.as_deref_mut() {
            lfo_envelope.set_envelope(Some(envelope));
            lfo_envelope.set_envelope_randoms(randoms);
            lfo_envelope.start_envelope(time_offset);
            self.lfo_envelope_active = true;
        }
    }

    /// Release the envelope at `time_offset`. Returns how long the release
    /// takes; zero without an envelope.
    pub fn end_envelope(&mut self, time_offset: Seconds) -> Seconds {
        let lfo_release = self.end_lfo_envelope(time_offset);

        if self.envelope_canceled {
            return self.envelope_cancel_duration.max(lfo_release);
        }

        let Some(envelope) = self.envelope() else {
            return lfo_release;
        };

        let (snapshot, id) = {
            let Ok(mut envelope) = envelope.try_borrow_mut() else {
                return lfo_release;
            };

            let latest = self.latest_snapshot.filter(|&id| self.snapshots.is_live(id));

            match (envelope.update_mode(), latest) {
                (UpdateMode::Static, Some(id)) => (self.snapshots.get(id).copied(), Some(id)),
                _ => {
                    envelope.update();

                    let mut snapshot = latest
                        .and_then(|id| self.snapshots.get(id).copied())
                        .unwrap_or_else(|| envelope.make_snapshot(&self.envelope_randoms));

                    envelope.make_end_snapshot(&self.envelope_randoms, &mut snapshot);
                    (Some(snapshot), None)
                }
            }
        };

        let Some(snapshot) = snapshot else {
            return lfo_release;
        };

        let id = id.unwrap_or_else(|| self.insert_snapshot(snapshot));

        self.schedule_release(EVT_ENVELOPE_END, time_offset, id, &snapshot);

        snapshot.release_time.max(lfo_release)
    }

    /// Cut the envelope short: release over `duration` from `time_offset`,
    /// unless the envelope is static and its own release is shorter. Returns
    /// the effective release time.
    pub fn cancel_envelope(&mut self, time_offset: Seconds, duration: Seconds) -> Seconds {
        if self.lfo_envelope_active
            && let Some(lfo_envelope) = self.lfo_envelope.as_deref_mut()
        {
            lfo_envelope.cancel_envelope(time_offset, duration);
        }

        let Some(envelope) = self.envelope() else {
            return 0.0;
        };

        let (is_static, fallback) = {
            let Ok(envelope) = envelope.try_borrow() else {
                return 0.0;
            };

            (
                envelope.is_static(),
                envelope.make_snapshot(&self.envelope_randoms),
            )
        };

        let latest = self.latest_snapshot.filter(|&id| self.snapshots.is_live(id));
        let mut snapshot = latest
            .and_then(|id| self.snapshots.get(id).copied())
            .unwrap_or(fallback);

        let release_time = if is_static && snapshot.release_time < duration {
            snapshot.release_time
        } else {
            duration
        };

        snapshot.release_time = release_time;

        let id = match latest {
            Some(id) if is_static => {
                if let Some(in_place) = self.snapshots.get_mut(id) {
                    in_place.release_time = release_time;
                }

                id
            }
            _ => self.insert_snapshot(snapshot),
        };

        self.envelope_canceled = true;
        self.envelope_cancel_duration = release_time;
        self.schedule_release(EVT_ENVELOPE_CANCEL, time_offset, id, &snapshot);

        release_time
    }

    fn end_lfo_envelope(&mut self, time_offset: Seconds) -> Seconds {
        if !self.lfo_envelope_active {
            return 0.0;
        }

        self.lfo_envelope
            .as_deref_mut()
            .map_or(0.0, |lfo_envelope| lfo_envelope.end_envelope(time_offset))
    }

    fn schedule_release(
        &mut self,
        kind: u8,
        time_offset: Seconds,
        id: usize,
        snapshot: &EnvelopeSnapshot,
    ) {
        self.envelope_end_scheduled = true;
        self.envelope_end_time_offset = time_offset;

        self.state.cancel_events_after(time_offset);
        self.state
            .schedule(Event::new(kind, time_offset).with_int(id as i64));

        let final_value = self.ratio_to_value(snapshot.final_value);
        self.schedule_curved_ramp(snapshot.release_time, final_value, snapshot.release_shape);
    }

    fn insert_snapshot(&mut self, snapshot: EnvelopeSnapshot) -> usize {
        self.collect_snapshots();

        let id = self.snapshots.insert(snapshot);
        self.live_snapshots.push(id);
        self.latest_snapshot = Some(id);
        id
    }

    /// Release snapshots that are neither active nor referenced by a queued
    /// envelope event.
    fn collect_snapshots(&mut self) {
        self.referenced_snapshots.clear();
        self.referenced_snapshots.extend(
            self.state
                .events()
                .iter()
                .filter(|event| is_envelope_event(event.kind))
                .map(|event| event.int_param as usize),
        );

        let keep = [self.active_snapshot, self.latest_snapshot];
        let referenced = &self.referenced_snapshots;
        let snapshots = &mut self.snapshots;

        self.live_snapshots.retain(|&id| {
            let is_kept = keep.contains(&Some(id)) || referenced.contains(&id);

            if !is_kept {
                snapshots.release(id);
            }

            is_kept
        });
    }

    fn activate_snapshot(&mut self, event: &Event) -> bool {
        let id = event.int_param as usize;

        if !self.snapshots.is_live(id) {
            return false;
        }

        if let Some(previous) = self.active_snapshot
            && previous != id
        {
            self.active_snapshot = Some(id);
            self.collect_snapshots();
        }

        self.active_snapshot = Some(id);
        true
    }

    fn clear_envelope_state(&mut self) {
        self.snapshots.clear();
        self.live_snapshots.clear();
        self.active_snapshot = None;
        self.latest_snapshot = None;
        self.envelope_stage = EnvelopeStage::None;
        self.envelope_position = 0.0;
        self.envelope_end_scheduled = false;
        self.envelope_end_time_offset = 0.0;
        self.envelope_canceled = false;
        self.envelope_cancel_duration = 0.0;
    }

    fn advance_envelope(&mut self, elapsed: Seconds) {
        if self.envelope_stage == EnvelopeStage::None {
            return;
        }

        self.envelope_position += elapsed;

        if self.envelope_end_scheduled {
            self.envelope_end_time_offset -= elapsed;
        }

        let Some(snapshot) = self.active_envelope_snapshot() else {
            return;
        };

        match self.envelope_stage {
            EnvelopeStage::Dahd if self.envelope_position >= snapshot.dahd_length() => {
                self.envelope_stage = EnvelopeStage::Sustain;
            }
            EnvelopeStage::Release if self.envelope_position >= snapshot.release_time => {
                self.envelope_stage = EnvelopeStage::Released;
            }
            _ => {}
        }
    }

    // Constancy

    /// Whether every sample of the next `sample_count` samples equals
    /// [`value`](Self::value). Cached per round.
    pub fn is_constant_in_next_round(&mut self, round: Round, sample_count: usize) -> bool {
        if self.constantness_round == Some(round) {
            return self.constantness;
        }

        self.constantness_round = Some(round);
        self.constantness = self.is_constant_until(sample_count);
        self.constantness
    }

    /// Whether no ramp, event, LFO or controller change affects the next
    /// `sample_count` samples.
    pub fn is_constant_until(&self, sample_count: usize) -> bool {
        if let Some(leader) = self.followed_leader() {
            return leader
                .try_borrow()
                .is_ok_and(|leader| leader.is_constant_until(sample_count));
        }

        if self.lfo().is_some() {
            return false;
        }

        if self.ramp.is_some() || self.state.has_upcoming_events(sample_count.saturating_sub(1)) {
            return false;
        }

        if self.envelope_stage != EnvelopeStage::None
            && let Some(envelope) = self.envelope()
            && let Ok(mut envelope) = envelope.try_borrow_mut()
            && envelope.update_mode().is_dynamic_for(self.voice_status)
        {
            envelope.update();
            return Some(envelope.change_index()) == self.envelope_change_index;
        }

        if let Some(controller) = self.midi_controller() {
            let channel = self.midi_channel;

            return controller.try_borrow().is_ok_and(|controller| {
                !controller
                    .events()
                    .iter()
                    .any(|event| MidiController::is_event_for(event, channel))
            });
        }

        if let Some(macro_) = self.macro_() {
            return macro_.try_borrow_mut().is_ok_and(|mut macro_| {
                macro_.update();
                Some(macro_.change_index()) == self.macro_change_index
            });
        }

        true
    }

    /// Advance the clock by one block without rendering. Idempotent within a
    /// round.
    pub fn skip_round(&mut self, round: Round, sample_count: usize) {
        if let Some(leader) = self.followed_leader() {
            if let Ok(mut leader) = leader.try_borrow_mut() {
                leader.skip_round(round, sample_count);
            }

            return;
        }

        if self.state.cached_round() == Some(round) {
            return;
        }

        self.state.set_cached_round(round);

        let elapsed = self.state.sample_count_to_relative_time_offset(sample_count);

        if self.state.has_events() {
            self.state.advance_time(elapsed);
        }

        self.advance_envelope(elapsed);
    }

    // Controllers

    fn process_midi_controller_events(&mut self, controller: &Shared<MidiController>) {
        let Ok(controller) = controller.try_borrow() else {
            return;
        };

        let channel = self.midi_channel;
        let mut events = controller
            .events()
            .iter()
            .filter(|event| MidiController::is_event_for(event, channel))
            .peekable();

        if events.peek().is_none() {
            return;
        }

        self.state.cancel_events_at(0.0);

        if self.should_round() {
            for event in events {
                let value = self.ratio_to_value(event.number_param_1);
                self.schedule_value(event.time_offset, value);
            }

            return;
        }

        let mut previous_time_offset = 0.0;
        let mut previous_ratio = self.value_to_ratio(self.param.value());

        while let Some(first) = events.next() {
            let group_start = first.time_offset;
            let mut last = first;

            while let Some(next) = events.next_if(|event| {
                (event.time_offset - group_start).abs() < MIDI_CTL_SMALL_CHANGE_DURATION
            }) {
                last = next;
            }

            let ratio = last.number_param_1;
            let duration = smooth_change_duration(
                previous_ratio,
                ratio,
                last.time_offset - previous_time_offset,
            );

            previous_ratio = ratio;
            previous_time_offset = last.time_offset;

            let target = self.ratio_to_value(ratio);
            self.schedule_linear_ramp(duration, target);
        }
    }

    fn process_macro(&mut self, macro_: &Shared<Macro>, sample_count: usize) {
        let (change_index, ratio) = {
            let Ok(mut macro_) = macro_.try_borrow_mut() else {
                return;
            };

            macro_.update();
            (macro_.change_index(), macro_.value())
        };

        if Some(change_index) == self.macro_change_index {
            return;
        }

        self.macro_change_index = Some(change_index);
        self.state.cancel_events_at(0.0);

        let target = self.ratio_to_value(ratio);

        if self.should_round() {
            self.set_value(target);
            return;
        }

        let duration = smooth_change_duration(
            self.value_to_ratio(self.param.value()),
            ratio,
            self.state
                .sample_count_to_relative_time_offset(sample_count.saturating_sub(1)),
        );

        self.schedule_linear_ramp(duration, target);
    }

    fn process_envelope_update(&mut self) {
        if !matches!(
            self.envelope_stage,
            EnvelopeStage::Dahd | EnvelopeStage::Sustain
        ) {
            return;
        }

        let Some(envelope) = self.envelope() else {
            return;
        };

        let snapshot = {
            let Ok(mut envelope) = envelope.try_borrow_mut() else {
                return;
            };

            if !envelope.update_mode().is_dynamic_for(self.voice_status) {
                return;
            }

            envelope.update();

            if Some(envelope.change_index()) == self.envelope_change_index {
                return;
            }

            self.envelope_change_index = Some(envelope.change_index());
            envelope.make_snapshot(&self.envelope_randoms)
        };

        let id = self.insert_snapshot(snapshot);
        self.active_snapshot = Some(id);
        self.collect_snapshots();
        self.state.cancel_events_at(0.0);

        if self.envelope_stage == EnvelopeStage::Sustain
            || self.envelope_position > snapshot.dahd_length()
        {
            let sustain = self.ratio_to_value(snapshot.sustain_value);

            if (self.param.value() - sustain).abs() > 0.000001 {
                self.schedule_linear_ramp(DYNAMIC_ENVELOPE_RAMP_TIME, sustain);
            }
        } else {
            let stages = [
                (snapshot.delay_time, snapshot.initial_value, EnvelopeShape::Linear),
                (snapshot.attack_time, snapshot.peak_value, snapshot.attack_shape),
                (snapshot.hold_time, snapshot.peak_value, EnvelopeShape::Linear),
                (snapshot.decay_time, snapshot.sustain_value, snapshot.decay_shape),
            ];
            let mut next_time_offset = -self.envelope_position;

            for (time, ratio, shape) in stages {
                let duration = next_time_offset + time;

                if duration >= 0.0 {
                    let target = self.ratio_to_value(ratio);
                    self.schedule_curved_ramp(duration, target, shape);
                    next_time_offset = 0.0;
                } else {
                    next_time_offset = duration;
                }
            }
        }

        if self.envelope_end_scheduled && !self.envelope_canceled {
            let end_time_offset = self.envelope_end_time_offset.max(0.0);
            self.schedule_release(EVT_ENVELOPE_END, end_time_offset, id, &snapshot);
        }
    }

    // Event handlers

    fn start_ramp(&mut self, event: &Event, shape: EnvelopeShape, in_ratio_space: bool) {
        let (value, mut target, low, high) = if in_ratio_space {
            (
                self.value_to_ratio(self.param.value()),
                self.value_to_ratio(event.number_param_2),
                0.0,
                1.0,
            )
        } else {
            (self.param.value(), event.number_param_2, self.min(), self.max())
        };

        let mut duration = event.number_param_1;

        if target < low {
            duration *= (low - value) / (target - value);
            target = low;
        } else if target > high {
            duration *= (high - value) / (target - value);
            target = high;
        }

        let sample_rate = self.state.sample_rate();
        let done_samples = (self.state.current_time() - event.time_offset) * sample_rate;

        self.ramp = Some(Ramp::new(
            event.time_offset,
            done_samples,
            value,
            target,
            duration,
            sample_rate,
            shape,
            in_ratio_space,
        ));
    }

    fn stop_ramp(&mut self, event: &Event) {
        if let Some(ramp) = self.ramp.take() {
            let stop = ramp.value_at(event.time_offset - ramp.start_time);
            let value = if ramp.in_ratio_space {
                self.ratio_to_value(stop)
            } else {
                stop
            };

            self.param.set_value(value);
        }
    }
}

/// Produce `param` unless it is constant for the next `sample_count` samples,
/// in which case its clock is advanced and `None` is returned; read
/// [`FloatParam::value`] instead.
pub fn produce_if_not_constant(
    param: &mut FloatParam,
    round: Round,
    sample_count: usize,
) -> Option<&[Sample]> {
    if param.is_constant_in_next_round(round, sample_count) {
        param.skip_round(round, sample_count);
        return None;
    }

    let output = produce(param, round, sample_count);

    if output.channels() == 0 {
        return None;
    }

    Some(&output.channel(0)[..sample_count])
}

/// `Some(value)` when `param` is constant this round; otherwise its samples
/// are in its buffer.
pub fn constant_or_rendered(
    param: &mut FloatParam,
    round: Round,
    sample_count: usize,
) -> Option<Number> {
    produce_if_not_constant(param, round, sample_count)
        .is_none()
        .then(|| param.value())
}

/// Duration of a smoothed controller change.
pub(crate) fn smooth_change_duration(
    previous_ratio: Number,
    ratio: Number,
    duration: Seconds,
) -> Seconds {
    let change = (previous_ratio - ratio).abs();

    if change < 0.000001 {
        return duration.max(MIDI_CTL_BIG_CHANGE_DURATION * change);
    }

    let min_duration = MIDI_CTL_SMALL_CHANGE_DURATION.max(MIDI_CTL_BIG_CHANGE_DURATION * change);

    min_duration.max(duration)
}

fn updated_macro_ratio(macro_: &Shared<Macro>) -> Option<Number> {
    if let Ok(mut macro_) = macro_.try_borrow_mut() {
        macro_.update();
        return Some(macro_.value());
    }

    macro_.try_borrow().ok().map(|macro_| macro_.value())
}

fn is_envelope_event(kind: u8) -> bool {
    matches!(
        kind,
        EVT_ENVELOPE_START | EVT_ENVELOPE_END | EVT_ENVELOPE_CANCEL
    )
}

impl SignalProducer for FloatParam {
    fn state(&self) -> &ProducerState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut ProducerState {
        &mut self.state
    }

    fn visit_children(&mut self, visitor: &mut dyn FnMut(&mut dyn SignalProducer)) {
        if let Some(lfo_envelope) = self.lfo_envelope.as_deref_mut() {
            visitor(lfo_envelope);
        }
    }

    fn block_size_changed(&mut self) {
        self.lfo_buffer = vec![0.0; self.state.block_size()];
    }

    fn reset_state(&mut self) {
        self.ramp = None;
        self.lfo_envelope_active = false;
        self.constantness_round = None;
        self.clear_envelope_state();
    }

    fn initialize_rendering(&mut self, round: Round, sample_count: usize) -> Rendering {
        self.is_rendering_lfo = false;

        if let Some(leader) = self.followed_leader().map(Rc::clone) {
            if let Ok(mut leader) = leader.try_borrow_mut() {
                let output = produce(&mut *leader, round, sample_count);

                if self.state.channels() > 0 {
                    self.state.buffer_mut().copy_from(output, sample_count);
                }

                self.param.set_value(leader.raw_value());
            } else {
                let value = self.param.value();

                for channel in self.state.buffer_mut().channels_mut() {
                    channel[..sample_count].fill(value);
                }
            }

            return Rendering::Ready;
        }

        if let Some(lfo) = self.lfo() {
            self.is_rendering_lfo = true;

            if self.lfo_buffer.len() < sample_count {
                self.lfo_buffer.resize(self.state.block_size(), 0.0);
            }

            match lfo.try_borrow_mut() {
                Ok(mut lfo) => {
                    let output = produce(&mut *lfo, round, sample_count);
                    self.lfo_buffer[..sample_count].copy_from_slice(&output.channel(0)[..sample_count]);
                }
                Err(_) => {
                    let last = self.value_to_ratio(self.param.value());
                    self.lfo_buffer[..sample_count].fill(last);
                }
            }

            if self.lfo_envelope_active
                && let Some(lfo_envelope) = self.lfo_envelope.as_deref_mut()
            {
                produce(lfo_envelope, round, sample_count);
            }

            return Rendering::Render;
        }

        if let Some(controller) = self.midi_controller() {
            self.process_midi_controller_events(&controller);
        } else if let Some(macro_) = self.macro_() {
            self.process_macro(&macro_, sample_count);
        } else {
            self.process_envelope_update();
        }

        Rendering::Render
    }

    fn render(&mut self, _round: Round, first: usize, last: usize, buffer: &mut Buffer) {
        let has_buffer = buffer.channels() > 0;

        if first != last {
            if self.is_rendering_lfo {
                let last_value = {
                    let envelope = self
                        .lfo_envelope
                        .as_deref()
                        .filter(|_| self.lfo_envelope_active)
                        .map(|lfo_envelope| lfo_envelope.state().buffer().channel(0));
                    let mut sample = self.param.value();

                    for i in first..last {
                        let mut ratio = self.lfo_buffer[i];

                        if let Some(envelope) = envelope {
                            ratio *= envelope[i];
                        }

                        sample = self.ratio_to_value(ratio);

                        if has_buffer {
                            buffer.channel_mut(0)[i] = sample;
                        }
                    }

                    sample
                };

                self.param.set_value(last_value);
            } else if let Some(mut ramp) = self.ramp {
                let mut sample = self.param.value();

                for i in first..last {
                    let next = ramp.advance();

                    sample = if ramp.in_ratio_space {
                        self.ratio_to_value(next)
                    } else {
                        next
                    };

                    if has_buffer {
                        buffer.channel_mut(0)[i] = sample;
                    }
                }

                self.ramp = Some(ramp);
                self.param.set_value(sample);
            } else if has_buffer {
                let value = self.param.value();
                buffer.channel_mut(0)[first..last].fill(value);
            }
        }

        let elapsed = self.state.sample_count_to_relative_time_offset(last - first);
        self.advance_envelope(elapsed);
    }

    fn handle_event(&mut self, event: &Event) {
        match event.kind {
            EVT_CANCEL => self.stop_ramp(event),
            EVT_SET_VALUE => self.set_value(event.number_param_2),
            EVT_LINEAR_RAMP => self.start_ramp(event, EnvelopeShape::Linear, false),
            EVT_LOG_RAMP => self.start_ramp(event, EnvelopeShape::Linear, true),
            EVT_CURVED_RAMP => {
                let shape = EnvelopeShape::from_byte(event.byte_param_1);
                let in_ratio_space = self.is_logarithmic();
                self.start_ramp(event, shape, in_ratio_space);
            }
            EVT_ENVELOPE_START => {
                if self.activate_snapshot(event) {
                    self.envelope_stage = EnvelopeStage::Dahd;
                    self.envelope_position = self.state.current_time() - event.time_offset;
                }
            }
            EVT_ENVELOPE_END | EVT_ENVELOPE_CANCEL => {
                if self.activate_snapshot(event) {
                    self.envelope_stage = EnvelopeStage::Release;
                    self.envelope_position = self.state.current_time() - event.time_offset;
                }
            }
            _ => {}
        }
    }
}
