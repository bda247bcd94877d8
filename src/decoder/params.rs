//! Picture parameter set lifecycle.
//!
//! The external parser registers a new parameter set whenever stream
//! metadata changes. A set must never be replaced while a still-in-flight
//! picture references it: pictures already submitted were recorded against
//! the old structural assumptions, and mutating them retroactively would
//! corrupt the decode. The cache therefore arbitrates updates against
//! in-flight usage - replacing immediately when nothing references the
//! active set, and deferring activation until the last referencing picture
//! completes otherwise. Deferral is the designed resolution of the race,
//! not a failure.

use crate::decoder::Codec;
use ash::vk::native;
use std::sync::Arc;
use tracing::debug;

/// Codec-specific standard parameter payload carried by a set.
///
/// Holds the std video headers the parser extracted from the stream, in the
/// layout the video session parameters object consumes.
pub enum ParameterSetData {
    H264 {
        sps: Vec<native::StdVideoH264SequenceParameterSet>,
        pps: Vec<native::StdVideoH264PictureParameterSet>,
    },
    H265 {
        vps: Vec<native::StdVideoH265VideoParameterSet>,
        sps: Vec<native::StdVideoH265SequenceParameterSet>,
        pps: Vec<native::StdVideoH265PictureParameterSet>,
    },
    AV1 {
        sequence_header: Box<native::StdVideoAV1SequenceHeader>,
    },
}

// The std parameter structs embed optional pointers (scaling lists, VUI);
// when present they must reference data the parser keeps alive for the
// lifetime of the set.
unsafe impl Send for ParameterSetData {}
unsafe impl Sync for ParameterSetData {}

impl ParameterSetData {
    /// Codec the payload belongs to.
    pub fn codec(&self) -> Codec {
        match self {
            ParameterSetData::H264 { .. } => Codec::H264,
            ParameterSetData::H265 { .. } => Codec::H265,
            ParameterSetData::AV1 { .. } => Codec::AV1,
        }
    }
}

/// An immutable, versioned set of sequence/picture-level parameters.
///
/// Produced by the external parser on each parameter-set-change event,
/// identified by a monotonically increasing update sequence.
pub struct PictureParameterSet {
    update_sequence: u64,
    data: ParameterSetData,
}

impl PictureParameterSet {
    /// Wrap a parameter payload produced by the parser.
    pub fn new(update_sequence: u64, data: ParameterSetData) -> Self {
        Self {
            update_sequence,
            data,
        }
    }

    /// The set's update sequence number.
    pub fn update_sequence(&self) -> u64 {
        self.update_sequence
    }

    /// Codec the parameters belong to.
    pub fn codec(&self) -> Codec {
        self.data.codec()
    }

    /// The codec-specific std parameter payload.
    pub fn data(&self) -> &ParameterSetData {
        &self.data
    }
}

/// Outcome of a parameter set update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterUpdate {
    /// The set became active immediately.
    Active,
    /// Activation is deferred until all pictures referencing the previous
    /// set complete. Not a failure.
    Deferred,
}

/// Tracks the active parameter set and arbitrates updates against
/// decode-in-flight usage.
pub struct ParameterSetCache {
    current: Option<Arc<PictureParameterSet>>,
    pending: Option<Arc<PictureParameterSet>>,
    /// Outstanding picture counts per update sequence. Small and short -
    /// at most one entry per set with pictures still in flight.
    outstanding: Vec<(u64, usize)>,
}

impl Default for ParameterSetCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterSetCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            current: None,
            pending: None,
            outstanding: Vec::new(),
        }
    }

    /// The active parameter set.
    ///
    /// During a deferral window this still returns the prior set, so
    /// in-flight pictures continue decoding consistently.
    pub fn current(&self) -> Option<&Arc<PictureParameterSet>> {
        self.current.as_ref()
    }

    /// Whether an update is waiting for in-flight pictures to drain.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Register a new parameter set from the parser.
    ///
    /// Replaces the active set when no queued or in-flight picture
    /// references the previous one; otherwise queues it to activate once
    /// those pictures complete. When several updates arrive during one
    /// deferral window, only the newest survives.
    pub fn update(&mut self, set: Arc<PictureParameterSet>) -> ParameterUpdate {
        if self.current_in_flight() == 0 {
            debug!(
                "Parameter set {} active immediately",
                set.update_sequence()
            );
            self.current = Some(set);
            self.pending = None;
            ParameterUpdate::Active
        } else {
            debug!(
                "Parameter set {} deferred ({} pictures in flight on set {:?})",
                set.update_sequence(),
                self.current_in_flight(),
                self.current.as_ref().map(|c| c.update_sequence())
            );
            self.pending = Some(set);
            ParameterUpdate::Deferred
        }
    }

    /// Pin the active set for a picture about to be submitted.
    ///
    /// The returned reference keeps the set alive for the duration of the
    /// decode; the caller must hand the sequence back via
    /// [`ParameterSetCache::retire`] once the picture's completion signal
    /// is observed.
    pub fn pin_current(&mut self) -> Option<Arc<PictureParameterSet>> {
        let set = self.current.as_ref()?;
        let seq = set.update_sequence();
        match self.outstanding.iter_mut().find(|(s, _)| *s == seq) {
            Some((_, count)) => *count += 1,
            None => self.outstanding.push((seq, 1)),
        }
        Some(Arc::clone(set))
    }

    /// Record completion of a picture that pinned `update_sequence`.
    ///
    /// Promotes the pending set once the previously active one has no
    /// outstanding references.
    pub fn retire(&mut self, update_sequence: u64) {
        if let Some(pos) = self
            .outstanding
            .iter()
            .position(|(s, _)| *s == update_sequence)
        {
            self.outstanding[pos].1 -= 1;
            if self.outstanding[pos].1 == 0 {
                self.outstanding.remove(pos);
            }
        }

        if self.pending.is_some() && self.current_in_flight() == 0 {
            let set = self.pending.take();
            if let Some(ref s) = set {
                debug!(
                    "Deferred parameter set {} now active",
                    s.update_sequence()
                );
            }
            self.current = set;
        }
    }

    /// Drop all state, e.g. on sequence reset after the pipeline drained.
    pub fn reset(&mut self) {
        self.current = None;
        self.pending = None;
        self.outstanding.clear();
    }

    fn current_in_flight(&self) -> usize {
        match self.current.as_ref() {
            Some(current) => {
                let seq = current.update_sequence();
                self.outstanding
                    .iter()
                    .find(|(s, _)| *s == seq)
                    .map(|(_, count)| *count)
                    .unwrap_or(0)
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h264_data(sps_id: u8) -> ParameterSetData {
        let mut sps: native::StdVideoH264SequenceParameterSet = unsafe { std::mem::zeroed() };
        sps.seq_parameter_set_id = sps_id;
        let pps: native::StdVideoH264PictureParameterSet = unsafe { std::mem::zeroed() };
        ParameterSetData::H264 {
            sps: vec![sps],
            pps: vec![pps],
        }
    }

    fn set(seq: u64) -> Arc<PictureParameterSet> {
        Arc::new(PictureParameterSet::new(seq, h264_data(seq as u8)))
    }

    #[test]
    fn test_first_update_is_active() {
        let mut cache = ParameterSetCache::new();
        assert_eq!(cache.update(set(1)), ParameterUpdate::Active);
        assert_eq!(cache.current().unwrap().update_sequence(), 1);
    }

    #[test]
    fn test_update_with_nothing_in_flight_replaces_immediately() {
        let mut cache = ParameterSetCache::new();
        cache.update(set(1));
        assert_eq!(cache.update(set(2)), ParameterUpdate::Active);
        assert_eq!(cache.current().unwrap().update_sequence(), 2);
        assert!(!cache.has_pending());
    }

    #[test]
    fn test_update_while_picture_in_flight_is_deferred() {
        let mut cache = ParameterSetCache::new();
        cache.update(set(1));
        let pinned = cache.pin_current().unwrap();
        assert_eq!(pinned.update_sequence(), 1);

        assert_eq!(cache.update(set(2)), ParameterUpdate::Deferred);
        // The prior set stays current through the deferral window.
        assert_eq!(cache.current().unwrap().update_sequence(), 1);
        assert!(cache.has_pending());
    }

    #[test]
    fn test_in_flight_picture_keeps_its_pinned_set() {
        let mut cache = ParameterSetCache::new();
        cache.update(set(1));
        let pinned = cache.pin_current().unwrap();
        cache.update(set(2));
        // The picture's recorded parameters are untouched by the update.
        assert_eq!(pinned.update_sequence(), 1);
        match pinned.data() {
            ParameterSetData::H264 { sps, pps } => {
                assert_eq!(sps[0].seq_parameter_set_id, 1);
                assert_eq!(pps.len(), 1);
            }
            _ => panic!("expected H.264 payload"),
        }
    }

    #[test]
    fn test_codec_derived_from_payload() {
        assert_eq!(h264_data(0).codec(), Codec::H264);

        let h265 = ParameterSetData::H265 {
            vps: Vec::new(),
            sps: vec![unsafe { std::mem::zeroed() }],
            pps: vec![unsafe { std::mem::zeroed() }],
        };
        assert_eq!(h265.codec(), Codec::H265);

        let av1 = ParameterSetData::AV1 {
            sequence_header: Box::new(unsafe { std::mem::zeroed() }),
        };
        assert_eq!(av1.codec(), Codec::AV1);

        let set = PictureParameterSet::new(7, h264_data(0));
        assert_eq!(set.codec(), Codec::H264);
        assert_eq!(set.update_sequence(), 7);
    }

    #[test]
    fn test_pending_set_promoted_after_last_retirement() {
        let mut cache = ParameterSetCache::new();
        cache.update(set(1));
        let p1 = cache.pin_current().unwrap();
        let p2 = cache.pin_current().unwrap();
        cache.update(set(2));

        cache.retire(p1.update_sequence());
        assert_eq!(cache.current().unwrap().update_sequence(), 1);

        cache.retire(p2.update_sequence());
        assert_eq!(cache.current().unwrap().update_sequence(), 2);
        assert!(!cache.has_pending());
    }

    #[test]
    fn test_latest_pending_wins() {
        let mut cache = ParameterSetCache::new();
        cache.update(set(1));
        let pinned = cache.pin_current().unwrap();
        assert_eq!(cache.update(set(2)), ParameterUpdate::Deferred);
        assert_eq!(cache.update(set(3)), ParameterUpdate::Deferred);

        cache.retire(pinned.update_sequence());
        // Set 2 was never activated; the newest update takes effect.
        assert_eq!(cache.current().unwrap().update_sequence(), 3);
    }

    #[test]
    fn test_pins_against_new_set_do_not_block_promotion_counting() {
        let mut cache = ParameterSetCache::new();
        cache.update(set(1));
        let p1 = cache.pin_current().unwrap();
        cache.retire(p1.update_sequence());

        cache.update(set(2));
        let p2 = cache.pin_current().unwrap();
        assert_eq!(p2.update_sequence(), 2);

        // A further update defers on set 2's outstanding picture, not set 1.
        assert_eq!(cache.update(set(3)), ParameterUpdate::Deferred);
        cache.retire(p2.update_sequence());
        assert_eq!(cache.current().unwrap().update_sequence(), 3);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut cache = ParameterSetCache::new();
        cache.update(set(1));
        let _pinned = cache.pin_current().unwrap();
        cache.update(set(2));
        cache.reset();
        assert!(cache.current().is_none());
        assert!(!cache.has_pending());
    }
}
