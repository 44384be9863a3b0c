//! Fusion of diarization and transcription into speaker-attributed segments.
//!
//! Each transcription segment is assigned the diarization speaker with the
//! largest temporal overlap. Whole-file transcriptions (the text-blob model
//! tiers) are first split at diarization boundaries so every speaker stays
//! addressable. No text is ever dropped.

use crate::defaults;
use crate::error::Result;
use crate::types::{self, DiarizationSegment, FusedSegment, TranscriptionSegment};

/// Tuning for the fuser.
#[derive(Debug, Clone)]
pub struct FuseConfig {
    /// Minimum overlap as a share of the transcription segment's duration.
    pub min_overlap_ratio: f64,
    /// Label used when no diarization segment overlaps enough.
    pub unknown_label: String,
    /// Diarization segments at least this long must keep at least one word
    /// when a whole-file segment is redistributed.
    pub min_addressable_seconds: f64,
}

impl Default for FuseConfig {
    fn default() -> Self {
        Self {
            min_overlap_ratio: defaults::MIN_OVERLAP_RATIO,
            unknown_label: defaults::UNKNOWN_SPEAKER.to_string(),
            min_addressable_seconds: defaults::MIN_ADDRESSABLE_SECONDS,
        }
    }
}

/// Temporal overlap between two intervals, clamped at zero.
fn overlap(a_start: f64, a_end: f64, b_start: f64, b_end: f64) -> f64 {
    (a_end.min(b_end) - a_start.max(b_start)).max(0.0)
}

/// Joins diarization and transcription outputs.
pub struct SegmentFuser {
    config: FuseConfig,
}

impl SegmentFuser {
    pub fn new() -> Self {
        Self::with_config(FuseConfig::default())
    }

    pub fn with_config(config: FuseConfig) -> Self {
        Self { config }
    }

    /// Produces one fused segment per transcription segment.
    ///
    /// Inputs must be time-ordered; the output preserves transcription
    /// order, so its starts are non-decreasing.
    pub fn fuse(
        &self,
        diarization: &[DiarizationSegment],
        transcription: &[TranscriptionSegment],
    ) -> Result<Vec<FusedSegment>> {
        if transcription.is_empty() {
            return Ok(Vec::new());
        }
        types::validate_transcription(transcription)?;

        // A single whole-file segment against a multi-turn diarization is
        // the text-blob tier shape: split it before assigning speakers.
        let fused = if transcription.len() == 1 && diarization.len() > 1 {
            self.split_whole_file(&transcription[0], diarization)
        } else {
            transcription
                .iter()
                .map(|t| self.assign_speaker(t, diarization))
                .collect()
        };

        types::validate_fused(&fused)?;
        Ok(fused)
    }

    /// Picks the diarization segment with maximal overlap for `t`.
    ///
    /// Ties break on higher confidence, then earlier start, then
    /// lexicographic speaker label.
    fn assign_speaker(
        &self,
        t: &TranscriptionSegment,
        diarization: &[DiarizationSegment],
    ) -> FusedSegment {
        let mut best: Option<(&DiarizationSegment, f64)> = None;

        for d in diarization {
            let o = overlap(t.start, t.end, d.start, d.end);
            if o <= 0.0 {
                continue;
            }
            best = match best {
                None => Some((d, o)),
                Some((current, current_o)) => {
                    if Self::beats(d, o, current, current_o) {
                        Some((d, o))
                    } else {
                        Some((current, current_o))
                    }
                }
            };
        }

        let threshold = self.config.min_overlap_ratio * t.duration();
        match best {
            Some((d, o)) if o >= threshold => FusedSegment {
                start: t.start,
                end: t.end,
                speaker: d
                    .identified_as
                    .clone()
                    .unwrap_or_else(|| d.speaker.clone()),
                text: t.text.clone(),
                confidence: t.confidence,
                diarization_speaker: Some(d.speaker.clone()),
                identified_as: d.identified_as.clone(),
                match_score: d.match_score,
            },
            _ => FusedSegment {
                start: t.start,
                end: t.end,
                speaker: self.config.unknown_label.clone(),
                text: t.text.clone(),
                confidence: t.confidence,
                diarization_speaker: None,
                identified_as: None,
                match_score: None,
            },
        }
    }

    /// True when challenger (with overlap `o`) wins over `current`.
    fn beats(
        challenger: &DiarizationSegment,
        o: f64,
        current: &DiarizationSegment,
        current_o: f64,
    ) -> bool {
        if o != current_o {
            return o > current_o;
        }
        let challenger_conf = challenger.confidence.unwrap_or(f64::NEG_INFINITY);
        let current_conf = current.confidence.unwrap_or(f64::NEG_INFINITY);
        if challenger_conf != current_conf {
            return challenger_conf > current_conf;
        }
        if challenger.start != current.start {
            return challenger.start < current.start;
        }
        challenger.speaker < current.speaker
    }

    /// Splits one whole-file segment at diarization boundaries, distributing
    /// words by character count weighted by overlap duration.
    fn split_whole_file(
        &self,
        t: &TranscriptionSegment,
        diarization: &[DiarizationSegment],
    ) -> Vec<FusedSegment> {
        // Clip each speaker turn to the transcription span
        let mut pieces: Vec<(f64, f64, &DiarizationSegment)> = diarization
            .iter()
            .filter_map(|d| {
                let start = d.start.max(t.start);
                let end = d.end.min(t.end);
                (end > start).then_some((start, end, d))
            })
            .collect();

        if pieces.is_empty() {
            return vec![self.assign_speaker(t, diarization)];
        }
        pieces.sort_by(|a, b| a.0.partial_cmp(&b.0).expect("finite bounds"));

        let words: Vec<&str> = t.text.split_whitespace().collect();
        let total_chars: usize = words.iter().map(|w| w.len()).sum();
        let total_duration: f64 = pieces.iter().map(|(s, e, _)| e - s).sum();

        // Greedy word assignment against per-piece character targets
        let mut allocations: Vec<Vec<&str>> = vec![Vec::new(); pieces.len()];
        let mut word_iter = words.iter().copied().peekable();
        let mut assigned_chars = 0.0f64;
        let mut cumulative_target = 0.0f64;

        for (i, (start, end, _)) in pieces.iter().enumerate() {
            cumulative_target += total_chars as f64 * (end - start) / total_duration;
            let last = i + 1 == pieces.len();
            while let Some(&word) = word_iter.peek() {
                if !last && assigned_chars + word.len() as f64 / 2.0 > cumulative_target {
                    break;
                }
                allocations[i].push(word);
                assigned_chars += word.len() as f64;
                word_iter.next();
            }
        }

        // Long-enough speaker turns must not end up empty
        for i in 0..pieces.len() {
            let (start, end, _) = pieces[i];
            if allocations[i].is_empty() && end - start >= self.config.min_addressable_seconds {
                if let Some(donor) = (0..pieces.len())
                    .filter(|&j| allocations[j].len() > 1)
                    .max_by_key(|&j| allocations[j].len())
                {
                    let word = if donor < i {
                        allocations[donor].pop()
                    } else {
                        Some(allocations[donor].remove(0))
                    };
                    if let Some(word) = word {
                        allocations[i].push(word);
                    }
                }
            }
        }

        pieces
            .iter()
            .zip(allocations)
            .filter(|(_, words)| !words.is_empty())
            .map(|(&(start, end, d), words)| FusedSegment {
                start,
                end,
                speaker: d
                    .identified_as
                    .clone()
                    .unwrap_or_else(|| d.speaker.clone()),
                text: words.join(" "),
                confidence: t.confidence,
                diarization_speaker: Some(d.speaker.clone()),
                identified_as: d.identified_as.clone(),
                match_score: d.match_score,
            })
            .collect()
    }
}

impl Default for SegmentFuser {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts identification output (speaker turns without text) into the
/// canonical fused form for export.
pub fn identification_to_fused(segments: &[DiarizationSegment]) -> Vec<FusedSegment> {
    segments
        .iter()
        .map(|d| FusedSegment {
            start: d.start,
            end: d.end,
            speaker: d
                .identified_as
                .clone()
                .unwrap_or_else(|| d.speaker.clone()),
            text: String::new(),
            confidence: d.confidence,
            diarization_speaker: Some(d.speaker.clone()),
            identified_as: d.identified_as.clone(),
            match_score: d.match_score,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diar(start: f64, end: f64, speaker: &str) -> DiarizationSegment {
        DiarizationSegment::new(start, end, speaker)
    }

    fn asr(start: f64, end: f64, text: &str) -> TranscriptionSegment {
        TranscriptionSegment::new(start, end, text)
    }

    fn normalized_chars(text: &str) -> usize {
        text.split_whitespace().map(|w| w.len()).sum()
    }

    #[test]
    fn test_overlap_math() {
        assert_eq!(overlap(0.0, 5.0, 4.0, 6.0), 1.0);
        assert_eq!(overlap(0.0, 5.0, 5.0, 6.0), 0.0);
        assert_eq!(overlap(0.0, 5.0, 6.0, 7.0), 0.0);
        assert_eq!(overlap(2.0, 3.0, 0.0, 10.0), 1.0);
    }

    #[test]
    fn test_basic_attribution_with_crosstalk_tiebreak() {
        // The 4-6s segment overlaps S0 and S1 by 1s each; earlier start wins
        let diarization = vec![diar(0.0, 5.0, "S0"), diar(5.0, 10.0, "S1")];
        let transcription = vec![
            asr(0.0, 4.0, "hello world"),
            asr(4.0, 6.0, "crossing over"),
            asr(6.0, 10.0, "goodbye now"),
        ];

        let fused = SegmentFuser::new().fuse(&diarization, &transcription).unwrap();

        let speakers: Vec<_> = fused.iter().map(|f| f.speaker.as_str()).collect();
        assert_eq!(speakers, vec!["S0", "S0", "S1"]);
        let texts: Vec<_> = fused.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(texts, vec!["hello world", "crossing over", "goodbye now"]);
    }

    #[test]
    fn test_below_threshold_overlap_is_unknown() {
        let diarization = vec![diar(0.0, 1.0, "S0")];
        let transcription = vec![asr(10.0, 15.0, "later speech")];

        let fused = SegmentFuser::new().fuse(&diarization, &transcription).unwrap();

        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].speaker, "UNKNOWN");
        assert_eq!(fused[0].text, "later speech");
        assert_eq!(fused[0].start, 10.0);
        assert_eq!(fused[0].end, 15.0);
    }

    #[test]
    fn test_tiebreak_prefers_higher_confidence() {
        let mut a = diar(0.0, 4.0, "S0");
        a.confidence = Some(0.4);
        let mut b = diar(2.0, 6.0, "S1");
        b.confidence = Some(0.9);
        // Transcription [2,4] overlaps both by exactly 2s
        let transcription = vec![asr(2.0, 4.0, "tied")];

        let fused = SegmentFuser::new()
            .fuse(&[a, b], &transcription)
            .unwrap();
        assert_eq!(fused[0].speaker, "S1");
    }

    #[test]
    fn test_tiebreak_lexicographic_last() {
        // Same overlap, no confidence, same start: label order decides
        let diarization = vec![diar(0.0, 4.0, "S_b"), diar(0.0, 4.0, "S_a")];
        let transcription = vec![asr(0.0, 4.0, "who said this")];

        let fused = SegmentFuser::new().fuse(&diarization, &transcription).unwrap();
        assert_eq!(fused[0].speaker, "S_a");
    }

    #[test]
    fn test_empty_diarization_gives_all_unknown() {
        let transcription = vec![asr(0.0, 2.0, "one"), asr(2.0, 4.0, "two")];
        let fused = SegmentFuser::new().fuse(&[], &transcription).unwrap();

        assert_eq!(fused.len(), 2);
        assert!(fused.iter().all(|f| f.speaker == "UNKNOWN"));
    }

    #[test]
    fn test_empty_transcription_gives_empty_output() {
        let diarization = vec![diar(0.0, 5.0, "S0")];
        let fused = SegmentFuser::new().fuse(&diarization, &[]).unwrap();
        assert!(fused.is_empty());
    }

    #[test]
    fn test_whole_file_segment_split_proportionally() {
        let diarization = vec![
            diar(0.0, 6.0, "S0"),
            diar(6.0, 8.0, "S1"),
            diar(8.0, 10.0, "S0"),
        ];
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa";
        let transcription = vec![asr(0.0, 10.0, text)];

        let fused = SegmentFuser::new().fuse(&diarization, &transcription).unwrap();

        // Split at diarization boundaries, all speakers addressable
        assert_eq!(fused.len(), 3);
        assert_eq!(fused[0].speaker, "S0");
        assert_eq!(fused[1].speaker, "S1");
        assert_eq!(fused[2].speaker, "S0");
        assert_eq!(fused[0].start, 0.0);
        assert_eq!(fused[1].start, 6.0);
        assert_eq!(fused[2].end, 10.0);

        // The 60% piece holds the majority of the text
        assert!(fused[0].text.split_whitespace().count() >= 5);

        // No text dropped (modulo whitespace normalization)
        let total: usize = fused.iter().map(|f| normalized_chars(&f.text)).sum();
        assert_eq!(total, normalized_chars(text));
    }

    #[test]
    fn test_whole_file_split_keeps_short_speaker_addressable() {
        // S1 has just over a second; it must still receive a word
        let diarization = vec![diar(0.0, 20.0, "S0"), diar(20.0, 21.2, "S1")];
        let transcription = vec![asr(0.0, 21.2, "one two three four five six")];

        let fused = SegmentFuser::new().fuse(&diarization, &transcription).unwrap();

        let s1: Vec<_> = fused.iter().filter(|f| f.speaker == "S1").collect();
        assert_eq!(s1.len(), 1);
        assert!(!s1[0].text.is_empty());
    }

    #[test]
    fn test_single_transcription_single_diarization_not_split() {
        // One segment each: the plain assignment path applies
        let diarization = vec![diar(0.0, 10.0, "S0")];
        let transcription = vec![asr(0.0, 10.0, "just one speaker talking")];

        let fused = SegmentFuser::new().fuse(&diarization, &transcription).unwrap();
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].text, "just one speaker talking");
        assert_eq!(fused[0].speaker, "S0");
    }

    #[test]
    fn test_fusion_is_idempotent() {
        let diarization = vec![diar(0.0, 5.0, "S0"), diar(5.0, 10.0, "S1")];
        let transcription = vec![asr(0.0, 4.0, "a"), asr(4.0, 9.0, "b")];

        let fuser = SegmentFuser::new();
        let first = fuser.fuse(&diarization, &transcription).unwrap();
        let second = fuser.fuse(&diarization, &transcription).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_output_is_monotonic_with_overlapping_diarization() {
        // Cross-talk: diarization overlaps; output must stay ordered
        let diarization = vec![diar(0.0, 6.0, "S0"), diar(4.0, 10.0, "S1")];
        let transcription = vec![
            asr(0.0, 3.0, "first"),
            asr(3.0, 7.0, "second"),
            asr(7.0, 10.0, "third"),
        ];

        let fused = SegmentFuser::new().fuse(&diarization, &transcription).unwrap();
        for pair in fused.windows(2) {
            assert!(pair[1].start >= pair[0].start);
        }
    }

    #[test]
    fn test_identified_speaker_label_preferred() {
        let mut d = diar(0.0, 5.0, "SPEAKER_00");
        d.identified_as = Some("Alice".to_string());
        d.match_score = Some(0.88);
        let transcription = vec![asr(0.0, 4.0, "hello")];

        let fused = SegmentFuser::new().fuse(&[d], &transcription).unwrap();
        assert_eq!(fused[0].speaker, "Alice");
        assert_eq!(fused[0].diarization_speaker.as_deref(), Some("SPEAKER_00"));
        assert_eq!(fused[0].match_score, Some(0.88));
    }

    #[test]
    fn test_identification_to_fused() {
        let mut d = diar(0.0, 5.0, "SPEAKER_00");
        d.identified_as = Some("Bob".to_string());
        let fused = identification_to_fused(&[d]);

        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].speaker, "Bob");
        assert!(fused[0].text.is_empty());
    }

    #[test]
    fn test_character_count_preserved_across_inputs() {
        let diarization = vec![diar(0.0, 5.0, "S0"), diar(5.0, 10.0, "S1")];
        let transcription = vec![
            asr(0.0, 4.0, "  padded   text "),
            asr(4.0, 8.0, "MiXeD CaSe"),
        ];

        let fused = SegmentFuser::new().fuse(&diarization, &transcription).unwrap();

        let before: usize = transcription.iter().map(|t| normalized_chars(&t.text)).sum();
        let after: usize = fused.iter().map(|f| normalized_chars(&f.text)).sum();
        assert_eq!(before, after);
        // Casing and inner whitespace are preserved verbatim on this path
        assert_eq!(fused[0].text, "  padded   text ");
    }
}
