use crate::error::DecoderError;
use crate::logmath::{clamp_score, Score, WORST_SCORE};
use crate::search::lmcache::LmHistory;
use crate::types::{PhoneId, WordId};

/// Best way found to finish `word` on `end_frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpointerEntry {
    pub word: WordId,
    pub start_frame: usize,
    /// Inclusive.
    pub end_frame: usize,
    /// Path score from the utterance start through this word, less the
    /// normaliser of `end_frame` (see [`BackpointerTable::absolute_score`]).
    pub score: Score,
    pub ascr: Score,
    pub lscr: Score,
    /// `None` links to the utterance start.
    pub prev: Option<usize>,
    pub history: LmHistory,
    pub last_phone: PhoneId,
}

/// Append-only, frame-ordered store of word exits for one utterance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackpointerTable {
    entries: Vec<BackpointerEntry>,
    /// `frame_end[f]` is one past the last entry index of frame `f`.
    frame_end: Vec<usize>,
    /// Normaliser in force when each closed frame was recorded.
    frame_offset: Vec<i64>,
    /// Sum of the per-frame bests subtracted so far.
    offset: i64,
}

impl BackpointerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.frame_end.clear();
        self.frame_offset.clear();
        self.offset = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BackpointerEntry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&BackpointerEntry> {
        self.entries.get(index)
    }

    /// Number of closed frames.
    pub fn n_frames(&self) -> usize {
        self.frame_end.len()
    }

    /// Index the next `push` will receive.
    pub fn next_index(&self) -> usize {
        self.entries.len()
    }

    /// Entry indices that ended on `frame`, including the open frame.
    pub fn frame_range(&self, frame: usize) -> std::ops::Range<usize> {
        if frame > self.frame_end.len() {
            return 0..0;
        }
        let start = match frame {
            0 => 0,
            f => self.frame_end[f - 1],
        };
        let end = self
            .frame_end
            .get(frame)
            .copied()
            .unwrap_or(self.entries.len());
        start..end
    }

    pub fn frame_entries(&self, frame: usize) -> &[BackpointerEntry] {
        &self.entries[self.frame_range(frame)]
    }

    /// Checks that `entry` could be appended to the open frame.
    pub fn check(&self, entry: &BackpointerEntry) -> Result<(), DecoderError> {
        let open = self.frame_end.len();
        if entry.end_frame != open {
            return Err(DecoderError::invariant(format!(
                "word exit for frame {} recorded while frame {open} is open",
                entry.end_frame
            )));
        }
        check_link(&self.entries, entry)
    }

    pub fn push(&mut self, entry: BackpointerEntry) -> Result<usize, DecoderError> {
        self.check(&entry)?;
        self.entries.push(entry);
        Ok(self.entries.len() - 1)
    }

    /// Closes the open frame; later pushes belong to the next frame.
    pub fn close_frame(&mut self) {
        self.frame_end.push(self.entries.len());
        self.frame_offset.push(self.offset);
    }

    /// Total subtracted from live path scores up to the open frame.
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Normaliser that applies to entries ending on `frame`.
    pub fn frame_offset(&self, frame: usize) -> i64 {
        self.frame_offset.get(frame).copied().unwrap_or(self.offset)
    }

    /// Unnormalised path score of entry `index`.
    pub fn absolute_score(&self, index: usize) -> Option<i64> {
        let entry = self.entries.get(index)?;
        Some(entry.score as i64 + self.frame_offset(entry.end_frame))
    }

    /// Score of entry `index` in the units of the open frame.
    pub fn rebased_score(&self, index: usize) -> Option<Score> {
        self.absolute_score(index)
            .map(|abs| clamp_score(abs - self.offset))
    }

    /// Subtracts `by` from the open frame's entries and from every later
    /// score. Searches call this with the frame best once the frame's live
    /// HMMs have been shifted by the same amount.
    pub fn renormalize(&mut self, by: Score) {
        if by <= WORST_SCORE {
            return;
        }
        let range = self.frame_range(self.frame_end.len());
        for entry in &mut self.entries[range] {
            entry.score = clamp_score(entry.score as i64 - by as i64);
        }
        self.offset += by as i64;
    }

    /// Last frame at or before `frame` that has at least one entry.
    pub fn last_frame_with_entries(&self, frame: usize) -> Option<usize> {
        (0..=frame.min(self.n_frames().saturating_sub(1)))
            .rev()
            .find(|&f| !self.frame_range(f).is_empty())
    }

    /// Highest-scoring entry of `frame`; earlier entries win ties.
    pub fn best_in_frame(&self, frame: usize) -> Option<usize> {
        let mut best: Option<usize> = None;
        for i in self.frame_range(frame) {
            if best.map_or(true, |b| self.entries[i].score > self.entries[b].score) {
                best = Some(i);
            }
        }
        best
    }

    /// Indices from the first word of the path to `index`.
    pub fn backtrace(&self, index: usize) -> Result<Vec<usize>, DecoderError> {
        let mut path = Vec::new();
        let mut at = Some(index);
        while let Some(i) = at {
            let entry = self.entries.get(i).ok_or_else(|| {
                DecoderError::invariant(format!("backpointer {i} is out of range"))
            })?;
            if path.len() > self.entries.len() {
                return Err(DecoderError::invariant("backpointer chain loops"));
            }
            path.push(i);
            at = entry.prev;
        }
        path.reverse();
        Ok(path)
    }

    /// Full consistency check of every entry and the frame index.
    pub fn validate(&self) -> Result<(), DecoderError> {
        for (i, entry) in self.entries.iter().enumerate() {
            check_link(&self.entries[..i], entry)?;
            let range = self.frame_range(entry.end_frame);
            if !range.contains(&i) {
                return Err(DecoderError::invariant(format!(
                    "backpointer {i} is filed under the wrong frame"
                )));
            }
        }
        if self.frame_end.windows(2).any(|w| w[0] > w[1]) {
            return Err(DecoderError::invariant("backpointer frame index is not monotonic"));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn push_unchecked(&mut self, entry: BackpointerEntry) {
        self.entries.push(entry);
    }
}

/// Acoustic share of a word's path score. Both path scores are
/// unnormalised; the start of the utterance scores zero.
pub fn acoustic_share(score: i64, pred_score: i64, lscr: Score) -> Score {
    (score - pred_score - lscr as i64).clamp(i32::MIN as i64, i32::MAX as i64) as Score
}

fn check_link(before: &[BackpointerEntry], entry: &BackpointerEntry) -> Result<(), DecoderError> {
    if entry.start_frame > entry.end_frame {
        return Err(DecoderError::invariant(format!(
            "word {} starts at frame {} after it ends at frame {}",
            entry.word, entry.start_frame, entry.end_frame
        )));
    }
    match entry.prev {
        None if entry.start_frame != 0 => Err(DecoderError::invariant(format!(
            "word {} follows the utterance start but starts at frame {}",
            entry.word, entry.start_frame
        ))),
        None => Ok(()),
        Some(p) => {
            let pred = before.get(p).ok_or_else(|| {
                DecoderError::invariant(format!(
                    "word {} links to backpointer {p} which does not precede it",
                    entry.word
                ))
            })?;
            if pred.end_frame + 1 != entry.start_frame {
                return Err(DecoderError::invariant(format!(
                    "word {} starts at frame {} but its predecessor ends at frame {}",
                    entry.word, entry.start_frame, pred.end_frame
                )));
            }
            Ok(())
        }
    }
}
