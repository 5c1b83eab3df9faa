//! Pure track-selection logic.
//!
//! [`pick_next`] and [`find_generating_interrupt`] are the only functions in
//! this module and take no Room state beyond their arguments: given the same
//! inputs they always return the same output (see the `determinism` test).

use crate::model::{Song, SongStatus};

/// Selects the next song to play under the priority order:
///
/// 1. **P1 — Interrupts**: any playable `is_interrupt` song, oldest `creation_time` first.
/// 2. **P2 — Current epoch** (skipped when `manual_mode`): playable songs with
///    `prompt_epoch == playlist_epoch`, preferring the lowest `order_index` strictly
///    greater than `current_order_index`, wrapping to the overall lowest if none are ahead.
/// 3. **P3 — Fallback**: all remaining playable songs, same ahead-first-else-wrap rule.
///
/// The current song (`current_song_id`) is always excluded from candidacy.
pub fn pick_next(
    songs: &[Song],
    current_song_id: Option<&str>,
    playlist_epoch: u64,
    current_order_index: Option<f64>,
    manual_mode: bool,
) -> Option<Song> {
    let playable: Vec<&Song> = songs
        .iter()
        .filter(|s| s.is_playable(manual_mode))
        .filter(|s| Some(s.id.as_str()) != current_song_id)
        .collect();

    if let Some(song) = pick_ahead_or_wrap(
        playable.iter().copied().filter(|s| s.is_interrupt),
        current_order_index,
        true,
    ) {
        return Some(song.clone());
    }

    if !manual_mode {
        if let Some(song) = pick_ahead_or_wrap(
            playable
                .iter()
                .copied()
                .filter(|s| s.prompt_epoch == playlist_epoch),
            current_order_index,
            false,
        ) {
            return Some(song.clone());
        }
    }

    pick_ahead_or_wrap(playable.into_iter(), current_order_index, false).cloned()
}

/// Applies the "ahead-first, else wrap" rule to a candidate set.
///
/// Interrupts tie-break on oldest `creation_time` (FIFO) rather than
/// `order_index`; everything else tie-breaks on the lowest `order_index`.
fn pick_ahead_or_wrap<'a>(
    candidates: impl Iterator<Item = &'a Song>,
    current_order_index: Option<f64>,
    fifo_tiebreak: bool,
) -> Option<&'a Song> {
    let candidates: Vec<&Song> = candidates.collect();
    if candidates.is_empty() {
        return None;
    }

    if fifo_tiebreak {
        return candidates
            .into_iter()
            .min_by(|a, b| a.creation_time.cmp(&b.creation_time));
    }

    let ahead = current_order_index.and_then(|cur| {
        candidates
            .iter()
            .copied()
            .filter(|s| s.order_index > cur)
            .min_by(|a, b| a.order_index.total_cmp(&b.order_index))
    });

    ahead.or_else(|| {
        candidates
            .into_iter()
            .min_by(|a, b| a.order_index.total_cmp(&b.order_index))
    })
}

/// Returns the oldest in-flight interrupt (any generating status), used to
/// populate a "next up" banner while a user-requested interrupt is still
/// being generated.
pub fn find_generating_interrupt(songs: &[Song]) -> Option<&Song> {
    songs
        .iter()
        .filter(|s| s.is_interrupt && s.status.is_generating())
        .min_by(|a, b| a.creation_time.cmp(&b.creation_time))
}
