//! Blob search along one strip and across the tracking profile.

/// Contiguous vertical foreground run in one strip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blob {
    pub top: usize,
    pub bottom: usize,
    /// Mean |luma - background| over foreground pixels inside the run
    pub contrast: f32,
}

impl Blob {
    pub fn height(&self) -> usize {
        self.bottom - self.top + 1
    }
}

/// Longest foreground run in `strip`, bridging gaps of at most `max_gap` rows.
///
/// Returns `None` unless the run spans at least `min_height` rows.
pub fn find_vertical_blob(
    strip: &[u8],
    background: &[f32],
    threshold: f32,
    min_height: usize,
    max_gap: usize,
) -> Option<Blob> {
    let mut best: Option<Blob> = None;
    let mut start: Option<usize> = None;
    let mut last_fg = 0usize;
    let mut sum = 0.0f32;
    let mut count = 0usize;

    let close_run = |start: usize, end: usize, sum: f32, count: usize, best: &mut Option<Blob>| {
        let candidate = Blob {
            top: start,
            bottom: end,
            contrast: if count > 0 { sum / count as f32 } else { 0.0 },
        };
        if best.map_or(true, |b| candidate.height() > b.height()) {
            *best = Some(candidate);
        }
    };

    for (y, (&pixel, &bg)) in strip.iter().zip(background).enumerate() {
        let diff = (pixel as f32 - bg).abs();
        if diff <= threshold {
            continue;
        }
        match start {
            Some(s) if y - last_fg > max_gap + 1 => {
                close_run(s, last_fg, sum, count, &mut best);
                start = Some(y);
                sum = 0.0;
                count = 0;
            }
            None => {
                start = Some(y);
            }
            _ => {}
        }
        last_fg = y;
        sum += diff;
        count += 1;
    }
    if let Some(s) = start {
        close_run(s, last_fg, sum, count, &mut best);
    }

    best.filter(|b| b.height() >= min_height.max(1))
}

/// Horizontal extent of the foreground in the tracking profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileBlob {
    pub left: u32,
    pub right: u32,
    pub centroid: f32,
}

impl ProfileBlob {
    pub fn width(&self) -> f32 {
        (self.right - self.left) as f32
    }
}

/// Widest foreground group in a column profile, bridging `max_gap` sampled columns.
pub fn find_profile_blob(
    profile: &[(u32, f32)],
    background: &[(u32, f32)],
    threshold: f32,
    max_gap: usize,
) -> Option<ProfileBlob> {
    if profile.len() != background.len() {
        return None;
    }

    let mut best: Option<(usize, usize)> = None;
    let mut run: Option<(usize, usize)> = None;

    for (i, ((_, value), (_, bg))) in profile.iter().zip(background).enumerate() {
        if (value - bg).abs() <= threshold {
            continue;
        }
        run = match run {
            Some((s, e)) if i - e <= max_gap + 1 => Some((s, i)),
            Some(prev) => {
                if best.map_or(true, |(bs, be)| prev.1 - prev.0 > be - bs) {
                    best = Some(prev);
                }
                Some((i, i))
            }
            None => Some((i, i)),
        };
    }
    if let Some(prev) = run {
        if best.map_or(true, |(bs, be)| prev.1 - prev.0 > be - bs) {
            best = Some(prev);
        }
    }

    let (s, e) = best?;
    let foreground: Vec<u32> = (s..=e)
        .filter(|&i| (profile[i].1 - background[i].1).abs() > threshold)
        .map(|i| profile[i].0)
        .collect();
    let centroid = foreground.iter().map(|&x| x as f32).sum::<f32>() / foreground.len() as f32;

    Some(ProfileBlob {
        left: profile[s].0,
        right: profile[e].0,
        centroid,
    })
}
