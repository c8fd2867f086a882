//! Terminal VU meter rendering.
//!
//! Draws on one carriage-return line on stderr: a mono bar, or two
//! back-to-back bars for stereo streams. `+` marks the one-second maximum.

use std::io::Write;

use pcm_engine::meter::MeterLevels;

pub fn render(levels: &MeterLevels) {
    let line = if levels.lanes == 2 {
        stereo_line(&levels.instant, &levels.windowed)
    } else {
        mono_line(levels.instant[0], levels.windowed[0], levels.clipped)
    };
    eprint!("\r{line}");
    let _ = std::io::stderr().flush();
}

/// Terminate the meter line once the run ends.
pub fn finish() {
    eprintln!();
}

fn mono_line(perc: i32, maxperc: i32, clipped: bool) -> String {
    const BAR: i32 = 50;
    let mut cells = vec![' '; BAR as usize + 1];
    let mut val: i32 = 0;
    while val <= perc * BAR / 100 && val < BAR {
        cells[val as usize] = '#';
        val += 1;
    }
    while val <= maxperc * BAR / 100 && val < BAR {
        val += 1;
    }
    cells[val as usize] = '+';

    let mut line: String = cells.into_iter().collect();
    if maxperc > 99 {
        line.push_str("| MAX");
    } else {
        line.push_str(&format!("| {maxperc:02}%"));
    }
    if clipped {
        line.push_str(" !clip");
    }
    line
}

fn stereo_line(perc: &[i32; 2], maxperc: &[i32; 2]) -> String {
    const BAR: usize = 35;
    let mut cells = vec![b' '; BAR * 2 + 8];
    cells[BAR + 3] = b'|';

    for lane in 0..2 {
        let p = ((perc[lane].max(0) as usize) * BAR / 100).min(BAR);
        if lane == 1 {
            for i in 0..p {
                cells[BAR + 7 + i] = b'#';
            }
        } else {
            for i in 0..p {
                cells[BAR - p + i] = b'#';
            }
        }

        let marker = (maxperc[lane] * BAR as i32 / 100 - 1).clamp(0, BAR as i32 - 1) as usize;
        if lane == 1 {
            cells[BAR + 7 + marker] = b'+';
        } else {
            cells[BAR - marker - 1] = b'+';
        }

        let label = if maxperc[lane].abs() > 99 {
            "MAX".to_string()
        } else {
            format!("{:02}%", maxperc[lane])
        };
        let at = if lane == 1 { BAR + 4 } else { BAR };
        cells[at..at + 3].copy_from_slice(label.as_bytes());
    }

    String::from_utf8_lossy(&cells).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_mono_line_shows_zero() {
        let line = mono_line(0, 0, false);
        assert!(line.starts_with("#+"));
        assert!(line.ends_with("| 00%"));
    }

    #[test]
    fn loud_mono_line_shows_max_and_clip() {
        let line = mono_line(101, 101, true);
        assert!(line.contains("##########"));
        assert!(line.contains("| MAX"));
        assert!(line.ends_with(" !clip"));
    }

    #[test]
    fn mono_marker_trails_the_bar() {
        let line = mono_line(20, 80, false);
        let hash_count = line.chars().filter(|c| *c == '#').count();
        assert_eq!(hash_count, 11);
        assert!(line.contains('+'));
        assert!(line.ends_with("| 80%"));
    }

    #[test]
    fn stereo_line_has_fixed_layout() {
        let line = stereo_line(&[100, 0], &[100, 0]);
        assert_eq!(line.len(), 78);
        assert_eq!(line.as_bytes()[38], b'|');
        assert!(line.contains("MAX"));
        assert!(line.contains("00%"));
        // Left bar is right-aligned; the peak marker overlays its far end.
        assert_eq!(&line[..1], "+");
        assert_eq!(&line[1..35], "#".repeat(34));
    }
}
