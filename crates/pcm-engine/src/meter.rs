//! Peak (VU) metering over raw sample bytes.
//!
//! The decoder variant is picked once per session from the sample width, so
//! the per-sample loop carries no format dispatch. Samples are normalized to
//! a signed, zero-centered value by XOR-ing the format's silence mask, then
//! folded into per-channel maxima.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::format::{ByteOrder, StreamFormat};

/// How channels fold into meter lanes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MeterMode {
    /// All channels fold into a single lane.
    Mono,
    /// Alternating samples feed two lanes (interleaved stereo streams).
    Stereo,
}

/// Snapshot of the meter for a display layer.
#[derive(Clone, Copy, Debug, Default)]
pub struct MeterLevels {
    /// Percentage of full scale seen in the last observed chunk.
    pub instant: [i32; 2],
    /// Rolling one-second maximum percentage.
    pub windowed: [i32; 2],
    /// Number of active lanes (1 or 2).
    pub lanes: usize,
    /// Instantaneous percentage exceeded 100.
    pub clipped: bool,
}

/// Width-specialized sample decoder.
enum SampleDecoder {
    Bits8 { mask: i8 },
    Bits16 { mask: i16, big: bool },
    Bits24 { mask: i32, big: bool },
    Bits32 { mask: i32, big: bool },
}

impl SampleDecoder {
    fn new(format: &StreamFormat) -> Self {
        let coding = format.coding();
        let mask = coding.silence_xor_mask();
        let big = coding.order() == ByteOrder::Big;
        match coding.bits() {
            8 => SampleDecoder::Bits8 { mask: mask as i8 },
            16 => SampleDecoder::Bits16 {
                mask: mask as i16,
                big,
            },
            24 => SampleDecoder::Bits24 { mask, big },
            _ => SampleDecoder::Bits32 { mask, big },
        }
    }

    /// Fold `samples` decoded absolute values into per-lane maxima.
    fn peaks(&self, data: &[u8], samples: usize, lanes: usize, peak: &mut [i32; 2]) {
        let mut lane = 0;
        let mut bump = |val: i32, lane: &mut usize| {
            if peak[*lane] < val {
                peak[*lane] = val;
            }
            if lanes == 2 {
                *lane ^= 1;
            }
        };
        match *self {
            SampleDecoder::Bits8 { mask } => {
                for byte in data.iter().take(samples) {
                    let val = ((*byte as i8) ^ mask) as i32;
                    bump(val.abs(), &mut lane);
                }
            }
            SampleDecoder::Bits16 { mask, big } => {
                for raw in data.chunks_exact(2).take(samples) {
                    let sval = if big {
                        i16::from_be_bytes([raw[0], raw[1]])
                    } else {
                        i16::from_le_bytes([raw[0], raw[1]])
                    };
                    let val = (sval ^ mask) as i32;
                    bump(val.abs(), &mut lane);
                }
            }
            SampleDecoder::Bits24 { mask, big } => {
                for raw in data.chunks_exact(3).take(samples) {
                    let mut val = if big {
                        (raw[0] as i32) << 16 | (raw[1] as i32) << 8 | raw[2] as i32
                    } else {
                        raw[0] as i32 | (raw[1] as i32) << 8 | (raw[2] as i32) << 16
                    };
                    val ^= mask;
                    // Sign-extend the top byte.
                    if val & 0x80_0000 != 0 {
                        val |= -0x100_0000;
                    }
                    bump(val.abs(), &mut lane);
                }
            }
            SampleDecoder::Bits32 { mask, big } => {
                for raw in data.chunks_exact(4).take(samples) {
                    let mut val = if big {
                        i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])
                    } else {
                        i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
                    };
                    val ^= mask;
                    // abs() of the most negative value would wrap.
                    let val = if val == i32::MIN { i32::MAX } else { val.abs() };
                    bump(val, &mut lane);
                }
            }
        }
    }
}

/// Per-channel instantaneous and windowed-maximum amplitude.
pub struct PeakMeter {
    decoder: SampleDecoder,
    lanes: usize,
    full_scale: i32,
    wide: bool,
    window_second: u64,
    instant: [i32; 2],
    windowed: [i32; 2],
    clipped: bool,
}

impl PeakMeter {
    pub fn new(format: &StreamFormat, mode: MeterMode) -> Self {
        let lanes = match mode {
            MeterMode::Mono => 1,
            MeterMode::Stereo => 2,
        };
        Self {
            decoder: SampleDecoder::new(format),
            lanes,
            full_scale: format.coding().full_scale(),
            wide: format.coding().bits() > 16,
            window_second: 0,
            instant: [0; 2],
            windowed: [0; 2],
            clipped: false,
        }
    }

    /// Observe `samples` raw samples from a transferred region.
    pub fn observe(&mut self, data: &[u8], samples: usize) {
        let mut peak = [0i32; 2];
        self.decoder.peaks(data, samples, self.lanes, &mut peak);

        let mut perc = [0i32; 2];
        for lane in 0..self.lanes {
            // Two divisor styles on purpose: the wide form avoids overflow in
            // the multiplication, at slightly different rounding.
            perc[lane] = if self.wide {
                peak[lane] / (self.full_scale / 100)
            } else {
                peak[lane] * 100 / self.full_scale
            };
        }

        let now = wall_clock_second();
        if now > self.window_second {
            self.window_second = now;
            self.windowed = [0; 2];
        }
        for lane in 0..self.lanes {
            if perc[lane] > self.windowed[lane] {
                self.windowed[lane] = perc[lane];
            }
        }
        self.instant = perc;
        self.clipped = perc[..self.lanes].iter().any(|p| *p > 100);
    }

    /// Drop the windowed maxima (after a suspicious device position reading).
    pub fn reset_window(&mut self) {
        self.windowed = [0; 2];
    }

    pub fn levels(&self) -> MeterLevels {
        MeterLevels {
            instant: self.instant,
            windowed: self.windowed,
            lanes: self.lanes,
            clipped: self.clipped,
        }
    }
}

fn wall_clock_second() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleCoding;

    /// Encode one signed sample value into the coding's raw bytes.
    fn encode(coding: SampleCoding, value: i32, out: &mut Vec<u8>) {
        let raw = (value ^ coding.silence_xor_mask()) as u32;
        let n = coding.bytes_per_sample();
        let le = coding.order() == ByteOrder::Little;
        for i in 0..n {
            let shift = if le { 8 * i } else { 8 * (n - 1 - i) };
            out.push((raw >> shift) as u8);
        }
    }

    /// One sine cycle at the given peak amplitude, mono.
    fn sine_bytes(coding: SampleCoding, amplitude: i32, samples: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..samples {
            let phase = 2.0 * std::f64::consts::PI * i as f64 / samples as f64;
            let value = (amplitude as f64 * phase.sin()).round() as i32;
            encode(coding, value, &mut out);
        }
        out
    }

    fn mono_meter(coding: SampleCoding) -> PeakMeter {
        let format = StreamFormat::new(coding, 1, 48_000).unwrap();
        PeakMeter::new(&format, MeterMode::Mono)
    }

    #[test]
    fn half_scale_sine_reads_fifty_percent() {
        for (coding, amplitude) in [
            (SampleCoding::U8, 64),
            (SampleCoding::S16_LE, 16_384),
            (SampleCoding::S16_BE, 16_384),
            (SampleCoding::U16_LE, 16_384),
            (SampleCoding::S24_3LE, 1 << 22),
            (SampleCoding::S24_3BE, 1 << 22),
            (SampleCoding::S32_LE, 1 << 30),
        ] {
            let mut meter = mono_meter(coding);
            meter.observe(&sine_bytes(coding, amplitude, 64), 64);
            let got = meter.levels().instant[0];
            assert!(
                (got - 50).abs() <= 1,
                "{}: expected ~50%, got {got}%",
                coding.name()
            );
        }
    }

    #[test]
    fn full_scale_sine_reads_hundred_percent() {
        let coding = SampleCoding::S16_LE;
        let mut meter = mono_meter(coding);
        meter.observe(&sine_bytes(coding, 32_767, 64), 64);
        assert_eq!(meter.levels().instant[0], 99);
        assert!(!meter.levels().clipped);
    }

    #[test]
    fn most_negative_32_bit_sample_clamps_instead_of_wrapping() {
        let mut meter = mono_meter(SampleCoding::S32_LE);
        let bytes = i32::MIN.to_le_bytes().to_vec();
        meter.observe(&bytes, 1);
        assert_eq!(meter.levels().instant[0], 100);
    }

    #[test]
    fn silence_reads_zero_for_unsigned_codings() {
        let coding = SampleCoding::U16_LE;
        let mut meter = mono_meter(coding);
        let mut buf = vec![0u8; 8];
        coding.fill_silence(&mut buf);
        meter.observe(&buf, 4);
        assert_eq!(meter.levels().instant[0], 0);
    }

    #[test]
    fn stereo_mode_tracks_two_lanes() {
        let coding = SampleCoding::S16_LE;
        let format = StreamFormat::new(coding, 2, 48_000).unwrap();
        let mut meter = PeakMeter::new(&format, MeterMode::Stereo);

        // Loud left, quiet right.
        let mut bytes = Vec::new();
        for _ in 0..16 {
            encode(coding, 16_384, &mut bytes);
            encode(coding, 328, &mut bytes);
        }
        meter.observe(&bytes, 32);
        let levels = meter.levels();
        assert_eq!(levels.lanes, 2);
        assert_eq!(levels.instant[0], 50);
        assert_eq!(levels.instant[1], 1);
    }

    #[test]
    fn windowed_maximum_holds_until_reset() {
        let coding = SampleCoding::S16_LE;
        let mut meter = mono_meter(coding);
        meter.observe(&sine_bytes(coding, 16_384, 64), 64);
        meter.observe(&sine_bytes(coding, 328, 64), 64);
        let levels = meter.levels();
        assert_eq!(levels.instant[0], 1);
        assert_eq!(levels.windowed[0], 50);

        meter.reset_window();
        assert_eq!(meter.levels().windowed[0], 0);
    }
}
