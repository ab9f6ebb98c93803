//! # PCM Sample-Rate Conversion
//!
//! Linear-interpolation resampler for 16-bit little-endian mono PCM that
//! stays phase-continuous across chunk boundaries. The synthesis provider
//! emits audio at a fixed rate (often 24 kHz) in arbitrarily sized chunks;
//! each chunk is converted as it arrives and the fractional position between
//! input samples is carried to the next call in a [`ResampleState`].
//!
//! ## Rules:
//! - A chunk is trimmed to an even length before conversion. The dangling
//!   byte is dropped, not carried over.
//! - Equal source and target rates are the identity; the state is returned
//!   untouched.
//! - A call may legitimately produce no output (downsampling a chunk shorter
//!   than one output period). Callers skip empty output.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

/// Interpolation position carried between two conversion calls.
///
/// Only meaningful for the rate pair that produced it. One output stream owns
/// one state; two streams never share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResampleState {
    /// Phase accumulator in units of the gcd-reduced rates
    phase: i64,
    /// Previous input sample
    prev: i32,
    /// Current input sample
    cur: i32,
}

/// Convert one chunk from `source_rate` to `target_rate`.
///
/// Pass `None` as state for the first chunk of a stream and feed the returned
/// state into the next call.
pub fn convert(
    chunk: &[u8],
    source_rate: u32,
    target_rate: u32,
    state: Option<ResampleState>,
) -> (Vec<u8>, Option<ResampleState>) {
    let even = &chunk[..chunk.len() & !1];

    if source_rate == target_rate || source_rate == 0 || target_rate == 0 {
        return (even.to_vec(), state);
    }

    let divisor = gcd(source_rate, target_rate);
    let in_step = i64::from(source_rate / divisor);
    let out_step = i64::from(target_rate / divisor);

    let mut st = state.unwrap_or(ResampleState {
        phase: -out_step,
        prev: 0,
        cur: 0,
    });

    let estimated = (even.len() as u64 * out_step as u64 / in_step as u64) as usize + 4;
    let mut out = Vec::with_capacity(estimated);
    let mut samples = even.chunks_exact(2).map(LittleEndian::read_i16);

    loop {
        while st.phase < 0 {
            let Some(sample) = samples.next() else {
                return (out, Some(st));
            };
            st.prev = st.cur;
            st.cur = i32::from(sample);
            st.phase += out_step;
        }

        while st.phase >= 0 {
            // Interpolate in 16.16 fixed point, then floor back to 16 bits.
            let prev = i64::from(st.prev) << 16;
            let cur = i64::from(st.cur) << 16;
            let value = (prev * st.phase + cur * (out_step - st.phase)) / out_step;
            // Interpolation between two i16 values cannot leave the i16 range.
            let _ = out.write_i16::<LittleEndian>((value >> 16) as i16);
            st.phase -= in_step;
        }
    }
}

/// Resampler bound to one continuous output stream.
///
/// Owns the rate pair and the filter state so a stream's state can never be
/// mixed with another stream's.
#[derive(Debug)]
pub struct StreamResampler {
    source_rate: u32,
    target_rate: u32,
    state: Option<ResampleState>,
}

impl StreamResampler {
    pub fn new(source_rate: u32, target_rate: u32) -> Self {
        Self {
            source_rate,
            target_rate,
            state: None,
        }
    }

    /// Convert the next chunk of the stream. May return an empty vector.
    pub fn process(&mut self, chunk: &[u8]) -> Vec<u8> {
        let (out, state) = convert(chunk, self.source_rate, self.target_rate, self.state);
        self.state = state;
        out
    }

    pub fn is_passthrough(&self) -> bool {
        self.source_rate == self.target_rate
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}
