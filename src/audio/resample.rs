//! Sample-rate conversion built on rubato's FFT resampler

use rubato::{FftFixedIn, Resampler};

const CHUNK_SIZE: usize = 1024;
const SUB_CHUNKS: usize = 2;

fn new_resampler(from_rate: u32, to_rate: u32) -> Result<FftFixedIn<f32>, String> {
    if from_rate == 0 || to_rate == 0 {
        return Err(format!(
            "Invalid sample rates: {} Hz -> {} Hz",
            from_rate, to_rate
        ));
    }
    FftFixedIn::<f32>::new(
        from_rate as usize,
        to_rate as usize,
        CHUNK_SIZE,
        SUB_CHUNKS,
        1,
    )
    .map_err(|e| format!("Resampler init failed: {}", e))
}

/// Number of output samples `input_len` samples convert to.
fn expected_len(input_len: usize, from_rate: u32, to_rate: u32) -> usize {
    let from = from_rate as u64;
    ((input_len as u64 * to_rate as u64 + from / 2) / from) as usize
}

/// Append resampler output, dropping whatever the delay line still owes.
fn keep(out: &[f32], skip: &mut usize, output: &mut Vec<f32>) {
    let dropped = (*skip).min(out.len());
    *skip -= dropped;
    output.extend_from_slice(&out[dropped..]);
}

/// Incremental resampler for a continuous stream such as microphone input or
/// one model turn of playback audio.
///
/// Input is buffered until a full resampler chunk is available, so output
/// lags input by up to one chunk. Output is aligned to the input: the
/// resampler's delay is trimmed from the front, and [`finish`](Self::finish)
/// drains the tail so a finished stream is exactly `round(len * to / from)`
/// samples long.
pub struct StreamResampler {
    inner: Option<FftFixedIn<f32>>,
    from_rate: u32,
    to_rate: u32,
    pending: Vec<f32>,
    skip: usize,
    consumed: usize,
    emitted: usize,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self, String> {
        let inner = if from_rate == to_rate {
            None
        } else {
            Some(new_resampler(from_rate, to_rate)?)
        };
        let skip = inner.as_ref().map_or(0, |r| r.output_delay());
        Ok(Self {
            inner,
            from_rate,
            to_rate,
            pending: Vec::new(),
            skip,
            consumed: 0,
            emitted: 0,
        })
    }

    /// True when input and output rates match and samples pass straight through.
    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Feed samples, returning whatever output is ready.
    pub fn push(&mut self, samples: &[f32]) -> Result<Vec<f32>, String> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.pending.extend_from_slice(samples);

        let mut output = Vec::new();
        let mut pos = 0;
        while self.pending.len() - pos >= resampler.input_frames_next() {
            let n = resampler.input_frames_next();
            let out = resampler
                .process(&[&self.pending[pos..pos + n]], None)
                .map_err(|e| format!("Resample failed: {}", e))?;
            keep(&out[0], &mut self.skip, &mut output);
            pos += n;
        }
        self.pending.drain(..pos);

        self.consumed += pos;
        self.emitted += output.len();
        Ok(output)
    }

    /// End the stream: flush buffered input and the delay line, then start
    /// over as if freshly created.
    pub fn finish(&mut self) -> Result<Vec<f32>, String> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };

        let total = expected_len(
            self.consumed + self.pending.len(),
            self.from_rate,
            self.to_rate,
        );
        let owed = total.saturating_sub(self.emitted);
        let mut output = Vec::with_capacity(owed + CHUNK_SIZE);

        if !self.pending.is_empty() {
            let out = resampler
                .process_partial(Some(&[&self.pending[..]]), None)
                .map_err(|e| format!("Resample failed: {}", e))?;
            keep(&out[0], &mut self.skip, &mut output);
        }

        while output.len() < owed {
            let out = resampler
                .process_partial(None::<&[&[f32]]>, None)
                .map_err(|e| format!("Resample flush failed: {}", e))?;
            if out[0].is_empty() {
                break;
            }
            keep(&out[0], &mut self.skip, &mut output);
        }

        output.resize(owed, 0.0);
        self.reset();
        Ok(output)
    }

    /// Drop buffered input and filter state.
    pub fn reset(&mut self) {
        if let Some(resampler) = self.inner.as_mut() {
            resampler.reset();
            self.skip = resampler.output_delay();
        }
        self.pending.clear();
        self.consumed = 0;
        self.emitted = 0;
    }
}
