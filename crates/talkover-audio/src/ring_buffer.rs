use parking_lot::Mutex;
use std::sync::Arc;

/// Fixed-capacity ring buffer of mono i16 samples shared between the network
/// writer and the audio render callback.
///
/// One producer thread advances the write cursor, one consumer thread advances
/// the read cursor; both cursors and the running totals live under a single
/// mutex held only for cursor updates and the copy in or out of the
/// preallocated storage. Samples are never overwritten: a full buffer rejects
/// the excess and the writer is expected to back off. Reads that find less
/// than a full quantum before end-of-stream zero-fill the tail so the device
/// never hears stale data.
pub struct FrameRing {
    shared: Arc<RingShared>,
}

struct RingShared {
    capacity: usize,
    state: Mutex<RingState>,
}

struct RingState {
    buf: Box<[i16]>,
    write_pos: usize,
    read_pos: usize,
    total_written: u64,
    total_read: u64,
    eos: bool,
    underruns: u64,
}

/// Result of one `read_into` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The destination was filled entirely with buffered audio.
    Filled { samples: usize },
    /// Fewer samples were available than requested; the tail was zero-filled.
    /// Counts as an underrun unless end-of-stream had been signaled.
    Padded { samples: usize, silence: usize },
    /// End-of-stream was signaled and the buffer is empty. The destination is
    /// zero-filled.
    Drained,
}

impl FrameRing {
    /// Allocate a ring holding `capacity` samples and hand out the two
    /// exclusive halves. The returned `FrameRing` is a cheap query handle and
    /// may be cloned freely.
    pub fn with_capacity(capacity: usize) -> (FrameRing, FrameWriter, FrameReader) {
        let shared = Arc::new(RingShared {
            capacity,
            state: Mutex::new(RingState {
                buf: vec![0i16; capacity].into_boxed_slice(),
                write_pos: 0,
                read_pos: 0,
                total_written: 0,
                total_read: 0,
                eos: false,
                underruns: 0,
            }),
        });
        (
            FrameRing {
                shared: Arc::clone(&shared),
            },
            FrameWriter {
                shared: Arc::clone(&shared),
            },
            FrameReader { shared },
        )
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Samples currently buffered (`total_written - total_read`).
    pub fn available(&self) -> usize {
        self.shared.available()
    }

    /// Fraction of capacity filled, in `[0.0, 1.0]`.
    pub fn level(&self) -> f32 {
        if self.shared.capacity == 0 {
            return 0.0;
        }
        self.available() as f32 / self.shared.capacity as f32
    }

    pub fn total_written(&self) -> u64 {
        self.shared.state.lock().total_written
    }

    pub fn total_read(&self) -> u64 {
        self.shared.state.lock().total_read
    }

    pub fn underruns(&self) -> u64 {
        self.shared.state.lock().underruns
    }

    /// Latch end-of-stream. Idempotent; safe from any thread. After this no
    /// further writes are accepted and an empty buffer reads as `Drained`.
    pub fn mark_eos(&self) {
        self.shared.state.lock().eos = true;
    }

    pub fn is_eos(&self) -> bool {
        self.shared.state.lock().eos
    }
}

impl Clone for FrameRing {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl RingShared {
    fn available(&self) -> usize {
        let st = self.state.lock();
        (st.total_written - st.total_read) as usize
    }
}

/// Producer half. Owned by the synthesis session task.
pub struct FrameWriter {
    shared: Arc<RingShared>,
}

impl FrameWriter {
    /// Append samples, never overwriting unread audio. Returns how many were
    /// accepted; a short count means the buffer is full (or end-of-stream has
    /// been latched, in which case nothing is accepted).
    pub fn write(&mut self, samples: &[i16]) -> usize {
        if samples.is_empty() {
            return 0;
        }
        let cap = self.shared.capacity;
        let st = &mut *self.shared.state.lock();
        if st.eos {
            return 0;
        }
        let used = (st.total_written - st.total_read) as usize;
        let n = (cap - used).min(samples.len());
        if n == 0 {
            return 0;
        }
        let wp = st.write_pos;
        let first = n.min(cap - wp);
        st.buf[wp..wp + first].copy_from_slice(&samples[..first]);
        let rest = n - first;
        if rest > 0 {
            st.buf[..rest].copy_from_slice(&samples[first..n]);
        }
        st.write_pos = (wp + n) % cap;
        st.total_written += n as u64;
        n
    }

    /// Free space in samples.
    pub fn free(&self) -> usize {
        self.shared.capacity - self.shared.available()
    }

    pub fn mark_eos(&self) {
        self.shared.state.lock().eos = true;
    }

    pub fn is_eos(&self) -> bool {
        self.shared.state.lock().eos
    }
}

/// Consumer half. Owned by the render callback; `read_into` is the hot path
/// and performs no allocation.
pub struct FrameReader {
    shared: Arc<RingShared>,
}

impl FrameReader {
    /// Fill `out` from the buffer. The destination is always written in full:
    /// real samples first, zeros for whatever is missing.
    pub fn read_into(&mut self, out: &mut [i16]) -> ReadStatus {
        if out.is_empty() {
            return ReadStatus::Filled { samples: 0 };
        }
        let cap = self.shared.capacity;
        let st = &mut *self.shared.state.lock();
        let avail = (st.total_written - st.total_read) as usize;

        if avail == 0 {
            if st.eos {
                out.fill(0);
                return ReadStatus::Drained;
            }
            st.underruns += 1;
            out.fill(0);
            return ReadStatus::Padded {
                samples: 0,
                silence: out.len(),
            };
        }

        let n = avail.min(out.len());
        let rp = st.read_pos;
        let first = n.min(cap - rp);
        out[..first].copy_from_slice(&st.buf[rp..rp + first]);
        let rest = n - first;
        if rest > 0 {
            out[first..n].copy_from_slice(&st.buf[..rest]);
        }
        st.read_pos = (rp + n) % cap;
        st.total_read += n as u64;

        if n < out.len() {
            if !st.eos {
                st.underruns += 1;
            }
            out[n..].fill(0);
            return ReadStatus::Padded {
                samples: n,
                silence: out.len() - n,
            };
        }
        ReadStatus::Filled { samples: n }
    }

    /// Samples currently buffered.
    pub fn available(&self) -> usize {
        self.shared.available()
    }

    pub fn is_eos(&self) -> bool {
        self.shared.state.lock().eos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_write_read_preserves_order() {
        let (_ring, mut writer, mut reader) = FrameRing::with_capacity(1024);

        let samples: Vec<i16> = (1..=5).collect();
        assert_eq!(writer.write(&samples), 5);

        let mut out = [0i16; 5];
        assert_eq!(reader.read_into(&mut out), ReadStatus::Filled { samples: 5 });
        assert_eq!(&out, &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn full_buffer_rejects_excess_without_overwriting() {
        let (ring, mut writer, mut reader) = FrameRing::with_capacity(16);

        assert_eq!(writer.write(&[7i16; 20]), 16, "only capacity is accepted");
        assert_eq!(writer.write(&[9i16; 4]), 0, "full buffer accepts nothing");
        assert_eq!(ring.available(), 16);

        let mut out = [0i16; 16];
        assert_eq!(reader.read_into(&mut out), ReadStatus::Filled { samples: 16 });
        assert!(out.iter().all(|&s| s == 7), "rejected write must not clobber");
    }

    #[test]
    fn wrapping_write_and_read_stay_in_order() {
        let (_ring, mut writer, mut reader) = FrameRing::with_capacity(8);
        let mut out = [0i16; 6];

        assert_eq!(writer.write(&[1, 2, 3, 4, 5, 6]), 6);
        assert_eq!(reader.read_into(&mut out), ReadStatus::Filled { samples: 6 });

        // Cursors now sit at 6 of 8; this write wraps.
        assert_eq!(writer.write(&[7, 8, 9, 10, 11, 12]), 6);
        assert_eq!(reader.read_into(&mut out), ReadStatus::Filled { samples: 6 });
        assert_eq!(&out, &[7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn underrun_pads_with_silence_before_eos() {
        let (ring, mut writer, mut reader) = FrameRing::with_capacity(64);
        writer.write(&[5i16; 4]);

        let mut out = [1i16; 10];
        assert_eq!(
            reader.read_into(&mut out),
            ReadStatus::Padded {
                samples: 4,
                silence: 6
            }
        );
        assert_eq!(&out[..4], &[5, 5, 5, 5]);
        assert!(out[4..].iter().all(|&s| s == 0), "tail must be silence");
        assert_eq!(ring.underruns(), 1);
    }

    #[test]
    fn empty_read_before_eos_is_a_silent_underrun() {
        let (ring, _writer, mut reader) = FrameRing::with_capacity(64);
        let mut out = [3i16; 8];
        assert_eq!(
            reader.read_into(&mut out),
            ReadStatus::Padded {
                samples: 0,
                silence: 8
            }
        );
        assert!(out.iter().all(|&s| s == 0));
        assert_eq!(ring.underruns(), 1);
    }

    #[test]
    fn eos_tail_is_padded_without_counting_underrun() {
        let (ring, mut writer, mut reader) = FrameRing::with_capacity(64);
        writer.write(&[2i16; 3]);
        ring.mark_eos();

        let mut out = [9i16; 8];
        assert_eq!(
            reader.read_into(&mut out),
            ReadStatus::Padded {
                samples: 3,
                silence: 5
            }
        );
        assert_eq!(ring.underruns(), 0, "final partial quantum is not an underrun");
        assert_eq!(reader.read_into(&mut out), ReadStatus::Drained);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn writes_after_eos_are_refused() {
        let (ring, mut writer, _reader) = FrameRing::with_capacity(16);
        ring.mark_eos();
        assert_eq!(writer.write(&[1i16; 4]), 0);
        assert_eq!(ring.total_written(), 0);
    }

    #[test]
    fn totals_and_level_track_cursor_distance() {
        let (ring, mut writer, mut reader) = FrameRing::with_capacity(100);
        writer.write(&[0i16; 30]);
        assert_eq!(ring.available(), 30);
        assert!((ring.level() - 0.3).abs() < f32::EPSILON);

        let mut out = [0i16; 10];
        reader.read_into(&mut out);
        assert_eq!(ring.total_written(), 30);
        assert_eq!(ring.total_read(), 10);
        assert_eq!(ring.available(), 20);
    }
}
