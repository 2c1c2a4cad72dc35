use smallvec::SmallVec;
use std::ffi::CString;

/// Linux refuses vectored transfers with more spans than this (`UIO_MAXIOV`).
pub(crate) const MAX_IOVECS: usize = 1024;

// Vectored requests rarely carry more than a handful of spans.
const INLINE_IOVECS: usize = 4;

pub(crate) type Iovecs = SmallVec<[libc::iovec; INLINE_IOVECS]>;

/// Per-request state the ring may dereference while the request is in
/// flight. Everything here lives behind a heap allocation so its address is
/// stable while the owning queue node moves around in the slab.
pub(crate) enum Extra {
    /// NUL-terminated path of an open request.
    // Only held so the ring's pointer stays valid, never read back.
    #[allow(dead_code)]
    Path(CString),

    /// Span table of a vectored request that fits in one submission.
    // Only held so the ring's pointer stays valid, never read back.
    #[allow(dead_code)]
    Iovecs(Box<Iovecs>),

    /// Continuation state of a transfer split across several submissions.
    Split(Box<ReadWriteExtra>),

    /// Status buffer filled in by a stat request.
    Stat(Box<libc::statx>),
}

impl Extra {
    pub(crate) fn is_split(&self) -> bool {
        matches!(self, Extra::Split(_))
    }

    pub(crate) fn new_stat() -> Self {
        // SAFETY: `statx` is a plain C struct for which all-zeroes is valid.
        Extra::Stat(Box::new(unsafe { std::mem::zeroed() }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    MoreToDo,
    Finished,
}

/// Position of a transfer that exceeds what a single submission may carry.
pub(crate) struct ReadWriteExtra {
    pub(crate) total_processed: u64,
    pub(crate) span_index: usize,
    pub(crate) span_offset: usize,
    pub(crate) num_spans: usize,
    iovecs: Iovecs,
}

impl ReadWriteExtra {
    pub(crate) fn new<S: AsRef<[u8]>>(spans: &[S]) -> Self {
        let mut extra = Self {
            total_processed: 0,
            span_index: 0,
            span_offset: 0,
            num_spans: spans.len(),
            iovecs: SmallVec::new(),
        };

        // Leading empty spans would otherwise produce a zero-length submission.
        extra.skip_exhausted(spans);
        extra
    }

    /// Records `processed` bytes moved by the last submission.
    pub(crate) fn advance<S: AsRef<[u8]>>(&mut self, processed: usize, spans: &[S]) -> Progress {
        self.total_processed += processed as u64;
        self.span_offset += processed;
        self.skip_exhausted(spans)
    }

    fn skip_exhausted<S: AsRef<[u8]>>(&mut self, spans: &[S]) -> Progress {
        debug_assert_eq!(spans.len(), self.num_spans);

        while self.span_index < self.num_spans {
            let len = spans[self.span_index].as_ref().len();
            if self.span_offset < len {
                return Progress::MoreToDo;
            }

            self.span_offset -= len;
            self.span_index += 1;
        }

        Progress::Finished
    }

    /// Builds the span table for the next submission: the remaining spans
    /// from the current position, capped at `max_len` bytes and
    /// [`MAX_IOVECS`] entries.
    pub(crate) fn next_iovecs(&mut self, spans: &mut [Vec<u8>], max_len: usize) -> &Iovecs {
        self.iovecs.clear();

        let mut budget = max_len;
        let mut skip = self.span_offset;

        for span in spans[self.span_index..].iter_mut() {
            if budget == 0 || self.iovecs.len() == MAX_IOVECS {
                break;
            }

            let rest = &mut span[skip..];
            skip = 0;

            let len = rest.len().min(budget);
            if len == 0 {
                continue;
            }

            self.iovecs.push(libc::iovec {
                iov_base: rest.as_mut_ptr().cast(),
                iov_len: len,
            });
            budget -= len;
        }

        &self.iovecs
    }
}

/// Span table covering every span of a vectored request.
pub(crate) fn iovecs_for(spans: &mut [Vec<u8>]) -> Iovecs {
    spans
        .iter_mut()
        .map(|span| libc::iovec {
            iov_base: span.as_mut_ptr().cast(),
            iov_len: span.len(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn spans(lens: &[usize]) -> Vec<Vec<u8>> {
        lens.iter().map(|&len| vec![0u8; len]).collect()
    }

    #[test]
    fn test_single_span_progress() {
        let spans = spans(&[10]);
        let mut extra = ReadWriteExtra::new(&spans);

        assert_eq!(extra.advance(4, &spans), Progress::MoreToDo);
        assert_eq!(extra.span_offset, 4);
        assert_eq!(extra.advance(4, &spans), Progress::MoreToDo);
        assert_eq!(extra.advance(2, &spans), Progress::Finished);
        assert_eq!(extra.total_processed, 10);
    }

    #[rstest]
    #[case::crosses_two_spans(&[3, 3, 3], 7, 2, 1)]
    #[case::ends_on_boundary(&[3, 3, 3], 6, 2, 0)]
    #[case::skips_empty_spans(&[3, 0, 0, 5], 3, 3, 0)]
    fn test_multi_span_position(
        #[case] lens: &[usize],
        #[case] processed: usize,
        #[case] span_index: usize,
        #[case] span_offset: usize,
    ) {
        let spans = spans(lens);
        let mut extra = ReadWriteExtra::new(&spans);

        assert_eq!(extra.advance(processed, &spans), Progress::MoreToDo);
        assert_eq!(extra.span_index, span_index);
        assert_eq!(extra.span_offset, span_offset);
    }

    #[test]
    fn test_leading_empty_spans_are_skipped() {
        let spans = spans(&[0, 0, 4]);
        let extra = ReadWriteExtra::new(&spans);

        assert_eq!(extra.span_index, 2);
        assert_eq!(extra.span_offset, 0);
    }

    #[test]
    fn test_next_iovecs_caps_length() {
        let mut spans = spans(&[5, 0, 5, 5]);
        let mut extra = ReadWriteExtra::new(&spans);

        let lens: Vec<usize> = extra.next_iovecs(&mut spans, 8).iter().map(|v| v.iov_len).collect();
        assert_eq!(lens, vec![5, 3]);

        assert_eq!(extra.advance(8, &spans), Progress::MoreToDo);
        let lens: Vec<usize> = extra.next_iovecs(&mut spans, 8).iter().map(|v| v.iov_len).collect();
        assert_eq!(lens, vec![2, 5]);

        assert_eq!(extra.advance(7, &spans), Progress::Finished);
        assert_eq!(extra.total_processed, 15);
    }

    #[test]
    fn test_next_iovecs_caps_span_count() {
        let mut spans = spans(&vec![1; MAX_IOVECS + 10]);
        let mut extra = ReadWriteExtra::new(&spans);

        assert_eq!(extra.next_iovecs(&mut spans, usize::MAX).len(), MAX_IOVECS);
        assert_eq!(extra.advance(MAX_IOVECS, &spans), Progress::MoreToDo);
        assert_eq!(extra.next_iovecs(&mut spans, usize::MAX).len(), 10);
    }
}
