//! Log segmentation
//!
//! Backends report progress as one blob of timestamped console output per
//! unit. A [`LogSegmenter`] cuts that blob into the output of each step so the
//! reconciler can derive per-step status and timing without knowing the
//! backend's output format.
//!
//! [`ShellInvocationSegmenter`] handles output where every line is prefixed by
//! the elapsed time since the unit started (`00h00m01s123ms  `) and every step
//! begins with a shell invocation line such as
//! `00h00m02s004ms  [build] $ /bin/sh -xe /tmp/job123.sh`.

use regex::{Captures, Regex};
use std::ops::Range;
use std::sync::LazyLock;

use crate::unit::UnitResult;

/// Phrase a source checkout prints before any shell invocation
pub const CHECKOUT_MARKER: &str = "  Cloning the remote Git repository\n";

const SUCCESS_MARKER: &str = "  Finished: SUCCESS";
const FAILURE_MARKER: &str = "  Finished: FAILURE";
const ABORTED_MARKER: &str = "  Finished: ABORTED";

static DELIMITER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\w{14}\s{2}\[.*?\].*?\.sh").expect("valid regex"));
static LINE_TIMESTAMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\n)(\w{14})  ").expect("valid regex"));
static ELAPSED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)h(\d+)m(\d+)s(\d+)ms$").expect("valid regex"));

/// A contiguous piece of raw output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segment {
    /// Byte range into the raw output
    pub span: Range<usize>,
    /// Elapsed millis of the first timestamped line
    pub start_ms: Option<i64>,
    /// Elapsed millis of the last timestamped line
    pub end_ms: Option<i64>,
}

impl Segment {
    pub fn text<'a>(&self, raw: &'a str) -> &'a str {
        raw.get(self.span.clone()).unwrap_or_default()
    }

    /// Time between the first and last timestamped line
    pub fn duration_ms(&self) -> Option<i64> {
        Some(self.end_ms? - self.start_ms?)
    }
}

/// Output of [`LogSegmenter::segment`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segmentation {
    /// Everything before the first shell invocation
    pub preamble: Segment,
    /// One segment per shell invocation, in output order
    pub invocations: Vec<Segment>,
    /// The preamble contains a source checkout
    pub checkout: bool,
}

/// Splits raw unit output into per-step segments
pub trait LogSegmenter: Send + Sync {
    fn segment(&self, raw: &str) -> Segmentation;

    /// Terminal result announced by the output, if any
    fn outcome(&self, raw: &str) -> Option<UnitResult>;
}

/// Segmenter for timestamped shell-runner output
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellInvocationSegmenter;

impl LogSegmenter for ShellInvocationSegmenter {
    fn segment(&self, raw: &str) -> Segmentation {
        let delimiters: Vec<_> = DELIMITER.find_iter(raw).collect();
        let preamble_end = delimiters.first().map_or(raw.len(), |m| m.start());
        let preamble = segment_of(raw, 0..preamble_end);

        let invocations = delimiters
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let end = delimiters.get(i + 1).map_or(raw.len(), |next| next.start());
                segment_of(raw, m.end()..end)
            })
            .collect();

        Segmentation {
            checkout: preamble.text(raw).contains(CHECKOUT_MARKER),
            preamble,
            invocations,
        }
    }

    fn outcome(&self, raw: &str) -> Option<UnitResult> {
        let tail = raw.trim_end_matches('\n');
        if tail.ends_with(SUCCESS_MARKER) {
            Some(UnitResult::Success)
        } else if tail.ends_with(FAILURE_MARKER) || tail.ends_with(ABORTED_MARKER) {
            Some(UnitResult::Failure)
        } else {
            None
        }
    }
}

fn segment_of(raw: &str, span: Range<usize>) -> Segment {
    let text = raw.get(span.clone()).unwrap_or_default();
    let mut stamps = LINE_TIMESTAMP
        .captures_iter(text)
        .filter_map(|c| parse_elapsed(c.get(1)?.as_str()));
    let start_ms = stamps.next();
    let end_ms = stamps.last().or(start_ms);
    Segment {
        span,
        start_ms,
        end_ms,
    }
}

/// Parses `00h01m02s345ms` into millis
pub fn parse_elapsed(stamp: &str) -> Option<i64> {
    let caps = ELAPSED.captures(stamp)?;
    let part = |i: usize| caps.get(i)?.as_str().parse::<i64>().ok();
    Some(((part(1)? * 60 + part(2)?) * 60 + part(3)?) * 1000 + part(4)?)
}

/// Formats millis as `00h01m02s345ms`
pub fn format_elapsed(ms: i64) -> String {
    let ms = ms.max(0);
    format!(
        "{:02}h{:02}m{:02}s{:03}ms",
        ms / 3_600_000,
        ms / 60_000 % 60,
        ms / 1000 % 60,
        ms % 1000
    )
}

/// Moves every elapsed stamp in `raw` by `shift_ms`
///
/// Used to put the output of a unit that started later onto the clock of an
/// earlier one. Lines without a parseable stamp are left alone.
pub fn rebase_elapsed(raw: &str, shift_ms: i64) -> String {
    if shift_ms == 0 {
        return raw.to_string();
    }
    LINE_TIMESTAMP
        .replace_all(raw, |caps: &Captures| {
            let lead = if caps[0].starts_with('\n') { "\n" } else { "" };
            let stamp = &caps[1];
            match parse_elapsed(stamp) {
                Some(ms) => format!("{lead}{}  ", format_elapsed(ms + shift_ms)),
                None => format!("{lead}{stamp}  "),
            }
        })
        .into_owned()
}

/// Output from the first shell invocation on, without the leading newline
///
/// Empty when the output has no invocation yet.
pub fn strip_preamble(raw: &str) -> &str {
    DELIMITER
        .find(raw)
        .and_then(|m| raw.get(m.start() + 1..))
        .unwrap_or_default()
}

/// Drops the first line (the echoed command) of a segment
pub fn trim_first_line(text: &str) -> &str {
    text.trim_start_matches('\n')
        .split_once('\n')
        .map_or("", |(_, rest)| rest)
}
