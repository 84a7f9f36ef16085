use std::sync::LazyLock;

use regex::Regex;

static INLINE_CODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`[^`]+`").unwrap());

const FENCE: &str = "```";

/// Verbatim regions of one body, as an index of inclusive byte ranges.
///
/// Built once per pass over a body and queried per match. Offsets are byte
/// offsets into the body the map was built from; a map must be rebuilt after
/// the body is edited.
///
/// Rules, applied line by line (`\n`-separated):
/// - a line whose trimmed text starts with a triple backtick toggles the fence
///   state; opening and closing fences are not paired, any such line toggles.
/// - while the fence state is on at the start of a line, the whole line is
///   code, including its trailing separator and the first byte of the next line.
/// - a backtick span within one line is code, including the byte just past the
///   closing backtick.
/// - if the document ends with the fence state on, every offset is code.
#[derive(Debug, Clone, Default)]
pub struct CodeMap {
    regions: Vec<(usize, usize)>,
    open_fence: bool,
}

impl CodeMap {
    pub fn new(body: &str) -> Self {
        let mut raw: Vec<(usize, usize)> = Vec::new();
        let mut in_fence = false;
        let mut pos = 0;

        for line in body.split('\n') {
            let start = pos;
            let end = pos + line.len() + 1;

            if in_fence {
                raw.push((start, end));
            }
            if line.trim().starts_with(FENCE) {
                in_fence = !in_fence;
            }
            for m in INLINE_CODE_RE.find_iter(line) {
                raw.push((start + m.start(), start + m.end()));
            }

            pos = end;
        }

        // Ranges arrive sorted by start; fold overlapping and touching ones.
        let mut regions: Vec<(usize, usize)> = Vec::with_capacity(raw.len());
        for (start, end) in raw {
            match regions.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => regions.push((start, end)),
            }
        }

        Self {
            regions,
            open_fence: in_fence,
        }
    }

    pub fn contains(&self, offset: usize) -> bool {
        if self.open_fence {
            return true;
        }
        let idx = self.regions.partition_point(|&(start, _)| start <= offset);
        idx > 0 && offset <= self.regions[idx - 1].1
    }

    /// Both the first and the last byte of `span` are code. A span that only
    /// touches the inclusive end of a region is not covered.
    pub fn covers(&self, span: std::ops::Range<usize>) -> bool {
        if span.is_empty() {
            return self.contains(span.start);
        }
        self.contains(span.start) && self.contains(span.end - 1)
    }

    /// True when an odd number of fence lines left the document inside a block.
    #[cfg(test)]
    pub fn has_open_fence(&self) -> bool {
        self.open_fence
    }

    #[cfg(test)]
    pub fn regions(&self) -> &[(usize, usize)] {
        &self.regions
    }
}

/// One-off query; rescans the whole body.
pub fn is_code_region(body: &str, offset: usize) -> bool {
    CodeMap::new(body).contains(offset)
}
