//! Call set expressions for `--snapshot`
//!
//! Grammar, comma separated:
//! - `*`: every call
//! - `N`, `N-M`, `N-`: call numbers, inclusive, open ended with a trailing dash
//! - `frame`, `draw`: calls that end a frame or render
//! - any range may carry `/STEP` and a trailing `/frame` or `/draw` filter,
//!   e.g. `100-200/10/draw`
//! - `@FILE`: read the expression from a file, one item per line

use crate::call::{Call, CallFlags};
use crate::error::{ReplayError, Result};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CallRange {
    start: u64,
    end: u64,
    step: u64,
    flags: CallFlags,
}

impl CallRange {
    fn contains(&self, call: &Call) -> bool {
        call.no >= self.start
            && call.no <= self.end
            && (call.no - self.start) % self.step == 0
            && (self.flags.is_empty() || call.flags.intersects(self.flags))
    }
}

/// Parsed set of call numbers and call classes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSet {
    ranges: Vec<CallRange>,
}

impl CallSet {
    /// The set used when `--snapshot` is omitted but a prefix is given
    pub fn frames() -> Self {
        Self {
            ranges: vec![CallRange {
                start: 0,
                end: u64::MAX,
                step: 1,
                flags: CallFlags::END_FRAME,
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn contains(&self, call: &Call) -> bool {
        self.ranges.iter().any(|r| r.contains(call))
    }

    /// Parse an expression, following `@FILE` indirection
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        if let Some(path) = expr.strip_prefix('@') {
            return Self::from_file(Path::new(path));
        }

        let mut ranges = Vec::new();
        for item in expr.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            ranges.push(parse_item(item)?);
        }
        Ok(Self { ranges })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ReplayError::InvalidCallSet(format!("cannot read {}: {}", path.display(), e))
        })?;
        let items: Vec<&str> = text
            .lines()
            .map(|l| l.split('#').next().unwrap_or("").trim())
            .filter(|l| !l.is_empty())
            .collect();
        Self::parse(&items.join(","))
    }
}

fn parse_class(word: &str) -> Option<CallFlags> {
    match word {
        "frame" => Some(CallFlags::END_FRAME),
        "draw" => Some(CallFlags::RENDER),
        _ => None,
    }
}

fn parse_number(item: &str, text: &str) -> Result<u64> {
    text.trim()
        .parse()
        .map_err(|_| ReplayError::InvalidCallSet(format!("bad call number in '{}'", item)))
}

fn parse_item(item: &str) -> Result<CallRange> {
    let mut parts = item.split('/');
    let head = parts.next().unwrap_or("").trim();

    let (start, end, mut flags) = if head == "*" {
        (0, u64::MAX, CallFlags::empty())
    } else if let Some(class) = parse_class(head) {
        (0, u64::MAX, class)
    } else if let Some((lo, hi)) = head.split_once('-') {
        let start = parse_number(item, lo)?;
        let end = if hi.trim().is_empty() {
            u64::MAX
        } else {
            parse_number(item, hi)?
        };
        if end < start {
            return Err(ReplayError::InvalidCallSet(format!(
                "range '{}' ends before it starts",
                item
            )));
        }
        (start, end, CallFlags::empty())
    } else {
        let no = parse_number(item, head)?;
        (no, no, CallFlags::empty())
    };

    let mut step = 1;
    for part in parts {
        let part = part.trim();
        if let Some(class) = parse_class(part) {
            flags |= class;
        } else {
            step = parse_number(item, part)?;
            if step == 0 {
                return Err(ReplayError::InvalidCallSet(format!(
                    "zero step in '{}'",
                    item
                )));
            }
        }
    }

    Ok(CallRange {
        start,
        end,
        step,
        flags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::FunctionSig;
    use std::io::Write;
    use std::sync::Arc;

    fn call(no: u64, flags: CallFlags) -> Call {
        Call {
            no,
            thread_id: 0,
            sig: Arc::new(FunctionSig::new(0, "glDrawArrays", &[])),
            args: vec![],
            ret: None,
            flags,
            offset: 0,
        }
    }

    #[test]
    fn test_single_numbers_and_ranges() {
        let set = CallSet::parse("3,10-12").unwrap();
        assert!(set.contains(&call(3, CallFlags::empty())));
        assert!(!set.contains(&call(4, CallFlags::empty())));
        assert!(set.contains(&call(10, CallFlags::empty())));
        assert!(set.contains(&call(12, CallFlags::empty())));
        assert!(!set.contains(&call(13, CallFlags::empty())));
    }

    #[test]
    fn test_step_and_open_range() {
        let set = CallSet::parse("100-/50").unwrap();
        assert!(set.contains(&call(100, CallFlags::empty())));
        assert!(set.contains(&call(1_000_000, CallFlags::empty())));
        assert!(!set.contains(&call(125, CallFlags::empty())));
        assert!(!set.contains(&call(99, CallFlags::empty())));
    }

    #[test]
    fn test_classes() {
        let frames = CallSet::parse("frame").unwrap();
        assert!(frames.contains(&call(5, CallFlags::END_FRAME)));
        assert!(!frames.contains(&call(5, CallFlags::RENDER)));

        let draws = CallSet::parse("10-20/draw").unwrap();
        assert!(draws.contains(&call(15, CallFlags::RENDER)));
        assert!(!draws.contains(&call(25, CallFlags::RENDER)));
        assert!(!draws.contains(&call(15, CallFlags::empty())));

        assert_eq!(CallSet::frames(), frames);
    }

    #[test]
    fn test_star_matches_everything() {
        let set = CallSet::parse("*").unwrap();
        assert!(set.contains(&call(0, CallFlags::empty())));
        assert!(set.contains(&call(u64::MAX, CallFlags::empty())));
    }

    #[test]
    fn test_empty_expression() {
        let set = CallSet::parse("").unwrap();
        assert!(set.is_empty());
        assert!(!set.contains(&call(0, CallFlags::END_FRAME)));
    }

    #[test]
    fn test_invalid_items() {
        assert!(CallSet::parse("abc").is_err());
        assert!(CallSet::parse("10-5").is_err());
        assert!(CallSet::parse("1-10/0").is_err());
        assert!(CallSet::parse("1-10/x").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# snapshot calls").unwrap();
        writeln!(file, "7").unwrap();
        writeln!(file, "20-30/5  # every fifth").unwrap();
        let set = CallSet::parse(&format!("@{}", file.path().display())).unwrap();
        assert!(set.contains(&call(7, CallFlags::empty())));
        assert!(set.contains(&call(25, CallFlags::empty())));
        assert!(!set.contains(&call(26, CallFlags::empty())));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            CallSet::parse("@/nonexistent/calls.txt"),
            Err(ReplayError::InvalidCallSet(_))
        ));
    }
}
