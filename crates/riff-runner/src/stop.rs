//! Stop-sequence detection over a stream of decoded pieces

/// Holds back text that might be the start of a stop sequence
#[derive(Debug, Default)]
pub struct StopMatcher {
    stops: Vec<String>,
    pending: String,
}

/// Result of feeding one piece
#[derive(Debug, PartialEq, Eq)]
pub struct Scan {
    /// Text that is safe to emit now
    pub emit: String,
    /// A stop sequence was found; nothing after it is emitted
    pub stopped: bool,
}

impl StopMatcher {
    pub fn new(stops: &[String]) -> Self {
        Self {
            stops: stops.iter().filter(|s| !s.is_empty()).cloned().collect(),
            pending: String::new(),
        }
    }

    pub fn push(&mut self, piece: &str) -> Scan {
        if self.stops.is_empty() {
            return Scan {
                emit: piece.to_string(),
                stopped: false,
            };
        }
        self.pending.push_str(piece);

        let hit = self
            .stops
            .iter()
            .filter_map(|s| self.pending.find(s.as_str()))
            .min();
        if let Some(at) = hit {
            let mut emit = std::mem::take(&mut self.pending);
            emit.truncate(at);
            return Scan { emit, stopped: true };
        }

        let hold = self.partial_suffix();
        let emit: String = self.pending.drain(..hold).collect();
        Scan { emit, stopped: false }
    }

    /// Flush whatever is still held back at the end of generation
    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }

    /// Start of the longest suffix of `pending` that begins a stop sequence
    fn partial_suffix(&self) -> usize {
        self.pending
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| {
                let tail = &self.pending[i..];
                self.stops.iter().any(|s| s.len() > tail.len() && s.starts_with(tail))
            })
            .unwrap_or(self.pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stops(s: &[&str]) -> Vec<String> {
        s.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_no_stops_passthrough() {
        let mut m = StopMatcher::new(&[]);
        assert_eq!(m.push("abc").emit, "abc");
        assert_eq!(m.finish(), "");
    }

    #[test]
    fn test_stop_within_piece() {
        let mut m = StopMatcher::new(&stops(&["\n\n"]));
        let scan = m.push("answer\n\nnext");
        assert_eq!(scan.emit, "answer");
        assert!(scan.stopped);
    }

    #[test]
    fn test_stop_split_across_pieces() {
        let mut m = StopMatcher::new(&stops(&["</s>"]));
        let a = m.push("done</");
        assert_eq!(a.emit, "done");
        assert!(!a.stopped);
        let b = m.push("s> trailing");
        assert_eq!(b.emit, "");
        assert!(b.stopped);
    }

    #[test]
    fn test_false_alarm_is_flushed() {
        let mut m = StopMatcher::new(&stops(&["User:"]));
        assert_eq!(m.push("Use").emit, "");
        assert_eq!(m.push("ful").emit, "Useful");
        assert_eq!(m.push(" Us").emit, " ");
        assert_eq!(m.finish(), "Us");
    }

    #[test]
    fn test_earliest_stop_wins() {
        let mut m = StopMatcher::new(&stops(&["END", "."]));
        let scan = m.push("one. two END");
        assert_eq!(scan.emit, "one");
    }
}
