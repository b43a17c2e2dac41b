//! Output filters applied to every channel stream before it reaches a sink.

/// Decodes a byte stream as UTF-8 across chunk boundaries.
///
/// Incomplete trailing sequences are held back until the next chunk; invalid
/// bytes are replaced with U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct StreamDecoder {
    pending: Vec<u8>,
}

impl StreamDecoder {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut decoded = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    decoded.push_str(text);
                    self.pending.clear();
                    return decoded;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    let head = self.pending.get(..valid).unwrap_or_default();
                    decoded.push_str(&String::from_utf8_lossy(head));
                    match err.error_len() {
                        Some(len) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return decoded;
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

const ESC: char = '\u{1b}';

/// Longest unterminated escape sequence held back between chunks.
const MAX_CARRY: usize = 256;

/// Removes terminal control sequences (colours, screen clears, cursor moves).
///
/// Carriage returns survive so CRLF output from Windows guests is unchanged.
fn strip_control_sequences(text: &str) -> String {
    text.split('\r')
        .map(|line| strip_ansi_escapes::strip_str(line))
        .collect::<Vec<_>>()
        .join("\r")
}

/// Strips control sequences from a stream whose sequences may straddle
/// chunk boundaries.
///
/// An escape sequence left open at the end of a chunk is carried into the
/// next one and released, stripped, by [`ControlFilter::finish`].
#[derive(Debug, Default)]
pub(crate) struct ControlFilter {
    carry: String,
}

impl ControlFilter {
    pub(crate) fn push(&mut self, text: &str) -> String {
        let mut pending = std::mem::take(&mut self.carry);
        pending.push_str(text);
        if let Some(start) = unterminated_escape(&pending) {
            if pending.len().saturating_sub(start) <= MAX_CARRY {
                self.carry = pending.split_off(start);
            }
        }
        strip_control_sequences(&pending)
    }

    pub(crate) fn finish(&mut self) -> String {
        strip_control_sequences(&std::mem::take(&mut self.carry))
    }
}

/// Byte offset of an escape sequence that `text` opens but does not close.
fn unterminated_escape(text: &str) -> Option<usize> {
    let last = text.rfind(ESC)?;
    let tail = text.get(last + ESC.len_utf8()..)?;
    if tail.is_empty() {
        // A lone ESC may be the first half of the string terminator of an
        // OSC or DCS opened earlier in the same chunk.
        let opener = text
            .get(..last)
            .and_then(|head| head.rfind(ESC))
            .filter(|&start| opens_string(text, start));
        return Some(opener.unwrap_or(last));
    }
    let mut chars = tail.chars();
    let terminated = match chars.next() {
        Some('[') => chars.any(|ch| ('\u{40}'..='\u{7e}').contains(&ch)),
        Some(']') => tail.contains('\u{7}'),
        Some('P' | 'X' | '^' | '_') => false,
        Some(' '..='/') => chars.any(|ch| !(' '..='/').contains(&ch)),
        _ => true,
    };
    (!terminated).then_some(last)
}

/// Whether the sequence at `start` is an OSC, DCS, SOS, PM or APC string
/// that no BEL has closed yet.
fn opens_string(text: &str, start: usize) -> bool {
    let Some(body) = text.get(start + ESC.len_utf8()..) else {
        return false;
    };
    matches!(body.chars().next(), Some(']' | 'P' | 'X' | '^' | '_')) && !body.contains('\u{7}')
}

/// Discards everything in one stream up to and including the first marker.
#[derive(Debug)]
pub(crate) struct MarkerGate {
    marker: Option<String>,
    trim_newline: bool,
    seen: bool,
    buffer: String,
}

impl MarkerGate {
    /// A gate that lets everything through.
    pub(crate) const fn open() -> Self {
        Self {
            marker: None,
            trim_newline: false,
            seen: true,
            buffer: String::new(),
        }
    }

    /// A gate that waits for `marker`. With `trim_newline`, one line break
    /// directly after the marker is dropped as well.
    pub(crate) fn closed(marker: impl Into<String>, trim_newline: bool) -> Self {
        Self {
            marker: Some(marker.into()),
            trim_newline,
            seen: false,
            buffer: String::new(),
        }
    }

    /// Feeds decoded text and returns whatever may be released to the caller.
    pub(crate) fn push(&mut self, text: &str) -> Option<String> {
        if self.seen {
            return Some(text.to_owned());
        }
        let marker = self.marker.as_deref()?;
        self.buffer.push_str(text);
        let Some(index) = self.buffer.find(marker) else {
            // Only a marker prefix at the very end can still matter.
            let keep_from = self.buffer.len().saturating_sub(marker.len());
            let start = (keep_from..=self.buffer.len())
                .find(|&at| self.buffer.is_char_boundary(at))
                .unwrap_or(keep_from);
            self.buffer.drain(..start);
            return None;
        };
        self.seen = true;
        let mut rest = self.buffer.split_off(index + marker.len());
        self.buffer.clear();
        if self.trim_newline {
            if let Some(stripped) = rest.strip_prefix("\r\n") {
                rest = stripped.to_owned();
            } else if let Some(stripped) = rest.strip_prefix('\n') {
                rest = stripped.to_owned();
            }
        }
        Some(rest)
    }

    pub(crate) const fn seen(&self) -> bool {
        self.seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn decoder_joins_split_multibyte_characters() {
        let mut decoder = StreamDecoder::default();
        let (head, tail) = "héllo".as_bytes().split_at(2);
        let first = decoder.push(head);
        let second = decoder.push(tail);
        assert_eq!(format!("{first}{second}"), "héllo");
        assert_eq!(first, "h");
    }

    #[rstest]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = StreamDecoder::default();
        assert_eq!(decoder.push(b"a\xffb"), "a\u{fffd}b");
        assert_eq!(decoder.finish(), "");
    }

    #[rstest]
    #[case("\u{1b}[2J\u{1b}[Hready", "ready")]
    #[case("\u{1b}[31mred\u{1b}[0m text", "red text")]
    #[case("plain", "plain")]
    fn strips_control_sequences(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(strip_control_sequences(input), expected);
    }

    #[rstest]
    fn carriage_returns_survive_stripping() {
        assert_eq!(strip_control_sequences("\u{1b}[1mtoday\u{1b}[0m\r\n"), "today\r\n");
    }

    #[rstest]
    #[case(&["\u{1b}[2", "Jready\n"], "ready\n")]
    #[case(&["\u{1b}", "[31mred\u{1b}[0m"], "red")]
    #[case(&["a\u{1b}]0;ti", "tle\u{7}b"], "ab")]
    #[case(&["a\u{1b}]0;title\u{1b}", "\\b"], "ab")]
    #[case(&["x\u{1b}[", "1;3", "2mz"], "xz")]
    fn sequences_split_across_chunks_are_stripped(#[case] chunks: &[&str], #[case] expected: &str) {
        let mut filter = ControlFilter::default();
        let mut out: String = chunks.iter().map(|chunk| filter.push(chunk)).collect();
        out.push_str(&filter.finish());
        assert_eq!(out, expected);
    }

    #[rstest]
    fn unfinished_sequence_is_dropped_at_end_of_stream() {
        let mut filter = ControlFilter::default();
        assert_eq!(filter.push("done\u{1b}[3"), "done");
        assert_eq!(filter.finish(), "");
    }

    #[rstest]
    fn gate_buffer_keeps_only_a_possible_marker_prefix() {
        let mut gate = MarkerGate::closed("MARK-1", false);
        let banner = "x".repeat(10_000);
        assert_eq!(gate.push(&banner), None);
        assert_eq!(gate.push("MARK"), None);
        assert!(gate.buffer.len() <= "MARK-1".len());
        assert_eq!(gate.push("-1out"), Some(String::from("out")));
    }

    #[rstest]
    fn gate_discards_banner_split_across_chunks() {
        let mut gate = MarkerGate::closed("MARK-1", false);
        assert_eq!(gate.push("Welcome to the box\nMA"), None);
        assert_eq!(gate.push("RK-1payload"), Some(String::from("payload")));
        assert!(gate.seen());
        assert_eq!(gate.push(" more"), Some(String::from(" more")));
    }

    #[rstest]
    fn gate_trims_newline_after_marker_when_asked() {
        let mut gate = MarkerGate::closed("M", true);
        assert_eq!(gate.push("banner\r\nM\r\nout"), Some(String::from("out")));
    }

    #[rstest]
    fn open_gate_passes_everything() {
        let mut gate = MarkerGate::open();
        assert_eq!(gate.push("x"), Some(String::from("x")));
        assert!(gate.seen());
    }
}
