//! Terminal output cleanup applied to every chunk read from an interactive
//! shell before it reaches a subscriber.

/// Clean a raw terminal chunk into plain text.
///
/// Removes NUL, SOH and backspace bytes, ANSI/VT escape sequences (CSI,
/// OSC and two-byte ESC forms, which covers the `ESC[6n` cursor position
/// query), folds CRLF and lone CR into LF, and trims surrounding
/// whitespace. An empty result means the chunk carried nothing visible.
pub fn sanitize(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '\u{0000}' | '\u{0001}' | '\u{0008}' => {}
            '\x1b' => match chars.peek() {
                // CSI: ESC [ params intermediates final
                Some('[') => {
                    chars.next();
                    while let Some(&c) = chars.peek() {
                        if ('\x20'..='\x3f').contains(&c) {
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if let Some(&c) = chars.peek() {
                        if ('\x40'..='\x7e').contains(&c) {
                            chars.next();
                        }
                    }
                }
                // OSC: ESC ] ... BEL | ESC \
                Some(']') => {
                    chars.next();
                    while let Some(c) = chars.next() {
                        if c == '\x07' {
                            break;
                        }
                        if c == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                Some(_) => {
                    chars.next();
                }
                None => {}
            },
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push('\n');
            }
            _ => out.push(ch),
        }
    }

    out.trim().to_string()
}

/// Longest unterminated escape sequence held back between reads. Anything
/// longer is sanitized as is.
const MAX_PENDING: usize = 4096;

/// Sanitizer for a byte stream delivered in arbitrary reads.
///
/// An escape sequence or UTF-8 character cut by a read boundary is held
/// back and prefixed to the next read instead of leaking its tail.
#[derive(Debug, Default)]
pub struct StreamSanitizer {
    pending: Vec<u8>,
}

impl StreamSanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sanitize the complete part of `pending + bytes`.
    pub fn feed(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let cut = complete_prefix_len(&self.pending);
        if self.pending.len() - cut > MAX_PENDING {
            return self.flush();
        }
        let rest = self.pending.split_off(cut);
        let ready = std::mem::replace(&mut self.pending, rest);
        sanitize(&ready)
    }

    /// Sanitize whatever is still held back; called when the stream ends.
    pub fn flush(&mut self) -> String {
        sanitize(&std::mem::take(&mut self.pending))
    }
}

/// Length of the prefix of `buf` that ends on a whole character outside
/// any escape sequence.
fn complete_prefix_len(buf: &[u8]) -> usize {
    let mut cut = match std::str::from_utf8(buf) {
        Ok(_) => buf.len(),
        // error_len() of None: input ends mid-character.
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => buf.len(),
    };

    if let Some(esc) = buf[..cut].iter().rposition(|&b| b == 0x1b) {
        if !escape_is_complete(&buf[esc..cut]) {
            cut = esc;
        }
    }
    cut
}

/// `seq` starts with ESC and runs to the end of the available bytes.
fn escape_is_complete(seq: &[u8]) -> bool {
    match seq.get(1) {
        None => false,
        Some(b'[') => seq[2..].iter().any(|b| (0x40..=0x7e).contains(b)),
        Some(b']') => seq[2..].contains(&0x07),
        Some(_) => true,
    }
}
