use anyhow::{Context, Result};
use regex::Regex;

/// Strips terminal control sequences from raw PTY output, leaving readable
/// text. Transforms are applied in a fixed order:
///
/// 1. cursor-movement codes -> one space
/// 2. cursor-positioning codes -> one space
/// 3. erase-line / erase-screen codes -> removed
/// 4. title-bar (OSC) sequences -> removed
/// 5. any remaining escape sequences -> removed
/// 6. any remaining non-printable control characters -> removed
/// 7. runs of 3+ spaces -> one space
/// 8. trim
#[derive(Debug, Clone)]
pub struct OutputSanitizer {
    cursor_move: Regex,
    cursor_position: Regex,
    erase: Regex,
    title_bar: Regex,
    remaining_escapes: Regex,
    control_chars: Regex,
    space_runs: Regex,
}

impl OutputSanitizer {
    pub fn new() -> Result<Self> {
        Ok(Self {
            // CUU/CUD/CUF/CUB: replaced by a space so adjacent words never merge
            cursor_move: compile(r"\x1b\[[0-9]*[ABCD]")?,
            // CUP/HVP and column/row absolute moves
            cursor_position: compile(r"\x1b\[[0-9;]*[HfGd]")?,
            // EL/ED
            erase: compile(r"\x1b\[[0-9]*[JK]")?,
            // OSC sequences, terminated by BEL or ST
            title_bar: compile(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)")?,
            // CSI with any final byte, charset selection, then single-char escapes
            remaining_escapes: compile(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b[()][0-9A-B]|\x1b.")?,
            // keeps \n and \t, drops \r and the rest
            control_chars: compile(r"[\x00-\x08\x0b-\x1f\x7f]")?,
            space_runs: compile(r" {3,}")?,
        })
    }

    pub fn sanitize(&self, text: &str) -> String {
        let text = self.cursor_move.replace_all(text, " ");
        let text = self.cursor_position.replace_all(&text, " ");
        let text = self.erase.replace_all(&text, "");
        let text = self.title_bar.replace_all(&text, "");
        let text = self.remaining_escapes.replace_all(&text, "");
        let text = self.control_chars.replace_all(&text, "");
        let text = self.space_runs.replace_all(&text, " ");
        text.trim().to_string()
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).with_context(|| format!("Failed to compile sanitizer pattern: {pattern}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitizer() -> OutputSanitizer {
        OutputSanitizer::new().unwrap()
    }

    #[test]
    fn plain_text_is_identity() {
        assert_eq!(sanitizer().sanitize("hello world"), "hello world");
    }

    #[test]
    fn plain_text_identity_up_to_whitespace_collapse() {
        assert_eq!(sanitizer().sanitize("a  b"), "a  b");
        assert_eq!(sanitizer().sanitize("a    b"), "a b");
        assert_eq!(sanitizer().sanitize("  padded  "), "padded");
    }

    #[test]
    fn cursor_movement_becomes_exactly_one_space() {
        assert_eq!(sanitizer().sanitize("up\x1b[Adown"), "up down");
        assert_eq!(sanitizer().sanitize("a\x1b[3Bb"), "a b");
        assert_eq!(sanitizer().sanitize("a\x1b[10Cb"), "a b");
        assert_eq!(sanitizer().sanitize("a\x1b[Db"), "a b");
    }

    #[test]
    fn cursor_positioning_becomes_one_space() {
        assert_eq!(sanitizer().sanitize("x\x1b[10;20Hy"), "x y");
        assert_eq!(sanitizer().sanitize("x\x1b[5Gy"), "x y");
    }

    #[test]
    fn erase_codes_are_removed() {
        assert_eq!(sanitizer().sanitize("a\x1b[2Jb"), "ab");
        assert_eq!(sanitizer().sanitize("a\x1b[Kb"), "ab");
    }

    #[test]
    fn title_bar_sequences_are_removed() {
        assert_eq!(sanitizer().sanitize("\x1b]0;my title\x07text"), "text");
        assert_eq!(sanitizer().sanitize("\x1b]2;t\x1b\\text"), "text");
    }

    #[test]
    fn color_codes_are_removed() {
        assert_eq!(sanitizer().sanitize("a\x1b[31mred\x1b[0mb"), "aredb");
        assert_eq!(sanitizer().sanitize("\x1b[1;32mok\x1b[m"), "ok");
    }

    #[test]
    fn charset_and_bare_escapes_are_removed() {
        assert_eq!(sanitizer().sanitize("a\x1b(Bb"), "ab");
        assert_eq!(sanitizer().sanitize("a\x1b=b"), "ab");
    }

    #[test]
    fn control_characters_are_removed() {
        assert_eq!(sanitizer().sanitize("a\x07b\x00c"), "abc");
        assert_eq!(sanitizer().sanitize("line\r"), "line");
    }

    #[test]
    fn newlines_survive() {
        assert_eq!(sanitizer().sanitize("one\ntwo"), "one\ntwo");
    }

    #[test]
    fn two_spaces_survive_three_collapse() {
        assert_eq!(sanitizer().sanitize("a\x1b[A\x1b[Ab"), "a  b");
        assert_eq!(sanitizer().sanitize("a\x1b[A\x1b[A\x1b[Ab"), "a b");
    }
}
