/// Translate a key name into the byte sequence the terminal expects.
///
/// Names follow the usual terminal conventions: "Enter", "Tab", "Escape",
/// arrows, "C-x" for control chords. Anything unrecognized is sent as
/// literal text.
pub fn key_to_bytes(key: &str) -> Vec<u8> {
    let bytes: &[u8] = match key {
        "Enter" => b"\x0d",
        "Tab" => b"\x09",
        "Space" => b" ",
        "Escape" | "C-[" => b"\x1b",
        "Backspace" => b"\x7f",
        "Up" => b"\x1b[A",
        "Down" => b"\x1b[B",
        "Right" => b"\x1b[C",
        "Left" => b"\x1b[D",
        "Home" => b"\x1b[H",
        "End" => b"\x1b[F",
        "PageUp" => b"\x1b[5~",
        "PageDown" => b"\x1b[6~",
        "Delete" => b"\x1b[3~",
        _ => {
            if let Some(ctrl) = parse_ctrl_chord(key) {
                return vec![ctrl];
            }
            return key.as_bytes().to_vec();
        }
    };
    bytes.to_vec()
}

/// Flatten a key sequence into one write.
pub fn keys_to_bytes(keys: &[String]) -> Vec<u8> {
    keys.iter().flat_map(|key| key_to_bytes(key)).collect()
}

fn parse_ctrl_chord(key: &str) -> Option<u8> {
    let ch = key.strip_prefix("C-")?.chars().next()?;
    if ch.is_ascii_lowercase() {
        Some(ch as u8 - b'a' + 1)
    } else if ch.is_ascii_uppercase() {
        Some(ch as u8 - b'A' + 1)
    } else {
        None
    }
}
