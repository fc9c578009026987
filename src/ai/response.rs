// response.rs — Turn framing shared by prompts and model output.

/// Opens a turn in the model's chat format.
pub const START_OF_TURN: &str = "<start_of_turn>";
/// Closes a turn; appended to every query.
pub const END_OF_TURN: &str = "<end_of_turn>";

const FRAMING_MARKERS: [&str; 2] = [START_OF_TURN, END_OF_TURN];

/// Strip turn markers (and the whitespace around them) from both ends.
/// Markers inside the text are left alone.
pub fn strip_framing(raw: &str) -> &str {
    let mut text = raw.trim();
    loop {
        let before = text.len();
        for marker in FRAMING_MARKERS {
            if let Some(rest) = text.strip_prefix(marker) {
                text = rest.trim_start();
            }
            if let Some(rest) = text.strip_suffix(marker) {
                text = rest.trim_end();
            }
        }
        if text.len() == before {
            return text;
        }
    }
}

/// Final cleaning of an accumulated response. `None` when nothing but
/// framing and whitespace came back.
pub fn clean_response(raw: &str) -> Option<String> {
    let text = strip_framing(raw);
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}
