/// Prompt text kept in activity records.
pub const ACTIVITY_PROMPT_CHARS: usize = 100;
/// Response text kept in activity records.
pub const ACTIVITY_RESPONSE_CHARS: usize = 300;
/// Prompt and response text kept in task snapshots.
pub const SNAPSHOT_CHARS: usize = 500;

/// Keep at most `max` characters. Cuts on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

pub fn truncate_activity_prompt(prompt: &str) -> String {
    truncate_chars(prompt, ACTIVITY_PROMPT_CHARS)
}

pub fn truncate_activity_response(response: &str) -> String {
    truncate_chars(response, ACTIVITY_RESPONSE_CHARS)
}

pub fn truncate_snapshot(text: &str) -> String {
    truncate_chars(text, SNAPSHOT_CHARS)
}
