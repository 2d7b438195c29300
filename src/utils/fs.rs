use std::path::Path;
use crate::errors::MenderError;

/// Write through a sibling temp file then rename over the target.
pub async fn atomic_write(path: &Path, content: &str) -> Result<(), MenderError> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Lowercase, replace anything outside `[a-z0-9_-]` with `-`, collapse runs,
/// trim dashes. Empty input gives `"step"`.
pub fn sanitize_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut last_dash = false;
    for c in label.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "step".to_string()
    } else {
        trimmed.chars().take(50).collect()
    }
}
