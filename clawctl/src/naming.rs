//! DNS label normalization for cloud resource names and tailnet hostnames.

/// Fallback label used when normalization strips everything.
const FALLBACK_LABEL: &str = "claw";

/// Reduce an arbitrary name to an RFC-1123 label: lowercased, non
/// `[a-z0-9-]` replaced by `-`, runs of `-` collapsed, leading/trailing `-`
/// stripped, truncated to 63 bytes. An empty result becomes a fixed fallback.
pub fn normalize_label(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = false;

    for c in name.to_lowercase().chars() {
        let c = if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' };
        if c == '-' {
            if last_dash || out.is_empty() {
                continue;
            }
            last_dash = true;
        } else {
            last_dash = false;
        }
        out.push(c);
    }

    while out.ends_with('-') {
        out.pop();
    }

    out.truncate(63);
    while out.ends_with('-') {
        out.pop();
    }

    if out.is_empty() { FALLBACK_LABEL.to_string() } else { out }
}
