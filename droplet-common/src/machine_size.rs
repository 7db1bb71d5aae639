/// Machine-size helpers used by target validation.
///
/// Sizes are checked against `*`-glob patterns (case-insensitive) rather than a closed
/// list, so new slugs inside a known family keep working without a driver release.
// DigitalOcean droplet families: basic, cpu-optimized (+ premium), general purpose,
// memory-optimized, storage-optimized and GPU.
pub const DEFAULT_MACHINE_SIZE_PATTERNS: &str =
    "s-*,c-*,c2-*,g-*,gd-*,m-*,m3-*,m6-*,so-*,so1_5-*,gpu-*";

/// Sizes offered as suggestions in the target manifest.
pub const SUGGESTED_SIZES: &[&str] = &[
    "s-1vcpu-1gb",
    "s-1vcpu-2gb",
    "s-2vcpu-2gb",
    "s-2vcpu-4gb",
    "s-4vcpu-8gb",
    "s-8vcpu-16gb",
    "c-2",
    "c-4",
    "g-2vcpu-8gb",
    "m-2vcpu-16gb",
];

/// Parse comma-separated patterns.
///
/// - Trims whitespace
/// - Drops empty entries
/// - If input is empty/None, returns the default patterns
fn parse_size_patterns(raw: Option<&str>) -> Vec<String> {
    let mut out: Vec<String> = raw
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if out.is_empty() {
        out = DEFAULT_MACHINE_SIZE_PATTERNS
            .split(',')
            .map(|s| s.trim().to_string())
            .collect();
    }

    out
}

/// Return true if `size` matches at least one pattern.
fn size_matches_patterns(size: &str, patterns: &[String]) -> bool {
    let size = size.trim().to_ascii_lowercase();
    if size.is_empty() {
        return false;
    }
    patterns
        .iter()
        .map(|p| p.trim().to_ascii_lowercase())
        .filter(|p| !p.is_empty())
        .any(|p| glob_match(&p, &size))
}

/// `true` for slugs in one of the default families.
pub fn is_known_size(size: &str) -> bool {
    size_matches_patterns(size, &parse_size_patterns(None))
}

// `*` matches any substring (including empty); no other glob features.
fn glob_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !value.starts_with(first) {
        return false;
    }
    if value.len() < first.len() + last.len() || !value.ends_with(last) {
        return false;
    }

    let mut rest = &value[first.len()..value.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    true
}
