//! Display-name resolution for the handshake.

/// Name given to peers that ask for none.
pub const DEFAULT_NAME: &str = "Anonymous";

/// Resolve a requested name against the names already in use.
/// Blank requests become [`DEFAULT_NAME`]; a taken name gets the smallest numeric
/// suffix (starting at 1) that makes it unique.
pub fn resolve_display_name<'a>(
    requested: Option<&str>,
    taken: impl IntoIterator<Item = &'a str>,
) -> String {
    let base = match requested.map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => DEFAULT_NAME.to_string(),
    };
    let taken: Vec<&str> = taken.into_iter().collect();
    if !taken.contains(&base.as_str()) {
        return base;
    }
    let mut suffix = 1u32;
    loop {
        let candidate = format!("{}{}", base, suffix);
        if !taken.contains(&candidate.as_str()) {
            return candidate;
        }
        suffix += 1;
    }
}
