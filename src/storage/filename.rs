//! File and directory naming helpers shared by storage gateways and the worker.

/// Sanitizes a file name for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems:
/// / \ : * ? " < > |
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    match sanitized.as_str() {
        "" => "_".to_string(),
        "." | ".." => sanitized.replace('.', "_"),
        _ => sanitized,
    }
}

/// Splits `name` into stem and extension (extension keeps its dot).
///
/// A leading dot is part of the stem, so `.env` has no extension.
#[must_use]
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}

/// Collision variant `stem (n).ext` of `name`.
#[must_use]
pub fn suffixed_name(name: &str, n: usize) -> String {
    let (stem, ext) = split_extension(name);
    format!("{stem} ({n}){ext}")
}

/// Directory segments of `directory` below `root`, or `None` when it lies outside.
///
/// Trailing separators on either side are ignored and empty segments are skipped.
#[must_use]
pub fn relative_segments(root: &str, directory: &str) -> Option<Vec<String>> {
    let root = root.trim_end_matches('/');
    let directory = directory.trim_end_matches('/');
    let rest = directory.strip_prefix(root)?;
    if !(rest.is_empty() || rest.starts_with('/')) {
        return None;
    }
    Some(
        rest.split('/')
            .filter(|segment| !segment.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// Returns true when `segment` names a single child entry.
#[must_use]
pub fn is_plain_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.contains(['/', '\\'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename_replaces_separators() {
        assert_eq!(sanitize_filename("a/b\\c:d.pdf"), "a_b_c_d.pdf");
        assert_eq!(sanitize_filename("  report.pdf "), "report.pdf");
        assert_eq!(sanitize_filename(""), "_");
        assert_eq!(sanitize_filename(".."), "__");
    }

    #[test]
    fn test_suffixed_name_inserts_counter_before_extension() {
        assert_eq!(suffixed_name("report.pdf", 2), "report (2).pdf");
        assert_eq!(suffixed_name("archive.tar.gz", 1), "archive.tar (1).gz");
        assert_eq!(suffixed_name("README", 3), "README (3)");
        assert_eq!(suffixed_name(".env", 1), ".env (1)");
    }

    #[test]
    fn test_relative_segments_under_root() {
        assert_eq!(
            relative_segments("/storage/emulated/0", "/storage/emulated/0/Download/Books/"),
            Some(vec!["Download".to_string(), "Books".to_string()])
        );
        assert_eq!(
            relative_segments("/storage/emulated/0/", "/storage/emulated/0"),
            Some(Vec::new())
        );
    }

    #[test]
    fn test_relative_segments_outside_root() {
        assert_eq!(relative_segments("/storage/a", "/storage/ab/x"), None);
        assert_eq!(relative_segments("/storage/a", "/other"), None);
    }

    #[test]
    fn test_is_plain_segment() {
        assert!(is_plain_segment("Download"));
        assert!(!is_plain_segment(".."));
        assert!(!is_plain_segment("a/b"));
        assert!(!is_plain_segment(""));
    }
}
