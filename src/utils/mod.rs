use std::fs::Metadata;

pub fn format_file_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

/// Strips anything that could escape the download directory.
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// Unix-style permission string, e.g. `-rw-r--r--` or `drwxr-xr-x`.
pub fn format_mode(metadata: &Metadata) -> String {
    let kind = if metadata.is_dir() { 'd' } else { '-' };

    #[cfg(unix)]
    let bits = {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode()
    };
    #[cfg(not(unix))]
    let bits: u32 = if metadata.permissions().readonly() {
        0o444
    } else {
        0o666
    };

    const FLAGS: [char; 3] = ['r', 'w', 'x'];
    let mut mode = String::with_capacity(10);
    mode.push(kind);
    for shift in (0..9).rev() {
        if bits & (1 << shift) != 0 {
            mode.push(FLAGS[(8 - shift) % 3]);
        } else {
            mode.push('-');
        }
    }
    mode
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(10 * 1024 * 1024), "10.0 MB");
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename(".."), "_");
        assert_eq!(sanitize_filename(""), "_");
    }

    #[cfg(unix)]
    #[test]
    fn test_format_mode() {
        use std::os::unix::fs::PermissionsExt;

        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644)).unwrap();
        let metadata = std::fs::metadata(file.path()).unwrap();
        assert_eq!(format_mode(&metadata), "-rw-r--r--");
    }
}
