use anyhow::{Result, anyhow};
use std::path::Path;

/// Extensions that are never stored, whatever the client claims the content is
const BLOCKED_EXTENSIONS: &[&str] = &[
    // Executables
    "exe", "dll", "so", "dylib", "bin", "com", "bat", "cmd", "ps1", "sh", "bash",
    // Scripts
    "js", "mjs", "py", "rb", "php", "pl", "cgi", "asp", "aspx", "jsp",
    // Served inline by browsers
    "html", "htm", "xhtml", "shtml", "svg", "xml",
    // Server config
    "htaccess", "htpasswd",
];

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Sanitizes an uploaded filename so it can be written under the image directory.
/// Returns the sanitized name or an error if the name cannot be stored.
pub fn sanitize_filename(filename: &str) -> Result<String> {
    // Browsers on Windows may send the full client path
    let last = filename.rsplit(['/', '\\']).next().unwrap_or("");
    let name = Path::new(last)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    if name.is_empty() || name == "." || name == ".." {
        return Err(anyhow!(ValidationError {
            code: "INVALID_FILENAME",
            message: "Filename cannot be empty".to_string(),
        }));
    }

    if filename.contains("..") {
        tracing::warn!("Path traversal attempt detected: {}", filename);
    }

    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_control()
                || c == ':'
                || c == '*'
                || c == '?'
                || c == '"'
                || c == '<'
                || c == '>'
                || c == '|'
                || c == ';'
                || c == '%'
            {
                '_'
            } else {
                c
            }
        })
        .collect();

    // Limit length safely for UTF-8
    let sanitized = if sanitized.len() > 100 {
        let mut end = 100;
        while !sanitized.is_char_boundary(end) {
            end -= 1;
        }
        sanitized[..end].to_string()
    } else {
        sanitized
    };

    if let Some(ext) = Path::new(&sanitized).extension().and_then(|e| e.to_str()) {
        let ext_lower = ext.to_lowercase();
        if BLOCKED_EXTENSIONS.contains(&ext_lower.as_str()) {
            return Err(anyhow!(ValidationError {
                code: "BLOCKED_EXTENSION",
                message: format!("File extension '.{}' is not allowed", ext_lower),
            }));
        }
    }

    if sanitized.starts_with('.') {
        return Err(anyhow!(ValidationError {
            code: "HIDDEN_FILE",
            message: "Hidden files (starting with '.') are not allowed".to_string(),
        }));
    }

    Ok(sanitized)
}

/// Checks if file content appears to be executable
pub fn is_executable_content(header: &[u8]) -> bool {
    if header.starts_with(b"#!") {
        return true;
    }

    if header.len() < 4 {
        return false;
    }

    // ELF binary (Linux)
    if header.starts_with(&[0x7F, 0x45, 0x4C, 0x46]) {
        return true;
    }

    // PE/COFF (Windows .exe, .dll)
    if header.starts_with(&[0x4D, 0x5A]) {
        return true;
    }

    // Mach-O (macOS)
    header.starts_with(&[0xFE, 0xED, 0xFA, 0xCE])
        || header.starts_with(&[0xFE, 0xED, 0xFA, 0xCF])
        || header.starts_with(&[0xCE, 0xFA, 0xED, 0xFE])
        || header.starts_with(&[0xCF, 0xFA, 0xED, 0xFE])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("goblin.png").unwrap(), "goblin.png");
        assert_eq!(sanitize_filename("ace of spades.jpg").unwrap(), "ace of spades.jpg");
        assert_eq!(
            sanitize_filename("card<1>.png").unwrap(),
            "card_1_.png"
        );
        assert_eq!(sanitize_filename("龍.webp").unwrap(), "龍.webp");

        // Path components are dropped
        assert_eq!(sanitize_filename("../../../etc/passwd").unwrap(), "passwd");
        assert_eq!(
            sanitize_filename("C:\\Users\\me\\Desktop\\card.png").unwrap(),
            "card.png"
        );

        // Blocked extensions
        assert!(sanitize_filename("virus.exe").is_err());
        assert!(sanitize_filename("card.svg").is_err());
        assert!(sanitize_filename("hack.js").is_err());

        // Hidden and empty
        assert!(sanitize_filename(".htaccess").is_err());
        assert!(sanitize_filename("").is_err());
        assert!(sanitize_filename("cards/").is_err());
    }

    #[test]
    fn test_sanitize_filename_truncates_on_char_boundary() {
        let long = format!("{}.png", "é".repeat(80));
        let sanitized = sanitize_filename(&long).unwrap();
        assert!(sanitized.len() <= 100);
        assert!(sanitized.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_is_executable_content() {
        // ELF header
        assert!(is_executable_content(&[0x7F, 0x45, 0x4C, 0x46, 0x00]));
        // PE header
        assert!(is_executable_content(&[0x4D, 0x5A, 0x00, 0x00]));
        // Shebang
        assert!(is_executable_content(b"#!/bin/bash"));
        // Regular content
        assert!(!is_executable_content(b"hello"));
        assert!(!is_executable_content(&[0x89, 0x50, 0x4E, 0x47])); // PNG
    }
}
