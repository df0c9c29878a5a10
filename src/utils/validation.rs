use crate::models::Stem;
use anyhow::{Result, anyhow};

/// Default maximum upload size: 200 MB
pub const MAX_FILE_SIZE: usize = 200 * 1024 * 1024;

/// Audio container extensions the separator can decode
/// Longest filename kept, in bytes
const MAX_FILENAME_BYTES: usize = 255;

pub const DEFAULT_AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "flac", "ogg", "m4a", "aac"];

/// Declared content types accepted in addition to `audio/*`
const ACCEPTED_GENERIC_TYPES: &[&str] = &["application/octet-stream", "application/ogg"];

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

/// Validates file size against maximum limit
pub fn validate_file_size(size: usize, max_size: usize) -> Result<()> {
    if size == 0 {
        return Err(anyhow!(ValidationError {
            code: "EMPTY_FILE",
            message: "Uploaded file is empty".to_string(),
        }));
    }
    if size > max_size {
        return Err(anyhow!(ValidationError {
            code: "FILE_TOO_LARGE",
            message: format!(
                "File size {} bytes exceeds maximum allowed {} bytes ({} MB)",
                size,
                max_size,
                max_size / 1024 / 1024
            ),
        }));
    }
    Ok(())
}

/// Sanitizes an uploaded filename down to its last path component.
pub fn sanitize_filename(filename: &str) -> Result<String> {
    // Browsers on Windows may send either separator
    let name = filename.rsplit(['/', '\\']).next().unwrap_or("").trim();

    if name.is_empty() || name == "." || name == ".." {
        return Err(anyhow!(ValidationError {
            code: "INVALID_FILENAME",
            message: "Filename cannot be empty".to_string(),
        }));
    }

    if name.len() != filename.len() {
        tracing::warn!("Path components stripped from upload filename: {}", filename);
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
            {
                '_'
            } else {
                c
            }
        })
        .collect();

    let sanitized = truncate_keeping_extension(sanitized, MAX_FILENAME_BYTES);

    if sanitized.starts_with('.') {
        return Err(anyhow!(ValidationError {
            code: "HIDDEN_FILE",
            message: "Hidden files (starting with '.') are not allowed".to_string(),
        }));
    }

    Ok(sanitized)
}

/// Cuts `name` to `max` bytes on a char boundary, shortening the stem so the
/// extension survives.
fn truncate_keeping_extension(name: String, max: usize) -> String {
    if name.len() <= max {
        return name;
    }

    let ext = std::path::Path::new(&name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| e.len() + 1 < max / 2)
        .map(|e| format!(".{}", e))
        .unwrap_or_default();

    let mut end = max - ext.len();
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &name[..end], ext)
}

/// Returns the lowercased extension if it is in the allow-list.
pub fn validate_extension(filename: &str, allowed: &[String]) -> Result<String> {
    let ext = std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    if !ext.is_empty() && allowed.iter().any(|a| a.eq_ignore_ascii_case(&ext)) {
        return Ok(ext);
    }

    Err(anyhow!(ValidationError {
        code: "UNSUPPORTED_FORMAT",
        message: format!(
            "Unsupported audio format '{}'. Supported formats: {}",
            if ext.is_empty() { "<none>" } else { &ext },
            allowed.join(", ")
        ),
    }))
}

/// Validates the declared multipart content type, when there is one.
pub fn validate_content_type(content_type: Option<&str>) -> Result<()> {
    let Some(content_type) = content_type else {
        return Ok(());
    };

    if content_type.trim().is_empty() {
        return Ok(());
    }

    // video/ogg and video/mp4 are what some browsers report for .ogg/.m4a
    if let Ok(parsed) = content_type.parse::<mime::Mime>() {
        if parsed.type_() == mime::AUDIO
            || parsed.type_() == mime::VIDEO
            || ACCEPTED_GENERIC_TYPES.contains(&parsed.essence_str())
        {
            return Ok(());
        }
    }

    Err(anyhow!(ValidationError {
        code: "INVALID_MIME_TYPE",
        message: format!("Content type '{}' is not an audio type", content_type),
    }))
}

/// Sniffs the first bytes of the upload and rejects recognizably non-audio content.
pub fn verify_audio_magic(header: &[u8]) -> Result<()> {
    if header.is_empty() {
        return Err(anyhow!(ValidationError {
            code: "EMPTY_FILE",
            message: "File appears to be empty".to_string(),
        }));
    }

    if is_executable_content(header) {
        return Err(anyhow!(ValidationError {
            code: "EXECUTABLE_CONTENT",
            message: "File contains executable content which is not allowed".to_string(),
        }));
    }

    match infer::get(header) {
        Some(kind)
            if matches!(
                kind.matcher_type(),
                infer::MatcherType::Audio | infer::MatcherType::Video
            ) =>
        {
            Ok(())
        }
        Some(kind) => Err(anyhow!(ValidationError {
            code: "NOT_AUDIO",
            message: format!("File content looks like '{}', not audio", kind.mime_type()),
        })),
        None => {
            // Raw ADTS or headerless MPEG frames are not always recognized
            tracing::debug!("No signature matched upload header, allowing");
            Ok(())
        }
    }
}

/// Checks if file content appears to be executable
pub fn is_executable_content(header: &[u8]) -> bool {
    if header.len() < 4 {
        return false;
    }

    // ELF
    if header.starts_with(&[0x7F, 0x45, 0x4C, 0x46]) {
        return true;
    }

    // PE/COFF
    if header.starts_with(&[0x4D, 0x5A]) {
        return true;
    }

    // Mach-O
    if header.starts_with(&[0xFE, 0xED, 0xFA, 0xCE])
        || header.starts_with(&[0xFE, 0xED, 0xFA, 0xCF])
        || header.starts_with(&[0xCE, 0xFA, 0xED, 0xFE])
        || header.starts_with(&[0xCF, 0xFA, 0xED, 0xFE])
    {
        return true;
    }

    header.starts_with(b"#!")
}

/// Parses a comma-separated stem list against the stems the model produces.
///
/// An absent or blank list selects the four standard stems. Order is kept and
/// duplicates are dropped.
pub fn parse_stems(raw: Option<&str>, supported: &[Stem]) -> Result<Vec<Stem>> {
    let raw = raw.map(str::trim).unwrap_or("");
    if raw.is_empty() {
        return Ok(Stem::STANDARD
            .iter()
            .copied()
            .filter(|s| supported.contains(s))
            .collect());
    }

    let mut stems = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let stem: Stem = part.parse().map_err(|_| {
            anyhow!(ValidationError {
                code: "UNKNOWN_STEM",
                message: format!(
                    "Unknown stem '{}'. Supported stems: {}",
                    part,
                    join_stems(supported)
                ),
            })
        })?;

        if !supported.contains(&stem) {
            return Err(anyhow!(ValidationError {
                code: "UNSUPPORTED_STEM",
                message: format!(
                    "Stem '{}' is not produced by the configured model. Supported stems: {}",
                    stem,
                    join_stems(supported)
                ),
            }));
        }

        if !stems.contains(&stem) {
            stems.push(stem);
        }
    }

    if stems.is_empty() {
        return Err(anyhow!(ValidationError {
            code: "UNKNOWN_STEM",
            message: "No stems requested".to_string(),
        }));
    }

    Ok(stems)
}

fn join_stems(stems: &[Stem]) -> String {
    stems
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> Vec<String> {
        DEFAULT_AUDIO_EXTENSIONS
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_validate_file_size() {
        assert!(validate_file_size(1024, MAX_FILE_SIZE).is_ok());
        assert!(validate_file_size(MAX_FILE_SIZE, MAX_FILE_SIZE).is_ok());
        assert!(validate_file_size(MAX_FILE_SIZE + 1, MAX_FILE_SIZE).is_err());
        assert!(validate_file_size(0, MAX_FILE_SIZE).is_err());
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("song.mp3").unwrap(), "song.mp3");
        assert_eq!(sanitize_filename("my song.wav").unwrap(), "my song.wav");
        assert_eq!(
            sanitize_filename("mix<final>.flac").unwrap(),
            "mix_final_.flac"
        );
        assert_eq!(sanitize_filename("日本語.mp3").unwrap(), "日本語.mp3");

        // Path traversal
        assert_eq!(sanitize_filename("../../../etc/song.mp3").unwrap(), "song.mp3");
        assert_eq!(
            sanitize_filename("..\\..\\music\\track.wav").unwrap(),
            "track.wav"
        );

        assert!(sanitize_filename("").is_err());
        assert!(sanitize_filename("dir/").is_err());
        assert!(sanitize_filename(".hidden.mp3").is_err());
    }

    #[test]
    fn test_sanitize_long_filename_keeps_extension() {
        let long = format!("{}.mp3", "a".repeat(300));
        let sanitized = sanitize_filename(&long).unwrap();
        assert_eq!(sanitized.len(), 255);
        assert!(sanitized.ends_with("a.mp3"));
        assert_eq!(validate_extension(&sanitized, &allowed()).unwrap(), "mp3");

        // Multi-byte stems are cut on a char boundary
        let long = format!("{}.flac", "é".repeat(200));
        let sanitized = sanitize_filename(&long).unwrap();
        assert!(sanitized.len() <= 255);
        assert!(sanitized.ends_with("é.flac"));

        // No extension to keep
        assert_eq!(sanitize_filename(&"b".repeat(400)).unwrap().len(), 255);
    }

    #[test]
    fn test_validate_extension() {
        assert_eq!(validate_extension("a.mp3", &allowed()).unwrap(), "mp3");
        assert_eq!(validate_extension("a.FLAC", &allowed()).unwrap(), "flac");
        assert!(validate_extension("a.txt", &allowed()).is_err());
        assert!(validate_extension("noext", &allowed()).is_err());
    }

    #[test]
    fn test_validate_content_type() {
        assert!(validate_content_type(None).is_ok());
        assert!(validate_content_type(Some("audio/mpeg")).is_ok());
        assert!(validate_content_type(Some("audio/wav; charset=binary")).is_ok());
        assert!(validate_content_type(Some("video/ogg")).is_ok());
        assert!(validate_content_type(Some("application/octet-stream")).is_ok());
        assert!(validate_content_type(Some("text/plain")).is_err());
        assert!(validate_content_type(Some("image/png")).is_err());
    }

    #[test]
    fn test_verify_audio_magic() {
        assert!(verify_audio_magic(b"ID3\x04\x00\x00\x00\x00\x00\x00").is_ok());
        assert!(verify_audio_magic(b"RIFF\x24\x00\x00\x00WAVEfmt ").is_ok());
        assert!(verify_audio_magic(b"fLaC\x00\x00\x00\x22").is_ok());
        // Unrecognized bytes are let through
        assert!(verify_audio_magic(&[0x01, 0x02, 0x03, 0x04]).is_ok());

        assert!(verify_audio_magic(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]).is_err());
        assert!(verify_audio_magic(&[0x7F, 0x45, 0x4C, 0x46, 0x02]).is_err());
        assert!(verify_audio_magic(b"").is_err());
    }

    #[test]
    fn test_parse_stems_defaults() {
        let stems = parse_stems(None, &Stem::STANDARD).unwrap();
        assert_eq!(stems, Stem::STANDARD.to_vec());

        let stems = parse_stems(Some("  "), &Stem::SIX_SOURCE).unwrap();
        assert_eq!(stems, Stem::STANDARD.to_vec());
    }

    #[test]
    fn test_parse_stems_subset() {
        let stems = parse_stems(Some("Vocals, bass,vocals"), &Stem::STANDARD).unwrap();
        assert_eq!(stems, vec![Stem::Vocals, Stem::Bass]);
    }

    #[test]
    fn test_parse_stems_rejects_unknown_and_unsupported() {
        assert!(parse_stems(Some("vocals,kazoo"), &Stem::STANDARD).is_err());
        assert!(parse_stems(Some("guitar"), &Stem::STANDARD).is_err());
        assert!(parse_stems(Some("guitar"), &Stem::SIX_SOURCE).is_ok());
        assert!(parse_stems(Some(",,"), &Stem::STANDARD).is_err());
    }
}
