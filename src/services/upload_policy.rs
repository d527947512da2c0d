//! Content checks applied to direct uploads before they reach storage.

use thiserror::Error;

/// Largest accepted upload body.
pub const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;
/// Uploads allowed per principal per window.
pub const UPLOAD_LIMIT: u32 = 5;
pub const UPLOAD_WINDOW_SECS: u64 = 60;

const SVG_CONTENT_TYPE: &str = "image/svg+xml";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UploadRejection {
    #[error("File signature mismatch (Magic Number check failed)")]
    SignatureMismatch,
    #[error("SVG contains potentially malicious scripts")]
    UnsafeSvg,
    #[error("File too large (Max 5MB)")]
    TooLarge,
}

/// Check the declared MIME type against the file's leading bytes, screen SVG
/// text for script markers and enforce the size ceiling.
pub fn check_upload(content_type: &str, bytes: &[u8]) -> Result<(), UploadRejection> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    let signature_ok = match essence.as_str() {
        "image/jpeg" => bytes.starts_with(&[0xFF, 0xD8, 0xFF]),
        "image/png" => bytes.starts_with(&[0x89, 0x50, 0x4E, 0x47]),
        "image/gif" => bytes.starts_with(b"GIF8"),
        "image/webp" => bytes.starts_with(b"RIFF") && bytes.get(8..12) == Some(b"WEBP".as_slice()),
        SVG_CONTENT_TYPE => true,
        _ => false,
    };
    if !signature_ok {
        return Err(UploadRejection::SignatureMismatch);
    }

    if essence == SVG_CONTENT_TYPE {
        let text = String::from_utf8_lossy(bytes);
        if text.contains("<script") || text.contains("javascript:") {
            return Err(UploadRejection::UnsafeSvg);
        }
    }

    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(UploadRejection::TooLarge);
    }
    Ok(())
}

/// Declared-type and size checks for presigned uploads, where the bytes never
/// pass through this process.
pub fn check_presign(content_type: &str, size: u64) -> Result<(), UploadRejection> {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    if !matches!(
        essence,
        "image/jpeg" | "image/png" | "image/gif" | "image/webp"
    ) {
        return Err(UploadRejection::SignatureMismatch);
    }
    if size > MAX_UPLOAD_BYTES as u64 {
        return Err(UploadRejection::TooLarge);
    }
    Ok(())
}
