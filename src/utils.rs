use std::path::Path;

use anyhow::Result;
use log::{error, info};
use tokio::fs;

/// Asynchronously ensures that a directory exists, creating it if it does not.
/// This function is idempotent.
pub async fn ensure_directory_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        if let Err(e) = fs::create_dir_all(path).await {
            error!("Failed to create directory at {:?}: {}", path, e);
            return Err(e.into());
        }
        info!("Created directory at: {:?}", path);
    }
    Ok(())
}

/// Space separated uppercase hex, e.g. `0A FF 10`
pub fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{:02X}", byte))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Decodes `bytes` as UTF-8 when every character is printable.
/// Trailing NUL padding is ignored.
pub fn try_decode_text(bytes: &[u8]) -> Option<String> {
    let trimmed = match bytes.iter().rposition(|byte| *byte != 0) {
        Some(last) => &bytes[..=last],
        None => return None,
    };
    let text = std::str::from_utf8(trimmed).ok()?;
    if text.chars().all(|c| !c.is_control() || c == '\n' || c == '\t') {
        Some(text.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_is_spaced_and_uppercase() {
        assert_eq!(format_hex(&[0x0a, 0xff, 0x10]), "0A FF 10");
        assert_eq!(format_hex(&[]), "");
    }

    #[test]
    fn printable_values_decode() {
        assert_eq!(try_decode_text(b"Inspector\0\0"), Some("Inspector".to_string()));
        assert_eq!(try_decode_text(&[0x01, 0x02]), None);
        assert_eq!(try_decode_text(&[0xff, 0xfe]), None);
        assert_eq!(try_decode_text(&[0, 0]), None);
    }
}
