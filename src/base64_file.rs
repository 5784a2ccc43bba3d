//! Plain-text base64 wrapper for binary files kept in configuration
//! repositories.

use anyhow::Context as _;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::io::Write as _;
use std::path::Path;

/// Header line identifying a base64-wrapped data file.
pub const BASE64_HEADER: &str = "#GOPHERBOT-BASE64-DATA\n";

/// Header line identifying an encrypted, base64-wrapped key file.
pub const ENCRYPTED_HEADER: &str = "#GOPHERBOT-ENCRYPTED-BASE64\n";

const WRAP_COLUMNS: usize = 77;

/// Encode `data` under `header`, wrapping the base64 body at 77 columns.
pub fn encode_wrapped(header: &str, data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    let mut out = String::with_capacity(header.len() + encoded.len() + encoded.len() / WRAP_COLUMNS + 2);
    out.push_str(header);
    let bytes = encoded.as_bytes();
    for chunk in bytes.chunks(WRAP_COLUMNS) {
        // base64 output is ASCII, so chunk boundaries are char boundaries
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push('\n');
    }
    if bytes.is_empty() {
        out.push('\n');
    }
    out
}

/// Decode `raw` if it starts with `header`; otherwise return it unchanged.
pub fn decode_wrapped(header: &str, raw: &[u8]) -> anyhow::Result<Vec<u8>> {
    let Some(body) = raw.strip_prefix(header.as_bytes()) else {
        return Ok(raw.to_vec());
    };
    let compact: Vec<u8> = body
        .iter()
        .copied()
        .filter(|byte| !byte.is_ascii_whitespace())
        .collect();
    STANDARD
        .decode(compact)
        .context("invalid base64 payload")
}

/// Write `data` to `path` in the wrapped format with mode 0600.
pub fn write_base64_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    write_private(path, encode_wrapped(BASE64_HEADER, data).as_bytes())
}

/// Read `path`, decoding the wrapped format when the header is present and
/// returning raw bytes otherwise.
pub fn read_base64_file(path: &Path) -> anyhow::Result<Vec<u8>> {
    let raw = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    decode_wrapped(BASE64_HEADER, &raw)
        .with_context(|| format!("failed to decode {}", path.display()))
}

/// Write a file readable only by the owner.
pub fn write_private(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt as _;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("failed to open {} for writing", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapped_lines_are_at_most_77_columns() {
        let data = vec![0xA5u8; 500];
        let encoded = encode_wrapped(BASE64_HEADER, &data);
        assert!(encoded.starts_with(BASE64_HEADER));
        assert!(encoded.ends_with('\n'));
        for line in encoded.lines().skip(1) {
            assert!(line.len() <= 77, "line too long: {}", line.len());
        }
    }

    #[test]
    fn file_round_trip_preserves_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("key.bin");
        let data: Vec<u8> = (0..=255u8).collect();
        write_base64_file(&path, &data).expect("write");
        assert_eq!(read_base64_file(&path).expect("read"), data);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn headerless_files_read_as_raw_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("raw.bin");
        std::fs::write(&path, b"not wrapped\x00\x01").expect("write");
        assert_eq!(read_base64_file(&path).expect("read"), b"not wrapped\x00\x01");
    }
}
