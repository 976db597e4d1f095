use anyhow::{Context, Result};
use bzip2::read::BzDecoder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::info;

/// Reads a SQL dump into memory. Files ending in `.bz2` are decompressed on the
/// fly; invalid UTF-8 sequences are replaced rather than rejected.
pub fn read_dump(path: &Path) -> Result<String> {
    let file =
        File::open(path).with_context(|| format!("Failed to open SQL dump: {}", path.display()))?;
    let size_hint = file.metadata().map(|m| m.len() as usize).unwrap_or(0);

    let mut bytes = Vec::with_capacity(size_hint);
    if is_bz2(path) {
        let mut decoder = BzDecoder::new(BufReader::new(file));
        decoder
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to decompress SQL dump: {}", path.display()))?;
    } else {
        let mut reader = BufReader::with_capacity(256 * 1024, file);
        reader
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to read SQL dump: {}", path.display()))?;
    }

    let text = decode_lossy(bytes);
    info!(
        path = %path.display(),
        bytes = text.len(),
        "SQL dump loaded"
    );
    Ok(text)
}

fn is_bz2(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("bz2"))
}

/// Avoids a second copy when the dump is already valid UTF-8.
fn decode_lossy(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => {
            let bytes = e.into_bytes();
            tracing::debug!("SQL dump contains invalid UTF-8, decoding lossily");
            String::from_utf8_lossy(&bytes).into_owned()
        }
    }
}
