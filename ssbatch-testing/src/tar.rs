//! Helpers for examining the tar archives a transfer produces.
use crate::Result;
use std::collections::HashMap;
use std::io::Read;

/// Parse an in-memory tar archive (optionally gzipped) into a map of entry path to entry data.
pub fn archive_entries(data: &[u8], gzipped: bool) -> Result<HashMap<String, Vec<u8>>> {
    let reader: Box<dyn Read + '_> = if gzipped {
        Box::new(flate2::read::GzDecoder::new(data))
    } else {
        Box::new(data)
    };

    let mut archive = tar::Archive::new(reader);
    let mut entries = HashMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();

        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;

        entries.insert(path, data);
    }

    Ok(entries)
}
