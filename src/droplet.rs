//! Inspection of downloaded droplets (gzipped tarballs of the staged app).

use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use tar::Archive;

use crate::error::{HarnessError, Result};

/// One occurrence of a searched string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropletHit {
    pub entry: String,
    pub needle: String,
}

/// Every (entry, needle) pair where the needle occurs in the entry's bytes.
pub fn scan_droplet(path: &Path, needles: &[&str]) -> Result<Vec<DropletHit>> {
    let file = File::open(path)?;
    scan_reader(GzDecoder::new(file), needles)
}

/// Fail with [`HarnessError::SecretLeaked`] on the first needle found.
pub fn assert_droplet_excludes(path: &Path, needles: &[&str]) -> Result<()> {
    match scan_droplet(path, needles)?.into_iter().next() {
        Some(hit) => Err(HarnessError::SecretLeaked {
            entry: format!("{} (contains {:?})", hit.entry, hit.needle),
        }),
        None => Ok(()),
    }
}

fn scan_reader<R: Read>(reader: R, needles: &[&str]) -> Result<Vec<DropletHit>> {
    let needles: Vec<&[u8]> = needles
        .iter()
        .filter(|n| !n.is_empty())
        .map(|n| n.as_bytes())
        .collect();
    let overlap = needles.iter().map(|n| n.len()).max().unwrap_or(1) - 1;

    let mut hits = Vec::new();
    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.display().to_string();
        let mut found = vec![false; needles.len()];

        // Chunked scan; the tail of each chunk is carried so matches spanning
        // a chunk boundary are still seen.
        let mut window: Vec<u8> = Vec::with_capacity(64 * 1024 + overlap);
        let mut chunk = [0u8; 64 * 1024];
        loop {
            let n = entry.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            window.extend_from_slice(&chunk[..n]);
            for (i, needle) in needles.iter().enumerate() {
                if !found[i] && contains(&window, needle) {
                    found[i] = true;
                }
            }
            let keep = window.len().min(overlap);
            window.drain(..window.len() - keep);
        }

        for (i, hit) in found.into_iter().enumerate() {
            if hit {
                hits.push(DropletHit {
                    entry: name.clone(),
                    needle: String::from_utf8_lossy(needles[i]).into_owned(),
                });
            }
        }
    }
    Ok(hits)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.len() <= haystack.len() && haystack.windows(needle.len()).any(|w| w == needle)
}
