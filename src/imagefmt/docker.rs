use super::{Extractor, FileMatcher, LayerFiles};
use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::io::{Cursor, Read};
use tar::Archive;
use tracing::{debug, warn};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Extracts files from Docker image layers.
///
/// Layers may be plain tar streams or gzip-compressed ones; the format is
/// detected from the first bytes of the stream. Only regular files are
/// returned. Files larger than `max_file_size` are skipped with a warning.
#[derive(Debug, Clone)]
pub struct TarExtractor {
    max_file_size: u64,
}

impl TarExtractor {
    pub fn new(max_file_size: u64) -> Self {
        Self { max_file_size }
    }
}

impl Extractor for TarExtractor {
    fn extract_files(&self, layer: &mut dyn Read, matcher: &dyn FileMatcher) -> Result<LayerFiles> {
        let mut magic = Vec::with_capacity(GZIP_MAGIC.len());
        (&mut *layer)
            .take(GZIP_MAGIC.len() as u64)
            .read_to_end(&mut magic)
            .map_err(|e| Error::Extraction(format!("failed to read layer header: {}", e)))?;

        let compressed = magic == GZIP_MAGIC;
        let stream = Cursor::new(magic).chain(layer);
        let source: Box<dyn Read + '_> = if compressed {
            Box::new(GzDecoder::new(stream))
        } else {
            Box::new(stream)
        };

        let mut archive = Archive::new(source);
        let entries = archive
            .entries()
            .map_err(|e| Error::Extraction(format!("failed to read tar entries: {}", e)))?;

        let mut files = LayerFiles::new();
        for entry in entries {
            let mut entry =
                entry.map_err(|e| Error::Extraction(format!("failed to read tar entry: {}", e)))?;

            if !entry.header().entry_type().is_file() {
                continue;
            }

            let path = match entry.path() {
                Ok(p) => normalize_path(&p.to_string_lossy()),
                Err(e) => {
                    warn!(error = %e, "skipping tar entry with unreadable path");
                    continue;
                }
            };

            if !matcher.matches(&path) {
                continue;
            }

            let size = entry.header().size().unwrap_or(0);
            if size > self.max_file_size {
                warn!(
                    path = %path,
                    size = size,
                    max = self.max_file_size,
                    "skipping oversized file in layer"
                );
                continue;
            }

            let mut contents = Vec::with_capacity(size as usize);
            entry
                .read_to_end(&mut contents)
                .map_err(|e| Error::Extraction(format!("failed to read {}: {}", path, e)))?;

            debug!(path = %path, size = contents.len(), "extracted file from layer");
            files.insert(path, contents);
        }

        Ok(files)
    }
}

fn normalize_path(path: &str) -> String {
    path.trim_start_matches("./").trim_start_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imagefmt::PrefixMatcher;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn build_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *contents).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_extract_plain_tar() {
        let layer = build_tar(&[
            ("var/lib/dpkg/status", &b"Package: bash\n"[..]),
            ("etc/hostname", &b"box\n"[..]),
        ]);
        let extractor = TarExtractor::new(1024);
        let matcher = PrefixMatcher::new(["var/lib/dpkg/"]);

        let files = extractor
            .extract_files(&mut Cursor::new(layer), &matcher)
            .unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(files.get("var/lib/dpkg/status"), Some(&b"Package: bash\n"[..]));
    }

    #[test]
    fn test_extract_gzip_tar() {
        let layer = gzip(&build_tar(&[("./etc/os-release", &b"ID=debian\n"[..])]));
        let extractor = TarExtractor::new(1024);

        let files = extractor
            .extract_files(&mut Cursor::new(layer), &|p: &str| p == "etc/os-release")
            .unwrap();

        assert_eq!(files.get("etc/os-release"), Some(&b"ID=debian\n"[..]));
    }

    #[test]
    fn test_skips_oversized_files() {
        let big = vec![b'x'; 64];
        let layer = build_tar(&[("big", big.as_slice()), ("small", &b"ok"[..])]);
        let extractor = TarExtractor::new(16);

        let files = extractor
            .extract_files(&mut Cursor::new(layer), &|_: &str| true)
            .unwrap();

        assert!(files.get("big").is_none());
        assert_eq!(files.get("small"), Some(&b"ok"[..]));
    }

    #[test]
    fn test_corrupt_gzip_is_extraction_error() {
        let mut layer = GZIP_MAGIC.to_vec();
        layer.extend_from_slice(b"definitely not deflate");
        let extractor = TarExtractor::new(1024);

        let err = extractor
            .extract_files(&mut Cursor::new(layer), &|_: &str| true)
            .unwrap_err();

        assert!(matches!(err, Error::Extraction(_)));
    }

    #[test]
    fn test_empty_stream_yields_no_files() {
        let extractor = TarExtractor::new(1024);
        let files = extractor
            .extract_files(&mut Cursor::new(Vec::new()), &|_: &str| true)
            .unwrap();
        assert!(files.is_empty());
    }
}
