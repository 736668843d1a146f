//! Compresses the finished image next to itself and removes the original.
use crate::error::CloneError;
use crate::job::Compression;
use bzip2::write::BzEncoder;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const BUFFER_SIZE: usize = 1024 * 1024; // 1 MiB

/// The path of `image` once compressed with `mode`.
pub fn compressed_path(image: &Path, mode: Compression) -> PathBuf {
    match mode.extension() {
        Some(ext) => {
            let mut name = image.as_os_str().to_os_string();
            name.push(".");
            name.push(ext);
            PathBuf::from(name)
        }
        None => image.to_path_buf(),
    }
}

/// Replaces `image` with its compressed form and returns the new path.
///
/// `on_progress` receives the bytes read so far and the total to read, first
/// with nothing read yet. On failure the partial output is removed and `image`
/// is left untouched.
pub fn run<F>(image: &Path, mode: Compression, mut on_progress: F) -> Result<PathBuf, CloneError>
where
    F: FnMut(u64, u64),
{
    let output = compressed_path(image, mode);
    if mode == Compression::None {
        return Ok(output);
    }

    let failed = |source| CloneError::CompressFailed {
        path: image.to_path_buf(),
        source,
    };

    info!("compressing {} with {mode}", image.display());
    let result = (|| -> io::Result<()> {
        let input = File::open(image)?;
        let total = input.metadata()?.len();
        on_progress(0, total);
        let mut on_progress = |done| on_progress(done, total);
        let reader = BufReader::new(input);
        let writer = BufWriter::new(File::create(&output)?);
        match mode {
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(writer, flate2::Compression::default());
                pump(reader, &mut encoder, &mut on_progress)?;
                encoder.finish()?.flush()
            }
            Compression::Bzip2 => {
                let mut encoder = BzEncoder::new(writer, bzip2::Compression::default());
                pump(reader, &mut encoder, &mut on_progress)?;
                encoder.finish()?.flush()
            }
            Compression::None => Ok(()),
        }
    })();

    if let Err(e) = result {
        if let Err(rm) = fs::remove_file(&output) {
            warn!("could not remove {}: {rm}", output.display());
        }
        return Err(failed(e));
    }
    fs::remove_file(image).map_err(failed)?;
    info!("image written to {}", output.display());
    Ok(output)
}

fn pump<R: Read, W: Write>(
    mut reader: R,
    writer: &mut W,
    on_progress: &mut impl FnMut(u64),
) -> io::Result<()> {
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buffer[..n])?;
        total += n as u64;
        on_progress(total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    #[test]
    fn gzip_replaces_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("pi.img");
        fs::write(&image, vec![7u8; 3 * BUFFER_SIZE + 17]).unwrap();

        let mut seen = 0;
        let out = run(&image, Compression::Gzip, |done, total| {
            assert_eq!(total, 3 * BUFFER_SIZE as u64 + 17);
            seen = done;
        })
        .unwrap();

        assert_eq!(out, dir.path().join("pi.img.gz"));
        assert!(!image.exists());
        assert_eq!(seen, 3 * BUFFER_SIZE as u64 + 17);
        let mut restored = Vec::new();
        GzDecoder::new(File::open(&out).unwrap())
            .read_to_end(&mut restored)
            .unwrap();
        assert_eq!(restored.len(), 3 * BUFFER_SIZE + 17);
    }

    #[test]
    fn bzip2_uses_its_own_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("pi.img");
        fs::write(&image, b"boot").unwrap();
        let out = run(&image, Compression::Bzip2, |_, _| {}).unwrap();
        assert_eq!(out, dir.path().join("pi.img.bz2"));
        assert!(out.exists());
    }

    #[test]
    fn missing_image_keeps_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("missing.img");
        let err = run(&image, Compression::Gzip, |_, _| {}).unwrap_err();
        assert_eq!(err.exit_code(), 24);
        assert!(!dir.path().join("missing.img.gz").exists());
    }
}
