use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::{GzDecoder, GzEncoder};

use crate::error::{Error, Result};

/// Gzip `src` lazily: bytes are pulled from `src` only as the consumer reads,
/// so a stalled upload stops the remote read too.
pub fn gzip_stream<R: Read>(src: R) -> GzEncoder<R> {
    GzEncoder::new(src, Compression::default())
}

/// Decompress `src` into `dest`, creating parent directories. The file is
/// written beside `dest` and renamed into place once complete.
pub fn gunzip_to_file<R: Read>(src: R, dest: &Path) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    }
    let file_name = dest
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::msg(format!("invalid staging path {}", dest.display())))?;
    let tmp = dest.with_file_name(format!(".{file_name}.part.{}", std::process::id()));

    let written = (|| -> Result<u64> {
        let file = fs::File::create(&tmp)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", tmp.display())))?;
        let mut out = BufWriter::new(file);
        let mut decoder = GzDecoder::new(src);
        let n = io::copy(&mut decoder, &mut out)
            .map_err(|e| Error::msg(format!("failed to decompress into {}: {e}", dest.display())))?;
        out.flush()
            .map_err(|e| Error::msg(format!("failed to write {}: {e}", tmp.display())))?;
        Ok(n)
    })();

    match written {
        Ok(n) => {
            fs::rename(&tmp, dest).map_err(|e| {
                Error::msg(format!(
                    "failed to rename {} -> {}: {e}",
                    tmp.display(),
                    dest.display()
                ))
            })?;
            Ok(n)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}
