use std::fs::File;
use std::io::Read;
use std::path::Path;

const TFLITE_MAGIC: &[u8; 4] = b"TFL3";

/// Checks that `path` names a readable, non-empty model file. Returns its
/// size in bytes.
pub(super) fn check_model_file(path: &Path) -> Result<u64, String> {
    let metadata = std::fs::metadata(path)
        .map_err(|_| format!("Model file does not exist at path: {}", path.display()))?;
    if !metadata.is_file() {
        return Err(format!("Model path is not a regular file: {}", path.display()));
    }

    let mut file = File::open(path)
        .map_err(|e| format!("Cannot read model file {}: {}", path.display(), e))?;
    if metadata.len() == 0 {
        return Err(format!("Model file is empty: {}", path.display()));
    }

    if has_extension(path, "tflite") {
        let mut header = [0u8; 8];
        let read = file
            .read(&mut header)
            .map_err(|e| format!("Cannot read model file {}: {}", path.display(), e))?;
        let header = &header[..read];
        // Flatbuffer identifier sits after the root offset; older exports put it first.
        let tagged = header.get(4..8) == Some(&TFLITE_MAGIC[..])
            || header.get(0..4) == Some(&TFLITE_MAGIC[..]);
        if !tagged {
            return Err(format!("Invalid tflite file format: {}", path.display()));
        }
    }

    Ok(metadata.len())
}

fn has_extension(path: &Path, wanted: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(wanted))
}
