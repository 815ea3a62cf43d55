//! Writes bundle artifacts and their sourcemaps under the output root.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use kiln_types::{Artifact, KilnError, Result};

fn write_failed(path: &Path, err: std::io::Error) -> KilnError {
    KilnError::WriteFailed {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Write `code` to `<output_root>/<output>`, creating intermediate directories.
///
/// With a sourcemap, the map is written to `<output>.map` next to the artifact
/// and the artifact gets a trailing `sourceMappingURL` comment pointing at it.
pub async fn write_artifact(
    output_root: &Path,
    output: &str,
    mut code: Vec<u8>,
    sourcemap: Option<&str>,
) -> Result<Artifact> {
    let path = output_root.join(output);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| write_failed(parent, e))?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let map_path = match sourcemap {
        Some(map) => {
            let map_path = PathBuf::from(format!("{}.map", path.display()));
            if !code.ends_with(b"\n") {
                code.push(b'\n');
            }
            code.extend_from_slice(format!("//# sourceMappingURL={}.map\n", file_name).as_bytes());
            tokio::fs::write(&map_path, map)
                .await
                .map_err(|e| write_failed(&map_path, e))?;
            Some(map_path)
        }
        None => None,
    };

    tokio::fs::write(&path, &code)
        .await
        .map_err(|e| write_failed(&path, e))?;

    Ok(Artifact {
        content_hash: content_hash(&code),
        size: code.len() as u64,
        path,
        sourcemap: map_path,
    })
}

/// Hex-encoded SHA-256 of the given bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
