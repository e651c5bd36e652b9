use std::{io, path::Path};

use tokio::fs;

use crate::error::{IoContext, Result};

/// Write `contents` next to `path` and rename it into place, so readers only
/// ever see the old or the new file.
pub async fn write_atomic(path: &Path, contents: &[u8], what: &str) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".tmp_{file_name}"));

    fs::write(&tmp, contents)
        .await
        .during(|| format!("write {what} to {}", tmp.display()))?;

    if let Err(err) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err::<(), _>(err).during(|| format!("move {what} into {}", path.display()));
    }

    Ok(())
}

/// Read a file, mapping a missing file to `None`.
pub async fn read_optional(path: &Path, what: &str) -> Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err::<Option<Vec<u8>>, _>(err)
            .during(|| format!("read {what} from {}", path.display())),
    }
}

/// Remove a file, reporting whether it existed.
pub async fn remove_optional(path: &Path, what: &str) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err::<bool, _>(err).during(|| format!("remove {what} {}", path.display())),
    }
}

/// A name usable as a single path component.
pub fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with(".tmp_")
        && !name
            .chars()
            .any(|c| matches!(c, '/' | '\\' | '\0') || c.is_control())
}
