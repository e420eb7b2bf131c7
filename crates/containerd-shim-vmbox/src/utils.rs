use std::path::{Path, PathBuf};

use crate::{Error, Result};

pub trait WithTimeout {
    type Output;
    fn with_timeout(
        self,
        t: std::time::Duration,
    ) -> impl std::future::Future<Output = Option<Self::Output>> + Send;
}

impl<F: std::future::Future + Send> WithTimeout for F {
    type Output = F::Output;
    async fn with_timeout(self, t: std::time::Duration) -> Option<Self::Output> {
        tokio::time::timeout(t, self).await.ok()
    }
}

/// Checks the MUST and MUST NOT from the OCI runtime specification for
/// create-time parameters: a non-empty container id and an existing bundle
/// directory.
pub fn valid_create_params(container_id: &str, bundle: &str) -> Result<PathBuf> {
    if container_id.is_empty() {
        return Err(Error::InvalidArgument("missing container id".to_string()));
    }
    if bundle.is_empty() {
        return Err(Error::InvalidArgument("missing bundle path".to_string()));
    }
    let path = Path::new(bundle);
    let meta = std::fs::metadata(path)
        .map_err(|err| Error::InvalidArgument(format!("invalid bundle path {bundle}: {err}")))?;
    if !meta.is_dir() {
        return Err(Error::InvalidArgument(format!(
            "invalid bundle path {bundle}: not a directory"
        )));
    }
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_id_and_bundle() {
        assert!(matches!(
            valid_create_params("", "/tmp"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            valid_create_params("c1", ""),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_non_directory_bundle() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = valid_create_params("c1", file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn accepts_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = valid_create_params("c1", dir.path().to_str().unwrap()).unwrap();
        assert_eq!(path, dir.path());
    }
}
