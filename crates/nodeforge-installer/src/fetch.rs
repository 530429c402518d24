//! Artifact download and unpacking

use crate::error::{InstallerError, Result};
use async_compression::tokio::bufread::GzipDecoder;
use futures::StreamExt;
use nodeforge_workflow::StepContext;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio_tar::Archive;
use tracing::{debug, info};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Stream `url` into `dest`
///
/// Data lands in `<dest>.part` first and is renamed into place once
/// complete, so an interrupted download never looks like a finished one.
pub async fn download_to(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    ctx: &StepContext,
) -> Result<u64> {
    let response = ctx.guard(client.get(url).send()).await??;
    if !response.status().is_success() {
        return Err(InstallerError::HttpStatus {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    let content_length = response.content_length();
    info!(url = %url, content_length = ?content_length, "Download started");

    let partial = partial_path(dest);
    let mut file = fs::File::create(&partial)
        .await
        .map_err(InstallerError::io(&partial))?;
    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;
    let mut last_report = Instant::now();

    while let Some(chunk) = ctx.guard(stream.next()).await? {
        let chunk = chunk?;
        file.write_all(&chunk)
            .await
            .map_err(InstallerError::io(&partial))?;
        downloaded += chunk.len() as u64;

        if last_report.elapsed() > PROGRESS_INTERVAL {
            let pct = content_length
                .filter(|t| *t > 0)
                .map(|t| (downloaded * 100) / t)
                .unwrap_or(0);
            info!(downloaded = downloaded, percent = pct, "Download progress");
            last_report = Instant::now();
        }
    }

    file.sync_all().await.map_err(InstallerError::io(&partial))?;
    drop(file);
    fs::rename(&partial, dest)
        .await
        .map_err(InstallerError::io(dest))?;

    info!(bytes = downloaded, path = %dest.display(), "Download complete");
    Ok(downloaded)
}

/// Copy a file into place
///
/// Like [`download_to`], the copy goes to `<to>.part` and is renamed once
/// complete; an interrupted copy never leaves a truncated `to` behind.
pub async fn copy_file(from: &Path, to: &Path) -> Result<u64> {
    match fs::try_exists(from).await {
        Ok(true) => {}
        Ok(false) => return Err(InstallerError::MissingArtifact(from.to_path_buf())),
        Err(e) => return Err(InstallerError::io(from)(e)),
    }
    let partial = partial_path(to);
    let copied = fs::copy(from, &partial)
        .await
        .map_err(InstallerError::io(&partial))?;
    fs::rename(&partial, to)
        .await
        .map_err(InstallerError::io(to))?;
    Ok(copied)
}

/// Unpack a gzip-compressed tarball into `dest`
pub async fn unpack_tar_gz(archive: &Path, dest: &Path, ctx: &StepContext) -> Result<()> {
    let file = fs::File::open(archive)
        .await
        .map_err(InstallerError::io(archive))?;
    let decoder = GzipDecoder::new(BufReader::new(file));
    let mut tar = Archive::new(decoder);

    debug!(archive = %archive.display(), dest = %dest.display(), "Unpacking archive");
    ctx.guard(tar.unpack(dest))
        .await?
        .map_err(InstallerError::io(archive))
}

#[cfg(test)]
pub(crate) mod testing {
    use async_compression::tokio::write::GzipEncoder;
    use std::path::Path;
    use tokio::io::AsyncWriteExt;

    /// Write a `.tar.gz` holding `files` as `(path, contents)` pairs
    pub async fn write_tar_gz(dest: &Path, files: &[(&str, &[u8])]) {
        let file = tokio::fs::File::create(dest).await.unwrap();
        let mut builder = tokio_tar::Builder::new(GzipEncoder::new(file));

        for (path, contents) in files {
            let mut header = tokio_tar::Header::new_gnu();
            header.set_path(path).unwrap();
            header.set_size(contents.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append(&header, *contents).await.unwrap();
        }

        let mut encoder = builder.into_inner().await.unwrap();
        encoder.shutdown().await.unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/var/lib/nodeforge/cni.tgz")),
            PathBuf::from("/var/lib/nodeforge/cni.tgz.part")
        );
    }

    #[tokio::test]
    async fn test_unpack_tar_gz() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("cni.tar.gz");
        testing::write_tar_gz(&archive, &[("bin/bridge", b"#!/bin/sh\n")]).await;

        let dest = dir.path().join("extracted");
        fs::create_dir_all(&dest).await.unwrap();
        unpack_tar_gz(&archive, &dest, &StepContext::new()).await.unwrap();

        let contents = fs::read_to_string(dest.join("bin/bridge")).await.unwrap();
        assert_eq!(contents, "#!/bin/sh\n");
    }

    #[tokio::test]
    async fn test_unpack_corrupt_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("broken.tar.gz");
        fs::write(&archive, b"not gzip at all").await.unwrap();

        let err = unpack_tar_gz(&archive, dir.path(), &StepContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InstallerError::Io { .. }));
    }

    #[tokio::test]
    async fn test_copy_replaces_stale_partial() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("runc.amd64");
        let to = dir.path().join("artifact");
        std::fs::write(&from, b"runc binary").unwrap();
        // Left behind by an interrupted earlier copy
        std::fs::write(partial_path(&to), b"runc bi").unwrap();

        let copied = copy_file(&from, &to).await.unwrap();
        assert_eq!(copied, 11);
        assert_eq!(std::fs::read(&to).unwrap(), b"runc binary");
        assert!(!partial_path(&to).exists());
    }

    #[tokio::test]
    async fn test_failed_copy_leaves_no_destination() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("runc.amd64");
        let to = dir.path().join("artifact");
        std::fs::write(&from, b"runc binary").unwrap();
        // The staging file cannot be written
        std::fs::create_dir(partial_path(&to)).unwrap();

        assert!(matches!(
            copy_file(&from, &to).await,
            Err(InstallerError::Io { .. })
        ));
        assert!(!to.exists());
    }

    #[tokio::test]
    async fn test_copy_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = copy_file(&dir.path().join("nope"), &dir.path().join("dest"))
            .await
            .unwrap_err();
        assert!(matches!(err, InstallerError::MissingArtifact(_)));
    }
}
