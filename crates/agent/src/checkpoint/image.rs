//! Image — wrap a checkpoint tarball into a single-layer OCI image.
//!
//! The layer is the tarball as-is (uncompressed tar media type), so the
//! layer digest and the rootfs diff ID are the same value. The manifest
//! carries the runtime's checkpoint annotation so the restore side
//! recognizes the image as a restore source.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use oci_spec::image::{
    Arch, DescriptorBuilder, ImageConfigurationBuilder, ImageManifestBuilder, MediaType, Os,
    RootFsBuilder,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;

use super::PAYLOAD_CONTAINER;

/// Annotation the runtime uses to locate the dumped container inside the
/// image on restore.
pub const CHECKPOINT_NAME_ANNOTATION: &str = "io.kubernetes.cri-o.annotations.checkpoint.name";

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("failed to read checkpoint tarball: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to assemble image: {0}")]
    Spec(#[from] oci_spec::OciSpecError),
    #[error("failed to serialize image: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// An assembled checkpoint image, ready to hand to the push service. The
/// layer stays on disk at `layer_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointImage {
    pub manifest_json: Vec<u8>,
    pub config_json: Vec<u8>,
    pub layer_path: PathBuf,
}

fn host_arch() -> Arch {
    match std::env::consts::ARCH {
        "aarch64" => Arch::ARM64,
        _ => Arch::Amd64,
    }
}

/// Stream-hash the tarball; returns (sha256 digest string, size in bytes).
async fn digest_file(path: &Path) -> Result<(String, i64), ImageError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut size: i64 = 0;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as i64;
    }
    Ok((format!("sha256:{:x}", hasher.finalize()), size))
}

/// Package the tarball at `tarball` into an OCI image.
pub async fn package_tarball(
    tarball: &Path,
    created_at: DateTime<Utc>,
) -> Result<CheckpointImage, ImageError> {
    let (digest, size) = digest_file(tarball).await?;

    let configuration = ImageConfigurationBuilder::default()
        .architecture(host_arch())
        .os(Os::Linux)
        .created(created_at.to_rfc3339())
        .rootfs(
            RootFsBuilder::default()
                .typ("layers".to_string())
                .diff_ids(vec![digest.clone()])
                .build()?,
        )
        .build()?;
    let config_json = serde_json::to_vec(&configuration)?;

    let config_descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageConfig)
        .digest(format!("sha256:{:x}", Sha256::digest(&config_json)))
        .size(config_json.len() as i64)
        .build()?;

    let layer_descriptor = DescriptorBuilder::default()
        .media_type(MediaType::ImageLayer)
        .digest(digest)
        .size(size)
        .build()?;

    let mut annotations = HashMap::new();
    annotations.insert(
        CHECKPOINT_NAME_ANNOTATION.to_string(),
        PAYLOAD_CONTAINER.to_string(),
    );

    let manifest = ImageManifestBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageManifest)
        .config(config_descriptor)
        .layers(vec![layer_descriptor])
        .annotations(annotations)
        .build()?;
    let manifest_json = serde_json::to_vec(&manifest)?;

    Ok(CheckpointImage {
        manifest_json,
        config_json,
        layer_path: tarball.to_path_buf(),
    })
}
