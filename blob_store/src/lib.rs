use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bytes::{Bytes, BytesMut};
use futures::{stream::BoxStream, StreamExt};
use object_store::{
    aws::AmazonS3Builder,
    parse_url,
    path::Path,
    ObjectStore,
    ObjectStoreScheme,
    WriteMultipart,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::io::ReaderStream;
use tracing::info;
use url::Url;

const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub region: String,
    pub endpoint: Option<String>,
    #[serde(default = "default_force_path_style")]
    pub force_path_style: bool,
    pub access_key: String,
    pub secret_key: String,
}

fn default_force_path_style() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    /// Where blobs land, e.g. "s3://bucket" or "file:///var/lib/filehaven/blobs".
    pub path: String,
    pub s3: Option<S3Config>,
}

impl BlobStorageConfig {
    pub fn new(path: &str) -> Self {
        BlobStorageConfig {
            path: format!("file://{}", path),
            s3: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub url: String,
    pub size_bytes: u64,
    pub sha256_hash: String,
}

#[derive(Clone)]
pub struct BlobStorage {
    object_store: Arc<dyn ObjectStore>,
    path: Path,
}

impl BlobStorage {
    pub fn new(config: &BlobStorageConfig) -> Result<Self> {
        let (object_store, path) = Self::build_object_store(&config.path, config.s3.as_ref())?;
        info!("using blob store path: {}", config.path);
        Ok(Self {
            object_store: Arc::new(object_store),
            path,
        })
    }

    fn build_object_store(
        url_str: &str,
        s3: Option<&S3Config>,
    ) -> Result<(Box<dyn ObjectStore>, Path)> {
        let url = url_str
            .parse::<Url>()
            .with_context(|| format!("invalid blob store url {}", url_str))?;
        let (scheme, _) = ObjectStoreScheme::parse(&url)?;
        match scheme {
            ObjectStoreScheme::AmazonS3 => {
                let s3 =
                    s3.ok_or_else(|| anyhow!("s3 credentials are required for {}", url_str))?;
                let mut builder = AmazonS3Builder::new()
                    .with_url(url_str)
                    .with_region(&s3.region)
                    .with_access_key_id(&s3.access_key)
                    .with_secret_access_key(&s3.secret_key)
                    .with_virtual_hosted_style_request(!s3.force_path_style);
                if let Some(endpoint) = &s3.endpoint {
                    builder = builder.with_endpoint(endpoint.clone());
                    // For supporting localstack/minio for testing
                    if endpoint.starts_with("http://") {
                        builder = builder.with_allow_http(true);
                    }
                }
                let store = builder.build()?;
                let path = Path::parse(url.path().trim_start_matches('/'))?;
                Ok((Box::new(store), path))
            }
            _ => Ok(parse_url(&url)?),
        }
    }

    /// Streams `data` to the object store under `key`, hashing the bytes as
    /// they pass through. Multipart transfer keeps memory use bounded
    /// regardless of file size.
    pub async fn put(
        &self,
        key: &str,
        data: impl futures::Stream<Item = Result<Bytes>> + Send + Unpin,
    ) -> Result<PutResult> {
        let mut hasher = Sha256::new();
        let mut hashed_stream = data.map(|item| {
            item.map(|bytes| {
                hasher.update(&bytes);
                bytes
            })
        });

        let path = self.path.child(key);
        let m = self.object_store.put_multipart(&path).await?;
        let mut w = WriteMultipart::new(m);
        let mut size_bytes = 0;
        while let Some(chunk) = hashed_stream.next().await {
            w.wait_for_capacity(1).await?;
            let chunk = chunk?;
            size_bytes += chunk.len() as u64;
            w.write(&chunk);
        }
        w.finish().await?;

        let hash = format!("{:x}", hasher.finalize());
        Ok(PutResult {
            url: path.to_string(),
            size_bytes,
            sha256_hash: hash,
        })
    }

    /// Uploads a local file under `key`, reading it in chunks.
    pub async fn put_file(&self, key: &str, file_path: &str) -> Result<PutResult> {
        let file = tokio::fs::File::open(file_path)
            .await
            .with_context(|| format!("opening {} for upload", file_path))?;
        let stream = ReaderStream::with_capacity(file, UPLOAD_CHUNK_SIZE)
            .map(|chunk| chunk.map_err(anyhow::Error::from));
        self.put(key, stream).await
    }

    pub async fn get(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        let location = self.path.child(key);
        let get_result = self
            .object_store
            .get(&location)
            .await
            .map_err(|e| anyhow!("can't get object {:?}: {:?}", location, e))?;
        let stream = get_result
            .into_stream()
            .map(move |chunk| chunk.map_err(|e| anyhow!("error reading object: {:?}", e)));
        Ok(Box::pin(stream))
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.object_store.delete(&self.path.child(key)).await?;
        Ok(())
    }

    pub async fn read_bytes(&self, key: &str) -> Result<Bytes> {
        let mut reader = self.get(key).await?;
        let mut bytes = BytesMut::new();
        while let Some(chunk) = reader.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        Ok(bytes.into())
    }
}
