use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ServerSideEncryption;
use indicatif::ParallelProgressIterator;
use rayon::prelude::*;
use url::Url;

use crate::storage_local::{collect_files_under, ensure_dir};
use crate::utils::default_bounded_progress_bar;

/// Number of workers used for parallel prefix downloads.
pub const DOWNLOAD_WORKERS: usize = 4;

/// Safety cap on the number of files a single directory-tree upload will push.
pub const MAX_UPLOAD_FILES: usize = 100;

const DEFAULT_REGION: &str = "us-east-1";

/// Split an `s3://bucket/key` URL into its bucket and key parts. The key may
/// be empty (a bare bucket), but the bucket may not.
pub fn split_s3_url(s3_url: &str) -> Result<(String, String)> {
    let s3_url = s3_url.trim();
    let stripped = s3_url
        .strip_prefix("s3://")
        .ok_or_else(|| anyhow!("Not an S3 URL - could not get bucket and key from '{}'", s3_url))?;

    let (bucket, key) = match stripped.split_once('/') {
        Some((bucket, key)) => (bucket, key),
        None => (stripped, ""),
    };

    if bucket.is_empty() {
        bail!("S3 URL '{}' has an empty bucket name", s3_url);
    }

    Ok((bucket.to_string(), key.to_string()))
}

#[must_use]
pub fn is_s3_url(value: &str) -> bool {
    value.trim_start().starts_with("s3://")
}

#[must_use]
pub fn is_http_url(value: &str) -> bool {
    let value = value.trim_start();
    value.starts_with("http://") || value.starts_with("https://")
}

/// One planned object transfer within a prefix download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub key: String,
    pub size: u64,
    pub target: PathBuf,
}

/// Turn an object listing into per-object download requests rooted at
/// `target_root`. Keys ending in the path separator are directory
/// placeholders, not objects, and are excluded.
pub fn plan_prefix_downloads(objects: &[(String, u64)], target_root: &Path) -> Vec<DownloadRequest> {
    objects
        .iter()
        .filter(|(key, _)| !key.ends_with('/'))
        .map(|(key, size)| DownloadRequest {
            key: key.clone(),
            size: *size,
            target: target_root.join(key),
        })
        .collect()
}

/// Synchronous S3 client used by the job runner and the scheduler helpers.
///
/// The AWS SDK is async; the wrapper owns a private tokio runtime and blocks
/// on each call so the rest of the codebase can stay sequential.
pub struct S3Client {
    runtime: tokio::runtime::Runtime,
    client: aws_sdk_s3::Client,
}

impl S3Client {
    /// Create a client. `region` overrides the SDK's default region chain;
    /// `anonymous` disables request signing for public buckets.
    pub fn new(region: Option<String>, anonymous: bool) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("Could not start async runtime for object storage")?;

        let config = runtime.block_on(async {
            let region_provider = RegionProviderChain::first_try(region.map(Region::new))
                .or_default_provider()
                .or_else(Region::new(DEFAULT_REGION));

            let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region_provider);
            if anonymous {
                loader = loader.no_credentials();
            }

            loader.load().await
        });

        Ok(S3Client {
            runtime,
            client: aws_sdk_s3::Client::new(&config),
        })
    }

    /// Probe an object without downloading it. Returns the content length in
    /// bytes, or `None` if the object does not exist.
    pub fn head_object(&self, bucket: &str, key: &str) -> Result<Option<u64>> {
        let result = self
            .runtime
            .block_on(self.client.head_object().bucket(bucket).key(key).send());

        match result {
            Ok(info) => Ok(info.content_length().map(|len| len as u64)),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(None)
                } else {
                    Err(anyhow!(
                        "Could not probe s3://{}/{}: {}",
                        bucket,
                        key,
                        service_err
                    ))
                }
            }
        }
    }

    /// Download a single object to `target`. If a local file of the same byte
    /// size already exists the transfer is skipped; content length is a cheap
    /// but non-cryptographic integrity check.
    ///
    /// # Returns
    ///
    /// The size of the file on disk after the call.
    pub fn download_object(&self, bucket: &str, key: &str, target: &Path) -> Result<u64> {
        if let Some(parent) = target.parent() {
            ensure_dir(parent)?;
        }

        if target.is_file() {
            let local_size = std::fs::metadata(target)?.len();
            if self.head_object(bucket, key)? == Some(local_size) {
                return Ok(local_size);
            }
        }

        // Reference-tree objects run to many gigabytes; stream each chunk to
        // disk instead of buffering the whole body.
        self.runtime.block_on(async {
            let mut object = self
                .client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| anyhow!("Could not download s3://{}/{}: {}", bucket, key, e))?;

            let mut file = std::fs::File::create(target)
                .with_context(|| format!("Could not create {}", target.display()))?;

            while let Some(chunk) = object.body.try_next().await.map_err(|e| {
                anyhow!("Transfer of s3://{}/{} was interrupted: {}", bucket, key, e)
            })? {
                file.write_all(&chunk)
                    .with_context(|| format!("Could not write {}", target.display()))?;
            }

            Ok::<(), anyhow::Error>(())
        })?;

        Ok(std::fs::metadata(target)?.len())
    }

    /// Download every object under a key prefix into `target_root`, preserving
    /// key paths. Transfers run on a fixed-size worker pool; the call blocks
    /// until every object has completed or any transfer has failed.
    ///
    /// # Returns
    ///
    /// The total number of bytes downloaded.
    pub fn download_prefix(&self, bucket: &str, prefix: &str, target_root: &Path) -> Result<u64> {
        let objects = self.list_objects(bucket, prefix)?;
        let plan = plan_prefix_downloads(&objects, target_root);

        if plan.is_empty() {
            return Ok(0);
        }

        // Each object gets its directory created up front so concurrent
        // workers never race on directory creation.
        for request in &plan {
            if let Some(parent) = request.target.parent() {
                ensure_dir(parent)?;
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(DOWNLOAD_WORKERS)
            .build()
            .context("Could not start download worker pool")?;

        let progress = default_bounded_progress_bar("Downloading objects", plan.len() as u64);

        let sizes = pool.install(|| {
            plan.par_iter()
                .progress_with(progress)
                .map(|request| self.download_object(bucket, &request.key, &request.target))
                .collect::<Result<Vec<u64>>>()
        })?;

        Ok(sizes.iter().sum())
    }

    /// List all objects under a prefix as (key, size) pairs.
    pub fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<(String, u64)>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(bucket).prefix(prefix);
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }

            let page = self
                .runtime
                .block_on(request.send())
                .map_err(|e| anyhow!("Could not list s3://{}/{}: {}", bucket, prefix, e))?;

            for object in page.contents() {
                if let Some(key) = object.key() {
                    objects.push((key.to_string(), object.size().unwrap_or(0) as u64));
                }
            }

            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        Ok(objects)
    }

    /// Upload one file. A `key` ending in '/' is treated as a prefix and the
    /// file's own name is appended. Server-side encryption is always
    /// requested.
    ///
    /// # Returns
    ///
    /// The remote content length, confirmed with a head request.
    pub fn upload_file(&self, path: &Path, bucket: &str, key: &str) -> Result<u64> {
        let key = if key.ends_with('/') {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| anyhow!("Path {} has no file name", path.display()))?;
            format!("{key}{name}")
        } else {
            key.to_string()
        };

        self.runtime.block_on(async {
            let body = ByteStream::from_path(path)
                .await
                .with_context(|| format!("Could not open {} for upload", path.display()))?;

            self.client
                .put_object()
                .bucket(bucket)
                .key(&key)
                .server_side_encryption(ServerSideEncryption::Aes256)
                .body(body)
                .send()
                .await
                .map_err(|e| anyhow!("Could not upload {} to s3://{}/{}: {}", path.display(), bucket, key, e))?;

            Ok::<(), anyhow::Error>(())
        })?;

        self.head_object(bucket, &key)?
            .ok_or_else(|| anyhow!("Uploaded object s3://{}/{} is missing", bucket, key))
    }

    /// Upload a directory tree under a key prefix, preserving the layout
    /// relative to `dir`. At most [`MAX_UPLOAD_FILES`] files are pushed.
    ///
    /// # Returns
    ///
    /// The total number of bytes uploaded.
    pub fn upload_tree(&self, dir: &Path, bucket: &str, key_root: &str) -> Result<u64> {
        let key_root = key_root.trim_end_matches('/');
        let files = collect_files_under(dir, MAX_UPLOAD_FILES)?;

        let mut total = 0;
        for file in &files {
            let relative = file
                .strip_prefix(dir)
                .with_context(|| format!("File {} escaped upload root", file.display()))?;
            let key = format!("{}/{}", key_root, relative.display());
            total += self.upload_file(file, bucket, &key)?;
        }

        Ok(total)
    }

    pub fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.runtime
            .block_on(self.client.delete_object().bucket(bucket).key(key).send())
            .map_err(|e| anyhow!("Could not delete s3://{}/{}: {}", bucket, key, e))?;

        Ok(())
    }
}

/// Download a file over plain HTTP(S) into `target_dir`, named by the final
/// path segment of the URL.
pub fn http_download(url: &Url, target_dir: &Path) -> Result<PathBuf> {
    ensure_dir(target_dir)?;

    let filename = crate::utils::basename_from_url(url)?;
    let target = target_dir.join(filename);

    let mut response = reqwest::blocking::get(url.as_str())
        .and_then(reqwest::blocking::Response::error_for_status)
        .with_context(|| format!("Could not download {}", url))?;

    let mut file = std::fs::File::create(&target)
        .with_context(|| format!("Could not create {}", target.display()))?;
    response
        .copy_to(&mut file)
        .with_context(|| format!("Transfer of {} was interrupted", url))?;

    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_s3_url() {
        let (bucket, key) = split_s3_url("s3://genome-refs/hg38/v8/").unwrap();
        assert_eq!(bucket, "genome-refs");
        assert_eq!(key, "hg38/v8/");
    }

    #[test]
    fn test_split_s3_url_bare_bucket() {
        let (bucket, key) = split_s3_url("s3://genome-refs").unwrap();
        assert_eq!(bucket, "genome-refs");
        assert_eq!(key, "");
    }

    #[test]
    fn test_split_s3_url_rejects_other_schemes() {
        assert!(split_s3_url("https://example.com/file.bed").is_err());
        assert!(split_s3_url("/local/path").is_err());
        assert!(split_s3_url("s3:///missing-bucket").is_err());
    }

    #[test]
    fn test_url_scheme_probes() {
        assert!(is_s3_url("s3://bucket/key"));
        assert!(is_s3_url("  s3://bucket/key"));
        assert!(!is_s3_url("http://example.com"));
        assert!(is_http_url("https://example.com/x.csv"));
        assert!(!is_http_url("/ephemeral/inputs/x.csv"));
    }

    #[test]
    fn test_http_download_writes_full_body_to_disk() {
        use std::io::Read;
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        // Large enough to span several transfer chunks.
        let body = vec![b'A'; 256 * 1024];
        let expected_len = body.len() as u64;
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut request = [0u8; 4096];
            let _ = sock.read(&mut request);
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            std::io::Write::write_all(&mut sock, header.as_bytes()).unwrap();
            std::io::Write::write_all(&mut sock, &body).unwrap();
        });

        let tmp = tempfile::TempDir::new().unwrap();
        let url = Url::parse(&format!("http://{addr}/inputs/fastq_list.csv")).unwrap();

        let target = http_download(&url, tmp.path()).unwrap();
        server.join().unwrap();

        assert_eq!(target.file_name().unwrap(), "fastq_list.csv");
        assert_eq!(std::fs::metadata(&target).unwrap().len(), expected_len);
        let contents = std::fs::read(&target).unwrap();
        assert!(contents.iter().all(|b| *b == b'A'));
    }

    #[test]
    fn test_http_download_fails_when_nothing_listens() {
        let tmp = tempfile::TempDir::new().unwrap();
        // Port 9 (discard) has no listener; the connection is refused.
        let url = Url::parse("http://127.0.0.1:9/inputs/fastq_list.csv").unwrap();

        assert!(http_download(&url, tmp.path()).is_err());
        assert!(!tmp.path().join("fastq_list.csv").exists());
    }

    #[test]
    fn test_plan_prefix_downloads_excludes_placeholders() {
        let objects = vec![
            ("hg38/".to_string(), 0),
            ("hg38/hash_table.bin".to_string(), 1_024),
            ("hg38/meta/".to_string(), 0),
            ("hg38/meta/info.json".to_string(), 64),
        ];

        let plan = plan_prefix_downloads(&objects, Path::new("/ephemeral"));

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].key, "hg38/hash_table.bin");
        assert_eq!(plan[0].target, PathBuf::from("/ephemeral/hg38/hash_table.bin"));
        assert_eq!(plan[1].key, "hg38/meta/info.json");

        let total: u64 = plan.iter().map(|r| r.size).sum();
        assert_eq!(total, 1_088);
    }
}
