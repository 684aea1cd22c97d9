//! File hashing, used to check a saved image against the MD5 the API reported.

use std::cmp::{max, min};
use std::path::Path;

use digest::Digest;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

const MAX_BUF_SIZE: usize = 2 * 1024 * 1024; // 2MB

/// Hash the file at `filepath` with `D`, returning lowercase hex.
///
/// Reading stays on the async runtime, hashing runs on the rayon pool.
pub async fn hash_file<D>(filepath: impl AsRef<Path>) -> std::io::Result<String>
where
    D: Digest + Send + 'static,
{
    let mut file = File::open(filepath).await?;
    let file_size = usize::try_from(file.metadata().await?.len()).unwrap_or(MAX_BUF_SIZE);

    let mut hasher = D::new();
    let mut buf = vec![0u8; max(1, min(MAX_BUF_SIZE, file_size))];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        (hasher, buf) = tokio_rayon::spawn(move || {
            hasher.update(&buf[..n]);
            (hasher, buf)
        })
        .await;
    }

    Ok(base16ct::lower::encode_string(&hasher.finalize()))
}

/// `true` if the MD5 of the file at `filepath` is `expected` (hex, any case).
pub async fn md5_matches(filepath: impl AsRef<Path>, expected: &str) -> std::io::Result<bool> {
    let actual = hash_file::<md5::Md5>(filepath).await?;
    Ok(actual.eq_ignore_ascii_case(expected))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    // see: https://en.wikipedia.org/wiki/MD5#MD5_hashes
    const FOX_MD5: &str = "9e107d9d372bb6826bd81d3542a419d6";

    #[tokio::test]
    async fn test_md5_hash_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let hash = hash_file::<md5::Md5>(&file).await.unwrap();
        assert_eq!(hash, "d41d8cd98f00b204e9800998ecf8427e");

        file.write_all(b"The quick brown fox jumps over the lazy dog")
            .unwrap();
        file.flush().unwrap();
        let hash = hash_file::<md5::Md5>(&file).await.unwrap();
        assert_eq!(hash, FOX_MD5);
    }

    #[tokio::test]
    async fn test_md5_matches() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"The quick brown fox jumps over the lazy dog")
            .unwrap();
        file.flush().unwrap();

        assert!(md5_matches(&file, FOX_MD5).await.unwrap());
        assert!(md5_matches(&file, &FOX_MD5.to_uppercase()).await.unwrap());
        assert!(!md5_matches(&file, "wrong").await.unwrap());
        assert!(md5_matches("/no/such/file", FOX_MD5).await.is_err());
    }
}
