//! Container control-plane seam and bounded output capture.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Result;

/// A host directory bound into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Everything needed to create one execution container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub work_dir: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<BindMount>,
    /// Keep stdin open until the first attach detaches
    pub open_stdin: bool,
    pub network_enabled: bool,
    pub read_only_rootfs: bool,
    pub security_opt: Vec<String>,
    pub cap_drop: Vec<String>,
    /// OCI runtime; `None` uses the daemon default
    pub runtime: Option<String>,
    /// Mount point to tmpfs options
    pub tmpfs: BTreeMap<String, String>,
    pub shm_size: u64,
    pub memory_bytes: u64,
    pub memory_swap_bytes: u64,
    pub nano_cpus: u64,
    pub pids_limit: u64,
}

/// Demultiplexed container logs, each stream capped independently.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerLogs {
    pub stdout: CappedOutput,
    pub stderr: CappedOutput,
    /// Set when reading stopped early; whatever was read is still kept
    pub error: Option<String>,
}

/// Container lifecycle operations used by the container backend.
///
/// Implementations must be safe to call concurrently for different
/// containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the runtime name (e.g., "docker-cli")
    fn name(&self) -> &str;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create a stopped container and return its ID.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Deliver `input` to the container's stdin and close it.
    async fn attach_stdin(&self, id: &str, input: &str) -> Result<()>;

    /// Block until the container stops and return its exit status.
    async fn wait(&self, id: &str) -> Result<i64>;

    /// Send SIGKILL.
    async fn kill(&self, id: &str) -> Result<()>;

    /// Force-remove the container and its anonymous volumes.
    async fn remove(&self, id: &str) -> Result<()>;

    /// Read both output streams, keeping at most `limit` bytes of each.
    async fn logs(&self, id: &str, limit: u64) -> Result<ContainerLogs>;
}

/// Bytes captured from a stream with an upper bound.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CappedOutput {
    pub bytes: Vec<u8>,
    /// Bytes seen on the stream, including those discarded
    pub total: u64,
}

impl CappedOutput {
    pub fn truncated(&self) -> bool {
        self.total > self.bytes.len() as u64
    }

    /// Decode as UTF-8. A character split by the cap is dropped whole.
    pub fn into_string(mut self) -> String {
        if self.truncated() {
            let keep = complete_prefix_len(&self.bytes);
            self.bytes.truncate(keep);
        }
        match String::from_utf8(self.bytes) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }
}

/// Length of `bytes` without a trailing incomplete UTF-8 sequence.
fn complete_prefix_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    // A UTF-8 sequence is at most 4 bytes; look back for its lead byte
    for back in 1..=len.min(4) {
        let b = bytes[len - back];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let width = match b {
            0x00..=0x7F => 1,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => return len,
        };
        return if back < width { len - back } else { len };
    }
    len
}

/// Read `reader` to EOF, keeping at most `limit` bytes.
///
/// The remainder is drained and discarded so the writer never blocks on a
/// full pipe. A `limit` of zero keeps everything.
pub async fn read_capped<R>(mut reader: R, limit: u64) -> std::io::Result<CappedOutput>
where
    R: AsyncRead + Unpin,
{
    let mut out = CappedOutput::default();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        out.total += n as u64;
        let room = if limit == 0 {
            n
        } else {
            (limit as usize).saturating_sub(out.bytes.len()).min(n)
        };
        out.bytes.extend_from_slice(&buf[..room]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_capped_exact_limit() {
        let data = vec![b'a'; 10_000];
        let out = read_capped(&data[..], 4096).await.unwrap();
        assert_eq!(out.bytes.len(), 4096);
        assert_eq!(out.total, 10_000);
        assert!(out.truncated());
        assert_eq!(out.into_string().len(), 4096);
    }

    #[tokio::test]
    async fn test_read_capped_under_limit() {
        let out = read_capped(&b"hello\n"[..], 4096).await.unwrap();
        assert!(!out.truncated());
        assert_eq!(out.into_string(), "hello\n");
    }

    #[tokio::test]
    async fn test_read_capped_zero_is_unbounded() {
        let data = vec![b'x'; 20_000];
        let out = read_capped(&data[..], 0).await.unwrap();
        assert_eq!(out.bytes.len(), 20_000);
    }

    #[tokio::test]
    async fn test_split_multibyte_char_is_dropped() {
        // "é" is two bytes; cap lands between them
        let data = "aé".as_bytes().repeat(3);
        let out = read_capped(&data[..], 5).await.unwrap();
        let s = out.into_string();
        assert_eq!(s, "aéa");
        assert!(s.len() <= 5);
    }

    #[test]
    fn test_complete_prefix_len() {
        assert_eq!(complete_prefix_len(b"abc"), 3);
        assert_eq!(complete_prefix_len("€".as_bytes()), 3);
        assert_eq!(complete_prefix_len(&"€".as_bytes()[..2]), 0);
        assert_eq!(complete_prefix_len(&"a😀".as_bytes()[..4]), 1);
        assert_eq!(complete_prefix_len(b""), 0);
    }
}
