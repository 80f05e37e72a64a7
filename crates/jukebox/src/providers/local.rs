//! Local provider: track ids are paths relative to a root directory.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use jukebox_player::decode::PcmStream;
use jukebox_player::provider::{Provider, TrackStream};

pub struct LocalProvider {
    name: String,
    root: PathBuf,
    resample_chunk_frames: usize,
}

impl LocalProvider {
    pub fn new(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        resample_chunk_frames: usize,
    ) -> Result<Self> {
        let name = name.into();
        let root = root.into();
        if !root.is_dir() {
            return Err(anyhow!("provider {name}: root {:?} is not a directory", root));
        }
        Ok(Self {
            name,
            root,
            resample_chunk_frames,
        })
    }

    /// Map a track id to a file under the root.
    ///
    /// Rejects absolute paths and any `..` component.
    pub fn resolve(&self, track_id: &str) -> Result<PathBuf> {
        let rel = Path::new(track_id.trim());
        if rel.as_os_str().is_empty() {
            return Err(anyhow!("empty track id"));
        }
        for component in rel.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(anyhow!("invalid track id {track_id:?}")),
            }
        }
        let path = self.root.join(rel);
        if !path.is_file() {
            return Err(anyhow!("track not found: {track_id}"));
        }
        Ok(path)
    }
}

impl Provider for LocalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn stream(&self, track_id: &str) -> Result<TrackStream> {
        let path = self.resolve(track_id)?;
        tracing::debug!(provider = %self.name, path = ?path, "opening local track");
        let stream = PcmStream::open_file(&path, self.resample_chunk_frames)
            .with_context(|| format!("decode {track_id}"))?;
        let info = stream.info();
        tracing::info!(
            provider = %self.name,
            track = %track_id,
            codec = info.codec.unwrap_or("unknown"),
            rate_hz = info.sample_rate,
            channels = info.channels,
            duration_ms = ?info.duration_ms,
            "source (local file)"
        );
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn write_wav(path: &Path, frames: usize) {
        let data_len = (frames * 4) as u32;
        let mut out = Vec::new();
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVEfmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&44_100u32.to_le_bytes());
        out.extend_from_slice(&(44_100u32 * 4).to_le_bytes());
        out.extend_from_slice(&4u16.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        out.resize(out.len() + frames * 4, 0);
        std::fs::write(path, out).unwrap();
    }

    #[test]
    fn streams_a_wav_file_under_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("album")).unwrap();
        write_wav(&dir.path().join("album/song.wav"), 300);

        let provider = LocalProvider::new("files", dir.path(), 1024).unwrap();
        let mut bytes = Vec::new();
        provider
            .stream("album/song.wav")
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        assert_eq!(bytes.len(), 300 * 4);
    }

    #[test]
    fn rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new("files", dir.path(), 1024).unwrap();
        assert!(provider.resolve("../etc/passwd").is_err());
        assert!(provider.resolve("a/../../b").is_err());
        assert!(provider.resolve("/etc/passwd").is_err());
        assert!(provider.resolve("").is_err());
    }

    #[test]
    fn missing_track_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new("files", dir.path(), 1024).unwrap();
        let err = provider.stream("nope.flac").err().unwrap();
        assert!(err.to_string().contains("track not found"), "{err}");
    }

    #[test]
    fn undecodable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("junk.bin"), [0u8; 32]).unwrap();
        let provider = LocalProvider::new("files", dir.path(), 1024).unwrap();
        assert!(provider.stream("junk.bin").is_err());
    }

    #[test]
    fn root_must_be_a_directory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(LocalProvider::new("files", file.path(), 1024).is_err());
    }
}
