//! HLS output directory inspection and housekeeping.
//!
//! The transcoder writes a sliding manifest plus media segments into one
//! directory. Everything the supervisor and the health monitor know about the
//! pipeline's output comes from looking at that directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Manifest file name inside the output directory.
pub const MANIFEST_NAME: &str = "playlist.m3u8";
/// SDP descriptor handed to the transcoder for the engine's RTP sink.
pub const SDP_NAME: &str = "stream.sdp";
/// Viewer-facing path the manifest is served under.
pub const PLAYLIST_URL: &str = "/hls/playlist.m3u8";

/// A point-in-time view of the output directory, compared across health
/// checks to decide whether the stream is advancing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSnapshot {
    pub manifest_exists: bool,
    pub segment_count: usize,
    /// Manifest mtime — the transcoder rewrites the manifest on every new
    /// segment, so a frozen mtime means a frozen stream.
    pub manifest_modified: Option<SystemTime>,
}

/// Handle on the bridge's output directory.
#[derive(Debug, Clone)]
pub struct HlsOutput {
    dir: PathBuf,
}

impl HlsOutput {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_NAME)
    }

    pub fn sdp_path(&self) -> PathBuf {
        self.dir.join(SDP_NAME)
    }

    pub fn manifest_exists(&self) -> bool {
        self.manifest_path().is_file()
    }

    pub fn segment_count(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .flatten()
            .filter(|e| {
                e.path()
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("ts"))
            })
            .count()
    }

    pub fn has_segments(&self) -> bool {
        self.segment_count() > 0
    }

    pub fn snapshot(&self) -> OutputSnapshot {
        let manifest_modified = fs::metadata(self.manifest_path())
            .and_then(|m| m.modified())
            .ok();
        OutputSnapshot {
            manifest_exists: self.manifest_exists(),
            segment_count: self.segment_count(),
            manifest_modified,
        }
    }

    pub fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir)
    }

    /// Delete generated artifacts (segments, manifest, SDP). Leftovers from a
    /// previous run would let a stale manifest pass for a live one.
    pub fn clean(&self) -> io::Result<()> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let generated = path.extension().is_some_and(|ext| {
                ext.eq_ignore_ascii_case("ts")
                    || ext.eq_ignore_ascii_case("m3u8")
                    || ext.eq_ignore_ascii_case("sdp")
            });
            if generated {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_output() -> HlsOutput {
        let dir = std::env::temp_dir().join(format!("mezzo-output-{}", uuid::Uuid::new_v4()));
        let out = HlsOutput::new(dir);
        out.ensure_dir().unwrap();
        out
    }

    #[test]
    fn snapshot_tracks_manifest_and_segments() {
        let out = temp_output();
        assert!(!out.manifest_exists());
        assert_eq!(out.segment_count(), 0);

        fs::write(out.manifest_path(), "#EXTM3U\n").unwrap();
        fs::write(out.dir().join("segment_000.ts"), b"x").unwrap();
        fs::write(out.dir().join("segment_001.ts"), b"x").unwrap();

        let snap = out.snapshot();
        assert!(snap.manifest_exists);
        assert_eq!(snap.segment_count, 2);
        assert!(snap.manifest_modified.is_some());
    }

    #[test]
    fn clean_removes_generated_files_only() {
        let out = temp_output();
        fs::write(out.manifest_path(), "#EXTM3U\n").unwrap();
        fs::write(out.sdp_path(), "v=0\n").unwrap();
        fs::write(out.dir().join("segment_000.ts"), b"x").unwrap();
        fs::write(out.dir().join("notes.txt"), b"keep me").unwrap();

        out.clean().unwrap();

        assert!(!out.manifest_exists());
        assert_eq!(out.segment_count(), 0);
        assert!(out.dir().join("notes.txt").is_file());

        // Cleaning a missing directory is a no-op.
        let gone = HlsOutput::new(out.dir().join("nope"));
        gone.clean().unwrap();
    }
}
