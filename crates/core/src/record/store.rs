use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use image::ImageFormat;
use serde::{Deserialize, Serialize};

use super::ScoreSession;
use crate::{Result, SonifierError};

const SCORE_FILE: &str = "score.json";
const PANORAMA_FILE: &str = "panorama.png";
const SAMPLES_FILE: &str = "samples.json";

/// Raw sample buffer backing the panorama, one row per recorded cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplesFile {
    pub rows: usize,
    pub columns: usize,
    /// Row-major values.
    pub data: Vec<u8>,
}

impl SamplesFile {
    pub fn from_rows(rows: &[Vec<u8>]) -> Self {
        let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * columns);
        for row in rows {
            data.extend_from_slice(row);
            data.resize(data.len() + columns - row.len(), 0);
        }
        Self {
            rows: rows.len(),
            columns,
            data,
        }
    }

    pub fn into_rows(self) -> Vec<Vec<u8>> {
        if self.columns == 0 {
            return vec![Vec::new(); self.rows];
        }
        self.data
            .chunks(self.columns)
            .take(self.rows)
            .map(<[u8]>::to_vec)
            .collect()
    }
}

/// Writes and reads session directories under a root folder.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persists `session` as a new directory and returns its path.
    ///
    /// Files are written into a hidden staging directory that is renamed
    /// into place at the end. On failure the staging directory is removed,
    /// so no partial session is ever visible.
    pub fn persist(&self, session: &ScoreSession) -> Result<PathBuf> {
        let name = session.directory_name();
        let staging = self.root.join(format!(".{name}.partial"));
        let failure = |path: &Path, reason: String| SonifierError::Persistence {
            path: path.to_path_buf(),
            reason,
        };

        fs::create_dir_all(&self.root).map_err(|err| failure(&self.root, err.to_string()))?;
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|err| failure(&staging, err.to_string()))?;
        }

        let target = self.available_path(&name);
        let written = write_session(&staging, session)
            .and_then(|()| fs::rename(&staging, &target).map_err(SonifierError::from));
        if let Err(err) = written {
            if let Err(cleanup) = fs::remove_dir_all(&staging) {
                if cleanup.kind() != ErrorKind::NotFound {
                    tracing::warn!(path = %staging.display(), error = %cleanup, "failed to remove staging directory");
                }
            }
            return Err(failure(&target, err.to_string()));
        }

        tracing::info!(path = %target.display(), cycles = session.entries.len(), "session persisted");
        Ok(target)
    }

    /// Loads a persisted session. A missing, unreadable or empty event log
    /// is a playback-load failure; the sample buffer is optional.
    pub fn load(path: &Path) -> Result<ScoreSession> {
        let failure = |reason: String| SonifierError::PlaybackLoad {
            path: path.to_path_buf(),
            reason,
        };

        let score = fs::read(path.join(SCORE_FILE)).map_err(|err| match err.kind() {
            ErrorKind::NotFound => failure(format!("{SCORE_FILE} is missing")),
            _ => failure(err.to_string()),
        })?;
        let mut session: ScoreSession = serde_json::from_slice(&score)
            .map_err(|err| failure(format!("{SCORE_FILE} is corrupt: {err}")))?;
        if session.entries.is_empty() {
            return Err(failure("event log is empty".to_string()));
        }

        match fs::read(path.join(SAMPLES_FILE)) {
            Ok(bytes) => {
                let samples: SamplesFile = serde_json::from_slice(&bytes)
                    .map_err(|err| failure(format!("{SAMPLES_FILE} is corrupt: {err}")))?;
                session.samples = samples.into_rows();
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "session has no sample buffer");
            }
            Err(err) => return Err(failure(err.to_string())),
        }

        tracing::info!(
            path = %path.display(),
            cycles = session.entries.len(),
            scale = %session.metadata.scale,
            "session loaded"
        );
        Ok(session)
    }

    fn available_path(&self, name: &str) -> PathBuf {
        let candidate = self.root.join(name);
        if !candidate.exists() {
            return candidate;
        }
        (1..)
            .map(|suffix| self.root.join(format!("{name}_{suffix}")))
            .find(|path| !path.exists())
            .unwrap_or(candidate)
    }
}

fn write_session(dir: &Path, session: &ScoreSession) -> Result<()> {
    fs::create_dir(dir)?;
    fs::write(dir.join(SCORE_FILE), serde_json::to_vec_pretty(session)?)?;
    session
        .panorama()
        .save_with_format(dir.join(PANORAMA_FILE), ImageFormat::Png)?;
    let samples = SamplesFile::from_rows(&session.samples);
    fs::write(dir.join(SAMPLES_FILE), serde_json::to_vec(&samples)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mapping::NoteEvent,
        record::{ScoreEntry, SessionMetadata},
        roi::RoiMode,
        scan::ZodiacSection,
    };
    use chrono::DateTime;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sonifier-store-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn session() -> ScoreSession {
        ScoreSession {
            metadata: SessionMetadata {
                started_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
                roi_mode: RoiMode::Circular,
                scale: "pentatonic".into(),
                rpm: 4.0,
                duration_seconds: 0.2,
                sample_count: 3,
                cycles: 2,
            },
            entries: (0..2)
                .map(|cycle| ScoreEntry {
                    cycle,
                    elapsed: cycle as f64 * 0.1,
                    angle: cycle as f64 * 10.0,
                    section: ZodiacSection::new(0),
                    events: vec![NoteEvent {
                        pitch: 60 + cycle as u8,
                        velocity: 100,
                        duration: 1.0,
                        timestamp: cycle as f64 * 0.1,
                    }],
                })
                .collect(),
            samples: vec![vec![1, 2, 3], vec![4, 5, 6]],
        }
    }

    #[test]
    fn persists_and_loads_a_session() {
        let root = scratch_dir("roundtrip");
        let store = SessionStore::new(&root);
        let path = store.persist(&session()).unwrap();

        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "20231114_221320_Circular_pentatonic_4.0rpm"
        );
        for file in [SCORE_FILE, PANORAMA_FILE, SAMPLES_FILE] {
            assert!(path.join(file).is_file(), "{file} missing");
        }
        let panorama = image::open(path.join(PANORAMA_FILE)).unwrap().to_luma8();
        assert_eq!(panorama.dimensions(), (2, 3));

        let loaded = SessionStore::load(&path).unwrap();
        assert_eq!(loaded, session());

        let second = store.persist(&session()).unwrap();
        assert_ne!(second, path);
        assert!(!root.join(".20231114_221320_Circular_pentatonic_4.0rpm.partial").exists());
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn load_rejects_missing_or_corrupt_logs() {
        let root = scratch_dir("corrupt");
        fs::create_dir_all(&root).unwrap();
        assert!(matches!(
            SessionStore::load(&root),
            Err(SonifierError::PlaybackLoad { .. })
        ));

        fs::write(root.join(SCORE_FILE), b"{ not json").unwrap();
        assert!(matches!(
            SessionStore::load(&root),
            Err(SonifierError::PlaybackLoad { .. })
        ));

        let mut empty = session();
        empty.entries.clear();
        fs::write(root.join(SCORE_FILE), serde_json::to_vec(&empty).unwrap()).unwrap();
        assert!(matches!(
            SessionStore::load(&root),
            Err(SonifierError::PlaybackLoad { .. })
        ));
        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn failed_writes_leave_nothing_behind() {
        let root = scratch_dir("blocked");
        fs::create_dir_all(root.parent().unwrap()).unwrap();
        // A plain file where the session root should be.
        fs::write(&root, b"occupied").unwrap();
        let store = SessionStore::new(&root);
        let err = store.persist(&session()).unwrap_err();
        assert!(matches!(err, SonifierError::Persistence { .. }));
        assert!(root.is_file());
        fs::remove_file(&root).unwrap();
    }

    #[test]
    fn sample_rows_are_padded_to_the_widest() {
        let file = SamplesFile::from_rows(&[vec![1, 2], vec![3]]);
        assert_eq!((file.rows, file.columns), (2, 2));
        assert_eq!(file.data, vec![1, 2, 3, 0]);
        assert_eq!(file.into_rows(), vec![vec![1, 2], vec![3, 0]]);
    }
}
