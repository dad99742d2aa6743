use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU32, Ordering},
};

use snafu::ResultExt;
use tracing::{debug, info};
use trace_store_ipc::Version;

use crate::error::{CopySnafu, LaunchError, RenameSnafu};

const FALLBACK_NAME: &str = "trace-store";

static STAGE_SEQ: AtomicU32 = AtomicU32::new(0);

/// Where the daemon binary for a given version lives, so the launching
/// binary can be upgraded or deleted while that daemon keeps running.
#[derive(Debug, Clone)]
pub struct Staging {
    pub source: PathBuf,
    pub cache_dir: PathBuf,
    pub version: Version,
}

impl Staging {
    #[must_use]
    pub fn new(source: &Path, cache_dir: &Path, version: Version) -> Self {
        Self {
            source: source.to_path_buf(),
            cache_dir: cache_dir.to_path_buf(),
            version,
        }
    }

    /// `<cache>/<version as 8 hex digits>/<binary name>`
    #[must_use]
    pub fn target(&self) -> PathBuf {
        let name = self
            .source
            .file_name()
            .map_or_else(|| OsString::from(FALLBACK_NAME), OsString::from);
        self.cache_dir
            .join(format!("{:08x}", self.version.raw()))
            .join(name)
    }

    /// Copy the source binary into place unless it already is.
    ///
    /// The copy goes to a pid-tagged sibling first and is renamed over the
    /// target, so a concurrent stager never sees a half written binary. A
    /// failed rename onto a target that now exists means someone else won;
    /// their copy is identical.
    pub fn stage(&self) -> Result<PathBuf, LaunchError> {
        let target = self.target();
        if target.is_file() {
            debug!("{} already staged", target.display());
            return Ok(target);
        }

        let dir = target.parent().unwrap_or(&self.cache_dir);
        fs::create_dir_all(dir).context(CopySnafu {
            from: &self.source,
            to: dir,
        })?;

        let mut tagged = target.clone().into_os_string();
        let n = STAGE_SEQ.fetch_add(1, Ordering::Relaxed);
        tagged.push(format!(".{}.{n}", std::process::id()));
        let tagged = PathBuf::from(tagged);

        fs::copy(&self.source, &tagged).context(CopySnafu {
            from: &self.source,
            to: &tagged,
        })?;

        match fs::rename(&tagged, &target) {
            Ok(()) => info!("staged {}", target.display()),
            Err(e) if target.is_file() => {
                debug!("lost staging race for {}: {e}", target.display());
                let _ = fs::remove_file(&tagged);
            }
            Err(source) => {
                let _ = fs::remove_file(&tagged);
                return Err(source).context(RenameSnafu { to: &target });
            }
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Barrier, thread};

    use super::*;
    use crate::exit_code::ExitCode;

    fn fixture() -> (tempfile::TempDir, Staging) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("trace-store-bin");
        fs::write(&source, b"#!binary").unwrap();
        let staging =
            Staging::new(&source, &dir.path().join("cache"), Version::new(1, 2));
        (dir, staging)
    }

    #[test]
    fn target_is_keyed_by_version() {
        let (_dir, staging) = fixture();
        let target = staging.target();
        assert!(target.ends_with("00010002/trace-store-bin"));
    }

    #[test]
    fn stages_once_and_reuses() {
        let (_dir, staging) = fixture();
        let first = staging.stage().unwrap();
        assert_eq!(fs::read(&first).unwrap(), b"#!binary");

        fs::write(&staging.source, b"#!changed").unwrap();
        let second = staging.stage().unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::read(&second).unwrap(), b"#!binary");

        let leftovers = fs::read_dir(first.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn concurrent_stagers_all_succeed() {
        let (_dir, staging) = fixture();
        let barrier = Barrier::new(4);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    barrier.wait();
                    let staged = staging.stage().unwrap();
                    assert_eq!(fs::read(staged).unwrap(), b"#!binary");
                });
            }
        });
    }

    #[test]
    fn missing_source_is_a_copy_failure() {
        let (dir, mut staging) = fixture();
        staging.source = dir.path().join("nope");
        let err = staging.stage().unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::CopyFail);
    }
}
