//! On-disk cache of calibration results, one directory entry set per device identity.

use crate::{
    calibration::CalibrationTables,
    protocol::{AfeParameters, ExposureParameters},
};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

const SHADING_BLACK: &str = "shading_black";
const SHADING_WHITE: &str = "shading_white";
const OFFSET: &str = "offset";
const EXPOSURE: &str = "exposure";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationStore {
    dir: PathBuf,
}

impl CalibrationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store under `name` in the user's home directory.
    pub fn user_default(name: &str) -> Option<Self> {
        dirs::home_dir().map(|home| Self::new(home.join(name)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, identity: &str, item: &str) -> PathBuf {
        self.dir.join(format!("{identity}.{item}"))
    }

    /// Loads the cached calibration for `identity`. Missing or damaged data
    /// yields `None` so the caller recalibrates.
    pub fn load(&self, identity: &str, pixels: usize) -> Option<CalibrationTables> {
        match self.try_load(identity, pixels) {
            Ok(Some(tables)) => {
                log::debug!("Loaded calibration for {identity} from {}", self.dir.display());
                Some(tables)
            }
            Ok(None) => {
                log::info!("Calibration cache for {identity} is corrupt, ignoring");
                None
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log::debug!("No cached calibration for {identity}");
                None
            }
            Err(err) => {
                log::info!("Failed to read calibration cache for {identity}: {err}");
                None
            }
        }
    }

    fn try_load(&self, identity: &str, pixels: usize) -> io::Result<Option<CalibrationTables>> {
        let black = fs::read(self.path(identity, SHADING_BLACK))?;
        let white = fs::read(self.path(identity, SHADING_WHITE))?;
        let offset = fs::read(self.path(identity, OFFSET))?;
        let exposure = fs::read(self.path(identity, EXPOSURE))?;

        let tables = (|| {
            Some(CalibrationTables {
                black: CalibrationTables::decode_shading(&black, pixels)?,
                white: CalibrationTables::decode_shading(&white, pixels)?,
                afe: AfeParameters::from_bytes(&offset)?,
                exposure: ExposureParameters::from_bytes(&exposure)?,
            })
        })();

        Ok(tables)
    }

    pub fn save(&self, identity: &str, tables: &CalibrationTables) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let items = [
            (SHADING_BLACK, CalibrationTables::encode_shading(&tables.black)),
            (SHADING_WHITE, CalibrationTables::encode_shading(&tables.white)),
            (OFFSET, tables.afe.to_bytes().to_vec()),
            (EXPOSURE, tables.exposure.to_bytes().to_vec()),
        ];

        for (item, bytes) in items {
            let path = self.path(identity, item);
            fs::write(&path, bytes)?;
            restrict(&path)?;
        }

        log::debug!("Saved calibration for {identity} to {}", self.dir.display());

        Ok(())
    }

    pub fn remove(&self, identity: &str) -> io::Result<()> {
        for item in [SHADING_BLACK, SHADING_WHITE, OFFSET, EXPOSURE] {
            match fs::remove_file(self.path(identity, item)) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn restrict(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> CalibrationTables {
        CalibrationTables {
            black: [vec![10, 11, 12], vec![20, 21, 22], vec![30, 31, 32]],
            white: [vec![60000, 61000, 62000], vec![50000, 51000, 52000], vec![1, 2, 3]],
            afe: AfeParameters {
                r_offset: 1,
                r_pga: 2,
                g_offset: 3,
                g_pga: 4,
                b_offset: 5,
                b_pga: 6,
            },
            exposure: ExposureParameters {
                r_time: 0x9f,
                g_time: 0x109,
                b_time: 0xcb,
            },
        }
    }

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path().join("cache"));

        assert_eq!(store.load("artec_e__48u", 3), None);

        store.save("artec_e__48u", &tables()).unwrap();
        assert_eq!(store.load("artec_e__48u", 3), Some(tables()));
        assert_eq!(store.load("other", 3), None);

        store.remove("artec_e__48u").unwrap();
        assert_eq!(store.load("artec_e__48u", 3), None);
    }

    #[test]
    fn wrong_length_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path());

        store.save("dev", &tables()).unwrap();
        assert_eq!(store.load("dev", 4), None);

        fs::write(store.path("dev", EXPOSURE), [0; 5]).unwrap();
        assert_eq!(store.load("dev", 3), None);
    }

    #[cfg(unix)]
    #[test]
    fn files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(dir.path());
        store.save("dev", &tables()).unwrap();

        let mode = fs::metadata(store.path("dev", OFFSET)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
