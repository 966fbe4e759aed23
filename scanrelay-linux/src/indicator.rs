//! Connection indicator: writes `1`/`0` to a file such as a sysfs LED brightness node.

use std::path::PathBuf;

#[derive(Debug, Default)]
pub struct Indicator {
    path: Option<PathBuf>,
}

impl Indicator {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn set(&self, on: bool) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = std::fs::write(path, if on { "1" } else { "0" }) {
            tracing::debug!(path = %path.display(), error = %e, "indicator write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brightness");
        let ind = Indicator::new(Some(path.clone()));
        ind.set(true);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "1");
        ind.set(false);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0");
    }

    #[test]
    fn without_path_is_noop() {
        Indicator::default().set(true);
    }
}
