// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Data directory resolution.

use std::path::{Path, PathBuf};

/// Return the daemon's data directory, creating it if needed.
///
/// An explicit override from the config file wins over the platform default.
pub fn data_dir(override_dir: Option<&Path>) -> PathBuf {
    let dir = match override_dir {
        Some(dir) => dir.to_path_buf(),
        None => base_dir(
            std::env::var_os("XDG_DATA_HOME").map(PathBuf::from),
            std::env::var_os("HOME").map(PathBuf::from),
        )
        .join("bonwerk"),
    };
    std::fs::create_dir_all(&dir).ok();
    dir
}

fn base_dir(xdg_data_home: Option<PathBuf>, home: Option<PathBuf>) -> PathBuf {
    if let Some(xdg) = xdg_data_home.filter(|p| !p.as_os_str().is_empty()) {
        return xdg;
    }
    if let Some(home) = home {
        return home.join(".local").join("share");
    }
    // Last resort
    PathBuf::from("/tmp")
}
