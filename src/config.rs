//! Runtime configuration: where the cache lives, how large it may grow,
//! and whether it's enabled at all.  Everything here can be set
//! programmatically through [`crate::CacheBuilder`], or overridden from
//! the environment with [`crate::CacheBuilder::from_env`].
use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;

use crate::layout::ensure_dir;
use crate::queue::DEFAULT_WORKERS;
use crate::Error;
use crate::Result;

/// Overrides the parent of the cache directory.
pub const DIR_ENV_VAR: &str = "SHADER_CACHE_DIR";

/// Size limit, as a count of GiB or with a `K`, `M` or `G` suffix.
pub const MAX_SIZE_ENV_VAR: &str = "SHADER_CACHE_MAX_SIZE";

/// Disables the cache when set to a truthy value.
pub const DISABLE_ENV_VAR: &str = "SHADER_CACHE_DISABLE";

/// Name of the cache directory, under whichever parent we pick.
pub const CACHE_DIR_NAME: &str = "shader_disk_cache";

/// 1 GiB.
pub const DEFAULT_MAX_SIZE: u64 = 1 << 30;

/// Tunables for a [`crate::Cache`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Explicit cache root.  When `None`, we resolve one from the
    /// environment (see [`DirInputs`]).
    pub directory: Option<PathBuf>,
    /// Soft limit on the total size of the cache, in bytes.
    pub max_size: u64,
    /// Number of background writer threads.
    pub workers: usize,
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> CacheConfig {
        CacheConfig {
            directory: None,
            max_size: DEFAULT_MAX_SIZE,
            workers: DEFAULT_WORKERS,
            enabled: true,
        }
    }
}

impl CacheConfig {
    /// Applies `SHADER_CACHE_MAX_SIZE` and `SHADER_CACHE_DISABLE`, and
    /// disables the cache in processes with elevated privileges.
    ///
    /// Invalid values are ignored.
    pub fn apply_env(&mut self) {
        if let Some(value) = std::env::var_os(MAX_SIZE_ENV_VAR) {
            match value.to_str().and_then(parse_max_size) {
                Some(size) => self.max_size = size,
                None => tracing::debug!(?value, "ignoring invalid {}", MAX_SIZE_ENV_VAR),
            }
        }

        if let Some(value) = std::env::var_os(DISABLE_ENV_VAR) {
            if value.to_str().and_then(env_flag) == Some(true) {
                self.enabled = false;
            }
        }

        if privileges_differ() {
            tracing::debug!("disabling cache in privileged process");
            self.enabled = false;
        }
    }
}

/// Parses a size limit: decimal digits, optionally followed by `K`,
/// `M` or `G` (any case).  A bare number counts GiB.
///
/// Returns `None` for unparseable or zero values, so that callers
/// keep their default.
pub fn parse_max_size(value: &str) -> Option<u64> {
    let value = value.trim_start();
    let digits = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    if digits == 0 {
        return None;
    }

    let count: u64 = value[..digits].parse().ok()?;
    let scale: u64 = match value[digits..].chars().next() {
        Some('K') | Some('k') => 1 << 10,
        Some('M') | Some('m') => 1 << 20,
        // 'G', or anything else (including no suffix).
        _ => 1 << 30,
    };

    match count.saturating_mul(scale) {
        0 => None,
        size => Some(size),
    }
}

/// Parses a boolean environment flag.  Returns `None` for values
/// that are neither obviously true nor obviously false.
pub fn env_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "y" => Some(true),
        "0" | "false" | "no" | "off" | "n" | "" => Some(false),
        _ => None,
    }
}

/// Whether we're running setuid/setgid-like: the cache lives in the
/// real user's home, and we must not write there as someone else.
#[cfg(unix)]
pub fn privileges_differ() -> bool {
    unsafe { libc::geteuid() != libc::getuid() || libc::getegid() != libc::getgid() }
}

#[cfg(not(unix))]
pub fn privileges_differ() -> bool {
    false
}

/// Candidate parent directories for the cache, in priority order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirInputs {
    /// `$SHADER_CACHE_DIR`
    pub override_dir: Option<PathBuf>,
    /// `$XDG_CACHE_HOME`
    pub xdg_cache_home: Option<PathBuf>,
    /// The user's home directory; the cache goes in `$HOME/.cache`.
    pub home_dir: Option<PathBuf>,
}

fn non_empty(value: Option<OsString>) -> Option<PathBuf> {
    value.filter(|value| !value.is_empty()).map(PathBuf::from)
}

impl DirInputs {
    pub fn from_env() -> DirInputs {
        DirInputs {
            override_dir: non_empty(std::env::var_os(DIR_ENV_VAR)),
            xdg_cache_home: non_empty(std::env::var_os("XDG_CACHE_HOME")),
            home_dir: dirs::home_dir(),
        }
    }
}

/// Creates `parent/name` if needed, and returns it.  `parent` must
/// already be a directory.
fn concatenate_and_mkdir(parent: &Path, name: &str) -> Result<PathBuf> {
    if !parent.is_dir() {
        return Err(Error::Unavailable(format!(
            "{} is not a directory",
            parent.display()
        )));
    }

    let path = parent.join(name);
    ensure_dir(&path)?;
    Ok(path)
}

/// Resolves (and creates) the cache directory from the first
/// available input.
///
/// An input that is set but unusable is an error: we do not fall
/// through to the next candidate.
pub fn resolve_cache_dir(inputs: &DirInputs) -> Result<PathBuf> {
    if let Some(dir) = &inputs.override_dir {
        ensure_dir(dir)?;
        return concatenate_and_mkdir(dir, CACHE_DIR_NAME);
    }

    if let Some(dir) = &inputs.xdg_cache_home {
        ensure_dir(dir)?;
        return concatenate_and_mkdir(dir, CACHE_DIR_NAME);
    }

    if let Some(home) = &inputs.home_dir {
        let dot_cache = concatenate_and_mkdir(home, ".cache")?;
        return concatenate_and_mkdir(&dot_cache, CACHE_DIR_NAME);
    }

    Err(Error::Unavailable("no home directory".into()))
}

#[cfg(test)]
mod test {
    use super::*;
    use test_dir::{DirBuilder, FileType, TestDir};

    #[test]
    fn test_parse_max_size() {
        assert_eq!(parse_max_size("2"), Some(2 << 30));
        assert_eq!(parse_max_size("2G"), Some(2 << 30));
        assert_eq!(parse_max_size("2g"), Some(2 << 30));
        assert_eq!(parse_max_size("512M"), Some(512 << 20));
        assert_eq!(parse_max_size("512m"), Some(512 << 20));
        assert_eq!(parse_max_size("64K"), Some(64 << 10));
        assert_eq!(parse_max_size("  64k"), Some(64 << 10));
        // Unknown suffixes count GiB, like no suffix at all.
        assert_eq!(parse_max_size("3T"), Some(3 << 30));

        assert_eq!(parse_max_size(""), None);
        assert_eq!(parse_max_size("M"), None);
        assert_eq!(parse_max_size("0"), None);
        assert_eq!(parse_max_size("0K"), None);
        assert_eq!(parse_max_size("-1"), None);
        assert_eq!(parse_max_size("99999999999999999999999"), None);
    }

    #[test]
    fn test_env_flag() {
        for value in ["1", "true", "TRUE", "yes", "on", " y "] {
            assert_eq!(env_flag(value), Some(true), "{}", value);
        }

        for value in ["0", "false", "No", "off", ""] {
            assert_eq!(env_flag(value), Some(false), "{}", value);
        }

        assert_eq!(env_flag("maybe"), None);
    }

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();

        assert_eq!(config.directory, None);
        assert_eq!(config.max_size, 1 << 30);
        assert_eq!(config.workers, 4);
        assert!(config.enabled);
    }

    #[test]
    fn test_override_dir_wins() {
        let temp = TestDir::temp()
            .create("override", FileType::Dir)
            .create("xdg", FileType::Dir);

        let inputs = DirInputs {
            override_dir: Some(temp.path("override")),
            xdg_cache_home: Some(temp.path("xdg")),
            home_dir: Some(temp.root().to_owned()),
        };

        let dir = resolve_cache_dir(&inputs).expect("must resolve");
        assert_eq!(dir, temp.path("override").join(CACHE_DIR_NAME));
        assert!(dir.is_dir());
    }

    /// The override directory itself is created, but not its parents.
    #[test]
    fn test_override_dir_created() {
        let temp = TestDir::temp();

        let inputs = DirInputs {
            override_dir: Some(temp.path("fresh")),
            ..Default::default()
        };
        let dir = resolve_cache_dir(&inputs).expect("must resolve");
        assert_eq!(dir, temp.path("fresh").join(CACHE_DIR_NAME));

        let inputs = DirInputs {
            override_dir: Some(temp.path("missing/parent")),
            xdg_cache_home: Some(temp.root().to_owned()),
            home_dir: None,
        };
        assert!(resolve_cache_dir(&inputs).is_err());
    }

    #[test]
    fn test_xdg_then_home() {
        let temp = TestDir::temp().create("xdg", FileType::Dir);

        let inputs = DirInputs {
            override_dir: None,
            xdg_cache_home: Some(temp.path("xdg")),
            home_dir: Some(temp.root().to_owned()),
        };
        assert_eq!(
            resolve_cache_dir(&inputs).expect("must resolve"),
            temp.path("xdg").join(CACHE_DIR_NAME)
        );

        let inputs = DirInputs {
            override_dir: None,
            xdg_cache_home: None,
            home_dir: Some(temp.root().to_owned()),
        };
        assert_eq!(
            resolve_cache_dir(&inputs).expect("must resolve"),
            temp.path(".cache").join(CACHE_DIR_NAME)
        );
    }

    /// `$XDG_CACHE_HOME` is created on demand, like the override.
    #[test]
    fn test_missing_xdg_dir_is_created() {
        let temp = TestDir::temp();

        let inputs = DirInputs {
            override_dir: None,
            xdg_cache_home: Some(temp.path("fresh-xdg")),
            home_dir: Some(temp.root().to_owned()),
        };
        let dir = resolve_cache_dir(&inputs).expect("must resolve");
        assert_eq!(dir, temp.path("fresh-xdg").join(CACHE_DIR_NAME));
        assert!(dir.is_dir());
        assert!(!temp.path(".cache").exists());

        // Only the last component is created.
        let inputs = DirInputs {
            override_dir: None,
            xdg_cache_home: Some(temp.path("missing/xdg")),
            home_dir: Some(temp.root().to_owned()),
        };
        assert!(resolve_cache_dir(&inputs).is_err());
        assert!(!temp.path(".cache").exists());
    }

    /// An unusable XDG directory is an error, even with a valid home.
    #[test]
    fn test_no_fallthrough() {
        let temp = TestDir::temp().create("file", FileType::ZeroFile(1));

        let inputs = DirInputs {
            override_dir: None,
            xdg_cache_home: Some(temp.path("file")),
            home_dir: Some(temp.root().to_owned()),
        };
        assert!(matches!(resolve_cache_dir(&inputs), Err(Error::Io(_))));
        assert!(!temp.path(".cache").exists());
    }

    #[test]
    fn test_no_inputs() {
        assert!(matches!(
            resolve_cache_dir(&DirInputs::default()),
            Err(Error::Unavailable(_))
        ));
    }
}
