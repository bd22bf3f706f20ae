//! Configuration file and overrides.
//!
//! We have 2 components for the configuration, in order of priority :
//!
//! Overrides (e.g. CLI flags) --overrides--> File
use std::{
    fs,
    path::{Path, PathBuf},
};

use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{error::Error, fdlimit::Preallocation};

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Config {
    /// Where torrent data is written.
    pub download_dir: Option<PathBuf>,
    /// Where copies of added .torrent files are kept.
    pub torrent_dir: Option<PathBuf>,
    /// Where resume files are kept.
    pub resume_dir: Option<PathBuf>,
    /// Default 16
    pub open_file_limit: Option<usize>,
    /// Default 240
    pub socket_limit: Option<usize>,
    /// Default 60
    pub peer_limit_per_torrent: Option<u16>,
    pub preallocation: Option<Preallocation>,
    /// Stop seeding once this ratio is reached, unless the torrent says
    /// otherwise.
    pub ratio_limit: Option<f64>,
    /// KiB/s
    pub speed_limit_down: Option<u32>,
    /// KiB/s
    pub speed_limit_up: Option<u32>,
}

/// A [`Config`] with every default filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub download_dir: PathBuf,
    pub torrent_dir: PathBuf,
    pub resume_dir: PathBuf,
    pub open_file_limit: usize,
    pub socket_limit: usize,
    pub peer_limit_per_torrent: u16,
    pub preallocation: Preallocation,
    pub ratio_limit: Option<f64>,
    pub speed_limit_down: Option<u32>,
    pub speed_limit_up: Option<u32>,
}

impl ResolvedConfig {
    /// Everything under `root`, handy for tests and portable setups.
    pub fn in_dir(root: &Path) -> Self {
        Config {
            download_dir: Some(root.join("downloads")),
            torrent_dir: Some(root.join("torrents")),
            resume_dir: Some(root.join("resume")),
            ..Default::default()
        }
        .resolve_with(root)
    }
}

impl Config {
    /// Load the configuration file and merge `overrides` on top of it.
    /// If the file does not exist, it is created with the defaults.
    pub fn load(overrides: Config) -> Result<ResolvedConfig, Error> {
        let dirs = Self::project_dirs()?;
        let file = Self::from_file(&dirs.config_dir().join("config.toml"))?;
        Ok(Self::merge(file, overrides).resolve_with(dirs.data_dir()))
    }

    fn project_dirs() -> Result<ProjectDirs, Error> {
        ProjectDirs::from("", "", "Tessera").ok_or(Error::HomeInvalid)
    }

    /// Read `path`, writing the default configuration to it when it is
    /// missing.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(_) => {
                debug!("writing default configuration to {path:?}");
                let config = Config::default();
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                if let Err(e) = fs::write(path, toml::to_string(&config)?) {
                    warn!("could not write {path:?}: {e}");
                }
                Ok(config)
            }
        }
    }

    pub fn merge(file: Config, overrides: Config) -> Config {
        Config {
            download_dir: overrides.download_dir.or(file.download_dir),
            torrent_dir: overrides.torrent_dir.or(file.torrent_dir),
            resume_dir: overrides.resume_dir.or(file.resume_dir),
            open_file_limit: overrides.open_file_limit.or(file.open_file_limit),
            socket_limit: overrides.socket_limit.or(file.socket_limit),
            peer_limit_per_torrent: overrides
                .peer_limit_per_torrent
                .or(file.peer_limit_per_torrent),
            preallocation: overrides.preallocation.or(file.preallocation),
            ratio_limit: overrides.ratio_limit.or(file.ratio_limit),
            speed_limit_down: overrides.speed_limit_down.or(file.speed_limit_down),
            speed_limit_up: overrides.speed_limit_up.or(file.speed_limit_up),
        }
    }

    /// Fill the defaults, `data_dir` is where torrents and resume files go
    /// unless configured otherwise.
    pub fn resolve_with(self, data_dir: &Path) -> ResolvedConfig {
        let download_dir = self.download_dir.unwrap_or_else(|| {
            UserDirs::new()
                .and_then(|u| u.download_dir().map(Path::to_path_buf))
                .unwrap_or_else(|| data_dir.join("downloads"))
        });

        ResolvedConfig {
            download_dir,
            torrent_dir: self.torrent_dir.unwrap_or_else(|| data_dir.join("torrents")),
            resume_dir: self.resume_dir.unwrap_or_else(|| data_dir.join("resume")),
            open_file_limit: self.open_file_limit.unwrap_or(16),
            socket_limit: self.socket_limit.unwrap_or(240),
            peer_limit_per_torrent: self.peer_limit_per_torrent.unwrap_or(60),
            preallocation: self.preallocation.unwrap_or_default(),
            ratio_limit: self.ratio_limit,
            speed_limit_down: self.speed_limit_down,
            speed_limit_up: self.speed_limit_up,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge() {
        let file = Config {
            download_dir: Some("/file/downloads".into()),
            open_file_limit: Some(32),
            ratio_limit: Some(2.0),
            ..Default::default()
        };
        let overrides = Config {
            download_dir: Some("/cli/downloads".into()),
            socket_limit: Some(10),
            ..Default::default()
        };
        let c = Config::merge(file, overrides).resolve_with(Path::new("/data"));

        assert_eq!(c.download_dir, PathBuf::from("/cli/downloads"));
        assert_eq!(c.open_file_limit, 32);
        assert_eq!(c.socket_limit, 10);
        assert_eq!(c.ratio_limit, Some(2.0));
        assert_eq!(c.peer_limit_per_torrent, 60);
        assert_eq!(c.torrent_dir, PathBuf::from("/data/torrents"));
        assert_eq!(c.preallocation, Preallocation::Sparse);
    }

    #[test]
    fn decode() {
        let c: Config = toml::from_str(
            r#"
            download_dir = "/downloads"
            open_file_limit = 8
            preallocation = "full"
            speed_limit_up = 100
            "#,
        )
        .unwrap();

        assert_eq!(c.download_dir, Some("/downloads".into()));
        assert_eq!(c.open_file_limit, Some(8));
        assert_eq!(c.preallocation, Some(Preallocation::Full));
        assert_eq!(c.speed_limit_up, Some(100));
        assert_eq!(c.speed_limit_down, None);
    }

    #[test]
    fn decode_potential_errors() {
        assert!(toml::from_str::<Config>(r#"open_file_limit = "many""#).is_err());
        assert!(toml::from_str::<Config>(r#"preallocation = "huge""#).is_err());
        assert!(toml::from_str::<Config>("ratio_limit = ").is_err());
    }

    #[test]
    fn missing_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf/config.toml");
        let c = Config::from_file(&path).unwrap();
        assert_eq!(c, Config::default());
        assert!(path.exists());

        fs::write(&path, "socket_limit = 3").unwrap();
        assert_eq!(Config::from_file(&path).unwrap().socket_limit, Some(3));

        fs::write(&path, "socket_limit = [").unwrap();
        assert!(matches!(
            Config::from_file(&path),
            Err(Error::ConfigDeserializeError(_))
        ));
    }
}
