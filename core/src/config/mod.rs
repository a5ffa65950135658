//! Configuration loading and resolution.
//!
//! The on-disk TOML file is deserialized into [`ConfigFile`], where every
//! field is optional, then resolved into a [`Config`] with concrete values.
//! A missing file resolves to pure defaults; a malformed file is a startup
//! error.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use serde::Deserialize;

use crate::types::ImageDimensions;

use crate::Result;

/// Raw configuration file contents. All fields optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub target_resolution: Option<String>,
    pub temp_directory: Option<PathBuf>,
    pub preload_ahead: Option<usize>,
    pub preload_behind: Option<usize>,
    pub load_threads: Option<usize>,
    pub maximum_upscaled: Option<usize>,
    pub upscale_previous_chapters: Option<bool>,
    pub background_colour: Option<String>,
    pub upscaler: Option<PathBuf>,
    pub socket_dir: Option<PathBuf>,
    pub shortcuts: Vec<Shortcut>,
}

/// A single key binding consumed by the rendering frontend.
#[derive(Debug, Clone, Deserialize)]
pub struct Shortcut {
    pub key: String,
    #[serde(default)]
    pub modifiers: String,
    pub action: String,
}

/// Fully resolved configuration.
#[derive(Debug)]
pub struct Config {
    /// Output resolution for upscaling; `None` disables upscaling entirely.
    pub upscaling_target: Option<ImageDimensions>,
    pub temp_directory: PathBuf,
    pub preload_ahead: usize,
    pub preload_behind: usize,
    pub load_threads: usize,
    /// Cap on pages holding an upscaled output; 0 disables the cap.
    pub maximum_upscaled: usize,
    pub upscale_previous_chapters: bool,
    /// RGBA renderer clear colour.
    pub background_colour: [u8; 4],
    pub upscaler: Option<PathBuf>,
    pub socket_dir: Option<PathBuf>,
    pub shortcuts: Vec<Shortcut>,
}

impl ConfigFile {
    /// Reads `path`, or the default location when `None`. A missing default
    /// file is not an error.
    pub fn load(path: Option<&Path>) -> Result<ConfigFile> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match default_config_path() {
                Some(p) if p.is_file() => p,
                _ => return Ok(ConfigFile::default()),
            },
        };

        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Applies defaults and validates the raw values.
    pub fn resolve(self) -> Result<Config> {
        let upscaling_target = match self.target_resolution.as_deref() {
            None => None,
            Some(raw) => parse_resolution(raw)?,
        };

        let temp_directory = match self.temp_directory {
            Some(dir) => dir,
            None => std::env::temp_dir(),
        };

        let load_threads = match self.load_threads {
            Some(0) | None => auto_load_threads(),
            Some(n) => n,
        };

        let background_colour = match self.background_colour.as_deref() {
            None => [0, 0, 0, 0xFF],
            Some(raw) => parse_colour(raw)?,
        };

        Ok(Config {
            upscaling_target,
            temp_directory,
            preload_ahead: self.preload_ahead.unwrap_or(3),
            preload_behind: self.preload_behind.unwrap_or(1),
            load_threads,
            maximum_upscaled: self.maximum_upscaled.unwrap_or(16),
            upscale_previous_chapters: self.upscale_previous_chapters.unwrap_or(false),
            background_colour,
            upscaler: self.upscaler,
            socket_dir: self.socket_dir,
            shortcuts: self.shortcuts,
        })
    }
}

/// Default config file location, e.g. `~/.config/aw-man/aw-man.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    let dirs = directories::ProjectDirs::from("", "", "aw-man")?;
    Some(dirs.config_dir().join("aw-man.toml"))
}

fn auto_load_threads() -> usize {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
    (cpus / 2).max(2)
}

/// Parses `WxH`. `0x0` (either dimension zero) disables upscaling.
fn parse_resolution(raw: &str) -> Result<Option<ImageDimensions>> {
    let Some((w, h)) = raw.split_once('x') else {
        bail!("target_resolution must be WIDTHxHEIGHT, e.g. 3840x2160, got {raw:?}");
    };
    let w: u32 = w
        .trim()
        .parse()
        .with_context(|| format!("target_resolution width in {raw:?} is not a number"))?;
    let h: u32 = h
        .trim()
        .parse()
        .with_context(|| format!("target_resolution height in {raw:?} is not a number"))?;

    if w == 0 || h == 0 {
        return Ok(None);
    }
    Ok(Some(ImageDimensions::new(w, h)))
}

/// Parses an `RRGGBBAA` hex colour.
fn parse_colour(raw: &str) -> Result<[u8; 4]> {
    let raw = raw.trim_start_matches('#');
    if raw.len() != 8 || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("background_colour must be eight hex digits (RRGGBBAA), got {raw:?}");
    }
    let mut out = [0u8; 4];
    for (i, chunk) in out.iter_mut().enumerate() {
        *chunk = u8::from_str_radix(&raw[i * 2..i * 2 + 2], 16).expect("validated hex");
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_resolves_to_defaults() {
        let cfg = ConfigFile::default().resolve().unwrap();
        assert_eq!(cfg.upscaling_target, None);
        assert_eq!(cfg.preload_ahead, 3);
        assert_eq!(cfg.preload_behind, 1);
        assert!(cfg.load_threads >= 2);
        assert_eq!(cfg.background_colour, [0, 0, 0, 0xFF]);
    }

    #[test]
    fn parses_full_file() {
        let raw = r#"
            target_resolution = "3840x2160"
            preload_ahead = 5
            preload_behind = 2
            load_threads = 4
            background_colour = "11223344"
            upscale_previous_chapters = true

            [[shortcuts]]
            key = "n"
            action = "NextPage"

            [[shortcuts]]
            key = "p"
            modifiers = "Control"
            action = "PreviousPage"
        "#;
        let file: ConfigFile = toml::from_str(raw).unwrap();
        let cfg = file.resolve().unwrap();

        assert_eq!(cfg.upscaling_target, Some(ImageDimensions::new(3840, 2160)));
        assert_eq!(cfg.preload_ahead, 5);
        assert_eq!(cfg.load_threads, 4);
        assert_eq!(cfg.background_colour, [0x11, 0x22, 0x33, 0x44]);
        assert!(cfg.upscale_previous_chapters);
        assert_eq!(cfg.shortcuts.len(), 2);
        assert_eq!(cfg.shortcuts[1].modifiers, "Control");
    }

    #[test]
    fn zero_resolution_disables_upscaling() {
        assert_eq!(parse_resolution("0x0").unwrap(), None);
        assert_eq!(parse_resolution("1920x0").unwrap(), None);
        assert_eq!(parse_resolution("1920x1080").unwrap(), Some(ImageDimensions::new(1920, 1080)));
        assert!(parse_resolution("huge").is_err());
    }

    #[test]
    fn rejects_malformed_colours() {
        assert!(parse_colour("ff00").is_err());
        assert!(parse_colour("zzzzzzzz").is_err());
        assert_eq!(parse_colour("000000ff").unwrap(), [0, 0, 0, 0xFF]);
    }
}
